use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("provisioning failed: {0}")]
    Provision(String),
    #[error("command failed on {target} (exit {exit}): {command}: {stderr}")]
    CommandExecution {
        target: String,
        command: String,
        exit: String,
        stderr: String,
    },
    #[error("command timed out after {timeout:?} on {target}: {command}")]
    CommandTimeout {
        target: String,
        command: String,
        timeout: Duration,
    },
    #[error("could not parse {name}.json: {message}")]
    ResultParse { name: String, message: String },
    #[error("artifact retrieval failed: {0}")]
    Retrieval(String),
    #[error("persistence write failed: {0}")]
    Persistence(String),
    #[error("persistence endpoint unreachable: {0}")]
    PersistenceUnreachable(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("no remote benchmark host configured for a remote job")]
    NoRemoteTarget,
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl RunnerError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RunnerError::Io {
            path: path.into(),
            source,
        }
    }
}
