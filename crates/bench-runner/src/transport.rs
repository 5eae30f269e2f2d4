//! Command execution on the local machine or the benchmark host.
//!
//! The transport is chosen per job and handed to the orchestrator as a value;
//! nothing here reads the configured stage.

use crate::error::RunnerError;
use bench_core::RemoteTarget;
use serde_json::Value;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

pub trait CommandExecutor: Send + Sync {
    /// Runs `command` through a shell and returns its stdout.
    fn exec(&self, command: &str) -> Result<String, RunnerError>;
    /// Copies `source` (a path on the execution target) to a local `dest`.
    fn fetch(&self, source: &str, dest: &Path) -> Result<(), RunnerError>;
    fn target(&self) -> String;
}

struct ProcessOutput {
    status: ExitStatus,
    stdout: String,
    stderr: String,
}

fn spawn_reader<R: Read + Send + 'static>(source: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Kills the whole process group so background children die with the shell.
fn kill_group(child: &mut Child) {
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

fn run_process(
    mut cmd: Command,
    target: &str,
    command: &str,
    timeout: Duration,
) -> Result<ProcessOutput, RunnerError> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.process_group(0);
    let mut child = cmd.spawn().map_err(|e| RunnerError::CommandExecution {
        target: target.to_string(),
        command: command.to_string(),
        exit: "spawn".to_string(),
        stderr: e.to_string(),
    })?;
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let started = Instant::now();
    let timed_out = |child: &mut Child| {
        kill_group(child);
        debug!(host = target, command, ?timeout, "command timed out");
        RunnerError::CommandTimeout {
            target: target.to_string(),
            command: command.to_string(),
            timeout,
        }
    };
    let status = loop {
        let polled = child.try_wait().map_err(|e| RunnerError::CommandExecution {
            target: target.to_string(),
            command: command.to_string(),
            exit: "wait".to_string(),
            stderr: e.to_string(),
        })?;
        if let Some(status) = polled {
            break status;
        }
        if started.elapsed() >= timeout {
            return Err(timed_out(&mut child));
        }
        thread::sleep(POLL_INTERVAL);
    };

    // processes left running in the background keep the pipes open
    let mut collect = |reader: mpsc::Receiver<Vec<u8>>| {
        match reader.recv_timeout(timeout.saturating_sub(started.elapsed())) {
            Ok(buf) => Ok(String::from_utf8_lossy(&buf).to_string()),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(String::new()),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(timed_out(&mut child)),
        }
    };
    let stdout = collect(stdout_reader)?;
    let stderr = collect(stderr_reader)?;
    debug!(
        host = target,
        command,
        exit = ?status.code(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        stdout = %stdout,
        stderr = %stderr,
        "command finished"
    );
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
    })
}

fn stdout_or_failure(
    output: ProcessOutput,
    target: &str,
    command: &str,
) -> Result<String, RunnerError> {
    if output.status.success() {
        return Ok(output.stdout);
    }
    let stderr_tail = output
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("process exited without output")
        .to_string();
    Err(RunnerError::CommandExecution {
        target: target.to_string(),
        command: command.to_string(),
        exit: output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string()),
        stderr: stderr_tail,
    })
}

/// Runs commands with `sh -c` on this machine.
#[derive(Debug, Clone)]
pub struct LocalShell {
    timeout: Duration,
}

impl LocalShell {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandExecutor for LocalShell {
    fn exec(&self, command: &str) -> Result<String, RunnerError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        let output = run_process(cmd, "local", command, self.timeout)?;
        stdout_or_failure(output, "local", command)
    }

    fn fetch(&self, source: &str, dest: &Path) -> Result<(), RunnerError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
        }
        fs::copy(source, dest)
            .map(|_| ())
            .map_err(|e| RunnerError::io(source, e))
    }

    fn target(&self) -> String {
        "local".to_string()
    }
}

/// Runs commands on the benchmark host over `ssh`, fetching files with `scp`.
#[derive(Debug, Clone)]
pub struct SecureShell {
    remote: RemoteTarget,
    timeout: Duration,
}

impl SecureShell {
    pub fn new(remote: RemoteTarget, timeout: Duration) -> Self {
        Self { remote, timeout }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.remote.user, self.remote.host)
    }

    fn base_args(&self, cmd: &mut Command) {
        cmd.arg("-i")
            .arg(&self.remote.key)
            .args(["-o", "BatchMode=yes"])
            .args(["-o", "StrictHostKeyChecking=accept-new"]);
    }
}

impl CommandExecutor for SecureShell {
    fn exec(&self, command: &str) -> Result<String, RunnerError> {
        let target = self.target();
        let mut cmd = Command::new("ssh");
        self.base_args(&mut cmd);
        cmd.arg(self.destination()).arg(command);
        let output = run_process(cmd, &target, command, self.timeout)?;
        stdout_or_failure(output, &target, command)
    }

    fn fetch(&self, source: &str, dest: &Path) -> Result<(), RunnerError> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RunnerError::io(parent, e))?;
        }
        let target = self.target();
        let remote_path = format!("{}:{}", self.destination(), source);
        let mut cmd = Command::new("scp");
        self.base_args(&mut cmd);
        cmd.arg(&remote_path).arg(dest);
        let description = format!("scp {} {}", remote_path, dest.display());
        let output = run_process(cmd, &target, &description, self.timeout)?;
        stdout_or_failure(output, &target, &description).map(|_| ())
    }

    fn target(&self) -> String {
        self.destination()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutput {
    Text(String),
    Json(Value),
}

/// Runs benchmark commands and optionally reads back their JSON result file.
#[derive(Clone)]
pub struct CommandRunner {
    executor: Arc<dyn CommandExecutor>,
    out_folder: String,
}

impl CommandRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>, out_folder: impl Into<String>) -> Self {
        Self {
            executor,
            out_folder: out_folder.into(),
        }
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    pub fn out_folder(&self) -> &str {
        &self.out_folder
    }

    pub fn exec(&self, command: &str) -> Result<String, RunnerError> {
        self.executor.exec(command)
    }

    pub fn run(&self, command: &str, result_name: Option<&str>) -> Result<CommandOutput, RunnerError> {
        let stdout = self.executor.exec(command)?;
        let Some(name) = result_name else {
            return Ok(CommandOutput::Text(stdout));
        };
        let retrieve = format!(
            "cat {}/{}",
            self.out_folder.trim_end_matches('/'),
            shell_quote(&format!("{}.json", name))
        );
        debug!(host = %self.executor.target(), command = %retrieve, "reading result file");
        let raw = self.executor.exec(&retrieve)?;
        if raw.trim().is_empty() {
            return Ok(CommandOutput::Json(Value::Null));
        }
        serde_json::from_str(&raw)
            .map(CommandOutput::Json)
            .map_err(|e| RunnerError::ResultParse {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}

pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(label: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_transport_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn local_runner(out: &Path) -> CommandRunner {
        CommandRunner::new(
            Arc::new(LocalShell::new(Duration::from_secs(10))),
            out.to_string_lossy().to_string(),
        )
    }

    #[test]
    fn plain_command_returns_stdout() {
        let out = scratch("plain");
        let runner = local_runner(&out);
        let output = runner.run("echo hello", None).expect("run");
        assert_eq!(output, CommandOutput::Text("hello\n".to_string()));
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn named_result_is_read_back_as_json() {
        let out = scratch("named");
        let runner = local_runner(&out);
        let command = format!(
            "printf '%s' '{{\"name\":\"alpha\",\"duration\":{{\"s\":1,\"ms\":5}}}}' > {}/alpha.json",
            out.display()
        );
        let output = runner.run(&command, Some("alpha")).expect("run");
        match output {
            CommandOutput::Json(value) => assert_eq!(value["name"], "alpha"),
            other => panic!("expected json, got {:?}", other),
        }
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn malformed_result_file_is_a_parse_error() {
        let out = scratch("malformed");
        fs::write(out.join("broken.json"), "{ not json").expect("write");
        let runner = local_runner(&out);
        let err = runner.run("true", Some("broken")).expect_err("must fail");
        assert!(
            matches!(err, RunnerError::ResultParse { ref name, .. } if name == "broken"),
            "unexpected error: {}",
            err
        );
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn empty_result_file_reads_as_null() {
        let out = scratch("empty");
        fs::write(out.join("quiet.json"), "\n").expect("write");
        let runner = local_runner(&out);
        let output = runner.run("true", Some("quiet")).expect("run");
        assert_eq!(output, CommandOutput::Json(Value::Null));
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn nonzero_exit_reports_stderr_tail() {
        let shell = LocalShell::new(Duration::from_secs(10));
        let err = shell
            .exec("echo first >&2; echo 'last words' >&2; exit 3")
            .expect_err("must fail");
        match err {
            RunnerError::CommandExecution { exit, stderr, .. } => {
                assert_eq!(exit, "3");
                assert_eq!(stderr, "last words");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn hung_command_is_killed_at_timeout() {
        let shell = LocalShell::new(Duration::from_millis(200));
        let started = Instant::now();
        let err = shell.exec("exec sleep 5").expect_err("must time out");
        assert!(matches!(err, RunnerError::CommandTimeout { .. }), "{}", err);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn background_child_holding_the_pipes_still_times_out() {
        let shell = LocalShell::new(Duration::from_millis(300));
        let started = Instant::now();
        let err = shell
            .exec("sleep 6 & echo started")
            .expect_err("must time out");
        assert!(matches!(err, RunnerError::CommandTimeout { .. }), "{}", err);
        assert!(
            started.elapsed() < Duration::from_secs(4),
            "exec blocked for {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn quiet_background_child_does_not_hold_the_command() {
        let shell = LocalShell::new(Duration::from_secs(5));
        let started = Instant::now();
        let out = shell
            .exec("sleep 6 >/dev/null 2>&1 & echo started")
            .expect("run");
        assert_eq!(out, "started\n");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn local_fetch_copies_into_new_directory() {
        let out = scratch("fetch");
        let source = out.join("artifact.tar.gz");
        fs::write(&source, b"archive").expect("write");
        let dest = out.join("run").join("copy.tar.gz");
        LocalShell::new(Duration::from_secs(5))
            .fetch(&source.to_string_lossy(), &dest)
            .expect("fetch");
        assert_eq!(fs::read(&dest).expect("read"), b"archive");
        let _ = fs::remove_dir_all(out);
    }

    #[test]
    fn shell_quote_leaves_plain_words_alone() {
        assert_eq!(shell_quote("alpha.json"), "alpha.json");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote(""), "''");
    }
}
