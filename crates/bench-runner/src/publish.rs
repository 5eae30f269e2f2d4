use crate::error::RunnerError;
use bench_core::config::IpfsConfig;
use reqwest::blocking::multipart::{Form, Part};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;
use walkdir::WalkDir;

pub trait Publisher: Send + Sync {
    /// Uploads `dir` and returns its content identifier.
    fn publish(&self, dir: &Path) -> Result<String, RunnerError>;
}

/// Publishes run directories through an IPFS node or cluster HTTP API.
pub struct IpfsPublisher {
    client: Client,
    api_url: String,
    user: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddEntry {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsPublisher {
    pub fn new(config: &IpfsConfig) -> Result<Self, RunnerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(600))
            .build()
            .map_err(|e| RunnerError::Publish(e.to_string()))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    fn build_form(dir: &Path) -> Result<(Form, usize), RunnerError> {
        let mut form = Form::new();
        let mut files = 0usize;
        let root_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string());
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = entry.map_err(|e| RunnerError::Publish(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(|e| RunnerError::Publish(e.to_string()))?;
            let bytes = fs::read(entry.path()).map_err(|e| RunnerError::io(entry.path(), e))?;
            let name = format!("{}/{}", root_name, rel.to_string_lossy());
            form = form.part("file", Part::bytes(bytes).file_name(name));
            files += 1;
        }
        Ok((form, files))
    }
}

impl Publisher for IpfsPublisher {
    fn publish(&self, dir: &Path) -> Result<String, RunnerError> {
        let (form, files) = Self::build_form(dir)?;
        if files == 0 {
            return Err(RunnerError::Publish(format!(
                "nothing to publish in {}",
                dir.display()
            )));
        }
        let mut request = self
            .client
            .post(format!("{}/api/v0/add", self.api_url))
            .query(&[("recursive", "true"), ("wrap-with-directory", "true"), ("pin", "true")])
            .multipart(form);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }
        let body = request
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.text())
            .map_err(|e| RunnerError::Publish(e.to_string()))?;
        let cid = parse_add_response(&body)?;
        info!(dir = %dir.display(), files, cid = %cid, "published run directory");
        Ok(cid)
    }
}

/// Picks the wrapping directory's hash out of the newline-delimited add response.
pub fn parse_add_response(body: &str) -> Result<String, RunnerError> {
    let mut last = None;
    for line in body.lines().filter(|l| !l.trim().is_empty()) {
        let entry: AddEntry = serde_json::from_str(line)
            .map_err(|e| RunnerError::Publish(format!("bad add response line: {}", e)))?;
        if entry.name.is_empty() {
            return Ok(entry.hash);
        }
        last = Some(entry.hash);
    }
    last.ok_or_else(|| RunnerError::Publish("empty add response".to_string()))
}
