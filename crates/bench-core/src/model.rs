use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Sentinel stored in `meta.content_id` when a run directory could not be published.
pub const NO_CONTENT_ID: &str = "none";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Benchmark,
    Restart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Active,
    Done,
    Failed,
    Drained,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClinicRequest {
    pub enabled: bool,
}

/// What a caller asks the queue to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub clinic: Option<ClinicRequest>,
    #[serde(default)]
    pub benchmarks: Option<Vec<String>>,
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub nightly: bool,
}

impl JobSpec {
    pub fn benchmark() -> Self {
        Self {
            kind: JobKind::Benchmark,
            commit: None,
            clinic: None,
            benchmarks: None,
            remote: false,
            nightly: false,
        }
    }

    pub fn restart() -> Self {
        Self {
            kind: JobKind::Restart,
            ..Self::benchmark()
        }
    }

    pub fn with_commit(mut self, commit: impl Into<String>) -> Self {
        self.commit = Some(commit.into());
        self
    }

    pub fn with_clinic(mut self, enabled: bool) -> Self {
        self.clinic = Some(ClinicRequest { enabled });
        self
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    pub fn nightly(mut self) -> Self {
        self.nightly = true;
        self
    }
}

/// One queued unit of orchestration work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub commit: Option<String>,
    /// `None` defers to the configured profiling default.
    pub clinic_enabled: Option<bool>,
    #[serde(default)]
    pub benchmarks: Option<Vec<String>>,
    pub remote: bool,
    pub nightly: bool,
    pub enqueued_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Job {
    pub fn from_spec(id: String, spec: JobSpec) -> Self {
        Self {
            id,
            kind: spec.kind,
            commit: spec.commit,
            clinic_enabled: spec.clinic.map(|c| c.enabled),
            benchmarks: spec.benchmarks,
            remote: spec.remote,
            nightly: spec.nightly,
            enqueued_at: Utc::now(),
            status: JobStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub active: Option<Job>,
    pub pending: Vec<Job>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrainReport {
    pub removed: Vec<Job>,
    #[serde(flatten)]
    pub status: QueueStatus,
}

/// Wall time reported by a benchmark script as whole seconds plus milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BenchDuration {
    #[serde(default)]
    pub s: f64,
    #[serde(default)]
    pub ms: f64,
}

impl BenchDuration {
    pub fn from_millis(millis: f64) -> Self {
        Self {
            s: (millis / 1000.0).trunc(),
            ms: millis % 1000.0,
        }
    }

    pub fn millis(&self) -> f64 {
        self.s * 1000.0 + self.ms
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ResultMeta {
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, alias = "contentId")]
    pub content_id: Option<String>,
}

/// A single timing record produced by a benchmark script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub name: String,
    #[serde(default)]
    pub subtest: Option<String>,
    #[serde(default, alias = "fileSet")]
    pub file_set: Option<String>,
    pub duration: BenchDuration,
    #[serde(default)]
    pub meta: ResultMeta,
    #[serde(default, alias = "testClass")]
    pub test_class: Option<String>,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warmup: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RunResult {
    pub fn duration_millis(&self) -> f64 {
        self.duration.millis()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("result has an empty benchmark name".to_string());
        }
        let millis = self.duration_millis();
        if !millis.is_finite() || millis < 0.0 {
            return Err(format!(
                "result {} has invalid duration {}ms",
                self.name, millis
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProfilingOp {
    #[serde(rename = "doctor")]
    Doctor,
    #[serde(rename = "flame")]
    Flame,
    #[serde(rename = "bubbleProf")]
    BubbleProf,
}

impl ProfilingOp {
    pub const ALL: [ProfilingOp; 3] = [ProfilingOp::Doctor, ProfilingOp::Flame, ProfilingOp::BubbleProf];

    pub fn as_str(self) -> &'static str {
        match self {
            ProfilingOp::Doctor => "doctor",
            ProfilingOp::Flame => "flame",
            ProfilingOp::BubbleProf => "bubbleProf",
        }
    }
}

impl fmt::Display for ProfilingOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfilingVariant {
    pub operation: ProfilingOp,
    pub file_set: String,
    pub command: String,
}

/// Static descriptor of one benchmark in the catalogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchmarkTest {
    pub name: String,
    /// Shell command; `{job_id}` is substituted per run.
    pub command: String,
    #[serde(default)]
    pub profiling: BTreeMap<ProfilingOp, Vec<ProfilingVariant>>,
}

impl BenchmarkTest {
    pub fn render_command(&self, job_id: &str) -> String {
        render_template(&self.command, job_id)
    }

    pub fn variants(&self, op: ProfilingOp) -> &[ProfilingVariant] {
        self.profiling.get(&op).map(Vec::as_slice).unwrap_or(&[])
    }
}

pub fn render_template(template: &str, job_id: &str) -> String {
    template.replace("{job_id}", job_id)
}
