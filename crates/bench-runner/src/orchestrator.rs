//! Executes one benchmark job end to end.
//!
//! Every stage is contained at the smallest scope that can continue: a
//! profiling variant, then a test, then the job. Only an unreachable
//! persistence endpoint (or a job that cannot get a run directory or
//! transport at all) fails the job.

use crate::error::RunnerError;
use crate::persistence::{InfluxStore, ResultSink, StoreReport};
use crate::publish::{IpfsPublisher, Publisher};
use crate::queue::JobHandler;
use crate::retrieve;
use crate::transport::{CommandExecutor, CommandOutput, CommandRunner, LocalShell, SecureShell};
use bench_core::model::render_template;
use bench_core::{
    atomic_write_json_pretty, ensure_dir, sha256_file, BenchmarkTest, Config, Job, LogFile,
    ProfilingOp, ProfilingVariant, RunResult, NO_CONTENT_ID,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunParams {
    pub job_id: String,
    pub commit: Option<String>,
    pub clinic_enabled: Option<bool>,
    pub remote: bool,
    pub benchmarks: Option<Vec<String>>,
    pub nightly: bool,
}

impl RunParams {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            commit: job.commit.clone().filter(|c| !c.is_empty()),
            clinic_enabled: job.clinic_enabled,
            remote: job.remote,
            benchmarks: job.benchmarks.clone(),
            nightly: job.nightly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Ok,
    Empty,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub path: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestOutcome {
    pub name: String,
    pub status: TestStatus,
    pub error: Option<String>,
    pub results: usize,
    pub profiling_failures: usize,
    pub artifacts: Vec<ArtifactRecord>,
}

impl TestOutcome {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: TestStatus::Failed,
            error: None,
            results: 0,
            profiling_failures: 0,
            artifacts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job_id: String,
    pub run_dir: PathBuf,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tests: Vec<TestOutcome>,
    pub results_collected: usize,
    pub content_id: String,
    pub persisted: Option<usize>,
    pub persist_failures: Option<usize>,
}

impl RunSummary {
    pub fn failed_tests(&self) -> usize {
        self.tests
            .iter()
            .filter(|t| t.status == TestStatus::Failed)
            .count()
    }
}

#[derive(Debug, Serialize)]
struct RunManifest<'a> {
    schema_version: &'static str,
    job_id: &'a str,
    commit: Option<&'a str>,
    location: &'static str,
    target: &'a str,
    nightly: bool,
    clinic_enabled: bool,
    started_at: DateTime<Utc>,
    written_at: DateTime<Utc>,
    tests: &'a [TestOutcome],
}

/// Removes the run directory when the job is finished with it.
struct RunDirGuard {
    path: PathBuf,
    keep: bool,
}

impl Drop for RunDirGuard {
    fn drop(&mut self) {
        if self.keep {
            info!(run_dir = %self.path.display(), "keeping run directory");
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.path) {
            warn!(run_dir = %self.path.display(), error = %e, "could not remove run directory");
        }
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    local: Arc<dyn CommandExecutor>,
    remote: Option<Arc<dyn CommandExecutor>>,
    publisher: Arc<dyn Publisher>,
    sink: Arc<dyn ResultSink>,
    log_file: Option<LogFile>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        local: Arc<dyn CommandExecutor>,
        remote: Option<Arc<dyn CommandExecutor>>,
        publisher: Arc<dyn Publisher>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            local,
            remote,
            publisher,
            sink,
            log_file: None,
        }
    }

    /// Wires the production collaborators described by `config`.
    pub fn from_config(config: Arc<Config>) -> Result<Self, RunnerError> {
        let local: Arc<dyn CommandExecutor> = Arc::new(LocalShell::new(config.command_timeout));
        let remote = config.benchmarks.remote.clone().map(|target| {
            Arc::new(SecureShell::new(target, config.command_timeout)) as Arc<dyn CommandExecutor>
        });
        let publisher = Arc::new(IpfsPublisher::new(&config.ipfs)?);
        let sink = Arc::new(InfluxStore::new(&config.influx)?);
        Ok(Self::new(config, local, remote, publisher, sink))
    }

    pub fn with_log_file(mut self, log_file: LogFile) -> Self {
        self.log_file = Some(log_file);
        self
    }

    fn transport(&self, remote: bool) -> Result<Arc<dyn CommandExecutor>, RunnerError> {
        if remote {
            self.remote.clone().ok_or(RunnerError::NoRemoteTarget)
        } else {
            Ok(self.local.clone())
        }
    }

    fn create_run_dir(&self, job_id: &str) -> Result<PathBuf, RunnerError> {
        let name = format!("run_{}_{}", Utc::now().format("%Y%m%d_%H%M%S%3f"), job_id);
        let path = self.config.runs_root.join(name);
        ensure_dir(&path).map_err(|e| RunnerError::io(&path, e))?;
        Ok(path)
    }

    /// Tests to run for this job, honouring an optional name filter.
    pub fn select_tests(&self, params: &RunParams) -> Vec<&BenchmarkTest> {
        let suite = self.config.benchmarks.catalog.suite(params.remote);
        match params.benchmarks.as_deref() {
            Some(names) if !names.is_empty() => {
                for name in names {
                    if !suite.iter().any(|t| &t.name == name) {
                        warn!(job_id = %params.job_id, benchmark = %name, "unknown benchmark requested");
                    }
                }
                suite.iter().filter(|t| names.contains(&t.name)).collect()
            }
            _ => suite.iter().collect(),
        }
    }

    fn provision(&self, params: &RunParams) {
        let mut command = self.config.provision_command.clone();
        if let Some(commit) = &params.commit {
            command.push_str(&format!(" -e commit={}", crate::transport::shell_quote(commit)));
        }
        info!(job_id = %params.job_id, "provisioning benchmark host");
        if let Err(e) = self.local.exec(&command) {
            let e = RunnerError::Provision(e.to_string());
            error!(job_id = %params.job_id, error = %e, "provisioning failed, continuing");
        }
    }

    pub fn run(&self, params: &RunParams) -> Result<RunSummary, RunnerError> {
        let started_at = Utc::now();
        let executor = self.transport(params.remote)?;
        let target = executor.target();
        let runner = CommandRunner::new(executor, self.config.out_folder.clone());
        let run_dir = self.create_run_dir(&params.job_id)?;
        let _guard = RunDirGuard {
            path: run_dir.clone(),
            keep: self.config.keep_run_dirs,
        };
        let clinic_enabled = params
            .clinic_enabled
            .unwrap_or(self.config.benchmarks.clinic_enabled);
        info!(
            job_id = %params.job_id,
            commit = params.commit.as_deref().unwrap_or("-"),
            host = %target,
            clinic_enabled,
            run_dir = %run_dir.display(),
            "starting benchmark run"
        );

        if params.remote {
            self.provision(params);
        }

        let mut collected = Vec::new();
        let mut outcomes = Vec::new();
        for test in self.select_tests(params) {
            let outcome = self.run_test(&runner, test, params, clinic_enabled, &run_dir, &mut collected);
            outcomes.push(outcome);
        }

        self.rotate_log(&run_dir);
        let manifest = RunManifest {
            schema_version: "run_manifest_v1",
            job_id: &params.job_id,
            commit: params.commit.as_deref(),
            location: if params.remote { "remote" } else { "local" },
            target: &target,
            nightly: params.nightly,
            clinic_enabled,
            started_at,
            written_at: Utc::now(),
            tests: &outcomes,
        };
        let manifest_path = run_dir.join("run_manifest.json");
        if let Err(e) = atomic_write_json_pretty(&manifest_path, &manifest) {
            warn!(job_id = %params.job_id, error = %e, "could not write run manifest");
        }

        let content_id = match self.publisher.publish(&run_dir) {
            Ok(cid) => Some(cid),
            Err(e) => {
                error!(job_id = %params.job_id, error = %e, "publish failed, results get no content id");
                None
            }
        };
        stamp_content_id(&mut collected, content_id.as_deref());

        let mut summary = RunSummary {
            job_id: params.job_id.clone(),
            run_dir: run_dir.clone(),
            target,
            started_at,
            finished_at: started_at,
            tests: outcomes,
            results_collected: collected.len(),
            content_id: content_id.unwrap_or_else(|| NO_CONTENT_ID.to_string()),
            persisted: None,
            persist_failures: None,
        };

        let persisted = if collected.is_empty() {
            warn!(job_id = %params.job_id, "no results to persist");
            Ok(StoreReport::default())
        } else {
            self.sink.store(&collected)
        };
        summary.finished_at = Utc::now();
        match persisted {
            Ok(report) => {
                if report.failed > 0 {
                    warn!(job_id = %params.job_id, failed = report.failed, "some points were not written");
                }
                summary.persisted = Some(report.written);
                summary.persist_failures = Some(report.failed);
                info!(
                    job_id = %params.job_id,
                    tests = summary.tests.len(),
                    failed_tests = summary.failed_tests(),
                    persisted = report.written,
                    content_id = %summary.content_id,
                    "benchmark run finished"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(job_id = %params.job_id, error = %e, "results could not be persisted");
                Err(e)
            }
        }
    }

    fn run_test(
        &self,
        runner: &CommandRunner,
        test: &BenchmarkTest,
        params: &RunParams,
        clinic_enabled: bool,
        run_dir: &Path,
        collected: &mut Vec<RunResult>,
    ) -> TestOutcome {
        let mut outcome = TestOutcome::new(&test.name);
        let test_dir = run_dir.join(&test.name);
        if let Err(e) = ensure_dir(&test_dir) {
            error!(test = %test.name, error = %e, "cannot create test directory");
            outcome.error = Some(e.to_string());
            return outcome;
        }

        let command = test.render_command(&params.job_id);
        info!(job_id = %params.job_id, test = %test.name, "running benchmark");
        match runner.run(&command, Some(&test.name)) {
            Ok(output) => {
                let value = match output {
                    CommandOutput::Json(value) => value,
                    CommandOutput::Text(text) => Value::String(text),
                };
                let results_path = test_dir.join("results.json");
                match atomic_write_json_pretty(&results_path, &value) {
                    Ok(()) => {
                        if let Ok(digest) = sha256_file(&results_path) {
                            outcome.artifacts.push(ArtifactRecord {
                                path: format!("{}/results.json", test.name),
                                digest,
                            });
                        }
                    }
                    Err(e) => warn!(test = %test.name, error = %e, "could not keep raw result"),
                }
                match parse_results(&test.name, &value) {
                    Ok(results) if results.is_empty() => {
                        warn!(test = %test.name, "benchmark produced an empty result");
                        outcome.status = TestStatus::Empty;
                    }
                    Ok(mut results) => {
                        for result in results.iter_mut() {
                            if result.meta.commit.is_none() {
                                result.meta.commit = params.commit.clone();
                            }
                        }
                        outcome.status = TestStatus::Ok;
                        outcome.results = results.len();
                        collected.extend(results);
                    }
                    Err(e) => {
                        error!(test = %test.name, error = %e, "benchmark result rejected");
                        outcome.error = Some(e.to_string());
                    }
                }
            }
            Err(e) => {
                error!(job_id = %params.job_id, test = %test.name, error = %e, "benchmark failed");
                outcome.error = Some(e.to_string());
            }
        }

        if clinic_enabled {
            for op in ProfilingOp::ALL {
                for variant in test.variants(op) {
                    match self.run_variant(runner, test, variant, params, &test_dir) {
                        Ok(artifact) => outcome.artifacts.push(artifact),
                        Err(e) => {
                            error!(
                                test = %test.name,
                                operation = %op,
                                file_set = %variant.file_set,
                                error = %e,
                                "profiling variant failed"
                            );
                            outcome.profiling_failures += 1;
                        }
                    }
                }
            }
        }
        outcome
    }

    fn run_variant(
        &self,
        runner: &CommandRunner,
        test: &BenchmarkTest,
        variant: &ProfilingVariant,
        params: &RunParams,
        test_dir: &Path,
    ) -> Result<ArtifactRecord, RunnerError> {
        info!(
            test = %test.name,
            operation = %variant.operation,
            file_set = %variant.file_set,
            "running profiler"
        );
        let profiled = runner
            .exec(&render_template(&variant.command, &params.job_id))
            .and_then(|_| retrieve::retrieve(runner, &test.name, variant, test_dir));
        if let Err(e) = runner.exec(&self.config.benchmarks.cleanup) {
            warn!(test = %test.name, error = %e, "profiler cleanup failed");
        }
        let archive = profiled?;
        let digest = sha256_file(&archive).map_err(|e| RunnerError::io(&archive, e))?;
        let rel = format!(
            "{}/{}",
            test.name,
            archive
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default()
        );
        Ok(ArtifactRecord { path: rel, digest })
    }

    fn rotate_log(&self, run_dir: &Path) {
        let Some(log_file) = &self.log_file else {
            debug!("no process log file to rotate");
            return;
        };
        if let Err(e) = log_file.rotate_into(&run_dir.join("stdout.log")) {
            warn!(error = %e, "log rotation failed");
        }
    }
}

impl JobHandler for Orchestrator {
    fn execute(&self, job: &Job) -> anyhow::Result<()> {
        self.run(&RunParams::from_job(job))?;
        Ok(())
    }

    fn prepare_restart(&self, job: &Job) -> anyhow::Result<()> {
        info!(job_id = %job.id, "restart requested, flushing logs");
        if let Some(log_file) = &self.log_file {
            log_file.clone().flush()?;
        }
        Ok(())
    }
}

/// Normalises a benchmark's JSON output into validated results.
///
/// `null`, `{}`, `[]` and blank strings are empty output, not errors. Entries
/// that fail validation are dropped individually.
pub fn parse_results(test_name: &str, value: &Value) -> Result<Vec<RunResult>, RunnerError> {
    let items: Vec<Value> = match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.clone(),
        Value::Object(map) if map.is_empty() => Vec::new(),
        Value::Object(_) => vec![value.clone()],
        Value::String(s) if s.trim().is_empty() => Vec::new(),
        other => {
            return Err(RunnerError::ResultParse {
                name: test_name.to_string(),
                message: format!("unexpected result shape: {}", other),
            })
        }
    };
    let mut results = Vec::with_capacity(items.len());
    for item in items {
        let result: RunResult =
            serde_json::from_value(item).map_err(|e| RunnerError::ResultParse {
                name: test_name.to_string(),
                message: e.to_string(),
            })?;
        match result.validate() {
            Ok(()) => results.push(result),
            Err(reason) => warn!(test = test_name, %reason, "dropping invalid result"),
        }
    }
    Ok(results)
}

/// Sets every result's content id, falling back to the sentinel.
pub fn stamp_content_id(results: &mut [RunResult], content_id: Option<&str>) {
    let value = content_id.unwrap_or(NO_CONTENT_ID);
    for result in results.iter_mut() {
        result.meta.content_id = Some(value.to_string());
    }
}
