use anyhow::{anyhow, Result};
use bench_core::{BenchmarkTest, Config, Job, JobSpec, JobStatus};
use bench_runner::{JobHandler, JobQueue, Orchestrator, RunParams, RunSummary};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

mod logging;
mod scheduler;
mod schemas;
mod server;

#[derive(Parser)]
#[command(name = "bench", version = "0.3.0", about = "IPFS benchmark runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ClinicArg {
    #[value(name = "on")]
    On,
    #[value(name = "off")]
    Off,
}

impl From<ClinicArg> for bool {
    fn from(value: ClinicArg) -> Self {
        matches!(value, ClinicArg::On)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control API and nightly trigger until a restart job completes.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        no_schedule: bool,
    },
    /// Run a single benchmark job in the foreground.
    Run {
        #[arg(long)]
        commit: Option<String>,
        #[arg(long, value_enum)]
        clinic: Option<ClinicArg>,
        #[arg(long)]
        remote: bool,
        #[arg(long = "benchmark")]
        benchmarks: Vec<String>,
        #[arg(long)]
        json: bool,
    },
    /// List the benchmark catalogue for the configured stage.
    Tests {
        #[arg(long)]
        remote: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Serve { port, no_schedule } => {
            serve(port, no_schedule)?;
            Ok(None)
        }
        Commands::Run {
            commit,
            clinic,
            remote,
            benchmarks,
            json,
        } => {
            let spec = JobSpec {
                commit,
                benchmarks: (!benchmarks.is_empty()).then_some(benchmarks),
                ..JobSpec::benchmark().with_remote(remote)
            };
            let spec = match clinic {
                Some(clinic) => spec.with_clinic(clinic.into()),
                None => spec,
            };
            let (job, summary) = run_once(spec, json)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "job": job,
                    "summary": summary
                })));
            }
            print_summary(&job, summary.as_ref());
            Ok(None)
        }
        Commands::Tests { remote, json } => {
            let config = Config::from_env()?;
            let remote = remote || config.is_remote();
            let suite = config.benchmarks.catalog.suite(remote);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "stage": if remote { "remote" } else { "local" },
                    "tests": suite.iter().map(test_to_json).collect::<Vec<_>>()
                })));
            }
            for test in suite {
                println!("{}\t{}", test.name, test.command);
            }
            Ok(None)
        }
    }
}

fn build_orchestrator(config: &Arc<Config>, json: bool) -> Result<Orchestrator> {
    let log_file = logging::init(config, json)?;
    if config.server.api_key_defaulted {
        warn!("API_KEY is not set; using the built-in default key");
    }
    Ok(Orchestrator::from_config(config.clone())?.with_log_file(log_file))
}

fn serve(port: Option<u16>, no_schedule: bool) -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    let orchestrator = build_orchestrator(&config, false)?;
    info!(
        stage = config.stage.as_str(),
        tests = config.benchmarks.catalog.suite(config.is_remote()).len(),
        clinic = config.benchmarks.clinic_enabled,
        "starting benchmark runner"
    );
    let queue = JobQueue::with_journal(Arc::new(orchestrator), config.journal_path());
    match queue.restore_journal() {
        Ok(0) => {}
        Ok(restored) => info!(restored, "resumed jobs from before the restart"),
        Err(e) => error!(error = %e, "could not restore queue journal"),
    }

    let api = server::Api::new(queue.clone(), config.server.api_key.clone(), config.is_remote())?;
    let handle = server::spawn(api, port.unwrap_or(config.server.port))?;
    if no_schedule {
        info!("nightly trigger disabled");
    } else {
        scheduler::spawn(queue.clone(), config.nightly_hour, config.is_remote())?;
    }

    queue.wait_for_halt();
    info!("Exiting for restart.");
    handle.join();
    Ok(())
}

/// Keeps the summary of the last run so the CLI can report it.
struct Recorded {
    orchestrator: Orchestrator,
    last: Mutex<Option<RunSummary>>,
}

impl JobHandler for Recorded {
    fn execute(&self, job: &Job) -> anyhow::Result<()> {
        let summary = self.orchestrator.run(&RunParams::from_job(job))?;
        if let Ok(mut last) = self.last.lock() {
            *last = Some(summary);
        }
        Ok(())
    }
}

fn run_once(spec: JobSpec, json: bool) -> Result<(Job, Option<RunSummary>)> {
    let config = Arc::new(Config::from_env()?);
    let handler = Arc::new(Recorded {
        orchestrator: build_orchestrator(&config, json)?,
        last: Mutex::new(None),
    });
    let queue = JobQueue::new(handler.clone());
    let job = queue.enqueue(spec)?;
    while !queue.wait_idle(Duration::from_secs(60)) {
        info!(job_id = %job.id, "still running");
    }
    let finished = queue
        .history()
        .into_iter()
        .find(|j| j.id == job.id)
        .ok_or_else(|| anyhow!("job {} vanished from the queue", job.id))?;
    if finished.status == JobStatus::Failed {
        return Err(anyhow!(
            "job {} failed: {}",
            finished.id,
            finished.error.as_deref().unwrap_or("unknown error")
        ));
    }
    let summary = handler.last.lock().ok().and_then(|mut last| last.take());
    Ok((finished, summary))
}

fn print_summary(job: &Job, summary: Option<&RunSummary>) {
    println!("job: {} ({:?})", job.id, job.status);
    let Some(summary) = summary else {
        return;
    };
    println!("target: {}", summary.target);
    for test in &summary.tests {
        println!(
            "  {:<24} {:?}  results={} artifacts={} profiling_failures={}",
            test.name,
            test.status,
            test.results,
            test.artifacts.len(),
            test.profiling_failures
        );
    }
    println!("content id: {}", summary.content_id);
    if let Some(persisted) = summary.persisted {
        println!("persisted: {}", persisted);
    }
}

fn test_to_json(test: &BenchmarkTest) -> Value {
    let profiling: serde_json::Map<String, Value> = test
        .profiling
        .iter()
        .map(|(op, variants)| {
            (
                op.to_string(),
                json!(variants.iter().map(|v| v.file_set.clone()).collect::<Vec<_>>()),
            )
        })
        .collect();
    json!({
        "name": test.name,
        "command": test.command,
        "profiling": profiling
    })
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

pub(crate) fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. } | Commands::Tests { json, .. } => *json,
        Commands::Serve { .. } => false,
    }
}
