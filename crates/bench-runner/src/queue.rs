//! Single-worker FIFO job queue with a restart journal.
//!
//! At most one job is active. The worker thread is spawned when the queue goes
//! from idle to busy and exits when nothing is pending. A finished restart job
//! halts the queue for the rest of the process lifetime; whatever is still
//! pending is journaled so the next process can pick it up.

use bench_core::{atomic_write_json_pretty, DrainReport, Job, JobKind, JobSpec, JobStatus, QueueStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::VecDeque;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

pub const HISTORY_LIMIT: usize = 50;
const JOURNAL_SCHEMA: &str = "queue_journal_v1";
const MAX_COMMIT_LEN: usize = 64;

/// Work the queue hands each job to.
pub trait JobHandler: Send + Sync {
    fn execute(&self, job: &Job) -> anyhow::Result<()>;

    /// Runs when a restart job becomes active, before the queue halts.
    fn prepare_restart(&self, _job: &Job) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid job: {0}")]
    InvalidSpec(String),
    #[error("queue journal {path}: {message}")]
    Journal { path: PathBuf, message: String },
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalFile {
    schema_version: String,
    written_at: DateTime<Utc>,
    jobs: Vec<Job>,
}

#[derive(Default)]
struct QueueState {
    active: Option<Job>,
    pending: VecDeque<Job>,
    history: VecDeque<Job>,
    worker_running: bool,
    halted: bool,
    seq: u64,
}

impl QueueState {
    fn knows(&self, id: &str) -> bool {
        self.active.as_ref().is_some_and(|j| j.id == id)
            || self.pending.iter().any(|j| j.id == id)
            || self.history.iter().any(|j| j.id == id)
    }

    fn record(&mut self, job: Job) {
        self.history.push_back(job);
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn snapshot(&self) -> QueueStatus {
        QueueStatus {
            active: self.active.clone(),
            pending: self.pending.iter().cloned().collect(),
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    changed: Condvar,
    handler: Arc<dyn JobHandler>,
    journal_path: Option<PathBuf>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_journal(&self, state: &QueueState) -> Result<(), QueueError> {
        let Some(path) = &self.journal_path else {
            return Ok(());
        };
        let journal = JournalFile {
            schema_version: JOURNAL_SCHEMA.to_string(),
            written_at: Utc::now(),
            jobs: state.pending.iter().cloned().collect(),
        };
        atomic_write_json_pretty(path, &journal).map_err(|e| QueueError::Journal {
            path: path.clone(),
            message: e.to_string(),
        })?;
        info!(path = %path.display(), jobs = journal.jobs.len(), "queue journal written");
        Ok(())
    }
}

#[derive(Clone)]
pub struct JobQueue {
    shared: Arc<Shared>,
}

impl JobQueue {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self::build(handler, None)
    }

    /// A queue that journals pending work to `path` when it halts for restart.
    pub fn with_journal(handler: Arc<dyn JobHandler>, path: impl Into<PathBuf>) -> Self {
        Self::build(handler, Some(path.into()))
    }

    fn build(handler: Arc<dyn JobHandler>, journal_path: Option<PathBuf>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                changed: Condvar::new(),
                handler,
                journal_path,
            }),
        }
    }

    pub fn journal_path(&self) -> Option<&Path> {
        self.shared.journal_path.as_deref()
    }

    /// Validates `spec`, queues it and returns the created job without waiting
    /// for it to run.
    pub fn enqueue(&self, spec: JobSpec) -> Result<Job, QueueError> {
        validate_spec(&spec)?;
        let mut state = self.shared.lock();
        state.seq += 1;
        let id = format!("job_{}_{}", Utc::now().format("%Y%m%d%H%M%S"), state.seq);
        let job = Job::from_spec(id, spec);
        info!(job_id = %job.id, kind = ?job.kind, commit = job.commit.as_deref().unwrap_or("-"), "job enqueued");
        self.admit(state, job.clone())?;
        Ok(job)
    }

    fn admit(&self, mut state: MutexGuard<'_, QueueState>, job: Job) -> Result<(), QueueError> {
        let job_id = job.id.clone();
        state.pending.push_back(job);
        if state.halted {
            if let Err(e) = self.shared.write_journal(&state) {
                state.pending.pop_back();
                return Err(e);
            }
            warn!(job_id = %job_id, "queue is halted for restart; job kept for the next process");
            self.shared.changed.notify_all();
            return Ok(());
        }
        if !state.worker_running {
            state.worker_running = true;
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name("bench-queue".to_string())
                .spawn(move || worker_loop(shared));
            if let Err(e) = spawned {
                state.worker_running = false;
                error!(error = %e, "could not start queue worker; job stays pending");
            }
        }
        self.shared.changed.notify_all();
        Ok(())
    }

    pub fn status(&self) -> QueueStatus {
        self.shared.lock().snapshot()
    }

    /// Recent terminal jobs, newest first.
    pub fn history(&self) -> Vec<Job> {
        self.shared.lock().history.iter().rev().cloned().collect()
    }

    /// Removes every pending job. The active job is left alone.
    pub fn drain(&self) -> DrainReport {
        let mut state = self.shared.lock();
        let now = Utc::now();
        let mut removed = Vec::with_capacity(state.pending.len());
        while let Some(mut job) = state.pending.pop_front() {
            job.status = JobStatus::Drained;
            job.finished_at = Some(now);
            removed.push(job.clone());
            state.record(job);
        }
        if state.halted {
            if let Err(e) = self.shared.write_journal(&state) {
                error!(error = %e, "could not rewrite journal after drain");
            }
        }
        info!(removed = removed.len(), "queue drained");
        self.shared.changed.notify_all();
        DrainReport {
            removed,
            status: state.snapshot(),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.shared.lock().halted
    }

    /// Blocks until a restart job has finished.
    pub fn wait_for_halt(&self) {
        let mut state = self.shared.lock();
        while !state.halted {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Like `wait_for_halt` but gives up after `timeout`; returns whether the
    /// queue is halted.
    pub fn wait_for_halt_timeout(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| state.halted)
    }

    /// Waits until no worker is running; returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.wait_until(timeout, |state| !state.worker_running)
    }

    fn wait_until(&self, timeout: Duration, done: impl Fn(&QueueState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if done(&state) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            state = self
                .shared
                .changed
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Re-queues jobs journaled by a previous process and removes the journal.
    /// Jobs keep the ids they were enqueued with; ids already known are skipped.
    pub fn restore_journal(&self) -> Result<usize, QueueError> {
        let Some(path) = self.shared.journal_path.clone() else {
            return Ok(0);
        };
        if !path.exists() {
            return Ok(0);
        }
        let journal_error = |message: String| QueueError::Journal {
            path: path.clone(),
            message,
        };
        let raw = fs::read_to_string(&path).map_err(|e| journal_error(e.to_string()))?;
        let journal: JournalFile =
            serde_json::from_str(&raw).map_err(|e| journal_error(e.to_string()))?;
        if journal.schema_version != JOURNAL_SCHEMA {
            return Err(journal_error(format!(
                "unsupported schema {}",
                journal.schema_version
            )));
        }
        fs::remove_file(&path).map_err(|e| journal_error(e.to_string()))?;

        let mut restored = 0usize;
        for mut job in journal.jobs {
            let mut state = self.shared.lock();
            if state.knows(&job.id) {
                warn!(job_id = %job.id, "journaled job already queued, skipping");
                continue;
            }
            if let Some(seq) = job.id.rsplit('_').next().and_then(|s| s.parse::<u64>().ok()) {
                state.seq = state.seq.max(seq);
            }
            job.status = JobStatus::Pending;
            job.started_at = None;
            job.finished_at = None;
            job.error = None;
            info!(job_id = %job.id, "restoring journaled job");
            self.admit(state, job)?;
            restored += 1;
        }
        info!(restored, "queue journal restored");
        Ok(restored)
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.lock();
            if state.halted {
                state.worker_running = false;
                shared.changed.notify_all();
                return;
            }
            let Some(mut job) = state.pending.pop_front() else {
                state.worker_running = false;
                shared.changed.notify_all();
                return;
            };
            job.status = JobStatus::Active;
            job.started_at = Some(Utc::now());
            state.active = Some(job.clone());
            shared.changed.notify_all();
            job
        };

        info!(job_id = %job.id, kind = ?job.kind, "job started");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| match job.kind {
            JobKind::Benchmark => shared.handler.execute(&job),
            JobKind::Restart => shared.handler.prepare_restart(&job),
        }));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(payload) => Some(format!("job panicked: {}", panic_message(payload.as_ref()))),
        };

        let mut state = shared.lock();
        let mut finished = state.active.take().unwrap_or(job);
        finished.finished_at = Some(Utc::now());
        match failure {
            None => {
                finished.status = JobStatus::Done;
                info!(job_id = %finished.id, "job done");
            }
            Some(message) => {
                error!(job_id = %finished.id, error = %message, "job failed");
                finished.status = JobStatus::Failed;
                finished.error = Some(message);
            }
        }
        if finished.kind == JobKind::Restart {
            state.halted = true;
            if let Err(e) = shared.write_journal(&state) {
                error!(error = %e, "pending jobs could not be journaled");
            }
            info!(pending = state.pending.len(), "restart job finished; queue halted");
        }
        state.record(finished);
        shared.changed.notify_all();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub fn validate_spec(spec: &JobSpec) -> Result<(), QueueError> {
    match spec.kind {
        JobKind::Restart => {
            if spec.commit.is_some() || spec.clinic.is_some() || spec.benchmarks.is_some() || spec.nightly {
                return Err(QueueError::InvalidSpec(
                    "restart jobs take no benchmark options".to_string(),
                ));
            }
        }
        JobKind::Benchmark => {
            if let Some(commit) = &spec.commit {
                if commit.is_empty() {
                    return Err(QueueError::InvalidSpec("commit is empty".to_string()));
                }
                if commit.chars().any(char::is_whitespace) {
                    return Err(QueueError::InvalidSpec(format!(
                        "commit {:?} contains whitespace",
                        commit
                    )));
                }
                if commit.len() > MAX_COMMIT_LEN {
                    return Err(QueueError::InvalidSpec(format!(
                        "commit is longer than {} characters",
                        MAX_COMMIT_LEN
                    )));
                }
            }
            if let Some(names) = &spec.benchmarks {
                if names.iter().any(|n| n.trim().is_empty()) {
                    return Err(QueueError::InvalidSpec(
                        "benchmark names must not be empty".to_string(),
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(10);

    #[derive(Default)]
    struct Recorder {
        running: AtomicUsize,
        max_running: AtomicUsize,
        executed: Mutex<Vec<String>>,
        gate: Option<Mutex<mpsc::Receiver<()>>>,
    }

    impl Recorder {
        fn gated() -> (Arc<Self>, mpsc::Sender<()>) {
            let (tx, rx) = mpsc::channel();
            let recorder = Self {
                gate: Some(Mutex::new(rx)),
                ..Self::default()
            };
            (Arc::new(recorder), tx)
        }

        fn executed(&self) -> Vec<String> {
            self.executed.lock().expect("lock").clone()
        }
    }

    impl JobHandler for Recorder {
        fn execute(&self, job: &Job) -> anyhow::Result<()> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(now, Ordering::SeqCst);
            self.executed.lock().expect("lock").push(job.id.clone());
            if let Some(gate) = &self.gate {
                let _ = gate.lock().expect("gate").recv_timeout(WAIT);
            }
            thread::sleep(Duration::from_millis(5));
            self.running.fetch_sub(1, Ordering::SeqCst);
            match job.commit.as_deref() {
                Some("bad") => anyhow::bail!("benchmark host unreachable"),
                Some("boom") => panic!("handler exploded"),
                _ => Ok(()),
            }
        }
    }

    fn scratch(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "bench_queue_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("scratch dir");
        dir
    }

    fn wait_for_active(queue: &JobQueue) -> Job {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(job) = queue.status().active {
                return job;
            }
            assert!(Instant::now() < deadline, "no job became active");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn commit(c: &str) -> JobSpec {
        JobSpec::benchmark().with_commit(c)
    }

    #[test]
    fn jobs_run_one_at_a_time_in_fifo_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = JobQueue::new(recorder.clone());
        let ids: Vec<String> = (0..6)
            .map(|i| queue.enqueue(commit(&format!("c{}", i))).expect("enqueue").id)
            .collect();
        assert!(queue.status().pending.iter().all(|j| j.status == JobStatus::Pending));
        assert!(queue.wait_idle(WAIT));
        assert_eq!(recorder.max_running.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.executed(), ids);
        let status = queue.status();
        assert!(status.active.is_none() && status.pending.is_empty());
        assert!(queue.history().iter().all(|j| j.status == JobStatus::Done));
    }

    #[test]
    fn enqueue_returns_pending_job_immediately() {
        let (recorder, release) = Recorder::gated();
        let queue = JobQueue::new(recorder);
        let first = queue.enqueue(commit("abc123").with_clinic(true)).expect("enqueue");
        assert_eq!(first.status, JobStatus::Pending);
        assert_eq!(first.clinic_enabled, Some(true));
        let second = queue.enqueue(JobSpec::benchmark()).expect("enqueue");
        assert_ne!(first.id, second.id);
        release.send(()).expect("release");
        release.send(()).expect("release");
        assert!(queue.wait_idle(WAIT));
    }

    #[test]
    fn drain_removes_pending_but_not_active() {
        let (recorder, release) = Recorder::gated();
        let queue = JobQueue::new(recorder.clone());
        let first = queue.enqueue(commit("a1")).expect("enqueue");
        for c in ["b1", "c1", "d1"] {
            queue.enqueue(commit(c)).expect("enqueue");
        }
        let active = wait_for_active(&queue);
        assert_eq!(active.id, first.id);
        assert_eq!(active.status, JobStatus::Active);

        let report = queue.drain();
        assert_eq!(report.removed.len(), 3);
        assert!(report.removed.iter().all(|j| j.status == JobStatus::Drained));
        assert!(report.status.pending.is_empty());
        assert_eq!(report.status.active.as_ref().map(|j| j.id.as_str()), Some(first.id.as_str()));
        let after = queue.status();
        assert!(after.pending.is_empty());
        assert_eq!(after.active.map(|j| j.id), Some(first.id.clone()));

        release.send(()).expect("release");
        assert!(queue.wait_idle(WAIT));
        assert_eq!(recorder.executed(), vec![first.id]);
        let history = queue.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].status, JobStatus::Done);
    }

    #[test]
    fn failures_and_panics_do_not_halt_the_queue() {
        let recorder = Arc::new(Recorder::default());
        let queue = JobQueue::new(recorder.clone());
        let bad = queue.enqueue(commit("bad")).expect("enqueue");
        let boom = queue.enqueue(commit("boom")).expect("enqueue");
        let good = queue.enqueue(commit("good")).expect("enqueue");
        assert!(queue.wait_idle(WAIT));

        let history = queue.history();
        let find = |id: &str| history.iter().find(|j| j.id == id).cloned().expect("in history");
        let bad = find(&bad.id);
        assert_eq!(bad.status, JobStatus::Failed);
        assert!(bad.error.as_deref().unwrap_or("").contains("unreachable"));
        let boom = find(&boom.id);
        assert_eq!(boom.status, JobStatus::Failed);
        assert!(boom.error.as_deref().unwrap_or("").contains("handler exploded"));
        assert_eq!(find(&good.id).status, JobStatus::Done);
        assert!(!queue.is_halted());
    }

    #[test]
    fn restart_halts_and_journals_remaining_work() {
        let dir = scratch("restart");
        let journal = dir.join("queue_journal.json");
        let (recorder, release) = Recorder::gated();
        let queue = JobQueue::with_journal(recorder.clone(), &journal);
        let first = queue.enqueue(commit("a1")).expect("enqueue");
        let restart = queue.enqueue(JobSpec::restart()).expect("enqueue restart");
        let later = queue.enqueue(commit("b2")).expect("enqueue");
        release.send(()).expect("release");

        assert!(queue.wait_for_halt_timeout(WAIT));
        assert!(queue.wait_idle(WAIT));
        assert_eq!(recorder.executed(), vec![first.id.clone()]);
        let status = queue.status();
        assert!(status.active.is_none());
        assert_eq!(status.pending.len(), 1);
        assert_eq!(status.pending[0].id, later.id);
        assert!(queue
            .history()
            .iter()
            .any(|j| j.id == restart.id && j.status == JobStatus::Done));

        let after_halt = queue.enqueue(commit("c3")).expect("accepted while halted");
        thread::sleep(Duration::from_millis(50));
        assert_eq!(recorder.executed().len(), 1, "nothing runs after a restart");

        let raw = fs::read_to_string(&journal).expect("journal");
        let parsed: JournalFile = serde_json::from_str(&raw).expect("journal json");
        assert_eq!(parsed.schema_version, JOURNAL_SCHEMA);
        let ids: Vec<&str> = parsed.jobs.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec![later.id.as_str(), after_halt.id.as_str()]);

        let next = Arc::new(Recorder::default());
        let restarted = JobQueue::with_journal(next.clone(), &journal);
        assert_eq!(restarted.restore_journal().expect("restore"), 2);
        assert!(!journal.exists());
        assert!(restarted.wait_idle(WAIT));
        assert_eq!(next.executed(), vec![later.id.clone(), after_halt.id.clone()]);
        assert_eq!(restarted.restore_journal().expect("second restore"), 0);

        let fresh = restarted.enqueue(JobSpec::benchmark()).expect("enqueue");
        assert_ne!(fresh.id, later.id);
        assert_ne!(fresh.id, after_halt.id);
        assert!(restarted.wait_idle(WAIT));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn restore_skips_duplicate_ids() {
        let dir = scratch("dupes");
        let journal = dir.join("queue_journal.json");
        let job = Job::from_spec("job_20260101000000_7".to_string(), commit("abc"));
        let file = JournalFile {
            schema_version: JOURNAL_SCHEMA.to_string(),
            written_at: Utc::now(),
            jobs: vec![job.clone(), job],
        };
        atomic_write_json_pretty(&journal, &file).expect("write journal");
        let recorder = Arc::new(Recorder::default());
        let queue = JobQueue::with_journal(recorder.clone(), &journal);
        assert_eq!(queue.restore_journal().expect("restore"), 1);
        assert!(queue.wait_idle(WAIT));
        assert_eq!(recorder.executed(), vec!["job_20260101000000_7".to_string()]);
        let next = queue.enqueue(JobSpec::benchmark()).expect("enqueue");
        assert!(next.id.ends_with("_8"), "{}", next.id);
        assert!(queue.wait_idle(WAIT));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_journal_is_reported() {
        let dir = scratch("corrupt");
        let journal = dir.join("queue_journal.json");
        fs::write(&journal, "{ nope").expect("write");
        let queue = JobQueue::with_journal(Arc::new(Recorder::default()), &journal);
        let err = queue.restore_journal().expect_err("corrupt");
        assert!(matches!(err, QueueError::Journal { .. }), "{}", err);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let queue = JobQueue::new(Arc::new(Recorder::default()));
        for spec in [
            commit(""),
            commit("abc 123"),
            commit(&"a".repeat(65)),
            JobSpec::restart().with_commit("abc"),
            JobSpec {
                benchmarks: Some(vec![" ".to_string()]),
                ..JobSpec::benchmark()
            },
        ] {
            let err = queue.enqueue(spec).expect_err("invalid");
            assert!(matches!(err, QueueError::InvalidSpec(_)), "{}", err);
        }
        assert!(queue.status().pending.is_empty());
    }
}
