//! Daily trigger that queues a full nightly run.

use bench_core::JobSpec;
use bench_runner::JobQueue;
use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info};

/// First `hour:00` UTC strictly after `now`.
pub fn next_run_after(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    let at = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(at).and_utc();
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub fn nightly_spec(remote: bool) -> JobSpec {
    JobSpec::benchmark()
        .with_clinic(true)
        .with_remote(remote)
        .nightly()
}

/// Runs until the queue halts for restart.
pub fn spawn(queue: JobQueue, hour: u32, remote: bool) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("bench-nightly".to_string())
        .spawn(move || {
            let mut last_fired: Option<DateTime<Utc>> = None;
            loop {
                let now = Utc::now();
                let from = last_fired.map_or(now, |fired| fired.max(now));
                let next = next_run_after(from, hour);
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                info!(next = %next, "nightly run scheduled");
                if queue.wait_for_halt_timeout(wait) {
                    info!("queue halted; nightly scheduler stopping");
                    return;
                }
                match queue.enqueue(nightly_spec(remote)) {
                    Ok(job) => info!(job_id = %job.id, "nightly run enqueued"),
                    Err(e) => error!(error = %e, "could not enqueue nightly run"),
                }
                last_fired = Some(next);
            }
        })
}
