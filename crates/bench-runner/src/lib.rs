//! Benchmark job queue, run orchestration and the I/O adapters it drives.

pub mod error;
pub mod orchestrator;
pub mod persistence;
pub mod publish;
pub mod queue;
pub mod retrieve;
pub mod transport;

pub use error::RunnerError;
pub use orchestrator::{Orchestrator, RunParams, RunSummary, TestOutcome, TestStatus};
pub use persistence::{InfluxStore, ResultSink, StoreReport};
pub use publish::{IpfsPublisher, Publisher};
pub use queue::{JobHandler, JobQueue, QueueError};
pub use transport::{CommandExecutor, CommandOutput, CommandRunner, LocalShell, SecureShell};
