//! A concurrent load-generation engine for relational data stores.
//!
//! The engine drives a pool of [`Agent`]s, each owning one connection to the
//! target and issuing synthetic statements produced by a seeded
//! [`StatementGenerator`]. An adaptive throttle converges every agent's call
//! rate to a configured target, completed statements are timed and handed to
//! an asynchronous [`Recorder`] in one-second batches, and the [`Task`]
//! orchestrator owns the whole lifecycle: target setup, the concurrent run
//! with deadline and cancellation handling, teardown, and the final
//! [`Report`].
//!
//! Database drivers are deliberately not part of this crate. The target is
//! reached through the [`SqlClient`]/[`Connect`] traits; the shipped
//! [`PrintConnect`] implementation writes every statement to stderr, which is
//! what the `--only-print` mode of the CLI uses.
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

mod agent;
mod client;
mod recorder;
mod task;
mod throttle;
mod workload;

pub use agent::{Agent, AgentError};
pub use client::{BoxedClient, ClientError, Connect, PrintClient, PrintConnect, Row, SqlClient};
pub use recorder::{
    ClosedRecorder, LatencySummary, Recorder, Report, Sample, SampleCounter, SampleSender,
};
pub use task::{Progress, Task, TaskOptions};
pub use workload::{LoadType, StatementGenerator, WorkloadConfig};
