//! `smarties-scheduler` — durable, cancellable deferred jobs.
//!
//! Callers register a callback under a key, then schedule payloads for that
//! key at an absolute instant or a fixed offset. Jobs are persisted through
//! the `smarties-db` object mapper, so pending work survives a restart and is
//! fired by the first sweep after the process comes back. Callbacks live
//! only in memory and must be registered again on every start.

pub mod db;
pub mod engine;
pub mod error;
pub mod registry;
pub mod schedule;
pub mod types;

pub use engine::Scheduler;
pub use error::{Result, SchedulerError};
pub use registry::{identifier_for, Callback, CallbackRegistry};
pub use types::{Job, JobState, Relative, SweepReport, When};
