//! Background workers.

pub mod job_worker;

pub use job_worker::{JobWorker, WorkOutcome, WorkerError, WorkerHandle, WorkerStats};
