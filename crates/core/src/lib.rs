//! `jobrelay-core`: domain building blocks for broker-notified job reservation.
//!
//! This crate is **pure**: job rows, notification wire payloads, fingerprints
//! and priority/retry policies. Stores and brokers live in `jobrelay-infra`.

pub mod error;
pub mod fingerprint;
pub mod id;
pub mod job;
pub mod notification;
pub mod priority;
pub mod retry;

pub use error::{DomainError, DomainResult};
pub use fingerprint::{Fingerprint, canonical_timestamp, fingerprint, truncate_to_second};
pub use id::JobId;
pub use job::{JobLock, JobRecord};
pub use notification::Notification;
pub use priority::{BrokerPriority, PriorityMap};
pub use retry::{BackoffStrategy, RetryPolicy};
