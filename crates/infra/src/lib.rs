//! Infrastructure layer: job stores, brokers, and the reservation protocol
//! that sits between them.
//!
//! ## Flow
//!
//! 1. A job row is committed through a [`store::JobStore`]; the
//!    [`notifier::Notifier`] commit hook publishes a notification.
//! 2. A worker calls [`reservation::ReservationManager::reserve`], which pops
//!    one notification and decides, under the row's exclusive lock, whether
//!    to run, skip or recheck the job.
//! 3. [`invoke::Invoker::invoke`] runs the reserved job and acks its message.

pub mod broker;
pub mod config;
pub mod handlers;
pub mod invoke;
pub mod lock;
pub mod notifier;
pub mod reservation;
pub mod store;
pub mod workers;

pub use broker::{Broker, BrokerError, Delivery, InMemoryBroker, PublishOptions};
pub use config::RelayConfig;
pub use handlers::{ExternalHandler, HandlerRegistry};
pub use invoke::{Invoker, Performer, ReservedJob};
pub use lock::ExclusiveLock;
pub use notifier::{ErrorReporter, Notifier, NotifyError};
pub use reservation::{ReservationConfig, ReservationManager, ReserveError};
pub use store::{CommitEvent, CommitHook, CommitKind, JobStore, JobStoreError, MutationOrigin};
pub use workers::{JobWorker, WorkerHandle};
