//! Publishes a notification whenever a job row reaches a new persisted version.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use jobrelay_core::{JobRecord, Notification, PriorityMap};

use crate::broker::{Broker, PublishOptions};
use crate::store::{CommitEvent, CommitHook, CommitKind, JobStore, JobStoreError, MutationOrigin};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NotifyError {
    #[error("job has not been persisted")]
    UnpersistedJob,
}

/// Sink for errors that are handled locally but should still be seen.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, error: &(dyn std::error::Error + Send + Sync + 'static), context: &str);
}

/// Turns persisted job versions into broker notifications.
#[derive(Clone)]
pub struct Notifier {
    broker: Arc<dyn Broker>,
    priorities: PriorityMap,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

impl Notifier {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            priorities: PriorityMap::new(),
            reporter: None,
        }
    }

    pub fn with_priorities(mut self, priorities: PriorityMap) -> Self {
        self.priorities = priorities;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Announce `job`'s current version, deliverable at `run_at` (or the
    /// job's own `run_at`).
    ///
    /// Transport failures are logged and reported, never returned: a lost
    /// notification must not fail the write that triggered it.
    pub async fn publish(
        &self,
        job: &JobRecord,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<(), NotifyError> {
        let notification = Notification::for_job(job).map_err(|_| NotifyError::UnpersistedJob)?;

        let priority = match self.priorities.lookup(job.priority) {
            Some(p) => p,
            None => {
                warn!(
                    job_id = %notification.job_id,
                    job_priority = job.priority,
                    "no broker priority mapped for job priority, using normal"
                );
                self.priorities.resolve(job.priority)
            }
        };
        let options = PublishOptions::new(priority, run_at.unwrap_or(job.run_at));

        let payload = match notification.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                self.report_failure(&notification, &e);
                return Ok(());
            }
        };

        match self.broker.publish(payload, options).await {
            Ok(()) => {
                debug!(
                    job_id = %notification.job_id,
                    fingerprint = %notification.fingerprint,
                    priority = %priority,
                    run_at = %options.run_at,
                    "published job notification"
                );
            }
            Err(e) => self.report_failure(&notification, &e),
        }
        Ok(())
    }

    /// Publish a fresh notification for every job that can still run.
    ///
    /// Used to rebuild broker state after it has lost messages.
    pub async fn republish_all(&self, store: &dyn JobStore) -> Result<usize, JobStoreError> {
        let jobs = store.list_dispatchable().await?;
        let mut published = 0;
        for job in &jobs {
            if self.publish(job, None).await.is_ok() {
                published += 1;
            }
        }
        debug!(count = published, "republished job notifications");
        Ok(published)
    }

    fn report_failure(
        &self,
        notification: &Notification,
        err: &(dyn std::error::Error + Send + Sync + 'static),
    ) {
        error!(
            job_id = %notification.job_id,
            error = %err,
            "failed to publish job notification"
        );
        if let Some(reporter) = &self.reporter {
            reporter.report(err, "publishing job notification");
        }
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("priorities", &self.priorities)
            .field("reporter", &self.reporter.is_some())
            .finish()
    }
}

#[async_trait]
impl CommitHook for Notifier {
    async fn on_commit(&self, event: &CommitEvent) {
        let announce = matches!(event.kind, CommitKind::Created | CommitKind::Updated)
            && event.origin == MutationOrigin::Business
            && !event.job.has_failed();
        if !announce {
            return;
        }
        if let Err(e) = self.publish(&event.job, None).await {
            warn!(error = %e, "skipping notification for committed job");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::store::InMemoryJobStore;
    use jobrelay_core::{BrokerPriority, JobId, JobLock};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingReporter {
        reports: Mutex<Vec<String>>,
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, error: &(dyn std::error::Error + Send + Sync + 'static), _context: &str) {
            self.reports.lock().unwrap().push(error.to_string());
        }
    }

    fn setup() -> (Arc<InMemoryBroker>, Notifier) {
        let broker = InMemoryBroker::arc();
        let notifier = Notifier::new(broker.clone())
            .with_priorities(PriorityMap::new().with(10, BrokerPriority::High));
        (broker, notifier)
    }

    fn saved(id: i64) -> JobRecord {
        let mut job = JobRecord::new(b"work".to_vec());
        job.id = Some(JobId::new(id));
        job
    }

    #[tokio::test]
    async fn publishes_notification_for_job() {
        let (broker, notifier) = setup();
        let job = saved(3).with_priority(10);

        notifier.publish(&job, None).await.unwrap();

        let published = broker.published();
        assert_eq!(published.len(), 1);
        let n = Notification::from_bytes(&published[0].payload).unwrap();
        assert!(n.matches(&job));
        assert_eq!(published[0].options.priority, BrokerPriority::High);
        assert_eq!(published[0].options.run_at, job.run_at);
    }

    #[tokio::test]
    async fn run_at_override_and_unmapped_priority() {
        let (broker, notifier) = setup();
        let job = saved(3).with_priority(42);
        let later = job.run_at + chrono::Duration::minutes(10);

        notifier.publish(&job, Some(later)).await.unwrap();

        let published = broker.published();
        assert_eq!(published[0].options.priority, BrokerPriority::Normal);
        assert_eq!(published[0].options.run_at, later);
    }

    #[tokio::test]
    async fn unpersisted_job_is_rejected() {
        let (broker, notifier) = setup();
        let err = notifier.publish(&JobRecord::new(Vec::new()), None).await;
        assert_eq!(err, Err(NotifyError::UnpersistedJob));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn transport_failures_are_reported_not_returned() {
        let (broker, notifier) = setup();
        let reporter = Arc::new(RecordingReporter::default());
        let notifier = notifier.with_reporter(reporter.clone());
        broker.fail_publishes("connection refused");

        assert!(notifier.publish(&saved(1), None).await.is_ok());
        assert_eq!(reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hook_publishes_only_business_creates_and_updates() {
        let (broker, notifier) = setup();
        let notifier = Arc::new(notifier);
        let store = InMemoryJobStore::new();
        store.on_commit(notifier.clone());

        let mut job = store.insert(JobRecord::new(Vec::new())).await.unwrap();
        assert_eq!(broker.published().len(), 1);

        job.run_at = job.run_at + chrono::Duration::seconds(30);
        let job = store.update(&job).await.unwrap();
        assert_eq!(broker.published().len(), 2);

        // Lock stamping is internal.
        let lock = store.lock_row(job.id.unwrap()).await.unwrap().unwrap();
        lock.stamp(JobLock::new(Utc::now(), "w")).await.unwrap();
        assert_eq!(broker.published().len(), 2);

        // Permanently failed.
        let mut failed = store.find(job.id.unwrap()).await.unwrap().unwrap();
        failed.failed_at = Some(Utc::now());
        store.update(&failed).await.unwrap();
        assert_eq!(broker.published().len(), 2);

        store.delete(job.id.unwrap()).await.unwrap();
        assert_eq!(broker.published().len(), 2);
    }

    #[tokio::test]
    async fn republish_all_skips_failed_jobs() {
        let (broker, notifier) = setup();
        let store = InMemoryJobStore::new();
        store.insert(JobRecord::new(Vec::new())).await.unwrap();
        store.insert(JobRecord::new(Vec::new())).await.unwrap();
        let mut failed = JobRecord::new(Vec::new());
        failed.failed_at = Some(Utc::now());
        store.insert(failed).await.unwrap();

        let count = notifier.republish_all(&store).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(broker.published().len(), 2);
    }
}
