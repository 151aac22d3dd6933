//! Invocation wrapper: runs a reserved job and settles its broker message.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error};

use jobrelay_core::{JobId, JobRecord};

use crate::broker::Delivery;

/// A job this worker holds the lock on.
///
/// `message` is the delivery that led to the reservation. It is acked by
/// [`Invoker::invoke`] and never persisted.
#[derive(Debug)]
pub struct ReservedJob {
    job: JobRecord,
    message: Option<Delivery>,
}

impl ReservedJob {
    pub fn new(job: JobRecord, message: Delivery) -> Self {
        Self {
            job,
            message: Some(message),
        }
    }

    /// A job obtained without a broker message (nothing to ack).
    pub fn without_message(job: JobRecord) -> Self {
        Self { job, message: None }
    }

    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn into_job(self) -> JobRecord {
        self.job
    }

    pub fn has_message(&self) -> bool {
        self.message.is_some()
    }

    pub fn message(&self) -> Option<&Delivery> {
        self.message.as_ref()
    }
}

/// Executes a job's payload.
#[async_trait]
pub trait Performer: Send + Sync {
    async fn perform(&self, job: &JobRecord) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct Invoker {
    performer: Arc<dyn Performer>,
}

impl Invoker {
    pub fn new(performer: Arc<dyn Performer>) -> Self {
        Self { performer }
    }

    /// Run the job, then ack its message whatever the outcome.
    ///
    /// The payload's error (or panic) is passed through after the ack. A
    /// failed ack is logged only; the message will be redelivered and
    /// rejected by the fingerprint check.
    ///
    /// The message is handed to a detached task together with the payload,
    /// so dropping the returned future still acks once the payload ends.
    pub async fn invoke(&self, reserved: &mut ReservedJob) -> anyhow::Result<()> {
        let performer = Arc::clone(&self.performer);
        let job = reserved.job.clone();
        let job_id = job.id;
        let message = reserved.message.take();

        let settled = tokio::spawn(async move {
            // Inner task so a panicking payload still reaches the ack.
            let outcome = tokio::spawn(async move { performer.perform(&job).await }).await;
            if let Some(message) = message {
                settle(job_id, &message).await;
            }
            outcome
        })
        .await;

        match settled {
            Ok(Ok(result)) => result,
            Ok(Err(join)) | Err(join) if join.is_panic() => {
                std::panic::resume_unwind(join.into_panic())
            }
            Ok(Err(join)) | Err(join) => Err(anyhow::anyhow!("job execution aborted: {}", join)),
        }
    }
}

async fn settle(job_id: Option<JobId>, message: &Delivery) {
    match message.ack().await {
        Ok(()) => debug!(job_id = ?job_id, tag = %message.tag(), "acknowledged job message"),
        Err(e) => error!(
            job_id = ?job_id,
            tag = %message.tag(),
            error = %e,
            "failed to acknowledge job message"
        ),
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, InMemoryBroker, PublishOptions};
    use jobrelay_core::BrokerPriority;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Outcome {
        fail: Option<&'static str>,
        panic: bool,
        runs: AtomicUsize,
    }

    impl Outcome {
        fn ok() -> Arc<Self> {
            Arc::new(Self { fail: None, panic: false, runs: AtomicUsize::new(0) })
        }

        fn failing(msg: &'static str) -> Arc<Self> {
            Arc::new(Self { fail: Some(msg), panic: false, runs: AtomicUsize::new(0) })
        }

        fn panicking() -> Arc<Self> {
            Arc::new(Self { fail: None, panic: true, runs: AtomicUsize::new(0) })
        }
    }

    #[async_trait]
    impl Performer for Outcome {
        async fn perform(&self, _job: &JobRecord) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("payload panicked");
            }
            match self.fail {
                Some(msg) => Err(anyhow::anyhow!(msg)),
                None => Ok(()),
            }
        }
    }

    fn job() -> JobRecord {
        let mut job = JobRecord::new(b"x".to_vec());
        job.id = Some(JobId::new(1));
        job
    }

    async fn reserved_with_message(broker: &InMemoryBroker) -> ReservedJob {
        broker
            .publish(b"n".to_vec(), PublishOptions::immediate(BrokerPriority::Normal))
            .await
            .unwrap();
        let delivery = broker
            .pop(Duration::from_millis(10), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        ReservedJob::new(job(), delivery)
    }

    #[tokio::test]
    async fn success_acks_once() {
        let broker = InMemoryBroker::new();
        let mut reserved = reserved_with_message(&broker).await;
        let tag = reserved.message().unwrap().tag().to_string();

        Invoker::new(Outcome::ok()).invoke(&mut reserved).await.unwrap();

        assert_eq!(broker.ack_count(&tag), 1);
        assert!(!reserved.has_message());
    }

    #[tokio::test]
    async fn failure_acks_once_then_returns_the_error() {
        let broker = InMemoryBroker::new();
        let mut reserved = reserved_with_message(&broker).await;
        let tag = reserved.message().unwrap().tag().to_string();

        let err = Invoker::new(Outcome::failing("boom"))
            .invoke(&mut reserved)
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "boom");
        assert_eq!(broker.ack_count(&tag), 1);
    }

    #[tokio::test]
    async fn panic_acks_then_resumes() {
        let broker = InMemoryBroker::new();
        let mut reserved = reserved_with_message(&broker).await;
        let tag = reserved.message().unwrap().tag().to_string();
        let invoker = Invoker::new(Outcome::panicking());

        let caught = tokio::spawn(async move { invoker.invoke(&mut reserved).await }).await;

        assert!(caught.unwrap_err().is_panic());
        assert_eq!(broker.ack_count(&tag), 1);
    }

    #[tokio::test]
    async fn job_without_message_just_runs() {
        let broker = InMemoryBroker::new();
        let performer = Outcome::ok();
        let mut reserved = ReservedJob::without_message(job());

        Invoker::new(performer.clone()).invoke(&mut reserved).await.unwrap();

        assert_eq!(performer.runs.load(Ordering::SeqCst), 1);
        assert_eq!(broker.total_acks(), 0);
    }

    #[tokio::test]
    async fn invoking_twice_acks_only_the_first_time() {
        let broker = InMemoryBroker::new();
        let mut reserved = reserved_with_message(&broker).await;
        let tag = reserved.message().unwrap().tag().to_string();
        let invoker = Invoker::new(Outcome::ok());

        invoker.invoke(&mut reserved).await.unwrap();
        invoker.invoke(&mut reserved).await.unwrap();

        assert_eq!(broker.ack_count(&tag), 1);
    }

    struct Slow {
        done: AtomicUsize,
    }

    #[async_trait]
    impl Performer for Slow {
        async fn perform(&self, _job: &JobRecord) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            self.done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_invocation_still_acks_when_the_payload_ends() {
        let broker = InMemoryBroker::new();
        let mut reserved = reserved_with_message(&broker).await;
        let tag = reserved.message().unwrap().tag().to_string();
        let performer = Arc::new(Slow { done: AtomicUsize::new(0) });
        let invoker = Invoker::new(performer.clone());

        let timed_out =
            tokio::time::timeout(Duration::from_millis(20), invoker.invoke(&mut reserved)).await;
        assert!(timed_out.is_err());
        assert!(!reserved.has_message());
        assert_eq!(broker.ack_count(&tag), 0);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(performer.done.load(Ordering::SeqCst), 1);
        assert_eq!(broker.ack_count(&tag), 1);
    }
}
