//! Broker wire payload announcing that a job may be ready.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::fingerprint::{Fingerprint, truncate_to_second};
use crate::id::JobId;
use crate::job::JobRecord;

/// `{"job_id": 1, "last_modified_at": "2024-05-01T10:00:00Z", "fingerprint": "..."}`
///
/// Disposable: the broker may deliver it zero, one or many times, and it may
/// be stale by the time it arrives. The job store is the source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub job_id: JobId,
    #[serde(with = "second_precision")]
    pub last_modified_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
}

impl Notification {
    /// Describe the row's current persisted version.
    pub fn for_job(job: &JobRecord) -> DomainResult<Self> {
        Ok(Self {
            job_id: job.persisted_id()?,
            last_modified_at: truncate_to_second(&job.last_modified_at),
            fingerprint: job.fingerprint()?,
        })
    }

    /// Whether this notification still describes `job` as persisted.
    pub fn matches(&self, job: &JobRecord) -> bool {
        job.id == Some(self.job_id)
            && job
                .fingerprint()
                .is_ok_and(|current| current == self.fingerprint)
    }

    pub fn to_bytes(&self) -> DomainResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| DomainError::malformed(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> DomainResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| DomainError::malformed(e.to_string()))
    }
}

mod second_precision {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::fingerprint::{canonical_timestamp, truncate_to_second};

    pub fn serialize<S: Serializer>(at: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&canonical_timestamp(at))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| truncate_to_second(&parsed))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn saved_job() -> JobRecord {
        let mut job = JobRecord::new(b"payload".to_vec());
        job.id = Some(JobId::new(12));
        job.last_modified_at = Utc.timestamp_opt(1_700_000_000, 123_456_789).single().unwrap();
        job
    }

    #[test]
    fn wire_format_uses_second_precision() {
        let n = Notification::for_job(&saved_job()).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&n.to_bytes().unwrap()).unwrap();

        assert_eq!(json["job_id"], 12);
        assert_eq!(json["last_modified_at"], "2023-11-14T22:13:20Z");
        assert_eq!(json["fingerprint"], n.fingerprint.as_str());
    }

    #[test]
    fn decodes_offset_timestamps() {
        let raw = br#"{"job_id":12,"last_modified_at":"2023-11-14T12:13:20-10:00","fingerprint":"abc"}"#;
        let n = Notification::from_bytes(raw).unwrap();
        assert_eq!(n.last_modified_at, Utc.timestamp_opt(1_700_000_000, 0).single().unwrap());
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            Notification::from_bytes(b"not json"),
            Err(DomainError::MalformedNotification(_))
        ));
    }

    #[test]
    fn unsaved_job_cannot_be_announced() {
        let job = JobRecord::new(Vec::new());
        assert_eq!(Notification::for_job(&job), Err(DomainError::UnpersistedJob));
    }

    #[test]
    fn matches_until_the_row_is_persisted_again() {
        let mut job = saved_job();
        let n = Notification::for_job(&job).unwrap();
        assert!(n.matches(&job));

        job.last_modified_at += Duration::seconds(3);
        assert!(!n.matches(&job));
    }
}
