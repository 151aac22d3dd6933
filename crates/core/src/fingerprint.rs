//! Row-version fingerprints.
//!
//! A notification carries the fingerprint of the row it was built from. When
//! the fingerprint no longer matches the row, the row has been persisted again
//! since, and the notification is stale.

use chrono::{DateTime, SecondsFormat, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::id::JobId;

/// Number of digest bytes kept (hex encoded to twice as many characters).
const FINGERPRINT_BYTES: usize = 16;

/// Short stable digest over a job id and its last-modified second.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl core::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalise a timestamp to UTC, truncated to whole seconds.
pub fn truncate_to_second<Tz: TimeZone>(at: &DateTime<Tz>) -> DateTime<Utc> {
    let utc = at.with_timezone(&Utc);
    utc.with_nanosecond(0).unwrap_or(utc)
}

/// Canonical second-precision ISO-8601 rendering (`2024-05-01T10:00:00Z`).
pub fn canonical_timestamp<Tz: TimeZone>(at: &DateTime<Tz>) -> String {
    truncate_to_second(at).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Compute the fingerprint of `(id, last_modified_at)`.
///
/// The timestamp is normalised before hashing, so the same instant expressed
/// in any offset yields the same fingerprint.
pub fn fingerprint<Tz: TimeZone>(id: JobId, last_modified_at: &DateTime<Tz>) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(id.get().to_be_bytes());
    hasher.update(b"|");
    hasher.update(canonical_timestamp(last_modified_at).as_bytes());
    let digest = hasher.finalize();
    Fingerprint(hex::encode(&digest[..FINGERPRINT_BYTES]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, FixedOffset};
    use proptest::prelude::*;

    fn at(secs: i64, nanos: u32) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, nanos).single().unwrap()
    }

    #[test]
    fn fingerprint_is_short_hex() {
        let fp = fingerprint(JobId::new(1), &at(1_700_000_000, 0));
        assert_eq!(fp.as_str().len(), FINGERPRINT_BYTES * 2);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn sub_second_changes_are_invisible() {
        let id = JobId::new(7);
        assert_eq!(
            fingerprint(id, &at(1_700_000_000, 0)),
            fingerprint(id, &at(1_700_000_000, 999_999_999))
        );
    }

    #[test]
    fn a_new_second_changes_the_fingerprint() {
        let id = JobId::new(7);
        let before = at(1_700_000_000, 0);
        assert_ne!(
            fingerprint(id, &before),
            fingerprint(id, &(before + Duration::seconds(1)))
        );
    }

    #[test]
    fn same_instant_in_different_zones_matches() {
        let instant = at(1_700_000_000, 250_000_000);
        let hawaii = FixedOffset::west_opt(10 * 3600).unwrap();
        let auckland = FixedOffset::east_opt(13 * 3600).unwrap();

        let id = JobId::new(99);
        assert_eq!(
            fingerprint(id, &instant.with_timezone(&hawaii)),
            fingerprint(id, &instant.with_timezone(&auckland))
        );
        assert_eq!(
            canonical_timestamp(&instant.with_timezone(&hawaii)),
            "2023-11-14T22:13:20Z"
        );
    }

    proptest! {
        #[test]
        fn fingerprint_is_deterministic(id in any::<i64>(), secs in 0i64..4_000_000_000, nanos in 0u32..1_000_000_000) {
            let t = at(secs, nanos);
            prop_assert_eq!(fingerprint(JobId::new(id), &t), fingerprint(JobId::new(id), &t));
        }

        #[test]
        fn fingerprint_ignores_offset(id in any::<i64>(), secs in 0i64..4_000_000_000, offset_mins in -720i32..=840) {
            let t = at(secs, 0);
            let zone = FixedOffset::east_opt(offset_mins * 60).unwrap();
            prop_assert_eq!(fingerprint(JobId::new(id), &t), fingerprint(JobId::new(id), &t.with_timezone(&zone)));
        }

        #[test]
        fn different_ids_differ(a in any::<i64>(), b in any::<i64>(), secs in 0i64..4_000_000_000) {
            prop_assume!(a != b);
            let t = at(secs, 0);
            prop_assert_ne!(fingerprint(JobId::new(a), &t), fingerprint(JobId::new(b), &t));
        }
    }
}
