//! Lease record model and its storage codec.
//!
//! Records are stored as JSON. Timestamps are encoded as integer milliseconds
//! so that decoding and re-encoding a record yields the exact same bytes,
//! which the Redis compare-and-swap relies on.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while validating or (de)serializing a [`LeaseRecord`].
#[derive(Debug, Error)]
pub enum CodecError {
    /// JSON encode/decode failure.
    #[error("codec error: {0}")]
    Json(#[from] serde_json::Error),
    /// The record violates the leased/deadline invariant.
    #[error("invalid lease record {key}: {reason}")]
    Invalid { key: String, reason: &'static str },
}

/// The persisted state of one leasable key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Unique key identifier.
    pub key: String,
    /// When the key joined the pool. Never changes.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    /// True while a holder has exclusive use of the key.
    pub is_leased: bool,
    /// When the current lease is considered abandoned. Present iff leased.
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub lease_deadline: Option<DateTime<Utc>>,
    /// Monotonic revision for optimistic conflict checks.
    pub revision: u64,
}

impl LeaseRecord {
    /// A fresh, free record.
    pub fn new(key: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            created_at: truncate_millis(created_at),
            is_leased: false,
            lease_deadline: None,
            revision: 0,
        }
    }

    /// Copy of this record held until `deadline`.
    pub fn leased_until(&self, deadline: DateTime<Utc>) -> Self {
        Self {
            is_leased: true,
            lease_deadline: Some(truncate_millis(deadline)),
            revision: self.revision.saturating_add(1),
            ..self.clone()
        }
    }

    /// Copy of this record with the lease cleared.
    pub fn freed(&self) -> Self {
        Self {
            is_leased: false,
            lease_deadline: None,
            revision: self.revision.saturating_add(1),
            ..self.clone()
        }
    }

    /// Copy of this record with only the revision bumped.
    pub fn touched(&self) -> Self {
        Self {
            revision: self.revision.saturating_add(1),
            ..self.clone()
        }
    }

    /// true if the record is leased and its deadline is at or before `now`
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_leased && self.lease_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Position of this record in the free-key index: oldest first.
    pub fn free_score(&self) -> i64 {
        self.created_at.timestamp_millis()
    }

    /// Check the leased flag and deadline agree.
    pub fn validate(&self) -> Result<(), CodecError> {
        match (self.is_leased, self.lease_deadline) {
            (true, None) => Err(CodecError::Invalid {
                key: self.key.clone(),
                reason: "leased record is missing its lease deadline",
            }),
            (false, Some(_)) => Err(CodecError::Invalid {
                key: self.key.clone(),
                reason: "free record carries a lease deadline",
            }),
            _ => Ok(()),
        }
    }
}

/// Encode a record for storage.
pub fn encode(record: &LeaseRecord) -> Result<String, CodecError> {
    record.validate()?;
    Ok(serde_json::to_string(record)?)
}

/// Decode a stored record.
pub fn decode(data: &str) -> Result<LeaseRecord, CodecError> {
    let record: LeaseRecord = serde_json::from_str(data)?;
    record.validate()?;
    Ok(record)
}

// stored precision is milliseconds, keep in-memory values comparable to decoded ones
fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Convert a std duration to a chrono one, saturating on overflow.
pub fn chrono_duration(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LeaseRecord {
        LeaseRecord::new(
            "6f1c1a4e-2d1b-4a57-9b1e-000000000001",
            DateTime::from_timestamp_millis(1_700_000_000_123).unwrap(),
        )
    }

    #[test]
    fn test_new_record_is_free() {
        let record = sample();
        assert!(!record.is_leased);
        assert_eq!(record.lease_deadline, None);
        assert_eq!(record.revision, 0);
        assert!(record.validate().is_ok());
    }

    #[test]
    fn test_transitions_bump_revision_and_keep_created_at() {
        let record = sample();
        let deadline = record.created_at + Duration::seconds(60);

        let leased = record.leased_until(deadline);
        assert!(leased.is_leased);
        assert_eq!(leased.lease_deadline, Some(deadline));
        assert_eq!(leased.revision, 1);
        assert_eq!(leased.created_at, record.created_at);

        let freed = leased.freed();
        assert!(!freed.is_leased);
        assert_eq!(freed.lease_deadline, None);
        assert_eq!(freed.revision, 2);
        // same lease state as before, but a different revision
        assert_ne!(freed, record);

        let touched = leased.touched();
        assert_eq!(touched.lease_deadline, leased.lease_deadline);
        assert_eq!(touched.revision, 2);
    }

    #[test]
    fn test_lease_expired() {
        let record = sample();
        let deadline = record.created_at + Duration::seconds(60);
        let leased = record.leased_until(deadline);

        assert!(!record.lease_expired(deadline + Duration::seconds(1)));
        assert!(!leased.lease_expired(deadline - Duration::seconds(1)));
        assert!(leased.lease_expired(deadline));
        assert!(leased.lease_expired(deadline + Duration::seconds(1)));
    }

    #[test]
    fn test_validate_rejects_mismatched_deadline() {
        let mut record = sample();
        record.is_leased = true;
        assert!(matches!(
            record.validate(),
            Err(CodecError::Invalid { .. })
        ));

        let mut record = sample();
        record.lease_deadline = Some(record.created_at);
        assert!(matches!(
            record.validate(),
            Err(CodecError::Invalid { .. })
        ));
        assert!(encode(&record).is_err());
    }

    #[test]
    fn test_encoding_is_stable() {
        let record = sample().leased_until(
            DateTime::from_timestamp_millis(1_700_000_060_123).unwrap(),
        );
        let encoded = encode(&record).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(encode(&decoded).unwrap(), encoded);
        assert!(encoded.contains("\"lease_deadline\":1700000060123"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(CodecError::Json(_))));
        assert!(matches!(
            decode(r#"{"key":"k","created_at":1,"is_leased":true,"lease_deadline":null,"revision":0}"#),
            Err(CodecError::Invalid { .. })
        ));
    }

    #[test]
    fn test_created_at_truncated_to_millis() {
        let ts = DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let record = LeaseRecord::new("k", ts);
        assert_eq!(record.created_at.timestamp_subsec_nanos(), 123_000_000);
        assert_eq!(record.free_score(), 1_700_000_000_123);
    }
}
