//! # joblens-core
//!
//! Domain model for job-feed processing runs. One [`JobLog`] is written per
//! run of a client feed through the indexing pipeline; the nested
//! [`Progress`] block carries the per-stage counters the analytics layer
//! aggregates over.

pub mod sample;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-run progress counters, written by the feed processor.
///
/// Field names on the wire are the processor's SCREAMING_SNAKE identifiers —
/// downstream queries reference them verbatim (e.g.
/// `progress.TOTAL_JOBS_SENT_TO_INDEX`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct Progress {
    pub switch_index: bool,
    pub total_records_in_feed: i64,
    pub total_jobs_in_feed: i64,
    pub total_jobs_fail_indexed: i64,
    pub total_jobs_sent_to_enrich: i64,
    pub total_jobs_dont_have_metadata: i64,
    pub total_jobs_dont_have_metadata_v2: i64,
    pub total_jobs_sent_to_index: i64,
}

/// One observation of a job-feed processing run.
///
/// Wire casing matches the analytics store schema: camelCase scalars,
/// snake_case country/currency codes, SCREAMING_SNAKE progress counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobLog {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    #[serde(rename = "country_code")]
    pub country_code: String,
    #[serde(rename = "currency_code")]
    pub currency_code: String,
    pub progress: Progress,
    pub status: RunStatus,
    pub timestamp: DateTime<Utc>,
    pub transaction_source_name: String,
    pub no_coordinates_count: i64,
    pub record_count: i64,
    pub unique_ref_number_count: i64,
}

/// Terminal state of a processing run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
    InProgress,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::InProgress => write!(f, "in_progress"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_casing() {
        let log = sample::sample_log(0);
        let value = serde_json::to_value(&log).unwrap();
        let obj = value.as_object().unwrap();

        assert!(obj.contains_key("country_code"));
        assert!(obj.contains_key("transactionSourceName"));
        assert!(obj.contains_key("noCoordinatesCount"));
        assert!(obj.contains_key("uniqueRefNumberCount"));

        let progress = obj.get("progress").and_then(|p| p.as_object()).unwrap();
        assert!(progress.contains_key("TOTAL_JOBS_SENT_TO_INDEX"));
        assert!(progress.contains_key("TOTAL_JOBS_DONT_HAVE_METADATA_V2"));
    }

    #[test]
    fn test_roundtrip() {
        let log = sample::sample_log(3);
        let json = serde_json::to_string(&log).unwrap();
        let back: JobLog = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, log.id);
        assert_eq!(back.transaction_source_name, log.transaction_source_name);
        assert_eq!(back.timestamp, log.timestamp);
    }
}
