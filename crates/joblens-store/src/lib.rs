//! # joblens-store
//!
//! Thread-safe in-memory store for [`JobLog`] records. Exposes two query
//! paths: typed listing filters for the dashboard endpoints, and the
//! aggregation pipeline executor in [`aggregate`] for everything that speaks
//! stage objects (the metric endpoints and the assistant).

pub mod aggregate;

pub use aggregate::{execute_plan, AggregateError, QueryPlan};

use chrono::{DateTime, Utc};
use joblens_core::JobLog;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::path::Path;
use tokio::sync::RwLock;

/// Typed filter shared by the listing and metric endpoints.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub client: Option<String>,
    pub country: Option<String>,
}

impl LogFilter {
    pub fn matches(&self, log: &JobLog) -> bool {
        if let Some(start) = self.start_date {
            if log.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if log.timestamp > end {
                return false;
            }
        }
        if let Some(client) = &self.client {
            if &log.transaction_source_name != client {
                return false;
            }
        }
        if let Some(country) = &self.country {
            if &log.country_code != country {
                return false;
            }
        }
        true
    }

    /// The `$match` parameters equivalent to this filter, with date bounds in
    /// native form, for building pipelines that reuse the executor.
    pub fn to_match_params(&self) -> Value {
        let mut spec = Map::new();
        if self.start_date.is_some() || self.end_date.is_some() {
            let mut ts = Map::new();
            if let Some(start) = self.start_date {
                ts.insert("$gte".into(), aggregate::date_value(start));
            }
            if let Some(end) = self.end_date {
                ts.insert("$lte".into(), aggregate::date_value(end));
            }
            spec.insert("timestamp".into(), Value::Object(ts));
        }
        if let Some(client) = &self.client {
            spec.insert("transactionSourceName".into(), json!(client));
        }
        if let Some(country) = &self.country {
            spec.insert("country_code".into(), json!(country));
        }
        Value::Object(spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Pagination and ordering for the listing endpoint.
#[derive(Debug, Clone)]
pub struct PageRequest {
    pub page: usize,
    pub limit: usize,
    pub sort_field: String,
    pub sort_order: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            sort_field: "timestamp".into(),
            sort_order: SortOrder::Desc,
        }
    }
}

/// One page of listing results.
#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub data: Vec<JobLog>,
    pub total: usize,
    pub page: usize,
    pub limit: usize,
}

/// The log collection. Internally synchronized; shared across requests.
pub struct JobLogStore {
    records: RwLock<Vec<JobLog>>,
}

impl Default for JobLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobLogStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(Vec::new()),
        }
    }

    pub async fn insert(&self, log: JobLog) {
        self.records.write().await.push(log);
    }

    pub async fn insert_batch(&self, logs: Vec<JobLog>) -> usize {
        let mut records = self.records.write().await;
        records.extend(logs);
        records.len()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Filter, sort, paginate. `sort_field` may be any dotted record path.
    pub async fn find(&self, filter: &LogFilter, page: &PageRequest) -> LogPage {
        let records = self.records.read().await;
        let mut matched: Vec<&JobLog> = records.iter().filter(|l| filter.matches(l)).collect();
        let total = matched.len();

        if page.sort_field == "timestamp" {
            matched.sort_by_key(|l| l.timestamp);
        } else {
            let mut keyed: Vec<(Value, &JobLog)> = matched
                .into_iter()
                .map(|l| {
                    let key = serde_json::to_value(l)
                        .ok()
                        .and_then(|doc| aggregate::field_path(&doc, &page.sort_field))
                        .unwrap_or(Value::Null);
                    (key, l)
                })
                .collect();
            keyed.sort_by(|a, b| aggregate::total_cmp_values(&a.0, &b.0));
            matched = keyed.into_iter().map(|(_, l)| l).collect();
        }
        if page.sort_order == SortOrder::Desc {
            matched.reverse();
        }

        let page_no = page.page.max(1);
        let limit = page.limit.max(1);
        let data = matched
            .into_iter()
            .skip((page_no - 1) * limit)
            .take(limit)
            .cloned()
            .collect();

        LogPage {
            data,
            total,
            page: page_no,
            limit,
        }
    }

    /// Run an aggregation plan over the whole collection.
    pub async fn aggregate(&self, plan: &QueryPlan) -> Result<Vec<Value>, AggregateError> {
        let docs = {
            let records = self.records.read().await;
            let mut docs = Vec::with_capacity(records.len());
            for record in records.iter() {
                let doc = serde_json::to_value(record)
                    .map_err(|e| AggregateError::Internal(e.to_string()))?;
                docs.push(doc);
            }
            docs
        };
        execute_plan(docs, plan)
    }
}

/// Load an NDJSON snapshot, skipping malformed lines with a warning.
pub fn load_ndjson(path: &Path) -> std::io::Result<Vec<JobLog>> {
    let content = std::fs::read_to_string(path)?;
    let mut logs = Vec::new();
    for (no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<JobLog>(line) {
            Ok(log) => logs.push(log),
            Err(e) => tracing::warn!("Skipping malformed record at line {}: {}", no + 1, e),
        }
    }
    Ok(logs)
}
