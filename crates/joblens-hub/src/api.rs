//! # API Handlers
//!
//! Axum handlers for the hub's HTTP surface. The assistant endpoint maps the
//! pipeline's error taxonomy onto status codes here; everything else is
//! dashboard plumbing over the store's two query paths.

use crate::assistant::{AssistantError, ChatAnswer, ChatRequest};
use crate::AppState;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use joblens_store::aggregate::parse_instant;
use joblens_store::{LogFilter, LogPage, PageRequest, QueryPlan, SortOrder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;

/// Uniform failure body: a stable summary plus the underlying detail.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub details: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn bad_request(error: &str, details: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: error.into(),
            details: details.into(),
        }),
    )
}

fn server_error(error: &str, details: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorBody {
            error: error.into(),
            details: details.into(),
        }),
    )
}

// =============================================================================
// Status
// =============================================================================

#[derive(Serialize)]
pub struct SystemStatus {
    version: &'static str,
    uptime_seconds: u64,
    records: usize,
    completion_configured: bool,
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        records: state.store.len().await,
        completion_configured: state.assistant.is_configured(),
    })
}

// =============================================================================
// Assistant
// =============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatProbe {
    message: &'static str,
    has_api_key: bool,
}

pub async fn chat_probe(State(state): State<Arc<AppState>>) -> Json<ChatProbe> {
    Json(ChatProbe {
        message: "Chat route is working",
        has_api_key: state.assistant.is_configured(),
    })
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    body: Option<Json<ChatRequest>>,
) -> Result<Json<ChatAnswer>, ApiError> {
    // An absent or unreadable body is the same failure as an empty question.
    let question = body.map(|Json(req)| req.question).unwrap_or_default();
    match state.assistant.answer(&question, &state.store).await {
        Ok(answer) => Ok(Json(answer)),
        Err(err) => {
            tracing::error!("Chat pipeline failed: {}", err);
            Err((
                err.status(),
                Json(ErrorBody {
                    error: err.summary().into(),
                    details: err.details(),
                }),
            ))
        }
    }
}

// =============================================================================
// Listing
// =============================================================================

/// Date/client/country filter accepted by the listing and metric endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterParams {
    start_date: Option<String>,
    end_date: Option<String>,
    client: Option<String>,
    country: Option<String>,
}

impl FilterParams {
    fn to_filter(&self) -> Result<LogFilter, ApiError> {
        let mut filter = LogFilter {
            client: self.client.clone(),
            country: self.country.clone(),
            ..Default::default()
        };
        if let Some(raw) = self.start_date.as_deref() {
            filter.start_date = Some(
                parse_instant(raw)
                    .ok_or_else(|| bad_request("Invalid startDate", raw.to_string()))?,
            );
        }
        if let Some(raw) = self.end_date.as_deref() {
            filter.end_date = Some(
                parse_instant(raw)
                    .ok_or_else(|| bad_request("Invalid endDate", raw.to_string()))?,
            );
        }
        Ok(filter)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageParams {
    page: Option<usize>,
    limit: Option<usize>,
    sort_field: Option<String>,
    sort_order: Option<SortOrder>,
}

pub async fn list_joblogs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FilterParams>,
    Query(paging): Query<PageParams>,
) -> Result<Json<LogPage>, ApiError> {
    let filter = filter.to_filter()?;
    let defaults = PageRequest::default();
    let page = PageRequest {
        page: paging.page.unwrap_or(defaults.page),
        limit: paging
            .limit
            .unwrap_or(defaults.limit)
            .min(state.config.server.max_page_size),
        sort_field: paging.sort_field.unwrap_or(defaults.sort_field),
        sort_order: paging.sort_order.unwrap_or(defaults.sort_order),
    };
    Ok(Json(state.store.find(&filter, &page).await))
}

// =============================================================================
// Metrics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Average,
    Sum,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricParams {
    field: Option<String>,
    group_by: Option<String>,
    agg: Option<Aggregation>,
}

fn metric_inputs(params: &MetricParams) -> Result<(String, String), ApiError> {
    let field = params.field.as_deref().filter(|f| !f.is_empty()).ok_or_else(|| {
        bad_request(
            "Missing field parameter",
            "the 'field' query parameter must name a progress counter",
        )
    })?;
    let group_by = params
        .group_by
        .as_deref()
        .filter(|g| !g.is_empty())
        .unwrap_or("transactionSourceName");
    Ok((
        format!("$progress.{}", field),
        format!("${}", group_by),
    ))
}

async fn run_metric_plan(
    state: &AppState,
    stages: Value,
) -> Result<Json<Vec<Value>>, ApiError> {
    let plan = QueryPlan::from_value(stages)
        .map_err(|e| server_error("Query construction error", e))?;
    state
        .store
        .aggregate(&plan)
        .await
        .map(Json)
        .map_err(|e| server_error("Query execution error", e.to_string()))
}

/// Per-group average or total of one progress counter.
pub async fn metrics_general(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FilterParams>,
    Query(params): Query<MetricParams>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let match_params = filter.to_filter()?.to_match_params();
    let (value_field, group_field) = metric_inputs(&params)?;
    let agg = params.agg.unwrap_or(Aggregation::Average);

    let mut group = Map::new();
    group.insert("_id".into(), json!(group_field));
    group.insert("count".into(), json!({"$sum": 1}));
    let sort = match agg {
        Aggregation::Sum => {
            group.insert("total".into(), json!({"$sum": value_field}));
            json!({"total": -1})
        }
        Aggregation::Average => {
            group.insert("average".into(), json!({"$avg": value_field}));
            json!({"average": -1})
        }
    };

    run_metric_plan(
        &state,
        json!([
            {"$match": match_params},
            {"$group": group},
            {"$sort": sort}
        ]),
    )
    .await
}

/// Per-group change of one progress counter between the first and last run
/// in the period.
pub async fn metrics_delta(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<FilterParams>,
    Query(params): Query<MetricParams>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let match_params = filter.to_filter()?.to_match_params();
    let (value_field, group_field) = metric_inputs(&params)?;

    run_metric_plan(
        &state,
        json!([
            {"$match": match_params},
            {"$sort": {"timestamp": 1}},
            {"$group": {
                "_id": group_field,
                "first": {"$first": &value_field},
                "last": {"$last": &value_field},
                "count": {"$sum": 1}
            }},
            {"$project": {
                "delta": {"$subtract": ["$last", "$first"]},
                "first": 1,
                "last": 1,
                "count": 1
            }},
            {"$sort": {"delta": -1}}
        ]),
    )
    .await
}

// =============================================================================
// Seeding
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SeedParams {
    count: Option<usize>,
}

#[derive(Serialize)]
pub struct SeedResult {
    records_created: usize,
    total: usize,
}

pub async fn seed(
    State(state): State<Arc<AppState>>,
    Json(params): Json<SeedParams>,
) -> Json<SeedResult> {
    let count = params.count.unwrap_or(100).min(10_000);
    let batch = joblens_core::sample::sample_batch(count);
    let total = state.store.insert_batch(batch).await;
    tracing::info!("Seeded {} synthetic job logs ({} total)", count, total);
    Json(SeedResult {
        records_created: count,
        total,
    })
}
