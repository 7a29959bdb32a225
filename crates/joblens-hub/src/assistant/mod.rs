//! # Natural-Language Query Assistant
//!
//! Free-text question → model-generated aggregation plan → store execution →
//! model-written summary, sequenced as a strict linear pipeline. Any stage
//! failure is terminal and classified before it leaves this module; there is
//! no retry and no partial result (a summarization failure discards the
//! already-computed rows).

pub mod completion;
pub mod extract;

use axum::http::StatusCode;
use completion::{CompletionBackend, CompletionError, Message};
use joblens_store::{AggregateError, JobLogStore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Schema-describing instruction for the plan-generation call. Output-format
/// rules are strict because the response is parsed, not read.
const PLAN_INSTRUCTION: &str = "You are an assistant for analyzing job-feed processing logs. \
The collection is called joblogs. The schema is: { country_code, currency_code, progress: { \
SWITCH_INDEX, TOTAL_RECORDS_IN_FEED, TOTAL_JOBS_IN_FEED, TOTAL_JOBS_FAIL_INDEXED, \
TOTAL_JOBS_SENT_TO_ENRICH, TOTAL_JOBS_DONT_HAVE_METADATA, TOTAL_JOBS_DONT_HAVE_METADATA_V2, \
TOTAL_JOBS_SENT_TO_INDEX }, status, timestamp, transactionSourceName, noCoordinatesCount, \
recordCount, uniqueRefNumberCount }. Given a user question, respond ONLY with a valid \
aggregation pipeline as a JSON array, and nothing else. Use only valid JSON. Do not use \
helper functions like ISODate(). For dates, use ISO 8601 strings (e.g. \
'2025-07-01T00:00:00Z'). Always quote all keys in the JSON output. Put the $match stage \
first when filtering.";

/// Instruction for the summarization call. No schema knowledge needed here.
const SUMMARY_INSTRUCTION: &str = "You are a helpful assistant.";

/// Request body for the chat endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub question: String,
}

/// Success payload: the raw result rows plus the model's summary.
#[derive(Debug, Clone, Serialize)]
pub struct ChatAnswer {
    pub data: Vec<Value>,
    pub summary: String,
}

/// Everything that can terminate the pipeline, classified.
#[derive(Debug)]
pub enum AssistantError {
    MissingInput,
    Misconfigured(String),
    ModelCall(CompletionError),
    PlanParse(String),
    Execution(AggregateError),
    ResultTooLarge { records: usize, cap: usize },
    Internal(String),
}

impl AssistantError {
    /// Stable summary line for the error body.
    pub fn summary(&self) -> &'static str {
        match self {
            Self::MissingInput => "Missing question",
            Self::Misconfigured(_) => "Completion service is not configured",
            Self::ModelCall(_) => "AI API error",
            Self::PlanParse(_) => "Failed to parse aggregation pipeline from model response",
            Self::Execution(_) => "Query execution error",
            Self::ResultTooLarge { .. } => "Aggregation result too large to summarize",
            Self::Internal(_) => "AI or query error",
        }
    }

    pub fn details(&self) -> String {
        match self {
            Self::MissingInput => "the request body must include a non-empty 'question'".into(),
            Self::Misconfigured(msg) => msg.clone(),
            Self::ModelCall(e) => e.to_string(),
            Self::PlanParse(msg) => msg.clone(),
            Self::Execution(e) => e.to_string(),
            Self::ResultTooLarge { records, cap } => {
                format!("{} result rows exceed the summarization cap of {}", records, cap)
            }
            Self::Internal(msg) => msg.clone(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingInput | Self::PlanParse(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl std::fmt::Display for AssistantError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.summary(), self.details())
    }
}

impl std::error::Error for AssistantError {}

/// The pipeline orchestrator. Holds the completion seam and the caps;
/// everything else is request-scoped.
pub struct Assistant {
    backend: Option<Arc<dyn CompletionBackend>>,
    max_summary_records: usize,
}

impl Assistant {
    pub fn new(backend: Option<Arc<dyn CompletionBackend>>, max_summary_records: usize) -> Self {
        Self {
            backend,
            max_summary_records,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// Run one question through the full pipeline.
    pub async fn answer(
        &self,
        question: &str,
        store: &JobLogStore,
    ) -> Result<ChatAnswer, AssistantError> {
        let question = question.trim();
        if question.is_empty() {
            return Err(AssistantError::MissingInput);
        }
        let backend = self.backend.as_ref().ok_or_else(|| {
            AssistantError::Misconfigured("no completion API key in the environment".into())
        })?;

        // 1. Ask the model for an aggregation plan.
        let raw = backend
            .complete(&[
                Message::system(PLAN_INSTRUCTION),
                Message::user(question),
            ])
            .await
            .map_err(AssistantError::ModelCall)?;

        // 2. Extract and normalize. Raw text never reaches the store.
        let plan = extract::extract_plan(&raw).map_err(AssistantError::PlanParse)?;
        tracing::debug!(stages = plan.stages.len(), "Executing generated plan");

        // 3. Execute.
        let data = store
            .aggregate(&plan)
            .await
            .map_err(AssistantError::Execution)?;

        // 4. Summarize. All-or-nothing: a failure here discards `data`.
        if data.len() > self.max_summary_records {
            return Err(AssistantError::ResultTooLarge {
                records: data.len(),
                cap: self.max_summary_records,
            });
        }
        let serialized =
            serde_json::to_string(&data).map_err(|e| AssistantError::Internal(e.to_string()))?;
        let prompt = format!(
            "Given the following aggregation result, summarize the answer to the user's \
             question. User question: \"{}\". Result: {}",
            question, serialized
        );
        let summary = backend
            .complete(&[Message::system(SUMMARY_INSTRUCTION), Message::user(prompt)])
            .await
            .map_err(AssistantError::ModelCall)?;

        Ok(ChatAnswer { data, summary })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use joblens_core::{sample, JobLog};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted completion backend with call counting.
    struct ScriptedBackend {
        calls: AtomicUsize,
        replies: Mutex<VecDeque<Result<String, CompletionError>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<String, CompletionError>>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                replies: Mutex::new(replies.into()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(&self, _messages: &[Message]) -> Result<String, CompletionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Transport("script exhausted".into())))
        }
    }

    fn assistant(backend: &Arc<ScriptedBackend>) -> Assistant {
        Assistant::new(Some(backend.clone() as Arc<dyn CompletionBackend>), 200)
    }

    fn june_log(day: u32, client: &str, sent_to_index: i64) -> JobLog {
        let mut log = sample::sample_log(0);
        log.timestamp = Utc.with_ymd_and_hms(2025, 6, day, 12, 0, 0).unwrap();
        log.transaction_source_name = client.into();
        log.progress.total_jobs_sent_to_index = sent_to_index;
        log
    }

    async fn seeded_store() -> JobLogStore {
        let store = JobLogStore::new();
        store.insert(june_log(5, "ClientA", 1200)).await;
        store.insert(june_log(20, "ClientA", 3000)).await;
        store.insert(june_log(12, "ClientB", 900)).await;
        store
    }

    #[tokio::test]
    async fn test_empty_question_rejected_before_any_call() {
        let backend = ScriptedBackend::new(vec![]);
        let store = JobLogStore::new();
        let err = assistant(&backend).answer("   ", &store).await.unwrap_err();
        assert!(matches!(err, AssistantError::MissingInput));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_backend_is_misconfiguration() {
        let store = JobLogStore::new();
        let err = Assistant::new(None, 200)
            .answer("how many runs?", &store)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::Misconfigured(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unparseable_model_text_never_reaches_execution() {
        let backend = ScriptedBackend::new(vec![Ok(
            "Sorry, I can only help with job-feed questions.".into()
        )]);
        let store = seeded_store().await;
        let err = assistant(&backend)
            .answer("what's the weather?", &store)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::PlanParse(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        // The summarizer was never called.
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_full_pipeline_happy_path() {
        let plan_reply = "```json\n[\
            {\"$match\": {\"transactionSourceName\": \"ClientA\", \
             \"timestamp\": {\"$gte\": \"2025-06-01T00:00:00Z\", \"$lt\": \"2025-07-01T00:00:00Z\"}}},\
            {\"$group\": {\"_id\": null, \"total\": {\"$sum\": \"$progress.TOTAL_JOBS_SENT_TO_INDEX\"}}}\
        ]\n```";
        let backend = ScriptedBackend::new(vec![
            Ok(plan_reply.into()),
            Ok("ClientA had 4200 jobs sent to index last month.".into()),
        ]);
        let store = seeded_store().await;

        let answer = assistant(&backend)
            .answer(
                "How many jobs were sent to index last month for ClientA?",
                &store,
            )
            .await
            .unwrap();

        assert_eq!(answer.data, vec![json!({"_id": null, "total": 4200})]);
        assert!(answer.summary.contains("4200"));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_store_rejection_skips_summarizer() {
        let backend = ScriptedBackend::new(vec![Ok(
            "```json\n[{\"$explode\": {\"path\": \"$progress\"}}]\n```".into(),
        )]);
        let store = seeded_store().await;
        let err = assistant(&backend)
            .answer("explode the progress counters", &store)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::Execution(_)));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_summarizer_failure_discards_result_set() {
        let backend = ScriptedBackend::new(vec![
            Ok("[{\"$count\": \"runs\"}]".into()),
            Err(CompletionError::Upstream {
                status: 429,
                detail: "rate limit exceeded".into(),
            }),
        ]);
        let store = seeded_store().await;
        let err = assistant(&backend)
            .answer("how many runs are there?", &store)
            .await
            .unwrap_err();
        // No partial body: the computed rows are gone, only the error remains.
        assert!(matches!(err, AssistantError::ModelCall(_)));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_oversized_result_fails_before_summarization() {
        let backend = ScriptedBackend::new(vec![Ok("[{\"$limit\": 100}]".into())]);
        let store = seeded_store().await;
        let err = Assistant::new(Some(backend.clone() as Arc<dyn CompletionBackend>), 2)
            .answer("list everything", &store)
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::ResultTooLarge { records: 3, cap: 2 }));
        assert_eq!(backend.calls(), 1);
    }
}

