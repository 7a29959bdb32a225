//! # Completion Service Client
//!
//! Chat-completions access behind a trait seam, so the pipeline can be
//! exercised against a scripted backend in tests. The HTTP implementation
//! targets any OpenAI-compatible endpoint: bearer credential, one POST per
//! completion, generated text at `choices[0].message.content`. A response
//! that deviates from that shape is an error, never silently defaulted.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

/// One chat message.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub role: &'static str,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system",
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user",
            content: content.into(),
        }
    }
}

/// A failed completion call.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionError {
    /// Network-level failure: connect, TLS, timeout.
    Transport(String),
    /// Non-success status from the service (auth, rate limit, bad request).
    Upstream { status: u16, detail: String },
    /// 2xx body without text at the conventional path.
    MalformedResponse(String),
}

impl std::fmt::Display for CompletionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "completion request failed: {}", msg),
            Self::Upstream { status, detail } => {
                write!(f, "completion service returned {}: {}", status, detail)
            }
            Self::MalformedResponse(msg) => write!(f, "malformed completion response: {}", msg),
        }
    }
}

impl std::error::Error for CompletionError {}

/// The seam the assistant pipeline talks through.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// One completion request. No retry: a failure is surfaced immediately.
    async fn complete(&self, messages: &[Message]) -> Result<String, CompletionError>;
}

/// Reqwest-based client for a chat-completions endpoint.
pub struct HttpCompletionClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl HttpCompletionClient {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CompletionError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CompletionError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl CompletionBackend for HttpCompletionClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, CompletionError> {
        let url = format!(
            "{}/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let response = self
            .http
            .post(&url)
            .header(
                reqwest::header::AUTHORIZATION,
                format!("Bearer {}", self.api_key),
            )
            .json(&json!({ "model": self.model, "messages": messages }))
            .send()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CompletionError::Transport(e.to_string()))?;

        if !status.is_success() {
            // Services report the useful part at error.message when they
            // report JSON at all.
            let detail = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|body| {
                    body.pointer("/error/message")
                        .and_then(|m| m.as_str())
                        .map(str::to_string)
                })
                .unwrap_or_else(|| truncate(&text, 300));
            return Err(CompletionError::Upstream {
                status: status.as_u16(),
                detail,
            });
        }

        let body: Value = serde_json::from_str(&text)
            .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;
        body.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                CompletionError::MalformedResponse(
                    "no text at choices[0].message.content".into(),
                )
            })
    }
}

fn truncate(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        trimmed.to_string()
    } else {
        let mut cut = max;
        while !trimmed.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &trimmed[..cut])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roles() {
        let m = Message::system("rules");
        assert_eq!(m.role, "system");
        let m = Message::user("question");
        assert_eq!(m.role, "user");
    }

    #[test]
    fn test_messages_serialize_to_wire_shape() {
        let wire = serde_json::to_value(vec![Message::system("a"), Message::user("b")]).unwrap();
        assert_eq!(
            wire,
            json!([{"role": "system", "content": "a"}, {"role": "user", "content": "b"}])
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "жжжжж";
        let cut = truncate(s, 3);
        assert!(cut.starts_with('ж'));
    }
}
