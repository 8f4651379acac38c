//! Summarization API client
//!
//! Calls the generative summarization endpoint. Unlike discovery these
//! calls carry no quota or cache; the pipeline runs them through the
//! retry orchestrator with the summarizer's own credential pool. Error
//! bodies pass through verbatim so the classifier can read the
//! provider's suggested retry delay out of them.

use std::time::Duration;

use common::ApiKey;
use governance::CallError;
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    text: Option<String>,
}

pub struct SummaryClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl SummaryClient {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
            timeout,
        }
    }

    /// Generate one summary for the prompt. Returns the model text verbatim.
    pub async fn summarize(&self, prompt: &str, key: &ApiKey) -> Result<String, CallError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        debug!(model = %self.model, key = key.last4(), "summarization request");

        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        let response = self
            .http
            .post(&url)
            .timeout(self.timeout)
            .header("x-goog-api-key", key.expose())
            .json(&body)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let text = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(CallError::Status {
                status: status.as_u16(),
                message: text,
            });
        }
        extract_text(&text)
    }
}

fn extract_text(body: &str) -> Result<String, CallError> {
    let response: GenerateResponse = serde_json::from_str(body).map_err(|e| CallError::Status {
        status: 502,
        message: format!("unparsable summarization response: {e}"),
    })?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let text = text.trim().to_owned();
    if text.is_empty() {
        return Err(CallError::Status {
            status: 502,
            message: "empty summarization response".into(),
        });
    }
    Ok(text)
}

fn map_transport_error(e: reqwest::Error) -> CallError {
    if e.is_timeout() {
        CallError::Timeout(e.to_string())
    } else {
        CallError::Connection(e.to_string())
    }
}
