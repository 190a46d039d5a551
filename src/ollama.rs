use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Number;
use crate::embedder::Embedder;

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

#[derive(Debug, Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: Vec<Number>,
}

/// Blocking client for an Ollama-compatible `/api/embeddings` endpoint.
#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    endpoint: String,
    model: String,
    model_id: String,
    dimension: usize,
    agent: ureq::Agent,
    retry_attempts: u32,
}

impl OllamaEmbedder {
    pub fn new(base_url: &str, model: &str, dimension: usize) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        anyhow::ensure!(
            base_url.starts_with("http://") || base_url.starts_with("https://"),
            "Ollama URL '{}' must start with http:// or https://",
            base_url
        );
        anyhow::ensure!(!model.trim().is_empty(), "Ollama model name is required");

        Ok(Self {
            endpoint: format!("{}/api/embeddings", base_url),
            model: model.to_string(),
            model_id: format!("ollama:{}", model),
            dimension,
            agent: Self::agent(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    fn agent(timeout: Duration) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = Self::agent(timeout);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts.max(1);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post_with_retry(&self, body: &str) -> Result<String> {
        let mut last_error = None;

        for attempt in 1..=self.retry_attempts {
            let outcome = self
                .agent
                .post(self.endpoint.as_str())
                .header("Content-Type", "application/json")
                .send(body)
                .and_then(|mut resp| resp.body_mut().read_to_string());

            let error = match outcome {
                Ok(text) => return Ok(text),
                Err(error) => error,
            };

            let retryable = match &error {
                ureq::Error::StatusCode(status) => *status >= 500,
                ureq::Error::ConnectionFailed
                | ureq::Error::HostNotFound
                | ureq::Error::Timeout(_)
                | ureq::Error::Io(_) => true,
                _ => false,
            };
            if !retryable {
                return Err(anyhow::anyhow!("Embedding request to {} failed: {}", self.endpoint, error));
            }

            warn!(
                "Embedding request failed: {}, attempt {}/{}",
                error, attempt, self.retry_attempts
            );
            last_error = Some(error);

            if attempt < self.retry_attempts {
                let delay = Duration::from_millis(EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) * 500);
                debug!("Waiting {:?} before retry", delay);
                std::thread::sleep(delay);
            }
        }

        match last_error {
            Some(error) => Err(anyhow::anyhow!(
                "Embedding request to {} failed after {} attempts: {}",
                self.endpoint,
                self.retry_attempts,
                error
            )),
            None => Err(anyhow::anyhow!("No embedding request was attempted")),
        }
    }
}

impl Embedder for OllamaEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Result<Vec<Number>> {
        let request = EmbedRequest {
            model: &self.model,
            prompt: text,
        };
        let body = serde_json::to_string(&request).context("Failed to serialize embedding request")?;
        let response_text = self.post_with_retry(&body)?;
        let response: EmbedResponse =
            serde_json::from_str(&response_text).context("Failed to parse embedding response")?;
        debug!("Received embedding with {} dimensions", response.embedding.len());
        Ok(response.embedding)
    }
}
