//! Remote embedding service
//!
//! HTTP client for an `/embeddings` endpoint (Voyage AI wire format). Calls
//! are bounded by a per-request timeout and retried with exponential backoff
//! on rate limiting and timeouts only; any other failure surfaces immediately
//! as `EmbeddingUnavailable` so the retriever can fall back to lexical
//! matching without stalling the turn.

use crate::config::EmbeddingSection;
use crate::embeddings::Embedder;
use crate::error::{NimbusError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Maximum retry attempts for rate limiting
const MAX_RETRIES: usize = 3;

/// Backoff base duration in milliseconds
const BACKOFF_BASE_MS: u64 = 500;

/// Remote embedding service
pub struct RemoteEmbedder {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    input: Vec<String>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    /// Create a remote embedder from the [embedding] config section
    pub fn from_config(section: &EmbeddingSection) -> Result<Self> {
        let api_key = std::env::var(&section.api_key_env).map_err(|_| {
            NimbusError::EmbeddingUnavailable(format!(
                "embedding API key not set ({})",
                section.api_key_env
            ))
        })?;

        Self::new(
            api_key,
            section.model.clone(),
            section.base_url.clone(),
            section.dimensions,
            section.timeout_ms,
        )
    }

    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        dimensions: usize,
        timeout_ms: u64,
    ) -> Result<Self> {
        if api_key.is_empty() {
            return Err(NimbusError::EmbeddingUnavailable(
                "API key cannot be empty".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| NimbusError::EmbeddingUnavailable(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            model,
            base_url,
            dimensions,
        })
    }

    /// Call the embeddings endpoint with retry on transient failures
    async fn call_api_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        let mut retries = 0;

        loop {
            match self.call_api(text).await {
                Ok(vector) => return Ok(vector),
                Err(e) => {
                    if retries >= MAX_RETRIES || !Self::is_retryable(&e) {
                        return Err(e);
                    }

                    // Exponential backoff
                    let backoff = BACKOFF_BASE_MS * 2u64.pow(retries as u32);
                    warn!(
                        "Embedding request failed (attempt {}), retrying in {}ms: {}",
                        retries + 1,
                        backoff,
                        e
                    );
                    sleep(Duration::from_millis(backoff)).await;
                    retries += 1;
                }
            }
        }
    }

    fn is_retryable(err: &NimbusError) -> bool {
        match err {
            NimbusError::EmbeddingUnavailable(msg) => {
                msg.contains("rate limit") || msg.contains("timeout")
            }
            _ => false,
        }
    }

    async fn call_api(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Requesting embedding ({} chars)", text.len());

        let request = EmbeddingRequest {
            input: vec![text.to_string()],
            model: self.model.clone(),
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NimbusError::EmbeddingUnavailable("request timeout".to_string())
                } else {
                    NimbusError::EmbeddingUnavailable(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(NimbusError::EmbeddingUnavailable(
                    "rate limit exceeded".to_string(),
                ));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(NimbusError::EmbeddingUnavailable(format!(
                    "embedding endpoint returned {}: {}",
                    status, body
                )));
            }
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| NimbusError::EmbeddingUnavailable(format!("bad response: {}", e)))?;

        let vector = body
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| {
                NimbusError::EmbeddingUnavailable("empty embedding response".to_string())
            })?;

        if vector.len() != self.dimensions {
            return Err(NimbusError::EmbeddingDimensionMismatch {
                stored: self.dimensions,
                produced: vector.len(),
            });
        }

        Ok(vector)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.call_api_with_retry(text).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_api_key_rejected() {
        let result = RemoteEmbedder::new(
            String::new(),
            "voyage-3-lite".to_string(),
            "https://api.voyageai.com/v1".to_string(),
            384,
            5_000,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_retryable_classification() {
        let rate = NimbusError::EmbeddingUnavailable("rate limit exceeded".to_string());
        let timeout = NimbusError::EmbeddingUnavailable("request timeout".to_string());
        let auth = NimbusError::EmbeddingUnavailable("endpoint returned 401".to_string());

        assert!(RemoteEmbedder::is_retryable(&rate));
        assert!(RemoteEmbedder::is_retryable(&timeout));
        assert!(!RemoteEmbedder::is_retryable(&auth));
    }
}
