//! Embedding client for OpenAI-compatible `/embeddings` endpoints.
//!
//! Defines the [`Embedder`] trait consumed by the indexer and the search
//! operator, plus the HTTP-backed [`EmbeddingClient`]. The vector
//! dimension for known models is resolved up front (no round-trip);
//! unknown models cache the dimension observed in the first successful
//! response.
//!
//! # Failure taxonomy
//!
//! The error *kind* governs caller behaviour, so this module uses a typed
//! error instead of `anyhow`:
//!
//! - [`EmbeddingError::Unreachable`] — network-level failure; the indexer
//!   treats this as a retryable connectivity fault and the search operator
//!   renders a friendly re-index hint.
//! - [`EmbeddingError::Status`] — non-2xx response, with a truncated body
//!   prefix for diagnostics.
//! - [`EmbeddingError::Protocol`] — 2xx response missing
//!   `data[0].embedding`.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::config::EmbeddingSettings;

/// Longest response-body prefix carried in a [`EmbeddingError::Status`].
const BODY_PREFIX_CHARS: usize = 256;

/// Short text used by [`Embedder::probe_dims`] to force dimension resolution.
const PROBE_TEXT: &str = "dimension probe";

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding service not reachable at {base_url}: {message}")]
    Unreachable { base_url: String, message: String },

    #[error("embedding service returned {status}: {body_prefix}")]
    Status { status: u16, body_prefix: String },

    #[error("embedding response missing data[0].embedding")]
    Protocol,

    #[error("invalid embedding endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Source of fixed-length text embeddings.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed one text into a fixed-length vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// The vector length, or `None` until first resolution.
    fn dims(&self) -> Option<usize>;

    /// Force dimension resolution, embedding a short probe if needed.
    async fn probe_dims(&self) -> Result<usize, EmbeddingError>;
}

/// Vector dimensions for models we recognise up front.
fn known_model_dims(model: &str) -> Option<usize> {
    match model {
        "nomic-embed-text" => Some(768),
        "mxbai-embed-large" => Some(1024),
        "all-minilm" => Some(384),
        "text-embedding-3-small" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        "text-embedding-ada-002" => Some(1536),
        _ => None,
    }
}

/// HTTP embedding client.
///
/// Sends `POST {base_url}/embeddings` with `{"model", "input"}` and an
/// optional `Authorization: Bearer` header. Stateless aside from the
/// cached dimension, so a single instance is shared across tasks.
pub struct EmbeddingClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    headers: HashMap<String, String>,
    dims: Mutex<Option<usize>>,
}

impl EmbeddingClient {
    pub fn new(settings: &EmbeddingSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            headers: settings.headers.clone(),
            dims: Mutex::new(known_model_dims(&settings.model)),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut request = self
            .http
            .post(self.endpoint())
            .json(&json!({ "model": self.model, "input": text }));

        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EmbeddingError::Unreachable {
                base_url: self.base_url.clone(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body_prefix: truncate_chars(&body, BODY_PREFIX_CHARS),
            });
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|_| EmbeddingError::Protocol)?;
        let vector = parse_embedding_response(&body)?;

        let mut dims = self.dims.lock().expect("dims lock poisoned");
        if dims.is_none() {
            *dims = Some(vector.len());
        }
        Ok(vector)
    }

    fn dims(&self) -> Option<usize> {
        *self.dims.lock().expect("dims lock poisoned")
    }

    async fn probe_dims(&self) -> Result<usize, EmbeddingError> {
        if let Some(dims) = self.dims() {
            return Ok(dims);
        }
        let vector = self.embed(PROBE_TEXT).await?;
        Ok(vector.len())
    }
}

/// Extract `data[0].embedding` from a 2xx response body.
fn parse_embedding_response(body: &serde_json::Value) -> Result<Vec<f32>, EmbeddingError> {
    let embedding = body
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or(EmbeddingError::Protocol)?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let cut: String = s.chars().take(max).collect();
    format!("{cut}…")
}

/// Deprecated native client retained for old configurations.
///
/// Construction rejects any endpoint whose host is not loopback
/// (`localhost`, `127.0.0.1`, `::1`), so a stale legacy config cannot be
/// pointed at an arbitrary host.
pub struct LegacyEmbeddingClient {
    inner: EmbeddingClient,
}

impl LegacyEmbeddingClient {
    pub fn new(settings: &EmbeddingSettings) -> Result<Self, EmbeddingError> {
        let parsed = url::Url::parse(&settings.base_url)
            .map_err(|e| EmbeddingError::InvalidEndpoint(e.to_string()))?;
        match parsed.host() {
            Some(url::Host::Domain("localhost")) => {}
            Some(url::Host::Ipv4(ip)) if ip.is_loopback() => {}
            Some(url::Host::Ipv6(ip)) if ip.is_loopback() => {}
            Some(other) => {
                return Err(EmbeddingError::InvalidEndpoint(format!(
                    "host '{other}' is not loopback; the legacy client only accepts \
                     localhost, 127.0.0.1, or ::1"
                )))
            }
            None => {
                return Err(EmbeddingError::InvalidEndpoint(
                    "endpoint has no host".to_string(),
                ))
            }
        }
        Ok(Self {
            inner: EmbeddingClient::new(settings),
        })
    }
}

#[async_trait]
impl Embedder for LegacyEmbeddingClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.inner.embed(text).await
    }

    fn dims(&self) -> Option<usize> {
        self.inner.dims()
    }

    async fn probe_dims(&self) -> Result<usize, EmbeddingError> {
        self.inner.probe_dims().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(base_url: &str, model: &str) -> EmbeddingSettings {
        EmbeddingSettings {
            provider: "openai".to_string(),
            model: model.to_string(),
            base_url: base_url.to_string(),
            api_key: None,
            headers: HashMap::new(),
        }
    }

    #[test]
    fn known_model_resolves_dims_without_round_trip() {
        let client = EmbeddingClient::new(&settings("http://localhost:11434/v1", "nomic-embed-text"));
        assert_eq!(client.dims(), Some(768));

        let client = EmbeddingClient::new(&settings("http://localhost:11434/v1", "mystery-model"));
        assert_eq!(client.dims(), None);
    }

    #[test]
    fn trailing_slash_is_stripped() {
        let client = EmbeddingClient::new(&settings("http://localhost:11434/v1/", "all-minilm"));
        assert_eq!(client.endpoint(), "http://localhost:11434/v1/embeddings");
    }

    #[test]
    fn response_parsing_accepts_valid_shape() {
        let body = serde_json::json!({ "data": [ { "embedding": [0.1, 0.2, 0.3] } ] });
        let vec = parse_embedding_response(&body).unwrap();
        assert_eq!(vec.len(), 3);
        assert!((vec[1] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn response_parsing_rejects_missing_embedding() {
        for body in [
            serde_json::json!({}),
            serde_json::json!({ "data": [] }),
            serde_json::json!({ "data": [ { "index": 0 } ] }),
        ] {
            assert!(matches!(
                parse_embedding_response(&body),
                Err(EmbeddingError::Protocol)
            ));
        }
    }

    #[test]
    fn legacy_client_requires_loopback_host() {
        assert!(LegacyEmbeddingClient::new(&settings("http://localhost:8080", "m")).is_ok());
        assert!(LegacyEmbeddingClient::new(&settings("http://127.0.0.1:8080", "m")).is_ok());
        assert!(LegacyEmbeddingClient::new(&settings("http://[::1]:8080", "m")).is_ok());

        let err = LegacyEmbeddingClient::new(&settings("http://evil.example.com", "m"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("loopback"));
    }

    #[test]
    fn body_prefix_truncates_long_bodies() {
        let long = "e".repeat(1000);
        let prefix = truncate_chars(&long, BODY_PREFIX_CHARS);
        assert!(prefix.chars().count() <= BODY_PREFIX_CHARS + 1);
        assert!(prefix.ends_with('…'));
    }
}
