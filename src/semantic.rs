//! Semantic retrieval backends: query embeddings and vector similarity search.
//!
//! Both collaborators sit behind async traits so the orchestrator can be
//! driven by real HTTP clients in production and by in-process stubs in
//! tests. Disabled providers report themselves through
//! [`VectorSearch::is_enabled`], which routes retrieval to the lexical path.
//!
//! # Providers
//!
//! | Trait | Provider | Endpoint |
//! |-------|----------|----------|
//! | [`Embedder`] | `openai` | `POST {url}/embeddings` |
//! | [`VectorSearch`] | `supabase` | `POST {url}/rest/v1/rpc/{function}` |

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{read_secret, Config, EmbeddingConfig, VectorConfig};
use crate::error::{Result, VaultError};
use crate::models::VectorHit;

/// Turns text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Similarity search over pre-indexed document excerpts.
#[async_trait]
pub trait VectorSearch: Send + Sync {
    fn name(&self) -> &str;

    /// `false` when no backend is configured.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Hits with similarity at or above `threshold`, best first, at most
    /// `match_count` of them.
    async fn search(
        &self,
        embedding: &[f32],
        match_count: usize,
        threshold: f64,
    ) -> Result<Vec<VectorHit>>;
}

// ============ Disabled ============

/// Stand-in used when `provider = "disabled"`. Every call fails.
pub struct Disabled;

#[async_trait]
impl Embedder for Disabled {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(VaultError::upstream(None, "embedding provider is disabled"))
    }
}

#[async_trait]
impl VectorSearch for Disabled {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_enabled(&self) -> bool {
        false
    }

    async fn search(&self, _: &[f32], _: usize, _: f64) -> Result<Vec<VectorHit>> {
        Err(VaultError::upstream(None, "vector search is disabled"))
    }
}

// ============ OpenAI embeddings ============

/// Embedder backed by the OpenAI embeddings API.
///
/// Rate limits (429), server errors and network failures are retried with
/// exponential backoff (1s, 2s, 4s, ...) up to `max_retries` times. Other
/// client errors fail immediately.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_retries: u32,
}

impl OpenAiEmbedder {
    /// # Errors
    ///
    /// [`VaultError::ConfigurationMissing`] when the key variable is unset.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = read_secret(&config.api_key_env).ok_or_else(|| {
            VaultError::ConfigurationMissing(format!("{} is not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VaultError::Unknown(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                warn!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            VaultError::upstream(None, format!("invalid embedding response: {}", e))
                        })?;
                        return parse_embedding_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let code = status.as_u16();

                    if code == 401 || code == 403 {
                        return Err(VaultError::Unauthorized { status: code });
                    }
                    if code == 429 {
                        last_err = Some(VaultError::RateLimited(body_text));
                        continue;
                    }
                    if status.is_server_error() {
                        last_err = Some(VaultError::upstream(
                            Some(code),
                            format!("embedding API error {}: {}", status, body_text),
                        ));
                        continue;
                    }

                    return Err(VaultError::upstream(
                        Some(code),
                        format!("embedding API error {}: {}", status, body_text),
                    ));
                }
                Err(e) => {
                    last_err = Some(VaultError::upstream(None, e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| VaultError::upstream(None, "embedding failed after retries")))
    }
}

fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| VaultError::upstream(None, "invalid embedding response: missing data"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ Supabase pgvector ============

/// Vector search through a Supabase RPC function.
pub struct SupabaseVectorSearch {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

#[derive(Deserialize)]
struct MatchRow {
    file_path: String,
    #[serde(default)]
    chunk_index: Option<i64>,
    chunk_text: String,
    #[serde(default)]
    metadata: Option<MatchMetadata>,
    similarity: f64,
}

#[derive(Deserialize, Default)]
struct MatchMetadata {
    #[serde(default)]
    heading: Option<String>,
}

impl SupabaseVectorSearch {
    pub fn new(config: &VectorConfig) -> Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| VaultError::ConfigurationMissing("vector.url is not set".to_string()))?;
        let api_key = read_secret(&config.api_key_env).ok_or_else(|| {
            VaultError::ConfigurationMissing(format!("{} is not set", config.api_key_env))
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VaultError::Unknown(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/rest/v1/rpc/{}",
                url.trim_end_matches('/'),
                config.function
            ),
            api_key,
        })
    }
}

#[async_trait]
impl VectorSearch for SupabaseVectorSearch {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn search(
        &self,
        embedding: &[f32],
        match_count: usize,
        threshold: f64,
    ) -> Result<Vec<VectorHit>> {
        let body = serde_json::json!({
            "query_embedding": embedding,
            "match_threshold": threshold,
            "match_count": match_count,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VaultError::upstream(None, format!("vector search failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(VaultError::upstream(
                Some(status.as_u16()),
                format!("vector search error {}: {}", status, text),
            ));
        }

        let rows: Option<Vec<MatchRow>> = response
            .json()
            .await
            .map_err(|e| VaultError::upstream(None, format!("invalid vector search response: {}", e)))?;

        Ok(rows
            .unwrap_or_default()
            .into_iter()
            .map(|row| VectorHit {
                file_path: row.file_path,
                chunk_index: row.chunk_index.unwrap_or_default(),
                chunk_text: row.chunk_text,
                heading: row.metadata.unwrap_or_default().heading,
                similarity: row.similarity,
            })
            .collect())
    }
}

// ============ Wiring ============

/// The embedder and vector search a process runs with.
#[derive(Clone)]
pub struct SemanticBackend {
    pub embedder: Arc<dyn Embedder>,
    pub search: Arc<dyn VectorSearch>,
}

impl SemanticBackend {
    pub fn disabled() -> Self {
        Self {
            embedder: Arc::new(Disabled),
            search: Arc::new(Disabled),
        }
    }

    /// Build the configured providers. A provider whose credential is
    /// missing fails here, once, rather than on every request.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = match config.embedding.provider.as_str() {
            "openai" => Arc::new(OpenAiEmbedder::new(&config.embedding)?),
            _ => Arc::new(Disabled),
        };
        let search: Arc<dyn VectorSearch> = match config.vector.provider.as_str() {
            "supabase" => Arc::new(SupabaseVectorSearch::new(&config.vector)?),
            _ => Arc::new(Disabled),
        };
        Ok(Self { embedder, search })
    }

    pub fn is_enabled(&self) -> bool {
        self.search.is_enabled()
    }
}

/// Embed `query` and search for the closest excerpts.
pub async fn semantic_search(
    backend: &SemanticBackend,
    query: &str,
    match_count: usize,
    threshold: f64,
) -> Result<Vec<VectorHit>> {
    let embedding = backend.embedder.embed(query).await?;
    debug!(
        model = backend.embedder.model_name(),
        dims = embedding.len(),
        "query embedded"
    );
    let hits = backend
        .search
        .search(&embedding, match_count, threshold)
        .await?;
    debug!(backend = backend.search.name(), hits = hits.len(), "vector search done");
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedding_response() {
        let json = serde_json::json!({
            "data": [{ "embedding": [0.5, -1.0, 2.0], "index": 0 }]
        });
        assert_eq!(parse_embedding_response(&json).unwrap(), vec![0.5, -1.0, 2.0]);
    }

    #[test]
    fn test_parse_embedding_response_missing_data() {
        let err = parse_embedding_response(&serde_json::json!({ "data": [] })).unwrap_err();
        assert_eq!(err.code(), "upstream_failure");
    }

    #[tokio::test]
    async fn test_disabled_backend() {
        let backend = SemanticBackend::disabled();
        assert!(!backend.is_enabled());
        let err = semantic_search(&backend, "anything", 10, 0.3).await.unwrap_err();
        assert_eq!(err.code(), "upstream_failure");
    }

    #[test]
    fn test_missing_key_is_configuration_error() {
        let config = EmbeddingConfig {
            provider: "openai".to_string(),
            api_key_env: "VAULT_CONTEXT_TEST_UNSET_EMBED_KEY".to_string(),
            ..EmbeddingConfig::default()
        };
        let err = OpenAiEmbedder::new(&config).err().unwrap();
        assert_eq!(err.code(), "configuration_missing");
    }
}
