//! Embedding providers.
//!
//! | `embedding.provider` | Implementation |
//! |----------------------|----------------|
//! | `openai` | [`OpenAiEmbedder`], `POST {url}/embeddings`, key from `OPENAI_API_KEY` |
//! | `ollama` | [`OllamaEmbedder`], `POST {url}/api/embed` |
//! | `local` | [`HashingEmbedder`], offline feature hashing |
//! | `disabled` | none; [`create_embedder`] returns an error |
//!
//! Inputs are sent in batches of `embedding.batch_size`; every returned
//! vector is checked against the configured width.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use finsight_core::embedding::{Embedder, HashingEmbedder};
use finsight_core::error::CollaboratorError;

use crate::config::EmbeddingConfig;
use crate::http::{build_client, post_json};

const OPENAI_URL: &str = "https://api.openai.com/v1";
const OLLAMA_URL: &str = "http://localhost:11434";

/// Build the embedder named by `config.provider`.
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    let dims = || {
        config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for '{}'", config.provider))
    };
    let model = || {
        config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for '{}'", config.provider))
    };

    match config.provider.as_str() {
        "openai" => {
            let api_key = std::env::var("OPENAI_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
            Ok(Arc::new(OpenAiEmbedder {
                client: build_client(config.timeout_secs)?,
                url: config.url.clone().unwrap_or_else(|| OPENAI_URL.to_string()),
                api_key,
                model: model()?,
                dims: dims()?,
                batch_size: config.batch_size.max(1),
                max_retries: config.max_retries,
            }))
        }
        "ollama" => Ok(Arc::new(OllamaEmbedder {
            client: build_client(config.timeout_secs)?,
            url: config.url.clone().unwrap_or_else(|| OLLAMA_URL.to_string()),
            model: model()?,
            dims: dims()?,
            batch_size: config.batch_size.max(1),
            max_retries: config.max_retries,
        })),
        "local" => Ok(Arc::new(HashingEmbedder::new(dims()?))),
        "disabled" => bail!("Embedding provider is disabled. Set [embedding] provider in config."),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

// ============ OpenAI ============

pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let endpoint = format!("{}/embeddings", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = post_json(
                &self.client,
                &endpoint,
                Some(&self.api_key),
                &body,
                self.max_retries,
                "OpenAI",
            )
            .await?;
            out.extend(check_batch(parse_openai_response(&json)?, batch.len(), self.dims)?);
        }
        Ok(out)
    }
}

/// Vectors from `data[].embedding`, reordered by `data[].index` when present.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| CollaboratorError::malformed("embedding", "missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| CollaboratorError::malformed("embedding", "missing embedding"))?;
        indexed.push((index, json_to_vec(embedding)?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    client: reqwest::Client,
    url: String,
    model: String,
    dims: usize,
    batch_size: usize,
    max_retries: u32,
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let endpoint = format!("{}/api/embed", self.url.trim_end_matches('/'));
        let mut out = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let body = serde_json::json!({ "model": self.model, "input": batch });
            let json = post_json(&self.client, &endpoint, None, &body, self.max_retries, "Ollama").await?;
            out.extend(check_batch(parse_ollama_response(&json)?, batch.len(), self.dims)?);
        }
        Ok(out)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| CollaboratorError::malformed("embedding", "missing embeddings array"))?
        .iter()
        .map(json_to_vec)
        .collect()
}

// ============ Shared ============

fn json_to_vec(value: &serde_json::Value) -> Result<Vec<f32>, CollaboratorError> {
    value
        .as_array()
        .ok_or_else(|| CollaboratorError::malformed("embedding", "embedding is not an array"))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| CollaboratorError::malformed("embedding", "non-numeric component"))
        })
        .collect()
}

fn check_batch(
    vectors: Vec<Vec<f32>>,
    expected: usize,
    dims: usize,
) -> Result<Vec<Vec<f32>>, CollaboratorError> {
    if vectors.len() != expected {
        return Err(CollaboratorError::malformed(
            "embedding",
            format!("expected {} vectors, got {}", expected, vectors.len()),
        ));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
        return Err(CollaboratorError::malformed(
            "embedding",
            format!("expected {} dims, got {}", dims, bad.len()),
        ));
    }
    Ok(vectors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_openai_orders_by_index() {
        let body = json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vectors = parse_openai_response(&body).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_missing_data_is_malformed() {
        let err = parse_openai_response(&json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, CollaboratorError::Malformed { .. }));
    }

    #[test]
    fn test_parse_ollama() {
        let body = json!({"embeddings": [[0.5, 0.5], [1.0, 0.0]]});
        assert_eq!(parse_ollama_response(&body).unwrap().len(), 2);
        assert!(parse_ollama_response(&json!({"embeddings": [["x"]]})).is_err());
    }

    #[test]
    fn test_check_batch_rejects_wrong_width() {
        assert!(check_batch(vec![vec![1.0, 2.0]], 1, 2).is_ok());
        assert!(check_batch(vec![vec![1.0]], 1, 2).is_err());
        assert!(check_batch(vec![], 1, 2).is_err());
    }

    #[test]
    fn test_create_embedder_by_provider() {
        let mut config = EmbeddingConfig::default();
        assert!(create_embedder(&config).is_err());

        config.provider = "local".to_string();
        config.dims = Some(64);
        let embedder = create_embedder(&config).unwrap();
        assert_eq!(embedder.dims(), 64);

        config.provider = "ollama".to_string();
        config.model = Some("nomic-embed-text".to_string());
        assert_eq!(create_embedder(&config).unwrap().model_name(), "nomic-embed-text");
    }
}
