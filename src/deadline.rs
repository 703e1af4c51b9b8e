//! Deadline decorators for collaborators.
//!
//! The core crate has no runtime, so it cannot time calls out itself. These
//! wrappers put `tokio::time::timeout` around every outbound call and
//! report an overrun as [`CollaboratorError::Timeout`] (or an `anyhow`
//! error for the store), which the bounded loops already absorb.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use finsight_core::embedding::Embedder;
use finsight_core::error::CollaboratorError;
use finsight_core::filter::SearchFilter;
use finsight_core::generator::{GenerationRequest, TextGenerator};
use finsight_core::models::Chunk;
use finsight_core::store::{ChunkStore, VectorHit};
use tracing::warn;

fn elapsed_ms(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

pub struct TimedGenerator {
    inner: Arc<dyn TextGenerator>,
    limit: Duration,
}

impl TimedGenerator {
    pub fn new(inner: Arc<dyn TextGenerator>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl TextGenerator for TimedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<serde_json::Value, CollaboratorError> {
        match tokio::time::timeout(self.limit, self.inner.generate(request)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(task = request.task.as_str(), "generation timed out");
                Err(CollaboratorError::Timeout {
                    operation: request.task.as_str(),
                    elapsed_ms: elapsed_ms(self.limit),
                })
            }
        }
    }
}

pub struct TimedEmbedder {
    inner: Arc<dyn Embedder>,
    limit: Duration,
}

impl TimedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

#[async_trait]
impl Embedder for TimedEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        tokio::time::timeout(self.limit, self.inner.embed(texts))
            .await
            .unwrap_or_else(|_| {
                warn!(inputs = texts.len(), "embedding timed out");
                Err(CollaboratorError::Timeout {
                    operation: "embed",
                    elapsed_ms: elapsed_ms(self.limit),
                })
            })
    }
}

/// Bounds vector search only; writes run to completion.
pub struct TimedStore {
    inner: Arc<dyn ChunkStore>,
    search_limit: Duration,
}

impl TimedStore {
    pub fn new(inner: Arc<dyn ChunkStore>, search_limit: Duration) -> Self {
        Self { inner, search_limit }
    }
}

#[async_trait]
impl ChunkStore for TimedStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        self.inner.upsert_chunks(chunks).await
    }

    async fn upsert_vectors(&self, vectors: &[(String, Vec<f32>)]) -> Result<()> {
        self.inner.upsert_vectors(vectors).await
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        self.inner.document_chunks(document_id).await
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<u64> {
        self.inner.delete_document_chunks(document_id).await
    }

    async fn replace_document_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<u64> {
        self.inner.replace_document_chunks(document_id, chunks).await
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        match tokio::time::timeout(self.search_limit, self.inner.vector_search(query_vec, filter, limit)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CollaboratorError::Timeout {
                operation: "vector_search",
                elapsed_ms: elapsed_ms(self.search_limit),
            }
            .into()),
        }
    }
}
