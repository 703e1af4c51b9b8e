//! In-memory [`ChunkStore`] for tests and embedding in other hosts.
//!
//! Chunks and vectors sit behind `std::sync::RwLock`. Vector search is a
//! brute-force cosine scan over every stored vector that passes the filter.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::filter::SearchFilter;
use crate::models::Chunk;

use super::{rank_hits, ChunkStore, VectorHit};

#[derive(Default)]
pub struct InMemoryChunkStore {
    chunks: RwLock<BTreeMap<String, Chunk>>,
    vectors: RwLock<HashMap<String, Vec<f32>>>,
}

impl InMemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored chunks.
    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut stored = self.chunks.write().map_err(poisoned)?;
        for c in chunks {
            stored.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn upsert_vectors(&self, vectors: &[(String, Vec<f32>)]) -> Result<()> {
        let mut stored = self.vectors.write().map_err(poisoned)?;
        for (id, v) in vectors {
            stored.insert(id.clone(), v.clone());
        }
        Ok(())
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let stored = self.chunks.read().map_err(poisoned)?;
        let mut out: Vec<Chunk> = stored
            .values()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        out.sort_by_key(|c| c.chunk_index);
        Ok(out)
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<u64> {
        self.replace_document_chunks(document_id, &[]).await
    }

    async fn replace_document_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<u64> {
        let mut stored = self.chunks.write().map_err(poisoned)?;
        let mut vectors = self.vectors.write().map_err(poisoned)?;
        let ids: Vec<String> = stored
            .values()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            stored.remove(id);
            vectors.remove(id);
        }
        for c in chunks {
            stored.insert(c.id.clone(), c.clone());
        }
        Ok(ids.len() as u64)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        let stored = self.chunks.read().map_err(poisoned)?;
        let vectors = self.vectors.read().map_err(poisoned)?;

        let mut hits: Vec<VectorHit> = stored
            .values()
            .filter(|c| filter.matches(c))
            .filter_map(|c| {
                vectors.get(&c.id).map(|v| VectorHit {
                    chunk: c.clone(),
                    similarity: cosine_similarity(query_vec, v),
                })
            })
            .collect();

        rank_hits(&mut hits, limit);
        Ok(hits)
    }
}
