//! Vector search contract.
//!
//! The [`ChunkStore`] trait is the narrow surface the retriever and the
//! ingestion pipeline need from a similarity-search service: overwrite
//! chunks by id, attach vectors, and return filtered nearest neighbours.
//! Implementations must be `Send + Sync`; the SQLite backend lives in the
//! application crate, [`memory::InMemoryChunkStore`] serves tests.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert_chunks`](ChunkStore::upsert_chunks) | Insert or overwrite chunks by id |
//! | [`upsert_vectors`](ChunkStore::upsert_vectors) | Insert or overwrite chunk vectors |
//! | [`document_chunks`](ChunkStore::document_chunks) | All chunks of one document, in order |
//! | [`delete_document_chunks`](ChunkStore::delete_document_chunks) | Drop a document's chunks and vectors |
//! | [`replace_document_chunks`](ChunkStore::replace_document_chunks) | Swap a document's chunks atomically |
//! | [`vector_search`](ChunkStore::vector_search) | Filtered cosine-similarity search |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::filter::SearchFilter;
use crate::models::Chunk;

/// One vector search result: the stored chunk and its cosine similarity.
#[derive(Debug, Clone, Serialize)]
pub struct VectorHit {
    pub chunk: Chunk,
    pub similarity: f64,
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert chunks, overwriting any existing chunk with the same id.
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Store `(chunk_id, vector)` pairs, overwriting existing vectors.
    async fn upsert_vectors(&self, vectors: &[(String, Vec<f32>)]) -> Result<()>;

    /// Chunks belonging to `document_id`, ordered by `chunk_index`.
    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Remove a document's chunks and their vectors. Returns the number removed.
    async fn delete_document_chunks(&self, document_id: &str) -> Result<u64>;

    /// Drop a document's chunks and vectors and insert `chunks` in their
    /// place, as one atomic step. Returns the number of chunks removed.
    async fn replace_document_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<u64>;

    /// Up to `limit` chunks that pass `filter`, best cosine similarity first.
    /// Chunks without a vector are never returned.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>>;
}

/// Sort hits by similarity descending, then chunk id ascending, and truncate.
pub fn rank_hits(hits: &mut Vec<VectorHit>, limit: usize) {
    hits.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    hits.truncate(limit);
}
