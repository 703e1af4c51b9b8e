//! SQLite-backed [`ChunkStore`].
//!
//! Chunks live in the `chunks` table with their filter columns
//! denormalized; vectors live in `chunk_vectors` as little-endian `f32`
//! BLOBs. Vector search narrows by owner in SQL, applies the rest of the
//! [`SearchFilter`] in Rust, and ranks by brute-force cosine similarity.

use anyhow::{Context, Result};
use async_trait::async_trait;
use finsight_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use finsight_core::filter::SearchFilter;
use finsight_core::models::{Chunk, ChunkType, DocumentMetadata};
use finsight_core::store::{rank_hits, ChunkStore, VectorHit};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;

const CHUNK_COLUMNS: &str = "c.id, c.document_id, c.chunk_index, c.content, c.chunk_type, \
     c.page_index, c.page_indices, c.has_table, c.hash, c.metadata_json";

#[derive(Clone)]
pub struct SqliteChunkStore {
    pool: SqlitePool,
    model: String,
}

impl SqliteChunkStore {
    /// `model` is recorded next to every vector written through this store.
    pub fn new(pool: SqlitePool, model: impl Into<String>) -> Self {
        Self {
            pool,
            model: model.into(),
        }
    }
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    let id: String = row.get("id");
    let chunk_type: String = row.get("chunk_type");
    let page_indices: String = row.get("page_indices");
    let metadata_json: String = row.get("metadata_json");
    let page_index: i64 = row.get("page_index");

    let metadata: DocumentMetadata = serde_json::from_str(&metadata_json)
        .with_context(|| format!("Corrupt metadata on chunk {}", id))?;
    let page_indices: BTreeSet<u32> = serde_json::from_str(&page_indices)
        .with_context(|| format!("Corrupt page_indices on chunk {}", id))?;
    let chunk_type: ChunkType = chunk_type
        .parse()
        .map_err(|e: String| anyhow::anyhow!("chunk {}: {}", id, e))?;

    Ok(Chunk {
        id,
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        content: row.get("content"),
        chunk_type,
        page_index: u32::try_from(page_index).unwrap_or_default(),
        page_indices,
        has_table: row.get("has_table"),
        hash: row.get("hash"),
        metadata,
    })
}

async fn insert_chunk(tx: &mut Transaction<'_, Sqlite>, chunk: &Chunk) -> Result<()> {
    let meta = &chunk.metadata;
    sqlx::query(
        r#"
        INSERT INTO chunks (id, document_id, chunk_index, content, chunk_type, page_index,
                            page_indices, has_table, hash, owner_id, company, fiscal_year,
                            fiscal_quarter, document_type, sector, metadata_json)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            content = excluded.content,
            chunk_type = excluded.chunk_type,
            page_index = excluded.page_index,
            page_indices = excluded.page_indices,
            has_table = excluded.has_table,
            hash = excluded.hash,
            owner_id = excluded.owner_id,
            company = excluded.company,
            fiscal_year = excluded.fiscal_year,
            fiscal_quarter = excluded.fiscal_quarter,
            document_type = excluded.document_type,
            sector = excluded.sector,
            metadata_json = excluded.metadata_json
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.document_id)
    .bind(chunk.chunk_index)
    .bind(&chunk.content)
    .bind(chunk.chunk_type.as_str())
    .bind(chunk.page_index as i64)
    .bind(serde_json::to_string(&chunk.page_indices)?)
    .bind(chunk.has_table)
    .bind(&chunk.hash)
    .bind(&meta.owner_id)
    .bind(meta.company.as_deref().map(str::to_lowercase))
    .bind(meta.fiscal_year)
    .bind(meta.fiscal_quarter.map(i64::from))
    .bind(&meta.document_type)
    .bind(&meta.sector)
    .bind(serde_json::to_string(meta)?)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("Failed to store chunk {}", chunk.id))?;
    Ok(())
}

#[async_trait]
impl ChunkStore for SqliteChunkStore {
    async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_vectors(&self, vectors: &[(String, Vec<f32>)]) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        for (chunk_id, vector) in vectors {
            sqlx::query(
                r#"
                INSERT INTO chunk_vectors (chunk_id, document_id, model, dims, embedding, created_at)
                VALUES (?, (SELECT document_id FROM chunks WHERE id = ?), ?, ?, ?, ?)
                ON CONFLICT(chunk_id) DO UPDATE SET
                    model = excluded.model,
                    dims = excluded.dims,
                    embedding = excluded.embedding,
                    created_at = excluded.created_at
                "#,
            )
            .bind(chunk_id)
            .bind(chunk_id)
            .bind(&self.model)
            .bind(vector.len() as i64)
            .bind(vec_to_blob(vector))
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to store vector for chunk {}", chunk_id))?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks c WHERE c.document_id = ? ORDER BY c.chunk_index",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_chunk).collect()
    }

    async fn delete_document_chunks(&self, document_id: &str) -> Result<u64> {
        self.replace_document_chunks(document_id, &[]).await
    }

    async fn replace_document_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM chunk_vectors WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        for chunk in chunks {
            insert_chunk(&mut tx, chunk).await?;
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<VectorHit>> {
        if filter.owner_id.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            r#"
            SELECT {}, cv.embedding
            FROM chunk_vectors cv
            JOIN chunks c ON c.id = cv.chunk_id
            WHERE c.owner_id = ?
            "#,
            CHUNK_COLUMNS
        ))
        .bind(&filter.owner_id)
        .fetch_all(&self.pool)
        .await?;

        let mut hits = Vec::new();
        for row in &rows {
            let chunk = row_to_chunk(row)?;
            if !filter.matches(&chunk) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let similarity = cosine_similarity(query_vec, &blob_to_vec(&blob));
            hits.push(VectorHit { chunk, similarity });
        }

        rank_hits(&mut hits, limit);
        Ok(hits)
    }
}
