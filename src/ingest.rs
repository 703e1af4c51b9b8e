//! Document ingestion.
//!
//! [`submit`] registers a document and enqueues its first task. Workers
//! then drive each document through a task chain, one stage per task:
//!
//! | Stage | Reads | Writes | Then |
//! |-------|-------|--------|------|
//! | `parse` | source file / extraction output | `document_elements`, `page_count` | `chunk` |
//! | `chunk` | `document_elements` | `chunks` (replaced in one transaction) | `embed` |
//! | `embed` | `chunks` | `chunk_vectors`, in batches | `index` |
//! | `index` | `chunks`, `chunk_vectors` | document status `ready` | none |
//!
//! Chunk ids are `{document_id}_chunk_{n}`, so re-running any stage after an
//! interrupted attempt overwrites rather than duplicates. The next stage is
//! enqueued only if the document has no unfinished task of that type, so a
//! re-run stage does not fork the chain.
//!
//! Document status moves `pending → processing → ready`, or to `failed`
//! with the reason once a task fails terminally.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use finsight_core::chunk::{check_chunk_lengths, Chunker};
use finsight_core::embedding::Embedder;
use finsight_core::error::InvariantViolation;
use finsight_core::models::{DocumentMetadata, Element};
use finsight_core::queue::{NewTask, ProcessingTask, TaskQueue, TaskType};
use finsight_core::store::ChunkStore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument, warn};

use crate::config::ExtractionConfig;
use crate::extract;

// ============ Submission ============

/// A document to register.
#[derive(Debug, Clone, Default)]
pub struct SubmitRequest {
    pub source: PathBuf,
    pub owner_id: String,
    pub document_id: Option<String>,
    pub company: Option<String>,
    pub ticker: Option<String>,
    pub sector: Option<String>,
    pub fiscal_year: Option<i32>,
    pub fiscal_quarter: Option<u8>,
    pub document_type: Option<String>,
    /// Known page count, used to size the extraction wait.
    pub pages: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    pub document_id: String,
    pub task_id: String,
}

/// Payload carried by a `parse` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ParsePayload {
    source_path: PathBuf,
    #[serde(default)]
    page_hint: u32,
}

pub async fn submit(
    pool: &SqlitePool,
    queue: &dyn TaskQueue,
    req: SubmitRequest,
    max_attempts: u32,
) -> Result<Submitted> {
    if req.owner_id.trim().is_empty() {
        bail!("owner id must not be empty");
    }
    if let Some(q) = req.fiscal_quarter {
        if !(1..=4).contains(&q) {
            bail!("fiscal quarter must be 1-4, got {}", q);
        }
    }

    let bytes = tokio::fs::read(&req.source)
        .await
        .with_context(|| format!("Failed to read {}", req.source.display()))?;
    let content_hash = format!("{:x}", Sha256::digest(&bytes));
    let document_id = req
        .document_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let filename = req
        .source
        .file_name()
        .map(|n| n.to_string_lossy().to_string());
    let now = Utc::now().timestamp();

    sqlx::query(
        r#"
        INSERT INTO documents (id, owner_id, filename, company, ticker, sector, fiscal_year,
                               fiscal_quarter, document_type, source_path, content_hash,
                               page_count, status, error_message, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', NULL, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            owner_id = excluded.owner_id,
            filename = excluded.filename,
            company = excluded.company,
            ticker = excluded.ticker,
            sector = excluded.sector,
            fiscal_year = excluded.fiscal_year,
            fiscal_quarter = excluded.fiscal_quarter,
            document_type = excluded.document_type,
            source_path = excluded.source_path,
            content_hash = excluded.content_hash,
            page_count = excluded.page_count,
            status = 'pending',
            error_message = NULL,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&document_id)
    .bind(&req.owner_id)
    .bind(&filename)
    .bind(&req.company)
    .bind(&req.ticker)
    .bind(&req.sector)
    .bind(req.fiscal_year)
    .bind(req.fiscal_quarter.map(i64::from))
    .bind(&req.document_type)
    .bind(req.source.to_string_lossy().to_string())
    .bind(&content_hash)
    .bind(i64::from(req.pages.unwrap_or(0)))
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    let payload = serde_json::to_value(ParsePayload {
        source_path: req.source.clone(),
        page_hint: req.pages.unwrap_or(0),
    })?;
    let task_id = queue
        .enqueue(NewTask::new(&document_id, TaskType::Parse, payload).max_attempts(max_attempts))
        .await?;

    info!(document_id = %document_id, task_id = %task_id, "document submitted");
    Ok(Submitted {
        document_id,
        task_id,
    })
}

// ============ Document rows ============

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStatus {
    pub id: String,
    pub status: String,
    pub page_count: u32,
    pub error_message: Option<String>,
}

pub async fn document_status(pool: &SqlitePool, document_id: &str) -> Result<Option<DocumentStatus>> {
    let row = sqlx::query("SELECT id, status, page_count, error_message FROM documents WHERE id = ?")
        .bind(document_id)
        .fetch_optional(pool)
        .await?;

    Ok(row.map(|row| {
        let pages: i64 = row.get("page_count");
        DocumentStatus {
            id: row.get("id"),
            status: row.get("status"),
            page_count: u32::try_from(pages).unwrap_or_default(),
            error_message: row.get("error_message"),
        }
    }))
}

pub async fn set_document_status(
    pool: &SqlitePool,
    document_id: &str,
    status: &str,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE documents SET status = ?, error_message = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(document_id)
        .execute(pool)
        .await?;
    Ok(())
}

async fn load_metadata(pool: &SqlitePool, document_id: &str) -> Result<DocumentMetadata> {
    let row = sqlx::query(
        r#"
        SELECT owner_id, filename, company, ticker, sector, fiscal_year, fiscal_quarter, document_type
        FROM documents WHERE id = ?
        "#,
    )
    .bind(document_id)
    .fetch_optional(pool)
    .await?
    .with_context(|| format!("unknown document {}", document_id))?;

    let quarter: Option<i64> = row.get("fiscal_quarter");
    let year: Option<i64> = row.get("fiscal_year");
    Ok(DocumentMetadata {
        owner_id: row.get("owner_id"),
        document_id: document_id.to_string(),
        company: row.get("company"),
        ticker: row.get("ticker"),
        sector: row.get("sector"),
        fiscal_year: year.and_then(|y| i32::try_from(y).ok()),
        fiscal_quarter: quarter.and_then(|q| u8::try_from(q).ok()),
        document_type: row.get("document_type"),
        filename: row.get("filename"),
    })
}

// ============ Stages ============

/// Runs one ingestion task to completion and enqueues the next stage.
pub struct Ingestor {
    pool: SqlitePool,
    store: Arc<dyn ChunkStore>,
    queue: Arc<dyn TaskQueue>,
    embedder: Arc<dyn Embedder>,
    chunker: Chunker,
    extraction: ExtractionConfig,
    batch_size: usize,
    max_attempts: u32,
}

impl Ingestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        store: Arc<dyn ChunkStore>,
        queue: Arc<dyn TaskQueue>,
        embedder: Arc<dyn Embedder>,
        chunker: Chunker,
        extraction: ExtractionConfig,
        batch_size: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            pool,
            store,
            queue,
            embedder,
            chunker,
            extraction,
            batch_size: batch_size.max(1),
            max_attempts,
        }
    }

    pub fn queue(&self) -> &Arc<dyn TaskQueue> {
        &self.queue
    }

    /// Run `task`'s stage and, on success, enqueue the following one
    /// unless it is already queued.
    #[instrument(skip_all, fields(task_id = %task.id, document_id = %task.document_id, stage = %task.task_type, attempt = task.attempts))]
    pub async fn process(&self, task: &ProcessingTask) -> Result<()> {
        match task.task_type {
            TaskType::Parse => self.parse(task).await?,
            TaskType::Chunk => self.chunk(&task.document_id).await?,
            TaskType::Embed => self.embed(&task.document_id).await?,
            TaskType::Index => self.index(&task.document_id).await?,
        }

        if let Some(next) = task.task_type.next() {
            let queued = self
                .queue
                .enqueue_unique(
                    NewTask::new(&task.document_id, next, serde_json::json!({}))
                        .priority(task.priority)
                        .max_attempts(self.max_attempts),
                )
                .await?;
            if queued.is_none() {
                info!(next = %next, "next stage already queued");
            }
        }
        Ok(())
    }

    async fn parse(&self, task: &ProcessingTask) -> Result<()> {
        let payload: ParsePayload =
            serde_json::from_value(task.payload.clone()).context("invalid parse task payload")?;
        set_document_status(&self.pool, &task.document_id, "processing", None).await?;

        let elements = extract::extract(&self.extraction, &payload.source_path, payload.page_hint).await?;
        if elements.is_empty() {
            bail!("extraction produced no elements for {}", payload.source_path.display());
        }
        let pages = extract::page_count(&elements);
        let now = Utc::now().timestamp();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO document_elements (document_id, elements_json, element_count, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(document_id) DO UPDATE SET
                elements_json = excluded.elements_json,
                element_count = excluded.element_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&task.document_id)
        .bind(serde_json::to_string(&elements)?)
        .bind(elements.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE documents SET page_count = ?, updated_at = ? WHERE id = ?")
            .bind(i64::from(pages))
            .bind(now)
            .bind(&task.document_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(elements = elements.len(), pages, "parsed");
        Ok(())
    }

    async fn chunk(&self, document_id: &str) -> Result<()> {
        let json: String = sqlx::query_scalar("SELECT elements_json FROM document_elements WHERE document_id = ?")
            .bind(document_id)
            .fetch_optional(&self.pool)
            .await?
            .with_context(|| format!("no parsed elements for {}", document_id))?;
        let elements: Vec<Element> = serde_json::from_str(&json)?;
        let metadata = load_metadata(&self.pool, document_id).await?;

        let chunks = self.chunker.chunk(&elements, &metadata);
        check_chunk_lengths(&chunks, self.chunker.max_chars())?;

        let removed = self.store.replace_document_chunks(document_id, &chunks).await?;

        info!(chunks = chunks.len(), replaced = removed, "chunked");
        Ok(())
    }

    async fn embed(&self, document_id: &str) -> Result<()> {
        let chunks = self.store.document_chunks(document_id).await?;
        let mut written = 0usize;

        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }
            let pairs: Vec<(String, Vec<f32>)> = batch
                .iter()
                .map(|c| c.id.clone())
                .zip(vectors)
                .collect();
            self.store.upsert_vectors(&pairs).await?;
            written += pairs.len();
        }

        info!(vectors = written, model = self.embedder.model_name(), "embedded");
        Ok(())
    }

    /// Readiness gate: every chunk must carry a vector of the configured width.
    async fn index(&self, document_id: &str) -> Result<()> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM chunks WHERE document_id = ?1) AS chunks,
                (SELECT COUNT(*) FROM chunk_vectors WHERE document_id = ?1 AND dims = ?2) AS vectors
            "#,
        )
        .bind(document_id)
        .bind(self.embedder.dims() as i64)
        .fetch_one(&self.pool)
        .await?;
        let chunks: i64 = row.get("chunks");
        let vectors: i64 = row.get("vectors");

        if chunks == 0 {
            bail!("document {} has no chunks", document_id);
        }
        if vectors < chunks {
            bail!(
                "document {} has {} of {} chunk vectors",
                document_id,
                vectors,
                chunks
            );
        }

        set_document_status(&self.pool, document_id, "ready", None).await?;
        info!(chunks, "document ready");
        Ok(())
    }

    /// Record a failed attempt by `worker_id`. Invariant violations fail the
    /// task outright. Returns [`LeaseLost`](finsight_core::error::LeaseLost)
    /// without touching the document if the task has moved on.
    pub async fn record_failure(
        &self,
        task: &ProcessingTask,
        worker_id: &str,
        err: &anyhow::Error,
    ) -> Result<()> {
        let reason = format!("{:#}", err);

        let retrying = if err.downcast_ref::<InvariantViolation>().is_some() {
            self.queue.abandon(&task.id, worker_id, &reason).await?;
            false
        } else {
            self.queue.fail(&task.id, worker_id, &reason).await?
        };

        if retrying {
            warn!(task_id = %task.id, attempt = task.attempts, error = %reason, "task will be retried");
        } else {
            warn!(task_id = %task.id, document_id = %task.document_id, error = %reason, "task failed terminally");
            set_document_status(&self.pool, &task.document_id, "failed", Some(&reason)).await?;
        }
        Ok(())
    }
}
