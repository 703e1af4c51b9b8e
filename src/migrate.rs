use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Documents: one row per submitted file, with the metadata snapshotted onto its chunks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            filename TEXT,
            company TEXT,
            ticker TEXT,
            sector TEXT,
            fiscal_year INTEGER,
            fiscal_quarter INTEGER,
            document_type TEXT,
            source_path TEXT NOT NULL,
            content_hash TEXT,
            page_count INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'pending',
            error_message TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Parsed elements, written by the parse stage and read by the chunk stage
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_elements (
            document_id TEXT PRIMARY KEY,
            elements_json TEXT NOT NULL,
            element_count INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Chunks carry denormalized filter columns so search never joins documents
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            content TEXT NOT NULL,
            chunk_type TEXT NOT NULL,
            page_index INTEGER NOT NULL,
            page_indices TEXT NOT NULL,
            has_table INTEGER NOT NULL DEFAULT 0,
            hash TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            company TEXT,
            fiscal_year INTEGER,
            fiscal_quarter INTEGER,
            document_type TEXT,
            sector TEXT,
            metadata_json TEXT NOT NULL,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunk_vectors (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Task timestamps are unix milliseconds; a claim stamps its lease expiry on the row
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS processing_tasks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            priority INTEGER NOT NULL DEFAULT 0,
            attempts INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL DEFAULT 3,
            payload TEXT NOT NULL DEFAULT '{}',
            locked_by TEXT,
            locked_at INTEGER,
            lease_expires_at INTEGER,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS conversation_memory (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            summary TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_documents_owner ON documents(owner_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_chunks_owner_company ON chunks(owner_id, company)",
        "CREATE INDEX IF NOT EXISTS idx_chunk_vectors_document ON chunk_vectors(document_id)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_claim ON processing_tasks(status, priority DESC, created_at)",
        "CREATE INDEX IF NOT EXISTS idx_tasks_document ON processing_tasks(document_id, task_type)",
        "CREATE INDEX IF NOT EXISTS idx_memory_session ON conversation_memory(session_id, id)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
