//! Per-session conversation memory.
//!
//! Each accepted turn leaves a one-line summary (the query plus the start of
//! the answer). The next turn in the same session hands the most recent
//! summaries to query understanding so follow-ups like "and in 2022?"
//! resolve.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;
use tracing::{debug, warn};

/// Answer characters kept in a summary.
pub const SUMMARY_ANSWER_CHARS: usize = 500;

pub fn summarize_turn(query: &str, answer: &str) -> String {
    let head: String = answer.chars().take(SUMMARY_ANSWER_CHARS).collect();
    format!("Q: {}\nA: {}", query.trim(), head.trim())
}

/// The last `limit` summaries for `session_id`, oldest first.
pub async fn recent(pool: &SqlitePool, session_id: &str, owner_id: &str, limit: usize) -> Result<Vec<String>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let mut rows: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT summary FROM conversation_memory
        WHERE session_id = ? AND owner_id = ?
        ORDER BY id DESC
        LIMIT ?
        "#,
    )
    .bind(session_id)
    .bind(owner_id)
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;

    rows.reverse();
    Ok(rows)
}

pub async fn record(pool: &SqlitePool, session_id: &str, owner_id: &str, summary: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO conversation_memory (session_id, owner_id, summary, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(session_id)
    .bind(owner_id)
    .bind(summary)
    .bind(Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

/// Write a turn summary on a background task. Failures are logged only.
pub fn record_detached(
    pool: SqlitePool,
    session_id: String,
    owner_id: String,
    summary: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match record(&pool, &session_id, &owner_id, &summary).await {
            Ok(()) => debug!(session_id = %session_id, "turn summary stored"),
            Err(e) => warn!(session_id = %session_id, error = %e, "failed to store turn summary"),
        }
    })
}
