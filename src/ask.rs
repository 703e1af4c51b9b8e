//! `fin ask`: one full query turn, answer printed as JSON.

use anyhow::Result;
use finsight_core::answer::Answer;
use finsight_core::filter::SearchFilter;
use finsight_core::pipeline::{AnswerPipeline, TurnRequest};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::info;

use crate::app;
use crate::config::Config;
use crate::db;
use crate::memory;

#[derive(Debug, Serialize)]
pub struct AskOutput {
    pub session_id: String,
    #[serde(flatten)]
    pub answer: Answer,
    pub retrieval_attempts: u32,
    pub retrieval_sufficient: bool,
    pub self_heal_attempts: u32,
}

/// Run a turn against `pipeline`, reading the session's memory. The turn
/// summary is written on a detached task whose handle is returned.
pub async fn answer_turn(
    pool: &SqlitePool,
    pipeline: &AnswerPipeline,
    query: &str,
    filter: SearchFilter,
    session_id: String,
) -> Result<(AskOutput, JoinHandle<()>)> {
    let history = memory::recent(
        pool,
        &session_id,
        &filter.owner_id,
        pipeline.settings().history_window,
    )
    .await?;

    let owner_id = filter.owner_id.clone();
    let state = pipeline
        .run_turn(TurnRequest {
            query: query.to_string(),
            session_id: session_id.clone(),
            filter,
            history,
        })
        .await?;

    let answer = state.answer.clone().unwrap_or_default();
    info!(
        session_id = %session_id,
        attempts = state.retrieval_attempts,
        heals = state.self_heal_attempts,
        low_confidence = answer.low_confidence,
        "turn complete"
    );

    let summary = memory::summarize_turn(query, &answer.text);
    let pending = memory::record_detached(pool.clone(), session_id.clone(), owner_id, summary);

    let output = AskOutput {
        session_id,
        answer,
        retrieval_attempts: state.retrieval_attempts,
        retrieval_sufficient: state.retrieval_sufficient,
        self_heal_attempts: state.self_heal_attempts,
    };
    Ok((output, pending))
}

pub async fn run_ask(config: &Config, query: &str, filter: SearchFilter, session: Option<String>) -> Result<()> {
    let pool = db::connect(config).await?;
    let pipeline = app::pipeline(config, &pool)?;
    let session_id = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (output, pending) = answer_turn(&pool, &pipeline, query, filter, session_id).await?;
    println!("{}", serde_json::to_string_pretty(&output)?);

    // Let the memory write land before the process exits.
    let _ = pending.await;

    pool.close().await;
    Ok(())
}
