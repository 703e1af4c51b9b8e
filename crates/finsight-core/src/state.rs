//! Per-turn agent state.
//!
//! One [`AgentState`] is created when a query arrives, threaded by `&mut`
//! through every stage, and dropped when the turn ends. Attempt counters
//! live here rather than in any shared structure, so concurrent turns never
//! observe each other. Counter increments are checked against hard ceilings.

use serde::Serialize;

use crate::analysis::AnalysisResult;
use crate::answer::Answer;
use crate::error::InvariantViolation;
use crate::models::{ProcessedQuery, RetrievedChunk};

/// Hard ceiling on `Retrieve` invocations per turn.
pub const MAX_RETRIEVAL_ATTEMPTS: u32 = 3;

/// Hard ceiling on `SelfHeal` invocations per turn.
pub const MAX_SELF_HEAL_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentState {
    pub query_text: String,
    pub owner_id: String,
    pub session_id: String,
    /// Compressed summaries of earlier turns in this session, oldest first.
    pub history: Vec<String>,
    pub processed_query: Option<ProcessedQuery>,
    /// Result set of the latest retrieval attempt only.
    pub retrieved: Vec<RetrievedChunk>,
    /// Gaps named by the latest sufficiency judgment.
    pub gaps: Vec<String>,
    pub analysis: Option<AnalysisResult>,
    pub draft: Option<Answer>,
    pub answer: Option<Answer>,
    pub retrieval_attempts: u32,
    pub self_heal_attempts: u32,
    pub retrieval_sufficient: bool,
    pub response_valid: bool,
    /// Reasons the latest quality check failed.
    pub quality_failures: Vec<String>,
}

impl AgentState {
    pub fn new(
        query_text: impl Into<String>,
        owner_id: impl Into<String>,
        session_id: impl Into<String>,
        history: Vec<String>,
    ) -> Self {
        Self {
            query_text: query_text.into(),
            owner_id: owner_id.into(),
            session_id: session_id.into(),
            history,
            ..Default::default()
        }
    }

    /// Count one `Retrieve` invocation.
    pub fn record_retrieval_attempt(&mut self) -> Result<u32, InvariantViolation> {
        bump(&mut self.retrieval_attempts, "retrieval_attempts", MAX_RETRIEVAL_ATTEMPTS)
    }

    /// Count one `SelfHeal` invocation.
    pub fn record_self_heal(&mut self) -> Result<u32, InvariantViolation> {
        bump(&mut self.self_heal_attempts, "self_heal_attempts", MAX_SELF_HEAL_ATTEMPTS)
    }
}

fn bump(counter: &mut u32, name: &'static str, ceiling: u32) -> Result<u32, InvariantViolation> {
    let next = *counter + 1;
    if next > ceiling {
        return Err(InvariantViolation::AttemptCeiling {
            counter: name,
            value: next,
            ceiling,
        });
    }
    *counter = next;
    Ok(next)
}
