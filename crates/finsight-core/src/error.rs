//! Typed errors for collaborator calls and structural invariants.
//!
//! | Condition | Type | Handling |
//! |-----------|------|----------|
//! | Response fails schema validation | [`CollaboratorError::Malformed`] | retried once, then absorbed |
//! | Call exceeds its deadline | [`CollaboratorError::Timeout`] | absorbed as insufficiency/invalidity |
//! | Transport or provider failure | [`CollaboratorError::Unavailable`] | absorbed as insufficiency/invalidity |
//! | Loop hits its attempt ceiling | none, a terminal state | best-effort answer |
//! | Contract broken by our own code | [`InvariantViolation`] | fatal to the turn or task |
//! | Queue write after the lease moved on | [`LeaseLost`] | logged, the write is dropped |

use thiserror::Error;

/// Failure of an outbound call to an external collaborator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollaboratorError {
    #[error("malformed {schema} response: {reason}")]
    Malformed { schema: &'static str, reason: String },

    #[error("{operation} timed out after {elapsed_ms}ms")]
    Timeout {
        operation: &'static str,
        elapsed_ms: u64,
    },

    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    pub fn malformed(schema: &'static str, reason: impl Into<String>) -> Self {
        CollaboratorError::Malformed {
            schema,
            reason: reason.into(),
        }
    }

    /// Only malformed output earns a local retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollaboratorError::Malformed { .. })
    }
}

/// A programming-contract violation. Never absorbed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InvariantViolation {
    #[error("chunk {chunk_id} is {len} chars, exceeding the {max} char maximum")]
    ChunkTooLong {
        chunk_id: String,
        len: usize,
        max: usize,
    },

    #[error("citation references chunk {chunk_id} which is not in the retrieved set")]
    DanglingCitation { chunk_id: String },

    #[error("illegal transition: {event} in phase {phase}")]
    IllegalTransition { phase: String, event: String },

    #[error("{counter} reached {value}, above its ceiling of {ceiling}")]
    AttemptCeiling {
        counter: &'static str,
        value: u32,
        ceiling: u32,
    },
}

/// Error surfaced from a query turn. Everything else is absorbed into
/// sufficiency and validity flags.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

/// A worker tried to settle a task it no longer holds: its lease expired
/// and the task was reclaimed, or it was already settled.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("worker {worker_id} no longer holds task {task_id}")]
pub struct LeaseLost {
    pub task_id: String,
    pub worker_id: String,
}

impl LeaseLost {
    pub fn new(task_id: impl Into<String>, worker_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
        }
    }

    /// Whether `err` is, or wraps, a [`LeaseLost`].
    pub fn is(err: &anyhow::Error) -> bool {
        err.downcast_ref::<LeaseLost>().is_some()
    }
}
