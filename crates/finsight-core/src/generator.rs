//! Text-generation collaborator contract.
//!
//! Every language-model call in the system (entity extraction, sufficiency
//! judgment, analysis, explanation, self-heal) goes through one narrow
//! capability: a structured [`GenerationRequest`] in, a JSON value out. The
//! caller names the schema it expects via [`ResponseSchema`], and
//! [`request`] deserializes and validates the value, retrying exactly once
//! when the output is malformed.
//!
//! Schemas:
//!
//! | Task | Schema |
//! |------|--------|
//! | [`GenerationTask::ExtractEntities`] | [`EntityExtraction`] |
//! | [`GenerationTask::JudgeSufficiency`] | [`SufficiencyJudgment`] |
//! | [`GenerationTask::Analyze`] | `analysis::AnalysisPayload` |
//! | [`GenerationTask::Explain`], [`GenerationTask::SelfHeal`] | `answer::ExplanationPayload` |
//!
//! [`ScriptedGenerator`] is a deterministic stand-in for tests and offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CollaboratorError;
use crate::models::{ChunkType, ProcessedQuery, QueryEntities};

/// What the collaborator is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationTask {
    ExtractEntities,
    JudgeSufficiency,
    Analyze,
    Explain,
    SelfHeal,
}

impl GenerationTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationTask::ExtractEntities => "extract_entities",
            GenerationTask::JudgeSufficiency => "judge_sufficiency",
            GenerationTask::Analyze => "analyze",
            GenerationTask::Explain => "explain",
            GenerationTask::SelfHeal => "self_heal",
        }
    }
}

/// A structured request: task type plus task-specific context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationRequest {
    pub task: GenerationTask,
    pub context: serde_json::Value,
}

impl GenerationRequest {
    pub fn new(task: GenerationTask, context: serde_json::Value) -> Self {
        Self { task, context }
    }
}

/// The text-generation service.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Produce a JSON response for `request`. Implementations report
    /// unparseable output as [`CollaboratorError::Malformed`].
    async fn generate(&self, request: &GenerationRequest) -> Result<serde_json::Value, CollaboratorError>;
}

/// A response type the collaborator may be asked for.
pub trait ResponseSchema: DeserializeOwned + Send {
    /// Schema name used in error messages.
    const NAME: &'static str;

    /// Structural checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Deserialize and validate one response value.
pub fn parse_response<T: ResponseSchema>(value: serde_json::Value) -> Result<T, CollaboratorError> {
    let parsed: T =
        serde_json::from_value(value).map_err(|e| CollaboratorError::malformed(T::NAME, e.to_string()))?;
    parsed
        .validate()
        .map_err(|reason| CollaboratorError::malformed(T::NAME, reason))?;
    Ok(parsed)
}

/// Issue `req` and return a validated `T`.
///
/// Malformed output is retried once; the second failure, a timeout, or an
/// unavailable collaborator is returned to the caller to absorb.
pub async fn request<T: ResponseSchema>(
    generator: &dyn TextGenerator,
    req: &GenerationRequest,
) -> Result<T, CollaboratorError> {
    let mut last = None;
    for attempt in 1..=2u32 {
        let outcome = match generator.generate(req).await {
            Ok(value) => parse_response::<T>(value),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(parsed) => return Ok(parsed),
            Err(e) if e.is_retryable() && attempt == 1 => {
                warn!(task = req.task.as_str(), error = %e, "malformed response, retrying once");
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| CollaboratorError::malformed(T::NAME, "no response")))
}

// ============ Schemas ============

/// Entity-extraction response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct EntityExtraction {
    #[serde(default)]
    pub companies: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub year_range: Option<(i32, i32)>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub fiscal_quarter: Option<u8>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub chunk_type: Option<String>,
    #[serde(default)]
    pub query_type: String,
    pub augmented_query: String,
}

fn plausible_year(y: i32) -> bool {
    (1900..=2100).contains(&y)
}

impl ResponseSchema for EntityExtraction {
    const NAME: &'static str = "entity_extraction";

    fn validate(&self) -> Result<(), String> {
        if self.augmented_query.trim().is_empty() {
            return Err("augmented_query is empty".to_string());
        }
        if let Some(y) = self.year {
            if !plausible_year(y) {
                return Err(format!("year {} out of range", y));
            }
        }
        if let Some((start, end)) = self.year_range {
            if start > end || !plausible_year(start) || !plausible_year(end) {
                return Err(format!("invalid year_range {}..{}", start, end));
            }
        }
        if let Some(q) = self.fiscal_quarter {
            if !(1..=4).contains(&q) {
                return Err(format!("fiscal_quarter {} not in 1..=4", q));
            }
        }
        if let Some(ct) = &self.chunk_type {
            ct.parse::<ChunkType>()?;
        }
        Ok(())
    }
}

impl EntityExtraction {
    /// Convert into a [`ProcessedQuery`]. Call only after validation.
    pub fn into_processed(self, query_text: &str) -> ProcessedQuery {
        let mut companies: Vec<String> = Vec::new();
        for c in self.companies {
            let c = c.trim().to_lowercase();
            if !c.is_empty() && !companies.contains(&c) {
                companies.push(c);
            }
        }
        let non_empty = |s: Option<String>| s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        ProcessedQuery {
            query_text: query_text.to_string(),
            entities: QueryEntities {
                companies,
                year: self.year,
                year_range: self.year_range,
                document_type: non_empty(self.document_type),
                fiscal_quarter: self.fiscal_quarter,
                sector: non_empty(self.sector),
                chunk_type: self.chunk_type.and_then(|c| c.parse().ok()),
            },
            augmented_query: self.augmented_query.trim().to_string(),
            query_type: self.query_type,
        }
    }
}

/// Sufficiency-judgment response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SufficiencyJudgment {
    pub sufficient: bool,
    /// Information the evidence is missing, when insufficient.
    #[serde(default)]
    pub gaps: Vec<String>,
    /// Extra search terms suggested for the next attempt.
    #[serde(default)]
    pub additional_keywords: Vec<String>,
}

impl ResponseSchema for SufficiencyJudgment {
    const NAME: &'static str = "sufficiency_judgment";
}

// ============ Scripted stub ============

/// Deterministic [`TextGenerator`] that replays queued responses per task.
///
/// Each task has a FIFO of scripted outcomes; once a task's queue is empty,
/// its fallback value (if any) is returned forever. Tasks with neither
/// yield [`CollaboratorError::Unavailable`].
#[derive(Default)]
pub struct ScriptedGenerator {
    queued: Mutex<HashMap<GenerationTask, VecDeque<Result<serde_json::Value, CollaboratorError>>>>,
    fallback: Mutex<HashMap<GenerationTask, serde_json::Value>>,
    calls: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one outcome for `task`.
    pub fn push(&self, task: GenerationTask, outcome: Result<serde_json::Value, CollaboratorError>) -> &Self {
        if let Ok(mut q) = self.queued.lock() {
            q.entry(task).or_default().push_back(outcome);
        }
        self
    }

    /// Response returned for `task` once its queue is drained.
    pub fn always(&self, task: GenerationTask, value: serde_json::Value) -> &Self {
        if let Ok(mut f) = self.fallback.lock() {
            f.insert(task, value);
        }
        self
    }

    /// Every request seen so far, in order.
    pub fn calls(&self) -> Vec<GenerationRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn call_count(&self, task: GenerationTask) -> usize {
        self.calls().iter().filter(|r| r.task == task).count()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<serde_json::Value, CollaboratorError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let queued = match self.queued.lock() {
            Ok(mut q) => q.get_mut(&request.task).and_then(|d| d.pop_front()),
            Err(_) => None,
        };
        if let Some(outcome) = queued {
            return outcome;
        }
        let fallback = match self.fallback.lock() {
            Ok(f) => f.get(&request.task).cloned(),
            Err(_) => None,
        };
        fallback.ok_or_else(|| {
            CollaboratorError::Unavailable(format!("no script for {}", request.task.as_str()))
        })
    }
}
