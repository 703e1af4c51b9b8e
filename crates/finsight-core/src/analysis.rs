//! Analysis stage: quantitative findings extracted from retrieved evidence.
//!
//! Extraction is delegated to the text-generation collaborator
//! ([`GenerationTask::Analyze`]). The returned [`AnalysisPayload`] is then
//! checked locally by [`validate_analysis`]:
//!
//! - every finding and comparison has a non-empty label and finite values,
//! - `delta == to - from`,
//! - `growth_rate == (to - from) / |from|` (either as a fraction or a percentage),
//! - any referenced `source_chunk_id` is in the retrieved set.
//!
//! A structural failure is retried with the failure reasons attached, up to
//! `max_attempts`. After that the stage returns an empty, unvalidated
//! result and the turn carries on with a low-confidence flag.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::generator::{request, GenerationRequest, GenerationTask, ResponseSchema, TextGenerator};
use crate::models::{ProcessedQuery, RetrievedChunk};

/// Relative tolerance for derived-value checks.
const TOLERANCE: f64 = 1e-3;

/// One extracted number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub label: String,
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    /// e.g. `FY2023`, `Q3 2024`.
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub source_chunk_id: Option<String>,
}

/// A derived comparison between two values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comparison {
    pub label: String,
    pub from: f64,
    pub to: f64,
    pub delta: f64,
    #[serde(default)]
    pub growth_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub comparisons: Vec<Comparison>,
}

impl ResponseSchema for AnalysisPayload {
    const NAME: &'static str = "analysis";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnalysisResult {
    pub payload: AnalysisPayload,
    /// True when the payload passed [`validate_analysis`].
    pub validated: bool,
    /// Structural problems from the last attempt, if any.
    pub issues: Vec<String>,
    pub attempts: u32,
}

impl AnalysisResult {
    pub fn low_confidence(&self) -> bool {
        !self.validated
    }
}

fn close(actual: f64, expected: f64) -> bool {
    (actual - expected).abs() <= TOLERANCE * expected.abs().max(1.0)
}

/// Structural checks on an analysis payload. Returns every problem found.
pub fn validate_analysis(payload: &AnalysisPayload, retrieved: &[RetrievedChunk]) -> Vec<String> {
    let known: HashSet<&str> = retrieved.iter().map(|r| r.chunk.id.as_str()).collect();
    let mut issues = Vec::new();

    for (i, f) in payload.findings.iter().enumerate() {
        if f.label.trim().is_empty() {
            issues.push(format!("finding {} has no label", i));
        }
        if !f.value.is_finite() {
            issues.push(format!("finding {} value is not finite", i));
        }
        if let Some(id) = f.source_chunk_id.as_deref() {
            if !known.contains(id) {
                issues.push(format!("finding {} cites unknown chunk {}", i, id));
            }
        }
    }

    for (i, c) in payload.comparisons.iter().enumerate() {
        if c.label.trim().is_empty() {
            issues.push(format!("comparison {} has no label", i));
        }
        if !(c.from.is_finite() && c.to.is_finite() && c.delta.is_finite()) {
            issues.push(format!("comparison {} has a non-finite value", i));
            continue;
        }
        let expected_delta = c.to - c.from;
        if !close(c.delta, expected_delta) {
            issues.push(format!(
                "comparison {} delta {} != to - from ({})",
                i, c.delta, expected_delta
            ));
        }
        if let Some(g) = c.growth_rate {
            if c.from == 0.0 {
                issues.push(format!("comparison {} has a growth rate from zero", i));
            } else {
                let fraction = expected_delta / c.from.abs();
                if !g.is_finite() || !(close(g, fraction) || close(g, fraction * 100.0)) {
                    issues.push(format!(
                        "comparison {} growth_rate {} inconsistent with {:.4}",
                        i, g, fraction
                    ));
                }
            }
        }
    }

    issues
}

pub struct AnalysisStage<'a> {
    generator: &'a dyn TextGenerator,
    max_attempts: u32,
}

impl<'a> AnalysisStage<'a> {
    pub fn new(generator: &'a dyn TextGenerator, max_attempts: u32) -> Self {
        Self {
            generator,
            max_attempts: max_attempts.max(1),
        }
    }

    #[instrument(skip_all, fields(chunks = retrieved.len()))]
    pub async fn analyze(&self, retrieved: &[RetrievedChunk], query: &ProcessedQuery) -> AnalysisResult {
        let evidence: Vec<serde_json::Value> = retrieved
            .iter()
            .map(|r| {
                json!({
                    "chunk_id": r.chunk.id,
                    "company": r.chunk.metadata.company,
                    "fiscal_year": r.chunk.metadata.fiscal_year,
                    "fiscal_quarter": r.chunk.metadata.fiscal_quarter,
                    "document_type": r.chunk.metadata.document_type,
                    "chunk_type": r.chunk.chunk_type,
                    "page": r.chunk.page_index,
                    "content": r.chunk.content,
                })
            })
            .collect();

        let mut issues: Vec<String> = Vec::new();
        for attempt in 1..=self.max_attempts {
            let req = GenerationRequest::new(
                GenerationTask::Analyze,
                json!({
                    "query": query.query_text,
                    "query_type": query.query_type,
                    "entities": query.entities,
                    "chunks": evidence,
                    "previous_issues": issues,
                }),
            );
            let payload = match request::<AnalysisPayload>(self.generator, &req).await {
                Ok(p) => p,
                Err(e) => {
                    warn!(attempt, error = %e, "analysis unavailable");
                    issues = vec![e.to_string()];
                    break;
                }
            };

            issues = validate_analysis(&payload, retrieved);
            if issues.is_empty() {
                debug!(
                    attempt,
                    findings = payload.findings.len(),
                    comparisons = payload.comparisons.len(),
                    "analysis validated"
                );
                return AnalysisResult {
                    payload,
                    validated: true,
                    issues,
                    attempts: attempt,
                };
            }
            warn!(attempt, issues = issues.len(), "analysis failed structural validation");
        }

        AnalysisResult {
            payload: AnalysisPayload::default(),
            validated: false,
            issues,
            attempts: self.max_attempts,
        }
    }
}
