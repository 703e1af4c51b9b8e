//! Generation quality loop.
//!
//! ```text
//! Explain ──▶ Synthesize ──▶ QualityCheck ──▶ Accept
//!                 ▲               │
//!                 └── SelfHeal ◀──┘  (invalid, self-heal attempts < ceiling)
//! ```
//!
//! `Explain` and `SelfHeal` call the text-generation collaborator for an
//! [`ExplanationPayload`]. `Synthesize` is local: it strips any inline
//! sources section, attaches chart specs, and resolves cited chunk ids into
//! deduplicated [`Citation`]s from chunk metadata. `QualityCheck` is local
//! too and lists every failure; the list is what `SelfHeal` sees.
//!
//! On exhaustion the best-effort answer drops malformed charts and dangling
//! citations and is flagged low-confidence. A dangling citation surviving to
//! acceptance is an [`InvariantViolation`].

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::InvariantViolation;
use crate::generator::{request, GenerationRequest, GenerationTask, ResponseSchema, TextGenerator};
use crate::models::RetrievedChunk;
use crate::state::{AgentState, MAX_SELF_HEAL_ATTEMPTS};

/// Chart types the front end knows how to draw.
pub const CHART_TYPES: &[&str] = &["line", "bar", "pie", "doughnut"];

/// Text used when nothing usable could be generated.
pub const FALLBACK_TEXT: &str =
    "I could not produce a complete answer from the available documents. The sources below are the closest matches.";

/// Collaborator output for `Explain` and `SelfHeal`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplanationPayload {
    pub text: String,
    #[serde(default)]
    pub charts: Vec<Value>,
    /// Chunk ids the text relies on. Empty means "all retrieved chunks".
    #[serde(default, alias = "citations")]
    pub cited_chunk_ids: Vec<String>,
}

impl ResponseSchema for ExplanationPayload {
    const NAME: &'static str = "explanation";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: String,
    #[serde(default)]
    pub document_id: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default)]
    pub fiscal_quarter: Option<u8>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
}

impl Citation {
    fn from_chunk(r: &RetrievedChunk) -> Self {
        let meta = &r.chunk.metadata;
        Self {
            chunk_id: r.chunk.id.clone(),
            document_id: Some(r.chunk.document_id.clone()),
            company: meta.company.clone(),
            fiscal_year: meta.fiscal_year,
            fiscal_quarter: meta.fiscal_quarter,
            document_type: meta.document_type.clone(),
            page: Some(r.chunk.page_index),
        }
    }

    fn dangling(chunk_id: &str) -> Self {
        Self {
            chunk_id: chunk_id.to_string(),
            document_id: None,
            company: None,
            fiscal_year: None,
            fiscal_quarter: None,
            document_type: None,
            page: None,
        }
    }
}

/// The final answer object returned to the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub charts: Vec<Value>,
    pub citations: Vec<Citation>,
    pub low_confidence: bool,
}

// ============ State machine ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPhase {
    Explain,
    Synthesize,
    QualityCheck,
    SelfHeal,
    Accept,
}

impl fmt::Display for GenerationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationEvent {
    Explained,
    Synthesized,
    Checked { valid: bool },
    Healed,
}

/// Pure transition function. `heals` is the number of `SelfHeal`
/// invocations so far.
pub fn next_phase(
    phase: GenerationPhase,
    event: GenerationEvent,
    heals: u32,
    ceiling: u32,
) -> Result<GenerationPhase, InvariantViolation> {
    let ceiling = ceiling.min(MAX_SELF_HEAL_ATTEMPTS);
    match (phase, event) {
        (GenerationPhase::Explain, GenerationEvent::Explained) => Ok(GenerationPhase::Synthesize),
        (GenerationPhase::Synthesize, GenerationEvent::Synthesized) => Ok(GenerationPhase::QualityCheck),
        (GenerationPhase::QualityCheck, GenerationEvent::Checked { valid }) => {
            if valid || heals >= ceiling {
                Ok(GenerationPhase::Accept)
            } else {
                Ok(GenerationPhase::SelfHeal)
            }
        }
        (GenerationPhase::SelfHeal, GenerationEvent::Healed) => Ok(GenerationPhase::Synthesize),
        (phase, event) => Err(InvariantViolation::IllegalTransition {
            phase: phase.to_string(),
            event: format!("{:?}", event),
        }),
    }
}

// ============ Local steps ============

/// Remove a trailing `## Sources` or `### Sources` section.
pub fn strip_sources_section(text: &str) -> String {
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let heading = line.trim().trim_end_matches(':').to_lowercase();
        if heading == "## sources" || heading == "### sources" {
            return text[..offset].trim_end().to_string();
        }
        offset += line.len();
    }
    text.trim_end().to_string()
}

/// Check one chart spec: a known `type` and `data.labels` / `data.datasets` arrays.
pub fn validate_chart(chart: &Value) -> Result<(), String> {
    let obj = chart.as_object().ok_or("chart is not an object")?;
    let kind = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or("chart has no type")?;
    if !CHART_TYPES.contains(&kind) {
        return Err(format!("unsupported chart type {}", kind));
    }
    let data = obj
        .get("data")
        .and_then(Value::as_object)
        .ok_or("chart has no data object")?;
    if !data.get("labels").is_some_and(Value::is_array) {
        return Err("chart data.labels is not an array".to_string());
    }
    let datasets = data
        .get("datasets")
        .and_then(Value::as_array)
        .ok_or("chart data.datasets is not an array")?;
    if datasets
        .iter()
        .any(|d| !d.get("data").is_some_and(Value::is_array))
    {
        return Err("chart dataset without a data array".to_string());
    }
    Ok(())
}

/// Build an [`Answer`] from an explanation and the retrieved set.
pub fn synthesize(explanation: &ExplanationPayload, retrieved: &[RetrievedChunk]) -> Answer {
    let mut citations = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |c: Citation| {
        let key = if c.document_id.is_some() {
            (
                c.company.clone(),
                c.fiscal_year,
                c.document_type.clone(),
                c.fiscal_quarter,
                c.page,
                None,
            )
        } else {
            (None, None, None, None, None, Some(c.chunk_id.clone()))
        };
        if seen.insert(key) {
            citations.push(c);
        }
    };

    if explanation.cited_chunk_ids.is_empty() {
        retrieved.iter().map(Citation::from_chunk).for_each(&mut push);
    } else {
        for id in &explanation.cited_chunk_ids {
            match retrieved.iter().find(|r| r.chunk.id == *id) {
                Some(r) => push(Citation::from_chunk(r)),
                None => push(Citation::dangling(id)),
            }
        }
    }

    Answer {
        text: strip_sources_section(explanation.text.trim()),
        charts: explanation.charts.clone(),
        citations,
        low_confidence: false,
    }
}

/// Every reason `answer` is not acceptable. Empty means valid.
pub fn quality_check(answer: &Answer, retrieved: &[RetrievedChunk]) -> Vec<String> {
    let known: HashSet<&str> = retrieved.iter().map(|r| r.chunk.id.as_str()).collect();
    let mut failures = Vec::new();
    if answer.text.trim().is_empty() {
        failures.push("answer text is empty".to_string());
    }
    for c in &answer.citations {
        if !known.contains(c.chunk_id.as_str()) {
            failures.push(format!("citation {} does not reference a retrieved chunk", c.chunk_id));
        }
    }
    for (i, chart) in answer.charts.iter().enumerate() {
        if let Err(reason) = validate_chart(chart) {
            failures.push(format!("chart {}: {}", i, reason));
        }
    }
    failures
}

/// Best-effort repair after the loop gives up.
fn sanitize(mut answer: Answer, retrieved: &[RetrievedChunk]) -> Answer {
    let known: HashSet<&str> = retrieved.iter().map(|r| r.chunk.id.as_str()).collect();
    answer.citations.retain(|c| known.contains(c.chunk_id.as_str()));
    answer.charts.retain(|c| validate_chart(c).is_ok());
    if answer.text.trim().is_empty() {
        answer.text = FALLBACK_TEXT.to_string();
    }
    answer.low_confidence = true;
    answer
}

/// Every citation must point into `retrieved`.
pub fn check_citations(answer: &Answer, retrieved: &[RetrievedChunk]) -> Result<(), InvariantViolation> {
    match answer
        .citations
        .iter()
        .find(|c| !retrieved.iter().any(|r| r.chunk.id == c.chunk_id))
    {
        Some(c) => Err(InvariantViolation::DanglingCitation {
            chunk_id: c.chunk_id.clone(),
        }),
        None => Ok(()),
    }
}

// ============ Driver ============

pub struct QualityLoop<'a> {
    generator: &'a dyn TextGenerator,
    max_self_heal: u32,
}

impl<'a> QualityLoop<'a> {
    pub fn new(generator: &'a dyn TextGenerator, max_self_heal: u32) -> Self {
        Self {
            generator,
            max_self_heal: max_self_heal.min(MAX_SELF_HEAL_ATTEMPTS),
        }
    }

    /// Run to `Accept`, storing the final answer in `state.answer`.
    #[instrument(skip_all, fields(owner = %state.owner_id))]
    pub async fn run(&self, state: &mut AgentState) -> Result<(), InvariantViolation> {
        let mut phase = GenerationPhase::Explain;
        let mut explanation = ExplanationPayload::default();

        while phase != GenerationPhase::Accept {
            let event = match phase {
                GenerationPhase::Explain => {
                    explanation = self.explain(state).await;
                    GenerationEvent::Explained
                }
                GenerationPhase::Synthesize => {
                    state.draft = Some(synthesize(&explanation, &state.retrieved));
                    GenerationEvent::Synthesized
                }
                GenerationPhase::QualityCheck => {
                    let failures = match &state.draft {
                        Some(draft) => quality_check(draft, &state.retrieved),
                        None => vec!["no draft answer".to_string()],
                    };
                    state.response_valid = failures.is_empty();
                    if !failures.is_empty() {
                        debug!(failures = ?failures, "quality check failed");
                    }
                    state.quality_failures = failures;
                    GenerationEvent::Checked {
                        valid: state.response_valid,
                    }
                }
                GenerationPhase::SelfHeal => {
                    let attempt = state.record_self_heal()?;
                    if let Some(healed) = self.heal(state, &explanation, attempt).await {
                        explanation = healed;
                    }
                    GenerationEvent::Healed
                }
                GenerationPhase::Accept => break,
            };
            phase = next_phase(phase, event, state.self_heal_attempts, self.max_self_heal)?;
        }

        let draft = state.draft.take().unwrap_or_default();
        let mut answer = if state.response_valid {
            draft
        } else {
            warn!(
                heals = state.self_heal_attempts,
                failures = state.quality_failures.len(),
                "quality loop exhausted, returning best effort"
            );
            sanitize(draft, &state.retrieved)
        };
        let analysis_weak = state.analysis.as_ref().map_or(true, |a| a.low_confidence());
        if !state.retrieval_sufficient || analysis_weak {
            answer.low_confidence = true;
        }

        check_citations(&answer, &state.retrieved)?;
        info!(
            valid = state.response_valid,
            heals = state.self_heal_attempts,
            citations = answer.citations.len(),
            low_confidence = answer.low_confidence,
            "answer accepted"
        );
        state.answer = Some(answer);
        Ok(())
    }

    fn evidence(state: &AgentState) -> Vec<Value> {
        state
            .retrieved
            .iter()
            .map(|r| {
                json!({
                    "chunk_id": r.chunk.id,
                    "company": r.chunk.metadata.company,
                    "fiscal_year": r.chunk.metadata.fiscal_year,
                    "fiscal_quarter": r.chunk.metadata.fiscal_quarter,
                    "document_type": r.chunk.metadata.document_type,
                    "page": r.chunk.page_index,
                })
            })
            .collect()
    }

    async fn explain(&self, state: &AgentState) -> ExplanationPayload {
        let req = GenerationRequest::new(
            GenerationTask::Explain,
            json!({
                "query": state.query_text,
                "history": state.history,
                "analysis": state.analysis.as_ref().map(|a| &a.payload),
                "chunks": Self::evidence(state),
            }),
        );
        match request::<ExplanationPayload>(self.generator, &req).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "explanation unavailable");
                ExplanationPayload {
                    text: state
                        .analysis
                        .as_ref()
                        .map(|a| a.payload.summary.clone())
                        .unwrap_or_default(),
                    ..Default::default()
                }
            }
        }
    }

    async fn heal(&self, state: &AgentState, previous: &ExplanationPayload, attempt: u32) -> Option<ExplanationPayload> {
        let req = GenerationRequest::new(
            GenerationTask::SelfHeal,
            json!({
                "query": state.query_text,
                "previous": previous,
                "failures": state.quality_failures,
                "chunks": Self::evidence(state),
            }),
        );
        match request::<ExplanationPayload>(self.generator, &req).await {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!(attempt, error = %e, "self-heal unavailable, keeping previous draft");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisResult;
    use crate::chunk::Chunker;
    use crate::generator::ScriptedGenerator;
    use crate::models::{DocumentMetadata, Element, ScoreBreakdown};
    use proptest::prelude::*;

    fn retrieved() -> Vec<RetrievedChunk> {
        let meta = DocumentMetadata {
            owner_id: "u1".to_string(),
            document_id: "aapl".to_string(),
            company: Some("apple".to_string()),
            fiscal_year: Some(2023),
            document_type: Some("10-K".to_string()),
            ..Default::default()
        };
        Chunker::default()
            .chunk(
                &[Element::paragraph("Revenue was $383B.", 3), Element::table("Net income 97", 4)],
                &meta,
            )
            .into_iter()
            .map(|chunk| RetrievedChunk {
                chunk,
                relevance_score: 0.9,
                scores: ScoreBreakdown {
                    similarity: 0.9,
                    semantic: 1.0,
                    keyword: 0.0,
                    vector_rank: 0,
                },
            })
            .collect()
    }

    fn state() -> AgentState {
        let mut s = AgentState::new("How did Apple do in 2023?", "u1", "s1", Vec::new());
        s.retrieved = retrieved();
        s.retrieval_sufficient = true;
        s.analysis = Some(AnalysisResult {
            validated: true,
            ..Default::default()
        });
        s
    }

    fn bar_chart() -> Value {
        json!({"type": "bar", "data": {"labels": ["2022", "2023"], "datasets": [{"label": "Revenue", "data": [394, 383]}]}})
    }

    #[test]
    fn test_strip_sources_section() {
        let text = "Revenue fell.\n\n## Sources\n- 10-K p.3\n";
        assert_eq!(strip_sources_section(text), "Revenue fell.");
        assert_eq!(strip_sources_section("No sources here."), "No sources here.");
        assert_eq!(strip_sources_section("A\n### Sources:\nx"), "A");
    }

    #[test]
    fn test_chart_validation() {
        assert!(validate_chart(&bar_chart()).is_ok());
        assert!(validate_chart(&json!({"type": "radar", "data": {"labels": [], "datasets": []}})).is_err());
        assert!(validate_chart(&json!({"type": "line", "data": {"labels": "x", "datasets": []}})).is_err());
        assert!(validate_chart(&json!({"type": "pie", "data": {"labels": [], "datasets": [{}]}})).is_err());
        assert!(validate_chart(&json!("bar")).is_err());
    }

    #[test]
    fn test_synthesize_dedupes_and_marks_dangling() {
        let chunks = retrieved();
        let explanation = ExplanationPayload {
            text: "Apple revenue was $383B.".to_string(),
            charts: vec![],
            cited_chunk_ids: vec![
                "aapl_chunk_0".to_string(),
                "aapl_chunk_0".to_string(),
                "ghost_chunk_1".to_string(),
            ],
        };
        let answer = synthesize(&explanation, &chunks);
        assert_eq!(answer.citations.len(), 2);
        assert_eq!(answer.citations[0].page, Some(3));
        assert_eq!(answer.citations[0].fiscal_year, Some(2023));
        let failures = quality_check(&answer, &chunks);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("ghost_chunk_1"));
    }

    #[test]
    fn test_transitions() {
        use GenerationEvent::*;
        use GenerationPhase::*;
        assert_eq!(next_phase(Explain, Explained, 0, 2).unwrap(), Synthesize);
        assert_eq!(next_phase(Synthesize, Synthesized, 0, 2).unwrap(), QualityCheck);
        assert_eq!(next_phase(QualityCheck, Checked { valid: false }, 1, 2).unwrap(), SelfHeal);
        assert_eq!(next_phase(QualityCheck, Checked { valid: false }, 2, 2).unwrap(), Accept);
        assert_eq!(next_phase(QualityCheck, Checked { valid: true }, 0, 2).unwrap(), Accept);
        assert_eq!(next_phase(SelfHeal, Healed, 1, 2).unwrap(), Synthesize);
        assert!(next_phase(Explain, Healed, 0, 2).is_err());
    }

    proptest! {
        #[test]
        fn prop_self_heal_is_bounded(checks in proptest::collection::vec(any::<bool>(), 0..10)) {
            let mut phase = GenerationPhase::Explain;
            let mut heals = 0u32;
            let mut outcomes = checks.into_iter();
            while phase != GenerationPhase::Accept {
                let event = match phase {
                    GenerationPhase::Explain => GenerationEvent::Explained,
                    GenerationPhase::Synthesize => GenerationEvent::Synthesized,
                    GenerationPhase::QualityCheck => GenerationEvent::Checked {
                        valid: outcomes.next().unwrap_or(false),
                    },
                    GenerationPhase::SelfHeal => {
                        heals += 1;
                        GenerationEvent::Healed
                    }
                    GenerationPhase::Accept => unreachable!(),
                };
                phase = next_phase(phase, event, heals, MAX_SELF_HEAL_ATTEMPTS).unwrap();
            }
            prop_assert!(heals <= MAX_SELF_HEAL_ATTEMPTS);
        }
    }

    #[tokio::test]
    async fn test_valid_first_draft_is_accepted() {
        let generator = ScriptedGenerator::new();
        generator.push(
            GenerationTask::Explain,
            Ok(json!({"text": "Revenue was $383B.\n\n## Sources\n- p3", "charts": [bar_chart()], "cited_chunk_ids": ["aapl_chunk_0"]})),
        );
        let mut s = state();
        QualityLoop::new(&generator, 2).run(&mut s).await.unwrap();

        let answer = s.answer.unwrap();
        assert_eq!(answer.text, "Revenue was $383B.");
        assert_eq!(answer.charts.len(), 1);
        assert_eq!(answer.citations.len(), 1);
        assert!(!answer.low_confidence);
        assert!(s.response_valid);
        assert_eq!(s.self_heal_attempts, 0);
        assert_eq!(generator.call_count(GenerationTask::SelfHeal), 0);
    }

    #[tokio::test]
    async fn test_self_heal_repairs_bad_chart() {
        let generator = ScriptedGenerator::new();
        generator
            .push(
                GenerationTask::Explain,
                Ok(json!({"text": "Revenue was $383B.", "charts": [{"type": "radar"}]})),
            )
            .push(
                GenerationTask::SelfHeal,
                Ok(json!({"text": "Revenue was $383B.", "charts": [bar_chart()]})),
            );
        let mut s = state();
        QualityLoop::new(&generator, 2).run(&mut s).await.unwrap();

        assert!(s.response_valid);
        assert_eq!(s.self_heal_attempts, 1);
        let heal = &generator.calls()[1];
        assert_eq!(heal.task, GenerationTask::SelfHeal);
        assert!(heal.context["failures"][0].as_str().unwrap().contains("chart 0"));
        let answer = s.answer.unwrap();
        assert_eq!(answer.citations.len(), 2);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_sanitized_low_confidence_answer() {
        let generator = ScriptedGenerator::new();
        let bad = json!({"text": "Revenue was $383B.", "charts": [{"type": "radar"}], "cited_chunk_ids": ["aapl_chunk_1", "ghost_chunk_7"]});
        generator
            .always(GenerationTask::Explain, bad.clone())
            .always(GenerationTask::SelfHeal, bad);
        let mut s = state();
        QualityLoop::new(&generator, 2).run(&mut s).await.unwrap();

        assert!(!s.response_valid);
        assert_eq!(s.self_heal_attempts, 2);
        assert_eq!(generator.call_count(GenerationTask::SelfHeal), 2);
        let answer = s.answer.unwrap();
        assert!(answer.low_confidence);
        assert!(answer.charts.is_empty());
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].chunk_id, "aapl_chunk_1");
    }

    #[tokio::test]
    async fn test_total_outage_still_answers() {
        let generator = ScriptedGenerator::new();
        let mut s = state();
        s.retrieval_sufficient = false;
        QualityLoop::new(&generator, 2).run(&mut s).await.unwrap();

        let answer = s.answer.unwrap();
        assert_eq!(answer.text, FALLBACK_TEXT);
        assert!(answer.low_confidence);
        assert_eq!(s.self_heal_attempts, 2);
    }

    #[test]
    fn test_dangling_citation_is_an_invariant_violation() {
        let answer = Answer {
            text: "x".into(),
            citations: vec![Citation::dangling("ghost")],
            ..Default::default()
        };
        assert_eq!(
            check_citations(&answer, &retrieved()),
            Err(InvariantViolation::DanglingCitation {
                chunk_id: "ghost".into()
            })
        );
    }
}
