//! Retrieval refinement loop.
//!
//! ```text
//! Retrieve ──▶ Validate ──▶ Accept
//!    ▲            │
//!    └── Refine ◀─┘  (insufficient, attempts < ceiling)
//! ```
//!
//! [`next_phase`] is the pure transition function; [`RefinementLoop`] drives
//! it against a [`HybridRetriever`] and a [`TextGenerator`]. Each `Retrieve`
//! counts as one attempt and replaces the previous result set outright.
//! The loop accepts when the evidence is judged sufficient or when the
//! attempt ceiling is reached, whichever happens first. On accept the result
//! set is cut to the downstream `final_top_k` with subject balancing.
//!
//! Collaborator failures never escape: a failed retrieval yields an empty
//! set, and a failed or malformed judgment counts as insufficient.

use std::collections::HashSet;
use std::fmt;

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::error::InvariantViolation;
use crate::filter::SearchFilter;
use crate::generator::{request, GenerationRequest, GenerationTask, SufficiencyJudgment, TextGenerator};
use crate::keyword::tokenize;
use crate::models::{ProcessedQuery, RetrievedChunk};
use crate::search::{balance, HybridRetriever};
use crate::state::{AgentState, MAX_RETRIEVAL_ATTEMPTS};

/// Gap recorded when a retrieval returns nothing.
pub const NO_EVIDENCE_GAP: &str = "no evidence retrieved";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalPhase {
    Retrieve,
    Validate,
    Refine,
    Accept,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalEvent {
    Retrieved,
    Judged { sufficient: bool },
    Refined,
}

impl fmt::Display for RetrievalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Pure transition function.
///
/// `attempts` is the number of `Retrieve` invocations so far and `ceiling`
/// the configured maximum (never above [`MAX_RETRIEVAL_ATTEMPTS`]).
pub fn next_phase(
    phase: RetrievalPhase,
    event: RetrievalEvent,
    attempts: u32,
    ceiling: u32,
) -> Result<RetrievalPhase, InvariantViolation> {
    let ceiling = ceiling.clamp(1, MAX_RETRIEVAL_ATTEMPTS);
    match (phase, event) {
        (RetrievalPhase::Retrieve, RetrievalEvent::Retrieved) => Ok(RetrievalPhase::Validate),
        (RetrievalPhase::Validate, RetrievalEvent::Judged { sufficient }) => {
            if sufficient || attempts >= ceiling {
                Ok(RetrievalPhase::Accept)
            } else {
                Ok(RetrievalPhase::Refine)
            }
        }
        (RetrievalPhase::Refine, RetrievalEvent::Refined) => Ok(RetrievalPhase::Retrieve),
        (phase, event) => Err(InvariantViolation::IllegalTransition {
            phase: phase.to_string(),
            event: format!("{:?}", event),
        }),
    }
}

/// Loop tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefineSettings {
    pub initial_top_k: usize,
    pub final_top_k: usize,
    pub max_attempts: u32,
}

impl Default for RefineSettings {
    fn default() -> Self {
        Self {
            initial_top_k: 30,
            final_top_k: 8,
            max_attempts: MAX_RETRIEVAL_ATTEMPTS,
        }
    }
}

/// Append words from `gaps` and `keywords` that the augmented query lacks.
pub fn refine_query(augmented: &str, gaps: &[String], keywords: &[String]) -> String {
    let mut present: HashSet<String> = tokenize(augmented).into_iter().collect();
    let mut out = augmented.trim().to_string();
    for source in keywords.iter().chain(gaps) {
        for token in tokenize(source) {
            if token.contains('_') || !present.insert(token.clone()) {
                continue;
            }
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&token);
        }
    }
    out
}

pub struct RefinementLoop<'a> {
    retriever: &'a HybridRetriever,
    generator: &'a dyn TextGenerator,
    settings: RefineSettings,
}

impl<'a> RefinementLoop<'a> {
    pub fn new(retriever: &'a HybridRetriever, generator: &'a dyn TextGenerator, settings: RefineSettings) -> Self {
        Self {
            retriever,
            generator,
            settings,
        }
    }

    /// Run the loop to `Accept`, leaving the final result set, gaps, and
    /// sufficiency flag in `state`.
    #[instrument(skip_all, fields(owner = %state.owner_id))]
    pub async fn run(&self, state: &mut AgentState, filter: &SearchFilter) -> Result<(), InvariantViolation> {
        let mut query = state
            .processed_query
            .clone()
            .unwrap_or_else(|| ProcessedQuery::passthrough(&state.query_text));
        let mut phase = RetrievalPhase::Retrieve;
        let mut previous_gaps: Option<Vec<String>> = None;
        let mut keywords: Vec<String> = Vec::new();

        while phase != RetrievalPhase::Accept {
            let event = match phase {
                RetrievalPhase::Retrieve => {
                    let attempt = state.record_retrieval_attempt()?;
                    state.retrieved = match self
                        .retriever
                        .retrieve(&query, filter, self.settings.initial_top_k)
                        .await
                    {
                        Ok(found) => found,
                        Err(e) => {
                            warn!(attempt, error = %e, "retrieval failed, treating as empty");
                            Vec::new()
                        }
                    };
                    debug!(attempt, hits = state.retrieved.len(), "retrieved");
                    RetrievalEvent::Retrieved
                }
                RetrievalPhase::Validate => {
                    let judgment = self.judge(&query, &state.retrieved).await;
                    let gaps = normalized(&judgment.gaps);
                    if !judgment.sufficient && previous_gaps.as_ref() == Some(&gaps) {
                        warn!(attempt = state.retrieval_attempts, "refinement is not closing any gaps");
                    }
                    previous_gaps = Some(gaps);
                    state.retrieval_sufficient = judgment.sufficient;
                    state.gaps = judgment.gaps;
                    keywords = judgment.additional_keywords;
                    RetrievalEvent::Judged {
                        sufficient: judgment.sufficient,
                    }
                }
                RetrievalPhase::Refine => {
                    query.augmented_query = refine_query(&query.augmented_query, &state.gaps, &keywords);
                    debug!(augmented = %query.augmented_query, "query refined");
                    RetrievalEvent::Refined
                }
                RetrievalPhase::Accept => break,
            };
            phase = next_phase(phase, event, state.retrieval_attempts, self.settings.max_attempts)?;
        }

        let ranked = std::mem::take(&mut state.retrieved);
        state.retrieved = balance(ranked, &query.entities.companies, self.settings.final_top_k);
        info!(
            attempts = state.retrieval_attempts,
            sufficient = state.retrieval_sufficient,
            kept = state.retrieved.len(),
            "retrieval accepted"
        );
        state.processed_query = Some(query);
        Ok(())
    }

    async fn judge(&self, query: &ProcessedQuery, retrieved: &[RetrievedChunk]) -> SufficiencyJudgment {
        if retrieved.is_empty() {
            return SufficiencyJudgment {
                sufficient: false,
                gaps: vec![NO_EVIDENCE_GAP.to_string()],
                additional_keywords: Vec::new(),
            };
        }

        let evidence: Vec<serde_json::Value> = retrieved
            .iter()
            .map(|r| {
                json!({
                    "chunk_id": r.chunk.id,
                    "company": r.chunk.metadata.company,
                    "fiscal_year": r.chunk.metadata.fiscal_year,
                    "page": r.chunk.page_index,
                    "content": r.chunk.content,
                })
            })
            .collect();
        let req = GenerationRequest::new(
            GenerationTask::JudgeSufficiency,
            json!({
                "query": query.query_text,
                "augmented_query": query.augmented_query,
                "entities": query.entities,
                "chunks": evidence,
            }),
        );

        match request::<SufficiencyJudgment>(self.generator, &req).await {
            Ok(judgment) => judgment,
            Err(e) => {
                warn!(error = %e, "sufficiency judgment unavailable, treating as insufficient");
                SufficiencyJudgment {
                    sufficient: false,
                    gaps: Vec::new(),
                    additional_keywords: Vec::new(),
                }
            }
        }
    }
}

fn normalized(gaps: &[String]) -> Vec<String> {
    let mut out: Vec<String> = gaps.iter().map(|g| g.trim().to_lowercase()).collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunker;
    use crate::embedding::HashingEmbedder;
    use crate::error::CollaboratorError;
    use crate::generator::ScriptedGenerator;
    use crate::models::{DocumentMetadata, Element};
    use crate::search::HybridParams;
    use crate::store::memory::InMemoryChunkStore;
    use crate::store::ChunkStore;
    use crate::embedding::Embedder;
    use proptest::prelude::*;
    use std::sync::Arc;

    async fn retriever_with(docs: &[(&str, &str, &[&str])]) -> HybridRetriever {
        let store = Arc::new(InMemoryChunkStore::new());
        let embedder = Arc::new(HashingEmbedder::new(128));
        for (doc, company, paragraphs) in docs {
            let meta = DocumentMetadata {
                owner_id: "u1".to_string(),
                document_id: doc.to_string(),
                company: Some(company.to_string()),
                fiscal_year: Some(2023),
                ..Default::default()
            };
            let elements: Vec<Element> = paragraphs
                .iter()
                .enumerate()
                .map(|(i, p)| Element::paragraph(*p, i as u32))
                .collect();
            let chunks = Chunker::default().chunk(&elements, &meta);
            let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            let vectors = embedder.embed(&texts).await.unwrap();
            store.upsert_chunks(&chunks).await.unwrap();
            let pairs: Vec<(String, Vec<f32>)> = chunks.iter().map(|c| c.id.clone()).zip(vectors).collect();
            store.upsert_vectors(&pairs).await.unwrap();
        }
        HybridRetriever::new(store, embedder, HybridParams::default())
    }

    fn insufficient(gap: &str) -> serde_json::Value {
        json!({"sufficient": false, "gaps": [gap], "additional_keywords": []})
    }

    #[test]
    fn test_transitions() {
        use RetrievalEvent::*;
        use RetrievalPhase::*;
        assert_eq!(next_phase(Retrieve, Retrieved, 1, 3).unwrap(), Validate);
        assert_eq!(next_phase(Validate, Judged { sufficient: true }, 1, 3).unwrap(), Accept);
        assert_eq!(next_phase(Validate, Judged { sufficient: false }, 1, 3).unwrap(), Refine);
        assert_eq!(next_phase(Validate, Judged { sufficient: false }, 3, 3).unwrap(), Accept);
        assert_eq!(next_phase(Refine, Refined, 1, 3).unwrap(), Retrieve);
        assert!(matches!(
            next_phase(Accept, Retrieved, 1, 3),
            Err(InvariantViolation::IllegalTransition { .. })
        ));
        assert!(next_phase(Retrieve, Refined, 1, 3).is_err());
    }

    #[test]
    fn test_configured_ceiling_is_clamped() {
        let phase = next_phase(
            RetrievalPhase::Validate,
            RetrievalEvent::Judged { sufficient: false },
            3,
            10,
        );
        assert_eq!(phase.unwrap(), RetrievalPhase::Accept);
    }

    #[test]
    fn test_refine_query_appends_new_words_once() {
        let gaps = vec!["Missing operating margin for 2022".to_string()];
        let keywords = vec!["margin".to_string(), "segment".to_string()];
        let refined = refine_query("apple revenue", &gaps, &keywords);
        assert_eq!(refined, "apple revenue margin segment missing operating 2022");
        assert_eq!(refine_query(&refined, &gaps, &keywords), refined);
    }

    proptest! {
        #[test]
        fn prop_loop_terminates_within_ceiling(
            judgments in proptest::collection::vec(any::<bool>(), 0..10),
            ceiling in 1u32..=3,
        ) {
            let mut phase = RetrievalPhase::Retrieve;
            let mut attempts = 0u32;
            let mut verdicts = judgments.into_iter();
            let mut steps = 0;
            while phase != RetrievalPhase::Accept {
                let event = match phase {
                    RetrievalPhase::Retrieve => {
                        attempts += 1;
                        RetrievalEvent::Retrieved
                    }
                    RetrievalPhase::Validate => RetrievalEvent::Judged {
                        sufficient: verdicts.next().unwrap_or(false),
                    },
                    RetrievalPhase::Refine => RetrievalEvent::Refined,
                    RetrievalPhase::Accept => unreachable!(),
                };
                phase = next_phase(phase, event, attempts, ceiling).unwrap();
                steps += 1;
                prop_assert!(steps <= 3 * MAX_RETRIEVAL_ATTEMPTS as usize);
            }
            prop_assert!(attempts <= ceiling);
        }
    }

    #[tokio::test]
    async fn test_all_insufficient_exits_after_third_retrieve() {
        let retriever = retriever_with(&[(
            "apple-10k",
            "apple",
            &["Apple revenue was $383 billion.", "Apple services revenue grew."],
        )])
        .await;
        let generator = ScriptedGenerator::new();
        generator.always(GenerationTask::JudgeSufficiency, insufficient("segment margins"));

        let mut state = AgentState::new("apple revenue", "u1", "s1", Vec::new());
        RefinementLoop::new(&retriever, &generator, RefineSettings::default())
            .run(&mut state, &SearchFilter::for_owner("u1"))
            .await
            .unwrap();

        assert_eq!(state.retrieval_attempts, 3);
        assert!(!state.retrieval_sufficient);
        assert_eq!(generator.call_count(GenerationTask::JudgeSufficiency), 3);
        assert_eq!(state.retrieved.len(), 2);
        assert_eq!(state.gaps, vec!["segment margins".to_string()]);
        let query = state.processed_query.unwrap();
        assert!(query.augmented_query.contains("segment"));
    }

    #[tokio::test]
    async fn test_sufficient_on_first_attempt() {
        let retriever = retriever_with(&[("apple-10k", "apple", &["Apple revenue was $383 billion."])]).await;
        let generator = ScriptedGenerator::new();
        generator.push(
            GenerationTask::JudgeSufficiency,
            Ok(json!({"sufficient": true, "gaps": []})),
        );

        let mut state = AgentState::new("apple revenue", "u1", "s1", Vec::new());
        RefinementLoop::new(&retriever, &generator, RefineSettings::default())
            .run(&mut state, &SearchFilter::for_owner("u1"))
            .await
            .unwrap();

        assert_eq!(state.retrieval_attempts, 1);
        assert!(state.retrieval_sufficient);
        assert_eq!(state.retrieved.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_results_skip_the_collaborator() {
        let retriever = retriever_with(&[]).await;
        let generator = ScriptedGenerator::new();

        let mut state = AgentState::new("apple revenue", "u1", "s1", Vec::new());
        RefinementLoop::new(&retriever, &generator, RefineSettings::default())
            .run(&mut state, &SearchFilter::for_owner("u1"))
            .await
            .unwrap();

        assert_eq!(state.retrieval_attempts, 3);
        assert!(state.retrieved.is_empty());
        assert_eq!(state.gaps, vec![NO_EVIDENCE_GAP.to_string()]);
        assert!(generator.calls().is_empty());
    }

    #[tokio::test]
    async fn test_timeouts_count_as_insufficient() {
        let retriever = retriever_with(&[("apple-10k", "apple", &["Apple revenue was $383 billion."])]).await;
        let generator = ScriptedGenerator::new();
        generator
            .push(
                GenerationTask::JudgeSufficiency,
                Err(CollaboratorError::Timeout {
                    operation: "generate",
                    elapsed_ms: 30_000,
                }),
            )
            .push(
                GenerationTask::JudgeSufficiency,
                Ok(json!({"sufficient": true, "gaps": []})),
            );

        let mut state = AgentState::new("apple revenue", "u1", "s1", Vec::new());
        RefinementLoop::new(&retriever, &generator, RefineSettings::default())
            .run(&mut state, &SearchFilter::for_owner("u1"))
            .await
            .unwrap();

        assert_eq!(state.retrieval_attempts, 2);
        assert!(state.retrieval_sufficient);
    }

    #[tokio::test]
    async fn test_final_set_is_cut_to_final_top_k() {
        let paragraphs: Vec<String> = (0..12).map(|i| format!("Apple revenue note {}", i)).collect();
        let refs: Vec<&str> = paragraphs.iter().map(String::as_str).collect();
        let retriever = retriever_with(&[("apple-10k", "apple", &refs)]).await;
        let generator = ScriptedGenerator::new();
        generator.always(
            GenerationTask::JudgeSufficiency,
            json!({"sufficient": true}),
        );

        let mut state = AgentState::new("apple revenue", "u1", "s1", Vec::new());
        RefinementLoop::new(&retriever, &generator, RefineSettings::default())
            .run(&mut state, &SearchFilter::for_owner("u1"))
            .await
            .unwrap();

        assert_eq!(state.retrieved.len(), 8);
    }
}
