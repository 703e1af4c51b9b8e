//! One complete query turn.
//!
//! `understand → refine (retrieve/validate) → analyze → quality loop`
//!
//! The pipeline owns no mutable state of its own; each call to
//! [`AnswerPipeline::run_turn`] builds a fresh [`AgentState`], so turns for
//! different sessions can run concurrently on one shared pipeline. Only
//! invariant violations come back as errors. Collaborator failures end up
//! in the sufficiency and validity flags and the answer's low-confidence bit.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, instrument};

use crate::analysis::AnalysisStage;
use crate::answer::{Answer, QualityLoop};
use crate::error::TurnError;
use crate::filter::SearchFilter;
use crate::generator::TextGenerator;
use crate::query::{QueryUnderstander, DEFAULT_HISTORY_WINDOW};
use crate::refine::{RefineSettings, RefinementLoop};
use crate::search::HybridRetriever;
use crate::state::{AgentState, MAX_SELF_HEAL_ATTEMPTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub refine: RefineSettings,
    pub max_self_heal_attempts: u32,
    pub analysis_max_attempts: u32,
    pub history_window: usize,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            refine: RefineSettings::default(),
            max_self_heal_attempts: MAX_SELF_HEAL_ATTEMPTS,
            analysis_max_attempts: 2,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }
}

/// Input for one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRequest {
    pub query: String,
    pub session_id: String,
    /// Caller-supplied constraints; the owner scope is mandatory.
    pub filter: SearchFilter,
    /// Compressed summaries of earlier turns, oldest first.
    #[serde(default)]
    pub history: Vec<String>,
}

#[derive(Clone)]
pub struct AnswerPipeline {
    retriever: HybridRetriever,
    generator: Arc<dyn TextGenerator>,
    settings: PipelineSettings,
}

impl AnswerPipeline {
    pub fn new(retriever: HybridRetriever, generator: Arc<dyn TextGenerator>, settings: PipelineSettings) -> Self {
        Self {
            retriever,
            generator,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Run a turn and return the final state. `state.answer` is always
    /// `Some` on success.
    #[instrument(skip_all, fields(session = %req.session_id))]
    pub async fn run_turn(&self, req: TurnRequest) -> Result<AgentState, TurnError> {
        let mut state = AgentState::new(
            req.query,
            req.filter.owner_id.clone(),
            req.session_id,
            req.history,
        );
        if let Err(e) = self.drive(&mut state, &req.filter).await {
            error!(error = %e, "turn aborted");
            return Err(e);
        }
        Ok(state)
    }

    /// Convenience wrapper returning only the answer.
    pub async fn ask(&self, req: TurnRequest) -> Result<Answer, TurnError> {
        let state = self.run_turn(req).await?;
        Ok(state.answer.unwrap_or_default())
    }

    async fn drive(&self, state: &mut AgentState, filter: &SearchFilter) -> Result<(), TurnError> {
        let generator = self.generator.as_ref();

        let understood = QueryUnderstander::new(generator)
            .with_history_window(self.settings.history_window)
            .understand(&state.query_text, &state.history)
            .await;
        state.processed_query = Some(understood);

        RefinementLoop::new(&self.retriever, generator, self.settings.refine)
            .run(state, filter)
            .await?;

        if let Some(query) = state.processed_query.as_ref() {
            let analysis = AnalysisStage::new(generator, self.settings.analysis_max_attempts)
                .analyze(&state.retrieved, query)
                .await;
            state.analysis = Some(analysis);
        }

        QualityLoop::new(generator, self.settings.max_self_heal_attempts)
            .run(state)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunker;
    use crate::embedding::{Embedder, HashingEmbedder};
    use crate::generator::{GenerationTask, ScriptedGenerator};
    use crate::models::{DocumentMetadata, Element};
    use crate::search::HybridParams;
    use crate::store::memory::InMemoryChunkStore;
    use crate::store::ChunkStore;
    use serde_json::json;

    async fn pipeline(generator: Arc<ScriptedGenerator>) -> AnswerPipeline {
        let store = Arc::new(InMemoryChunkStore::new());
        let embedder = Arc::new(HashingEmbedder::new(128));
        for (doc, company, text) in [
            ("aapl-2023", "apple", "Apple total revenue was $383 billion in fiscal 2023."),
            ("msft-2023", "microsoft", "Microsoft total revenue was $212 billion in fiscal 2023."),
        ] {
            let meta = DocumentMetadata {
                owner_id: "u1".to_string(),
                document_id: doc.to_string(),
                company: Some(company.to_string()),
                fiscal_year: Some(2023),
                ..Default::default()
            };
            let chunks = Chunker::default().chunk(&[Element::paragraph(text, 0)], &meta);
            let vectors = embedder.embed(&[chunks[0].content.clone()]).await.unwrap();
            store.upsert_chunks(&chunks).await.unwrap();
            store
                .upsert_vectors(&[(chunks[0].id.clone(), vectors[0].clone())])
                .await
                .unwrap();
        }
        let retriever = HybridRetriever::new(store, embedder, HybridParams::default());
        AnswerPipeline::new(retriever, generator, PipelineSettings::default())
    }

    fn request(query: &str) -> TurnRequest {
        TurnRequest {
            query: query.to_string(),
            session_id: "s1".to_string(),
            filter: SearchFilter::for_owner("u1"),
            history: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_full_turn_with_scripted_collaborator() {
        let generator = Arc::new(ScriptedGenerator::new());
        generator
            .push(
                GenerationTask::ExtractEntities,
                Ok(json!({
                    "companies": ["Apple", "Microsoft"],
                    "year": 2023,
                    "query_type": "comparison",
                    "augmented_query": "apple microsoft total revenue 2023"
                })),
            )
            .push(GenerationTask::JudgeSufficiency, Ok(json!({"sufficient": true})))
            .push(
                GenerationTask::Analyze,
                Ok(json!({
                    "summary": "Apple out-earned Microsoft.",
                    "comparisons": [{"label": "Revenue gap", "from": 212.0, "to": 383.0, "delta": 171.0}]
                })),
            )
            .push(
                GenerationTask::Explain,
                Ok(json!({
                    "text": "Apple reported $383B versus Microsoft's $212B.",
                    "cited_chunk_ids": ["aapl-2023_chunk_0", "msft-2023_chunk_0"]
                })),
            );

        let state = pipeline(generator.clone())
            .await
            .run_turn(request("Compare Apple and Microsoft revenue in 2023"))
            .await
            .unwrap();

        assert_eq!(state.retrieval_attempts, 1);
        assert!(state.retrieval_sufficient);
        assert!(state.response_valid);
        assert_eq!(state.retrieved.len(), 2);
        let answer = state.answer.unwrap();
        assert!(!answer.low_confidence);
        assert_eq!(answer.citations.len(), 2);
        assert_eq!(generator.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_outage_still_returns_low_confidence_answer() {
        let generator = Arc::new(ScriptedGenerator::new());
        let answer = pipeline(generator.clone())
            .await
            .ask(request("apple revenue"))
            .await
            .unwrap();

        assert!(answer.low_confidence);
        assert!(!answer.text.is_empty());
        for c in &answer.citations {
            assert!(c.chunk_id.ends_with("_chunk_0"));
        }
    }

    #[tokio::test]
    async fn test_other_owner_sees_nothing() {
        let generator = Arc::new(ScriptedGenerator::new());
        let mut req = request("apple revenue");
        req.filter = SearchFilter::for_owner("someone-else");
        let state = pipeline(generator).await.run_turn(req).await.unwrap();
        assert!(state.retrieved.is_empty());
        assert_eq!(state.retrieval_attempts, 3);
        assert!(state.answer.unwrap().citations.is_empty());
    }
}
