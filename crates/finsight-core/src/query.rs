//! Query understanding.
//!
//! Entity extraction is fully delegated to the text-generation collaborator;
//! this module only frames the request (query plus the most recent turns of
//! conversation context) and validates the response. An unusable response
//! degrades to [`ProcessedQuery::passthrough`].

use serde_json::json;
use tracing::{debug, warn};

use crate::generator::{request, EntityExtraction, GenerationRequest, GenerationTask, TextGenerator};
use crate::models::ProcessedQuery;

/// Prior turns passed as context by default.
pub const DEFAULT_HISTORY_WINDOW: usize = 5;

pub struct QueryUnderstander<'a> {
    generator: &'a dyn TextGenerator,
    history_window: usize,
}

impl<'a> QueryUnderstander<'a> {
    pub fn new(generator: &'a dyn TextGenerator) -> Self {
        Self {
            generator,
            history_window: DEFAULT_HISTORY_WINDOW,
        }
    }

    pub fn with_history_window(mut self, turns: usize) -> Self {
        self.history_window = turns;
        self
    }

    /// Extract entities and an augmented keyword form for `query_text`.
    pub async fn understand(&self, query_text: &str, history: &[String]) -> ProcessedQuery {
        if query_text.trim().is_empty() {
            return ProcessedQuery::passthrough(query_text);
        }

        let recent = &history[history.len().saturating_sub(self.history_window)..];
        let req = GenerationRequest::new(
            GenerationTask::ExtractEntities,
            json!({
                "query": query_text,
                "history": recent,
            }),
        );

        match request::<EntityExtraction>(self.generator, &req).await {
            Ok(extracted) => {
                let processed = extracted.into_processed(query_text);
                debug!(
                    companies = ?processed.entities.companies,
                    query_type = %processed.query_type,
                    "entities extracted"
                );
                processed
            }
            Err(e) => {
                warn!(error = %e, "entity extraction failed, using raw query");
                ProcessedQuery::passthrough(query_text)
            }
        }
    }
}
