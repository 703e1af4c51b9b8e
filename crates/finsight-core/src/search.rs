//! Hybrid retrieval: vector search fused with BM25, balanced across subjects.
//!
//! The retriever works through the [`ChunkStore`] and [`Embedder`] traits
//! and has no database or HTTP dependencies.
//!
//! # Algorithm
//!
//! 1. Merge the query's extracted entities into the caller's filter
//!    (owner scope always comes from the caller).
//! 2. Embed the augmented query and fetch up to `top_k` vector candidates
//!    (`top_k × oversample` when the query compares several subjects).
//!    A malformed embedding or search response is retried once before the
//!    error is returned.
//! 3. Build a [`KeywordIndex`] over exactly those candidates and score the
//!    augmented query with BM25.
//! 4. Min-max normalize both score sets to `[0, 1]`; chunks with no keyword
//!    match get a keyword score of `0.0`.
//! 5. `final = semantic_weight × semantic + keyword_weight × keyword`,
//!    sorted descending, ties broken by vector rank.
//! 6. For multi-subject queries, reserve a quota per subject before
//!    truncating to `top_k` (see [`balance`]).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use crate::embedding::{embed_one, Embedder};
use crate::error::CollaboratorError;
use crate::filter::SearchFilter;
use crate::keyword::{Bm25Params, KeywordIndex};
use crate::models::{ProcessedQuery, RetrievedChunk, ScoreBreakdown};
use crate::store::{ChunkStore, VectorHit};

/// Fusion and candidate tuning, decoupled from application config.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HybridParams {
    pub semantic_weight: f64,
    pub keyword_weight: f64,
    pub bm25: Bm25Params,
    /// Candidate multiplier for multi-subject queries.
    pub multi_subject_oversample: usize,
}

impl Default for HybridParams {
    fn default() -> Self {
        Self {
            semantic_weight: 0.7,
            keyword_weight: 0.3,
            bm25: Bm25Params::default(),
            multi_subject_oversample: 3,
        }
    }
}

/// Min-max normalize to `[0.0, 1.0]`. All-equal inputs map to `1.0`.
pub fn normalize_scores(raw: &[f64]) -> Vec<f64> {
    if raw.is_empty() {
        return Vec::new();
    }
    let s_min = raw.iter().copied().fold(f64::INFINITY, f64::min);
    let s_max = raw.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    raw.iter()
        .map(|s| {
            if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            }
        })
        .collect()
}

/// Fuse vector hits (in rank order) with raw BM25 scores keyed by chunk id.
///
/// The output is sorted by fused score, descending; equal scores keep their
/// vector-search order.
pub fn fuse(
    hits: Vec<VectorHit>,
    keyword_scores: &HashMap<String, f64>,
    params: &HybridParams,
) -> Vec<RetrievedChunk> {
    let similarities: Vec<f64> = hits.iter().map(|h| h.similarity).collect();
    let semantic = normalize_scores(&similarities);

    let matched: Vec<(&String, f64)> = hits
        .iter()
        .filter_map(|h| keyword_scores.get_key_value(&h.chunk.id))
        .map(|(id, s)| (id, *s))
        .collect();
    let raw_kw: Vec<f64> = matched.iter().map(|(_, s)| *s).collect();
    let kw_norm: HashMap<&str, f64> = matched
        .iter()
        .map(|(id, _)| id.as_str())
        .zip(normalize_scores(&raw_kw))
        .collect();

    let mut fused: Vec<RetrievedChunk> = hits
        .into_iter()
        .enumerate()
        .map(|(rank, hit)| {
            let keyword = kw_norm.get(hit.chunk.id.as_str()).copied().unwrap_or(0.0);
            let semantic = semantic[rank];
            RetrievedChunk {
                relevance_score: params.semantic_weight * semantic
                    + params.keyword_weight * keyword,
                scores: ScoreBreakdown {
                    similarity: hit.similarity,
                    semantic,
                    keyword,
                    vector_rank: rank,
                },
                chunk: hit.chunk,
            }
        })
        .collect();

    sort_by_relevance(&mut fused);
    fused
}

/// Descending relevance, ties by vector rank.
pub fn sort_by_relevance(results: &mut [RetrievedChunk]) {
    results.sort_by(|a, b| {
        b.relevance_score
            .partial_cmp(&a.relevance_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.scores.vector_rank.cmp(&b.scores.vector_rank))
    });
}

/// Truncate `ranked` to `top_k`, guaranteeing each subject a share.
///
/// With fewer than two distinct subjects this is a plain truncation.
/// Otherwise each subject gets a quota of `max(1, top_k / n)`. Quotas are
/// filled round-robin in subject order, taking each subject's best
/// remaining chunk per round; a subject with fewer chunks than its quota
/// simply yields its slots. Remaining slots go to the best-scoring leftovers.
/// The selection is returned in its original (score) order.
pub fn balance(ranked: Vec<RetrievedChunk>, subjects: &[String], top_k: usize) -> Vec<RetrievedChunk> {
    let mut seen = HashSet::new();
    let subjects: Vec<String> = subjects
        .iter()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect();

    if subjects.len() < 2 || ranked.len() <= top_k {
        let mut ranked = ranked;
        ranked.truncate(top_k);
        return ranked;
    }

    let by_subject: Vec<Vec<usize>> = subjects
        .iter()
        .map(|s| {
            ranked
                .iter()
                .enumerate()
                .filter(|(_, r)| r.chunk.belongs_to(s))
                .map(|(i, _)| i)
                .collect()
        })
        .collect();

    let quota = (top_k / subjects.len()).max(1);
    let mut taken = vec![false; ranked.len()];
    let mut count = 0;

    'rounds: for round in 0..quota {
        for positions in &by_subject {
            if count == top_k {
                break 'rounds;
            }
            if let Some(&i) = positions.get(round) {
                taken[i] = true;
                count += 1;
            }
        }
    }

    for slot in taken.iter_mut() {
        if count == top_k {
            break;
        }
        if !*slot {
            *slot = true;
            count += 1;
        }
    }

    ranked
        .into_iter()
        .zip(taken)
        .filter_map(|(r, keep)| keep.then_some(r))
        .collect()
}

/// Hybrid retriever over a vector store and an embedding service.
#[derive(Clone)]
pub struct HybridRetriever {
    store: Arc<dyn ChunkStore>,
    embedder: Arc<dyn Embedder>,
    params: HybridParams,
}

impl HybridRetriever {
    pub fn new(store: Arc<dyn ChunkStore>, embedder: Arc<dyn Embedder>, params: HybridParams) -> Self {
        Self {
            store,
            embedder,
            params,
        }
    }

    pub fn params(&self) -> &HybridParams {
        &self.params
    }

    /// Retrieve up to `top_k` chunks for `query`, strictly ordered by fused score.
    pub async fn retrieve(
        &self,
        query: &ProcessedQuery,
        filter: &SearchFilter,
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        if top_k == 0 || query.augmented_query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let filter = filter.with_entities(&query.entities);
        let multi = query.entities.is_multi_subject();
        let fetch = if multi {
            top_k * self.params.multi_subject_oversample.max(1)
        } else {
            top_k
        };

        let query_vec = self.embed_query(&query.augmented_query).await?;
        let hits = self.search(&query_vec, &filter, fetch).await?;

        let index = KeywordIndex::from_chunks(hits.iter().map(|h| &h.chunk), self.params.bm25);
        let keyword_scores = index.score(&query.augmented_query);

        debug!(
            candidates = hits.len(),
            keyword_matches = keyword_scores.len(),
            multi_subject = multi,
            "hybrid candidates scored"
        );

        let fused = fuse(hits, &keyword_scores, &self.params);
        Ok(balance(fused, &query.entities.companies, top_k))
    }

    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, CollaboratorError> {
        match embed_one(self.embedder.as_ref(), text).await {
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "malformed query embedding, retrying once");
                embed_one(self.embedder.as_ref(), text).await
            }
            outcome => outcome,
        }
    }

    async fn search(&self, query_vec: &[f32], filter: &SearchFilter, limit: usize) -> Result<Vec<VectorHit>> {
        match self.search_once(query_vec, filter, limit).await {
            Err(e) if is_malformed(&e) => {
                warn!(error = %e, "malformed vector search response, retrying once");
                self.search_once(query_vec, filter, limit).await
            }
            outcome => outcome,
        }
    }

    async fn search_once(&self, query_vec: &[f32], filter: &SearchFilter, limit: usize) -> Result<Vec<VectorHit>> {
        let hits = self.store.vector_search(query_vec, filter, limit).await?;
        if let Some(bad) = hits.iter().find(|h| !h.similarity.is_finite()) {
            return Err(CollaboratorError::malformed(
                "vector_search",
                format!("non-finite similarity for chunk {}", bad.chunk.id),
            )
            .into());
        }
        Ok(hits)
    }
}

fn is_malformed(err: &anyhow::Error) -> bool {
    err.downcast_ref::<CollaboratorError>()
        .is_some_and(CollaboratorError::is_retryable)
}
