//! Collaborator wiring.
//!
//! Builds the concrete services named in the config and wraps each in its
//! deadline decorator:
//!
//! ```text
//! SqliteChunkStore ─▶ TimedStore ──┐
//! create_embedder  ─▶ TimedEmbedder ┴─▶ HybridRetriever ─┐
//! create_generator ─▶ TimedGenerator ────────────────────┴─▶ AnswerPipeline
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use finsight_core::chunk::Chunker;
use finsight_core::embedding::Embedder;
use finsight_core::generator::TextGenerator;
use finsight_core::pipeline::AnswerPipeline;
use finsight_core::queue::TaskQueue;
use finsight_core::search::HybridRetriever;
use finsight_core::store::ChunkStore;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::deadline::{TimedEmbedder, TimedGenerator, TimedStore};
use crate::embedding::create_embedder;
use crate::ingest::Ingestor;
use crate::llm::create_generator;
use crate::queue::SqliteTaskQueue;
use crate::store::SqliteChunkStore;

pub fn embedder(config: &Config) -> Result<Arc<dyn Embedder>> {
    if !config.embedding.is_enabled() {
        bail!("Embeddings are disabled. Set [embedding] provider in the config to ingest or search.");
    }
    let inner = create_embedder(&config.embedding)?;
    Ok(Arc::new(TimedEmbedder::new(
        inner,
        Duration::from_secs(config.embedding.timeout_secs),
    )))
}

pub fn generator(config: &Config) -> Result<Arc<dyn TextGenerator>> {
    let inner = create_generator(&config.llm)?;
    Ok(Arc::new(TimedGenerator::new(
        inner,
        Duration::from_secs(config.llm.timeout_secs),
    )))
}

pub fn chunk_store(config: &Config, pool: &SqlitePool, embedder: &dyn Embedder) -> Arc<dyn ChunkStore> {
    let store: Arc<dyn ChunkStore> = Arc::new(SqliteChunkStore::new(pool.clone(), embedder.model_name()));
    Arc::new(TimedStore::new(
        store,
        Duration::from_secs(config.retrieval.search_timeout_secs),
    ))
}

pub fn retriever(config: &Config, pool: &SqlitePool) -> Result<HybridRetriever> {
    let embedder = embedder(config)?;
    let store = chunk_store(config, pool, embedder.as_ref());
    Ok(HybridRetriever::new(store, embedder, config.retrieval.hybrid_params()))
}

pub fn pipeline(config: &Config, pool: &SqlitePool) -> Result<AnswerPipeline> {
    Ok(AnswerPipeline::new(
        retriever(config, pool)?,
        generator(config)?,
        config.pipeline_settings(),
    ))
}

pub fn ingestor(config: &Config, pool: &SqlitePool) -> Result<Ingestor> {
    let embedder = embedder(config)?;
    let store = chunk_store(config, pool, embedder.as_ref());
    let queue: Arc<dyn TaskQueue> = Arc::new(SqliteTaskQueue::new(pool.clone()));

    Ok(Ingestor::new(
        pool.clone(),
        store,
        queue,
        embedder,
        Chunker::new(config.chunking.max_chars),
        config.extraction.clone(),
        config.embedding.batch_size,
        config.worker.max_attempts,
    ))
}
