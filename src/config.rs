//! TOML configuration.
//!
//! Every section except `[db]` is optional and every tunable has a default,
//! so a minimal config is just:
//!
//! ```toml
//! [db]
//! path = "./data/finsight.sqlite"
//! ```
//!
//! [`load_config`] parses the file and rejects values that would break the
//! loop ceilings or the fusion formula.

use anyhow::{bail, Context, Result};
use finsight_core::keyword::Bm25Params;
use finsight_core::pipeline::PipelineSettings;
use finsight_core::refine::RefineSettings;
use finsight_core::search::HybridParams;
use finsight_core::state::{MAX_RETRIEVAL_ATTEMPTS, MAX_SELF_HEAL_ATTEMPTS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    finsight_core::chunk::MAX_CHUNK_CHARS
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,
    #[serde(default = "default_initial_top_k")]
    pub initial_top_k: usize,
    #[serde(default = "default_final_top_k")]
    pub final_top_k: usize,
    #[serde(default = "default_retrieval_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_oversample")]
    pub multi_subject_oversample: usize,
    #[serde(default = "default_bm25_k1")]
    pub bm25_k1: f64,
    #[serde(default = "default_bm25_b")]
    pub bm25_b: f64,
    /// Deadline for one vector search call.
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            keyword_weight: default_keyword_weight(),
            initial_top_k: default_initial_top_k(),
            final_top_k: default_final_top_k(),
            max_attempts: default_retrieval_attempts(),
            multi_subject_oversample: default_oversample(),
            bm25_k1: default_bm25_k1(),
            bm25_b: default_bm25_b(),
            search_timeout_secs: default_search_timeout_secs(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.7
}
fn default_keyword_weight() -> f64 {
    0.3
}
fn default_initial_top_k() -> usize {
    30
}
fn default_final_top_k() -> usize {
    8
}
fn default_retrieval_attempts() -> u32 {
    MAX_RETRIEVAL_ATTEMPTS
}
fn default_oversample() -> usize {
    3
}
fn default_bm25_k1() -> f64 {
    1.5
}
fn default_bm25_b() -> f64 {
    0.75
}
fn default_search_timeout_secs() -> u64 {
    10
}

impl RetrievalConfig {
    pub fn hybrid_params(&self) -> HybridParams {
        HybridParams {
            semantic_weight: self.semantic_weight,
            keyword_weight: self.keyword_weight,
            bm25: Bm25Params {
                k1: self.bm25_k1,
                b: self.bm25_b,
            },
            multi_subject_oversample: self.multi_subject_oversample,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_self_heal_attempts")]
    pub max_self_heal_attempts: u32,
    #[serde(default = "default_analysis_attempts")]
    pub analysis_max_attempts: u32,
    /// Prior turns handed to query understanding.
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_self_heal_attempts: default_self_heal_attempts(),
            analysis_max_attempts: default_analysis_attempts(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_self_heal_attempts() -> u32 {
    MAX_SELF_HEAL_ATTEMPTS
}
fn default_analysis_attempts() -> u32 {
    2
}
fn default_history_turns() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `disabled`, `openai`, `ollama`, or `local` (offline feature hashing).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (OpenAI-compatible or Ollama server).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `disabled` or `openai` (any OpenAI-compatible chat endpoint).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_retries(),
            temperature: 0.0,
        }
    }
}

fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Parse tasks allowed in flight across the pool.
    #[serde(default = "default_max_extractions")]
    pub max_concurrent_extractions: usize,
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_task_attempts")]
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            max_concurrent_extractions: default_max_extractions(),
            lease_timeout_secs: default_lease_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_task_attempts(),
        }
    }
}

fn default_pool_size() -> usize {
    2
}
fn default_max_extractions() -> usize {
    2
}
fn default_lease_timeout_secs() -> u64 {
    600
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_task_attempts() -> u32 {
    3
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Directory the extraction tool writes `*_content_list.json` files into.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default = "default_base_wait_ms")]
    pub base_wait_ms: u64,
    #[serde(default = "default_per_page_wait_ms")]
    pub per_page_wait_ms: u64,
    /// Upper bound on the total wait, whatever the page count.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            base_wait_ms: default_base_wait_ms(),
            per_page_wait_ms: default_per_page_wait_ms(),
            max_wait_ms: default_max_wait_ms(),
            max_polls: default_max_polls(),
        }
    }
}

fn default_base_wait_ms() -> u64 {
    2_000
}
fn default_per_page_wait_ms() -> u64 {
    250
}
fn default_max_wait_ms() -> u64 {
    60_000
}
fn default_max_polls() -> u32 {
    6
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Config {
    /// Settings for the query-turn pipeline.
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            refine: RefineSettings {
                initial_top_k: self.retrieval.initial_top_k,
                final_top_k: self.retrieval.final_top_k,
                max_attempts: self.retrieval.max_attempts,
            },
            max_self_heal_attempts: self.generation.max_self_heal_attempts,
            analysis_max_attempts: self.generation.analysis_max_attempts,
            history_window: self.generation.history_turns,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_chars == 0 {
        bail!("chunking.max_chars must be > 0");
    }

    let r = &config.retrieval;
    for (name, w) in [
        ("semantic_weight", r.semantic_weight),
        ("keyword_weight", r.keyword_weight),
    ] {
        if !(0.0..=1.0).contains(&w) {
            bail!("retrieval.{} must be in [0.0, 1.0]", name);
        }
    }
    if r.initial_top_k == 0 || r.final_top_k == 0 {
        bail!("retrieval.initial_top_k and retrieval.final_top_k must be >= 1");
    }
    if r.final_top_k > r.initial_top_k {
        bail!("retrieval.final_top_k must not exceed retrieval.initial_top_k");
    }
    if r.max_attempts == 0 || r.max_attempts > MAX_RETRIEVAL_ATTEMPTS {
        bail!("retrieval.max_attempts must be in 1..={}", MAX_RETRIEVAL_ATTEMPTS);
    }
    if r.multi_subject_oversample == 0 {
        bail!("retrieval.multi_subject_oversample must be >= 1");
    }

    let g = &config.generation;
    if g.max_self_heal_attempts > MAX_SELF_HEAL_ATTEMPTS {
        bail!(
            "generation.max_self_heal_attempts must be <= {}",
            MAX_SELF_HEAL_ATTEMPTS
        );
    }
    if g.analysis_max_attempts == 0 {
        bail!("generation.analysis_max_attempts must be >= 1");
    }

    let e = &config.embedding;
    match e.provider.as_str() {
        "disabled" | "local" => {}
        "openai" | "ollama" => {
            if e.model.is_none() {
                bail!("embedding.model must be specified when provider is '{}'", e.provider);
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if e.is_enabled() && (e.dims.is_none() || e.dims == Some(0)) {
        bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
    }
    if e.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }

    match config.llm.provider.as_str() {
        "disabled" => {}
        "openai" => {
            if config.llm.model.is_none() {
                bail!("llm.model must be specified when provider is 'openai'");
            }
        }
        other => bail!("Unknown llm provider: '{}'. Must be disabled or openai.", other),
    }

    let w = &config.worker;
    if w.pool_size == 0 || w.max_concurrent_extractions == 0 {
        bail!("worker.pool_size and worker.max_concurrent_extractions must be >= 1");
    }
    if w.max_attempts == 0 {
        bail!("worker.max_attempts must be >= 1");
    }
    if config.extraction.max_polls == 0 {
        bail!("extraction.max_polls must be >= 1");
    }

    Ok(())
}
