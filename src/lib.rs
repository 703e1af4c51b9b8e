//! # finsight
//!
//! Question answering over a user's financial filings. This crate is the
//! application shell around [`finsight_core`]: it supplies SQLite
//! persistence, HTTP collaborators, deadlines, the ingestion worker pool,
//! and the `fin` CLI.
//!
//! ## Architecture
//!
//! ```text
//!  fin submit ──▶ documents + processing_tasks
//!                        │
//!  fin worker ──claim──▶ parse ─▶ chunk ─▶ embed ─▶ index   (SQLite)
//!                                                     │
//!  fin ask ──▶ understand ─▶ retrieve/validate ─▶ analyze ─▶ explain/heal
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! fin init
//! fin submit ./filings/aapl_10k_content_list.json --owner u1 --company apple --year 2023 --doc-type 10-K
//! fin worker --drain
//! fin search "iPhone revenue" --owner u1
//! fin ask "How did Apple's revenue change in 2023?" --owner u1
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema creation |
//! | [`store`] | SQLite `ChunkStore` |
//! | [`queue`] | SQLite `TaskQueue` |
//! | [`embedding`] | OpenAI / Ollama / local embedders |
//! | [`llm`] | Chat-completion text generator |
//! | [`http`] | Shared HTTP retry loop |
//! | [`deadline`] | Timeout decorators for collaborators |
//! | [`extract`] | Extraction output discovery and decoding |
//! | [`ingest`] | Document submission and ingestion stages |
//! | [`worker`] | Ingestion worker pool |
//! | [`memory`] | Per-session conversation memory |
//! | [`app`] | Collaborator wiring |
//! | [`ask`], [`search`], [`stats`], [`chunk_cmd`] | CLI commands |
//! | [`logging`] | Tracing subscriber setup |

pub mod app;
pub mod ask;
pub mod chunk_cmd;
pub mod config;
pub mod db;
pub mod deadline;
pub mod embedding;
pub mod extract;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod migrate;
pub mod queue;
pub mod search;
pub mod stats;
pub mod store;
pub mod worker;
