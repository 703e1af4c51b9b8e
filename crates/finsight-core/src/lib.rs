//! # finsight core
//!
//! Runtime-free retrieval logic for financial documents: data models,
//! element chunking, BM25 keyword scoring, hybrid fusion with subject
//! balancing, the bounded retrieval-refinement and generation-quality state
//! machines, and the contracts for every external collaborator.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. The
//! application crate supplies concrete collaborators (SQLite, OpenAI-style
//! HTTP services) and wraps them with deadlines.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Elements, chunks, queries, retrieved chunks |
//! | [`chunk`] | Boundary-aware element chunker |
//! | [`keyword`] | In-memory BM25 inverted index |
//! | [`filter`] | Structured metadata filter |
//! | [`store`] | Vector search contract + in-memory backend |
//! | [`embedding`] | Embedding contract and vector helpers |
//! | [`search`] | Hybrid fusion and subject balancing |
//! | [`generator`] | Text-generation contract and response schemas |
//! | [`query`] | Query understanding |
//! | [`state`] | Per-turn agent state |
//! | [`refine`] | Retrieval refinement loop |
//! | [`analysis`] | Analysis stage and structural validation |
//! | [`answer`] | Generation quality loop |
//! | [`pipeline`] | One complete query turn |
//! | [`queue`] | Processing task queue contract + in-memory backend |
//! | [`error`] | Typed collaborator and invariant errors |

pub mod analysis;
pub mod answer;
pub mod chunk;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod generator;
pub mod keyword;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod refine;
pub mod search;
pub mod state;
pub mod store;
