//! Core data models shared by ingestion and query-time retrieval.
//!
//! These types flow through the whole system:
//!
//! ```text
//! Element ──chunk()──▶ Chunk ──index──▶ ChunkStore / KeywordIndex
//!                                            │
//! query ──understand()──▶ ProcessedQuery ──retrieve()──▶ RetrievedChunk
//! ```
//!
//! Elements are produced by the extraction collaborator and are immutable
//! once received. Chunks are created once at ingestion, never mutated, and
//! carry a full snapshot of their owning document's metadata so that no
//! join is needed at query time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// `heading_level` carried by every element that is not a heading.
pub const BODY_TEXT_LEVEL: u16 = 999;

/// Headings at or above this level (numerically ≤) open a new chunk.
pub const MAJOR_HEADING_LEVEL: u16 = 2;

fn default_heading_level() -> u16 {
    BODY_TEXT_LEVEL
}

/// Kind of an extracted page element.
///
/// The extractor's native `text` type deserializes as [`ElementKind::Paragraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    #[serde(alias = "text", alias = "equation", alias = "image")]
    Paragraph,
    #[serde(alias = "title")]
    Heading,
    Table,
    Code,
    List,
}

/// A nested text block inside a code or list element.
///
/// Accepts either `{"text": ".."}` or a bare string, as list items arrive.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "BlockRepr")]
pub struct Block {
    pub text: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BlockRepr {
    Plain(String),
    Object {
        #[serde(default)]
        text: String,
    },
}

impl From<BlockRepr> for Block {
    fn from(repr: BlockRepr) -> Self {
        match repr {
            BlockRepr::Plain(text) | BlockRepr::Object { text } => Block { text },
        }
    }
}

/// One unit of extracted document content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    #[serde(default)]
    pub text: String,
    /// Zero-based page number.
    #[serde(default, alias = "page_idx")]
    pub page_index: u32,
    #[serde(default = "default_heading_level", alias = "text_level")]
    pub heading_level: u16,
    /// Sub-elements for code and list elements, in order.
    #[serde(default, alias = "blocks", alias = "list_items")]
    pub children: Vec<Block>,
}

impl Element {
    /// Plain body-text element on `page_index`.
    pub fn paragraph(text: impl Into<String>, page_index: u32) -> Self {
        Self {
            kind: ElementKind::Paragraph,
            text: text.into(),
            page_index,
            heading_level: BODY_TEXT_LEVEL,
            children: Vec::new(),
        }
    }

    pub fn heading(text: impl Into<String>, level: u16, page_index: u32) -> Self {
        Self {
            kind: ElementKind::Heading,
            text: text.into(),
            page_index,
            heading_level: level,
            children: Vec::new(),
        }
    }

    pub fn table(text: impl Into<String>, page_index: u32) -> Self {
        Self {
            kind: ElementKind::Table,
            ..Self::paragraph(text, page_index)
        }
    }

    /// A code or list element assembled from nested blocks.
    pub fn nested(kind: ElementKind, blocks: &[&str], page_index: u32) -> Self {
        Self {
            kind,
            text: String::new(),
            page_index,
            heading_level: BODY_TEXT_LEVEL,
            children: blocks
                .iter()
                .map(|t| Block {
                    text: (*t).to_string(),
                })
                .collect(),
        }
    }

    /// True for headings that force a chunk boundary.
    pub fn is_major_heading(&self) -> bool {
        self.heading_level <= MAJOR_HEADING_LEVEL
    }

    /// The text this element contributes to a chunk.
    ///
    /// Code and list elements join their non-empty sub-blocks with `\n`,
    /// falling back to their direct text when no block has content.
    pub fn extracted_text(&self) -> String {
        if matches!(self.kind, ElementKind::Code | ElementKind::List) {
            let parts: Vec<&str> = self
                .children
                .iter()
                .map(|b| b.text.trim())
                .filter(|t| !t.is_empty())
                .collect();
            if !parts.is_empty() {
                return parts.join("\n");
            }
        }
        self.text.trim().to_string()
    }
}

/// Derived classification of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Heading,
    Table,
    Code,
    List,
    Paragraph,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Heading => "heading",
            ChunkType::Table => "table",
            ChunkType::Code => "code",
            ChunkType::List => "list",
            ChunkType::Paragraph => "paragraph",
        }
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "heading" => Ok(ChunkType::Heading),
            "table" => Ok(ChunkType::Table),
            "code" => Ok(ChunkType::Code),
            "list" => Ok(ChunkType::List),
            "paragraph" | "text" => Ok(ChunkType::Paragraph),
            other => Err(format!("unknown chunk type '{}'", other)),
        }
    }
}

/// Owning-document attributes snapshotted onto every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Owner (user) scope. Every search is filtered on this.
    pub owner_id: String,
    pub document_id: String,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub fiscal_year: Option<i32>,
    #[serde(default)]
    pub fiscal_quarter: Option<u8>,
    /// e.g. `10-K`, `10-Q`, `annual_report`.
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

impl DocumentMetadata {
    /// Whether `name` is this document's company or ticker, ignoring case.
    pub fn is_company(&self, name: &str) -> bool {
        let name = name.trim();
        !name.is_empty()
            && [self.company.as_deref(), self.ticker.as_deref()]
                .into_iter()
                .flatten()
                .any(|c| c.trim().eq_ignore_ascii_case(name))
    }
}

/// The atomic retrievable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// `{document_id}_chunk_{chunk_index}`; stable across re-ingestion.
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub content: String,
    pub chunk_type: ChunkType,
    /// Page of the first contributing element.
    pub page_index: u32,
    /// All distinct pages touched, ascending.
    pub page_indices: BTreeSet<u32>,
    pub has_table: bool,
    /// SHA-256 of `content`, hex encoded.
    pub hash: String,
    pub metadata: DocumentMetadata,
}

impl Chunk {
    /// Whether this chunk belongs to comparison subject `name`, matched
    /// against the company or the ticker.
    pub fn belongs_to(&self, name: &str) -> bool {
        self.metadata.is_company(name)
    }
}

/// Structured entities extracted from a user query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueryEntities {
    /// Comparison subjects, lowercased, in query order.
    #[serde(default)]
    pub companies: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    /// Inclusive `(start, end)`.
    #[serde(default)]
    pub year_range: Option<(i32, i32)>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub fiscal_quarter: Option<u8>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub chunk_type: Option<ChunkType>,
}

impl QueryEntities {
    pub fn is_multi_subject(&self) -> bool {
        self.companies.len() > 1
    }
}

/// A query after entity extraction and keyword augmentation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedQuery {
    pub query_text: String,
    pub entities: QueryEntities,
    /// Keyword form used for BM25 scoring and embedding.
    pub augmented_query: String,
    /// Collaborator's coarse intent label (`comparison`, `trend`, `lookup`, ...).
    #[serde(default)]
    pub query_type: String,
}

impl ProcessedQuery {
    /// A query with no entities whose keyword form is the raw text.
    pub fn passthrough(query_text: &str) -> Self {
        Self {
            query_text: query_text.to_string(),
            entities: QueryEntities::default(),
            augmented_query: query_text.to_string(),
            query_type: String::new(),
        }
    }
}

/// Scoring components behind a [`RetrievedChunk::relevance_score`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    /// Raw cosine similarity from vector search.
    pub similarity: f64,
    /// Min-max normalised semantic score.
    pub semantic: f64,
    /// Min-max normalised BM25 score (0.0 when no term matched).
    pub keyword: f64,
    /// Zero-based rank in the vector search response.
    pub vector_rank: usize,
}

/// A chunk plus its fused relevance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk: Chunk,
    pub relevance_score: f64,
    pub scores: ScoreBreakdown,
}
