//! Structured metadata filter for vector search.
//!
//! Owner scope is mandatory: a filter with an empty owner matches nothing.
//! Every other field is optional and narrows the candidate universe.
//! String comparisons are case-insensitive.

use serde::{Deserialize, Serialize};

use crate::models::{Chunk, ChunkType, QueryEntities};

/// Fiscal-year constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum YearFilter {
    Exact(i32),
    /// Inclusive on both ends.
    Range { start: i32, end: i32 },
}

impl YearFilter {
    pub fn contains(&self, year: i32) -> bool {
        match *self {
            YearFilter::Exact(y) => y == year,
            YearFilter::Range { start, end } => (start..=end).contains(&year),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub owner_id: String,
    /// Any-of match on the chunk's company or ticker.
    #[serde(default)]
    pub companies: Vec<String>,
    #[serde(default)]
    pub fiscal_year: Option<YearFilter>,
    #[serde(default)]
    pub document_type: Option<String>,
    #[serde(default)]
    pub fiscal_quarter: Option<u8>,
    #[serde(default)]
    pub sector: Option<String>,
    #[serde(default)]
    pub chunk_type: Option<ChunkType>,
    #[serde(default)]
    pub has_table: Option<bool>,
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

impl SearchFilter {
    pub fn for_owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }

    /// Fill every unset constraint from the query's extracted entities.
    /// Constraints the caller already set win.
    pub fn with_entities(&self, entities: &QueryEntities) -> Self {
        let mut merged = self.clone();
        if merged.companies.is_empty() {
            merged.companies = entities.companies.clone();
        }
        if merged.fiscal_year.is_none() {
            merged.fiscal_year = match (entities.year_range, entities.year) {
                (Some((start, end)), _) => Some(YearFilter::Range { start, end }),
                (None, Some(y)) => Some(YearFilter::Exact(y)),
                (None, None) => None,
            };
        }
        if merged.document_type.is_none() {
            merged.document_type = entities.document_type.clone();
        }
        if merged.fiscal_quarter.is_none() {
            merged.fiscal_quarter = entities.fiscal_quarter;
        }
        if merged.sector.is_none() {
            merged.sector = entities.sector.clone();
        }
        if merged.chunk_type.is_none() {
            merged.chunk_type = entities.chunk_type;
        }
        merged
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        let meta = &chunk.metadata;
        if self.owner_id.is_empty() || meta.owner_id != self.owner_id {
            return false;
        }
        if !self.companies.is_empty() && !self.companies.iter().any(|c| meta.is_company(c)) {
            return false;
        }
        if let Some(years) = self.fiscal_year {
            match meta.fiscal_year {
                Some(y) if years.contains(y) => {}
                _ => return false,
            }
        }
        if let Some(want) = self.document_type.as_deref() {
            if !meta.document_type.as_deref().is_some_and(|d| eq_ignore_case(d, want)) {
                return false;
            }
        }
        if let Some(q) = self.fiscal_quarter {
            if meta.fiscal_quarter != Some(q) {
                return false;
            }
        }
        if let Some(want) = self.sector.as_deref() {
            if !meta.sector.as_deref().is_some_and(|s| eq_ignore_case(s, want)) {
                return false;
            }
        }
        if let Some(ct) = self.chunk_type {
            if chunk.chunk_type != ct {
                return false;
            }
        }
        if let Some(t) = self.has_table {
            if chunk.has_table != t {
                return false;
            }
        }
        true
    }
}
