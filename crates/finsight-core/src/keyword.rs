//! In-memory BM25 keyword index tuned for financial filings.
//!
//! # Tokenization
//!
//! 1. Lowercase; every char other than alphanumerics, `_`, `$`, `%` and `.`
//!    becomes a separator. Leading and trailing dots are stripped.
//! 2. Known multi-word financial phrases (`operating income`,
//!    `free cash flow`, ...) are matched greedily, longest first, and
//!    emitted as one `_`-joined token followed by their individual words.
//! 3. Stop words are dropped unless they are also financial metrics.
//!
//! # Scoring
//!
//! ```text
//! score(q, d) = Σ boost(t) · idf(t) · tf·(k1 + 1) / (tf + k1·(1 − b + b·|d|/avgdl))
//! idf(t)      = ln((N − df + 0.5) / (df + 0.5) + 1)
//! ```
//!
//! summed over the distinct query terms present in `d`, with `k1 = 1.5`,
//! `b = 0.75` by default. Boosts: phrase 2.0, company 1.8, metric 1.5,
//! abbreviation 1.5, four-digit year 1.3, anything else 1.0.

use std::collections::{HashMap, HashSet};

use crate::models::Chunk;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "from", "as", "is", "was", "are", "were", "be", "been", "being", "have", "has", "had", "do",
    "does", "did", "will", "would", "should", "could", "may", "might", "must", "can", "this",
    "that", "these", "those", "it", "its", "they", "them", "their", "we", "our", "us", "you",
    "your", "he", "she", "his", "her",
];

const FINANCIAL_PHRASES: &[&str] = &[
    "operating income", "net income", "gross profit", "revenue growth", "cash flow",
    "operating cash flow", "free cash flow", "cash flow from operations", "total revenue",
    "net revenue", "gross revenue", "revenue recognition", "earnings per share", "diluted eps",
    "basic eps", "return on equity", "return on assets", "return on investment",
    "adjusted ebitda", "non gaap", "cost of revenue", "cost of goods sold",
    "operating expenses", "research and development", "sales and marketing",
    "general and administrative", "total assets", "total liabilities", "shareholders equity",
    "stockholders equity", "working capital", "current assets", "current liabilities",
    "debt to equity", "debt ratio", "leverage ratio", "year over year", "quarter over quarter",
    "sequential growth", "fiscal year", "annual report", "quarterly report",
    "amazon web services", "google cloud", "segment revenue", "geographic revenue",
    "product revenue", "service revenue",
];

/// Single-word terms weighted like phrases.
const PHRASE_WORDS: &[&str] = &["ebitda", "aws", "azure"];

const FINANCIAL_METRICS: &[&str] = &[
    "revenue", "income", "profit", "loss", "earnings", "expenses", "costs", "assets",
    "liabilities", "equity", "debt", "cash", "capital", "margin", "ratio", "growth", "decline",
    "increase", "decrease", "million", "billion", "trillion", "percent", "percentage",
];

const ABBREVIATIONS: &[&str] = &[
    "gaap", "ifrs", "eps", "ebitda", "roi", "roe", "roa", "pe", "aws", "azure", "gcp", "ai",
    "ml", "iot", "saas", "paas", "iaas",
];

/// Company names recognised for boosting.
pub const COMPANIES: &[&str] = &[
    "apple", "microsoft", "amazon", "alphabet", "meta", "nvidia", "tesla",
];

const MAX_PHRASE_WORDS: usize = 5;

/// BM25 tuning parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bm25Params {
    pub k1: f64,
    pub b: f64,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.5, b: 0.75 }
    }
}

fn split_words(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    lowered
        .split(|c: char| !(c.is_alphanumeric() || matches!(c, '_' | '$' | '%' | '.')))
        .map(|w| w.trim_matches('.'))
        .filter(|w| !w.is_empty())
        .map(str::to_string)
        .collect()
}

/// Phrase table keyed by word sequence, built once per tokenize call site.
fn phrase_set() -> HashSet<Vec<String>> {
    FINANCIAL_PHRASES.iter().map(|p| split_words(p)).collect()
}

/// Tokenize `text` for indexing or querying.
pub fn tokenize(text: &str) -> Vec<String> {
    tokenize_with(text, &phrase_set())
}

fn tokenize_with(text: &str, phrases: &HashSet<Vec<String>>) -> Vec<String> {
    let words = split_words(text);
    let mut tokens = Vec::with_capacity(words.len());
    let mut i = 0;

    while i < words.len() {
        let longest = (2..=MAX_PHRASE_WORDS.min(words.len() - i))
            .rev()
            .find(|&n| phrases.contains(&words[i..i + n]));

        if let Some(n) = longest {
            tokens.push(words[i..i + n].join("_"));
            tokens.extend(words[i..i + n].iter().filter(|w| keep_word(w)).cloned());
            i += n;
        } else {
            if keep_word(&words[i]) {
                tokens.push(words[i].clone());
            }
            i += 1;
        }
    }

    tokens
}

fn keep_word(word: &str) -> bool {
    !STOP_WORDS.contains(&word) || FINANCIAL_METRICS.contains(&word)
}

fn is_year(term: &str) -> bool {
    term.len() == 4 && term.chars().all(|c| c.is_ascii_digit())
}

/// Weight multiplier for a query term.
pub fn term_boost(term: &str) -> f64 {
    if term.contains('_') || PHRASE_WORDS.contains(&term) {
        2.0
    } else if COMPANIES.contains(&term) {
        1.8
    } else if FINANCIAL_METRICS.contains(&term) || ABBREVIATIONS.contains(&term) {
        1.5
    } else if is_year(term) {
        1.3
    } else {
        1.0
    }
}

struct Entry {
    document_id: String,
    term_freqs: HashMap<String, u32>,
    length: usize,
}

/// Inverted-index BM25 scorer over chunk text.
pub struct KeywordIndex {
    params: Bm25Params,
    phrases: HashSet<Vec<String>>,
    entries: HashMap<String, Entry>,
    doc_freq: HashMap<String, usize>,
    total_length: usize,
}

impl KeywordIndex {
    pub fn new(params: Bm25Params) -> Self {
        Self {
            params,
            phrases: phrase_set(),
            entries: HashMap::new(),
            doc_freq: HashMap::new(),
            total_length: 0,
        }
    }

    /// Index every chunk in `chunks`.
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a Chunk>, params: Bm25Params) -> Self {
        let mut index = Self::new(params);
        for c in chunks {
            index.insert(&c.id, &c.document_id, &c.content);
        }
        index
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index `text` under `chunk_id`, replacing any previous entry.
    pub fn insert(&mut self, chunk_id: &str, document_id: &str, text: &str) {
        self.remove(chunk_id);

        let tokens = tokenize_with(text, &self.phrases);
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for t in &tokens {
            *term_freqs.entry(t.clone()).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }
        self.total_length += tokens.len();
        self.entries.insert(
            chunk_id.to_string(),
            Entry {
                document_id: document_id.to_string(),
                term_freqs,
                length: tokens.len(),
            },
        );
    }

    /// Drop one chunk. Returns whether it was present.
    pub fn remove(&mut self, chunk_id: &str) -> bool {
        let Some(entry) = self.entries.remove(chunk_id) else {
            return false;
        };
        self.total_length -= entry.length;
        for term in entry.term_freqs.keys() {
            if let Some(df) = self.doc_freq.get_mut(term) {
                *df -= 1;
                if *df == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }
        true
    }

    /// Drop every chunk of `document_id`. Returns how many were removed.
    pub fn remove_document(&mut self, document_id: &str) -> usize {
        let ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.document_id == document_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            self.remove(id);
        }
        ids.len()
    }

    fn idf(&self, term: &str) -> f64 {
        let n = self.entries.len() as f64;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Raw BM25 score of every chunk matching at least one query term.
    pub fn score(&self, query: &str) -> HashMap<String, f64> {
        let mut scores = HashMap::new();
        if self.entries.is_empty() {
            return scores;
        }

        let mut terms = tokenize_with(query, &self.phrases);
        terms.sort();
        terms.dedup();
        if terms.is_empty() {
            return scores;
        }

        let avgdl = (self.total_length as f64 / self.entries.len() as f64).max(1.0);
        let Bm25Params { k1, b } = self.params;

        for (chunk_id, entry) in &self.entries {
            let mut total = 0.0;
            for term in &terms {
                let Some(&tf) = entry.term_freqs.get(term) else {
                    continue;
                };
                let tf = tf as f64;
                let norm = k1 * (1.0 - b + b * entry.length as f64 / avgdl);
                total += term_boost(term) * self.idf(term) * tf * (k1 + 1.0) / (tf + norm);
            }
            if total > 0.0 {
                scores.insert(chunk_id.clone(), total);
            }
        }

        scores
    }

    /// Top `limit` matches, best first, ties broken by chunk id.
    pub fn search(&self, query: &str, limit: usize) -> Vec<(String, f64)> {
        let mut ranked: Vec<(String, f64)> = self.score(query).into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(limit);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_protects_phrases() {
        let tokens = tokenize("Apple's Free Cash Flow grew in FY2023.");
        assert!(tokens.contains(&"free_cash_flow".to_string()));
        assert!(tokens.contains(&"cash".to_string()));
        assert!(tokens.contains(&"flow".to_string()));
        assert!(!tokens.contains(&"cash_flow".to_string()));
        assert!(!tokens.contains(&"in".to_string()));
        assert!(tokens.contains(&"fy2023".to_string()));
    }

    #[test]
    fn test_tokenize_keeps_symbols_and_numbers() {
        let tokens = tokenize("Margin was 45.2% on $383.3 billion, non-GAAP.");
        assert!(tokens.contains(&"45.2%".to_string()));
        assert!(tokens.contains(&"$383.3".to_string()));
        assert!(tokens.contains(&"non_gaap".to_string()));
        assert!(tokens.contains(&"gaap".to_string()));
    }

    #[test]
    fn test_term_boosts() {
        assert_eq!(term_boost("operating_income"), 2.0);
        assert_eq!(term_boost("ebitda"), 2.0);
        assert_eq!(term_boost("nvidia"), 1.8);
        assert_eq!(term_boost("revenue"), 1.5);
        assert_eq!(term_boost("gaap"), 1.5);
        assert_eq!(term_boost("2024"), 1.3);
        assert_eq!(term_boost("widget"), 1.0);
    }

    #[test]
    fn test_score_prefers_matching_chunk() {
        let mut index = KeywordIndex::new(Bm25Params::default());
        index.insert("c1", "d1", "Operating income rose to $114 billion in 2023.");
        index.insert("c2", "d1", "The board approved a new dividend policy.");
        index.insert("c3", "d2", "Income taxes were flat.");

        let ranked = index.search("operating income 2023", 10);
        assert_eq!(ranked[0].0, "c1");
        assert!(ranked.iter().all(|(id, _)| id != "c2"));
    }

    #[test]
    fn test_rare_terms_weigh_more() {
        let mut index = KeywordIndex::new(Bm25Params::default());
        index.insert("c1", "d", "revenue revenue tesla");
        index.insert("c2", "d", "revenue growth");
        index.insert("c3", "d", "revenue outlook");
        let scores = index.score("tesla");
        assert_eq!(scores.len(), 1);
        assert!(index.idf("tesla") > index.idf("revenue"));
    }

    #[test]
    fn test_insert_replaces_and_remove_document() {
        let mut index = KeywordIndex::new(Bm25Params::default());
        index.insert("c1", "d1", "apple revenue");
        index.insert("c1", "d1", "microsoft azure");
        assert_eq!(index.len(), 1);
        assert!(index.score("apple").is_empty());
        assert!(!index.score("azure").is_empty());

        index.insert("c2", "d1", "meta");
        index.insert("c3", "d2", "meta");
        assert_eq!(index.remove_document("d1"), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.doc_freq.get("meta"), Some(&1));
    }

    #[test]
    fn test_empty_query_and_index() {
        let index = KeywordIndex::new(Bm25Params::default());
        assert!(index.score("revenue").is_empty());
        let mut index = index;
        index.insert("c1", "d", "revenue");
        assert!(index.score("the of and").is_empty());
    }
}
