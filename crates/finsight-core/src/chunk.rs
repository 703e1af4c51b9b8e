//! Boundary-aware element chunker.
//!
//! Groups extracted page [`Element`]s into [`Chunk`]s no longer than a fixed
//! character budget (2000 by default), in document order.
//!
//! # Algorithm
//!
//! Elements are accumulated into a buffer. Before an element is appended,
//! the buffer is flushed when, in priority order:
//!
//! 1. the element is on a different page than the buffer (page break);
//! 2. the element is a major heading (`heading_level ≤ 2`), which then
//!    opens the fresh chunk itself;
//! 3. appending the element's text (plus its one-space separator) would
//!    push the buffer past the budget.
//!
//! Elements whose extracted text is empty are skipped. A single element
//! longer than the whole budget is hard-split at the last newline or space
//! before the limit into consecutive chunks of its own.
//!
//! Chunk ids are `{document_id}_chunk_{n}`, so re-chunking the same input
//! overwrites rather than duplicates. Each chunk also carries a SHA-256 of
//! its content.
//!
//! # Example
//!
//! ```rust
//! use finsight_core::chunk::Chunker;
//! use finsight_core::models::{DocumentMetadata, Element};
//!
//! let elements = vec![
//!     Element::heading("Results of Operations", 1, 0),
//!     Element::paragraph("Revenue grew 12% year over year.", 0),
//! ];
//! let meta = DocumentMetadata { document_id: "doc-1".into(), ..Default::default() };
//! let chunks = Chunker::default().chunk(&elements, &meta);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].id, "doc-1_chunk_0");
//! ```

use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use crate::error::InvariantViolation;
use crate::models::{Chunk, ChunkType, DocumentMetadata, Element, ElementKind};

/// Default maximum chunk length, in characters.
pub const MAX_CHUNK_CHARS: usize = 2000;

/// Separator placed between element texts inside one chunk.
const SEPARATOR: &str = " ";

/// Splits element sequences into bounded chunks.
#[derive(Debug, Clone, Copy)]
pub struct Chunker {
    max_chars: usize,
}

impl Default for Chunker {
    fn default() -> Self {
        Self {
            max_chars: MAX_CHUNK_CHARS,
        }
    }
}

/// Chunk under construction.
#[derive(Default)]
struct Buffer {
    content: String,
    chars: usize,
    page_index: u32,
    pages: BTreeSet<u32>,
    major_heading: bool,
    has_table: bool,
    has_code: bool,
    has_list: bool,
}

impl Buffer {
    fn is_empty(&self) -> bool {
        self.chars == 0
    }

    fn push(&mut self, element: &Element, text: &str, text_chars: usize) {
        if self.is_empty() {
            self.page_index = element.page_index;
        } else {
            self.content.push_str(SEPARATOR);
            self.chars += SEPARATOR.len();
        }
        self.content.push_str(text);
        self.chars += text_chars;
        self.pages.insert(element.page_index);
        self.major_heading |= element.is_major_heading();
        match element.kind {
            ElementKind::Table => self.has_table = true,
            ElementKind::Code => self.has_code = true,
            ElementKind::List => self.has_list = true,
            ElementKind::Paragraph | ElementKind::Heading => {}
        }
    }

    fn chunk_type(&self) -> ChunkType {
        if self.major_heading {
            ChunkType::Heading
        } else if self.has_table {
            ChunkType::Table
        } else if self.has_code {
            ChunkType::Code
        } else if self.has_list {
            ChunkType::List
        } else {
            ChunkType::Paragraph
        }
    }
}

impl Chunker {
    /// A chunker with a custom budget. Values below 1 are raised to 1.
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Chunk `elements`, stamping every chunk with `metadata`.
    ///
    /// # Guarantees
    ///
    /// - Every chunk's content is at most `max_chars` characters.
    /// - A page change always starts a new chunk.
    /// - A major heading always starts a new chunk.
    /// - Every non-empty element lands in exactly one chunk, in order.
    /// - Output is a pure function of the inputs.
    pub fn chunk(&self, elements: &[Element], metadata: &DocumentMetadata) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        let mut buf = Buffer::default();

        for element in elements {
            let text = element.extracted_text();
            if text.is_empty() {
                continue;
            }
            let text_chars = text.chars().count();

            if !buf.is_empty() {
                let page_break = element.page_index != buf.page_index;
                let heading = element.is_major_heading();
                let overflow = buf.chars + SEPARATOR.len() + text_chars > self.max_chars;
                if page_break || heading || overflow {
                    self.flush(&mut buf, metadata, &mut chunks);
                }
            }

            if text_chars > self.max_chars {
                for piece in hard_split(&text, self.max_chars) {
                    let mut single = Buffer::default();
                    single.push(element, piece, piece.chars().count());
                    self.flush(&mut single, metadata, &mut chunks);
                }
                continue;
            }

            buf.push(element, &text, text_chars);
        }

        if !buf.is_empty() {
            self.flush(&mut buf, metadata, &mut chunks);
        }

        chunks
    }

    fn flush(&self, buf: &mut Buffer, metadata: &DocumentMetadata, out: &mut Vec<Chunk>) {
        let taken = std::mem::take(buf);
        let index = out.len() as i64;
        out.push(Chunk {
            id: chunk_id(&metadata.document_id, index),
            document_id: metadata.document_id.clone(),
            chunk_index: index,
            hash: content_hash(&taken.content),
            chunk_type: taken.chunk_type(),
            page_index: taken.page_index,
            page_indices: taken.pages,
            has_table: taken.has_table,
            content: taken.content,
            metadata: metadata.clone(),
        });
    }
}

/// Deterministic chunk id for position `index` of `document_id`.
pub fn chunk_id(document_id: &str, index: i64) -> String {
    format!("{}_chunk_{}", document_id, index)
}

/// Check the length ceiling on already-built chunks.
pub fn check_chunk_lengths(chunks: &[Chunk], max_chars: usize) -> Result<(), InvariantViolation> {
    for chunk in chunks {
        let len = chunk.content.chars().count();
        if len > max_chars {
            return Err(InvariantViolation::ChunkTooLong {
                chunk_id: chunk.id.clone(),
                len,
                max: max_chars,
            });
        }
    }
    Ok(())
}

fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Byte offset of the `n`th char, or `s.len()` if `s` is shorter.
fn byte_offset_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(i, _)| i).unwrap_or(s.len())
}

/// Split `text` into trimmed, non-empty pieces of at most `max_chars` chars,
/// preferring to break after the last newline, then the last space.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let limit = byte_offset_of_char(remaining, max_chars);
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .filter(|&pos| pos > 0)
                .unwrap_or(limit)
        } else {
            limit
        };
        // Always make progress, even on a zero-width budget edge.
        let split_at = if split_at == 0 {
            byte_offset_of_char(remaining, 1)
        } else {
            split_at
        };

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[split_at..];
    }

    pieces
}
