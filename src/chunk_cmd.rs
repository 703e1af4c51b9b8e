//! `fin chunk`: run the chunker over a content list without touching the database.

use std::path::Path;

use anyhow::{Context, Result};
use finsight_core::chunk::{check_chunk_lengths, Chunker};
use finsight_core::models::{Chunk, DocumentMetadata};

use crate::config::Config;
use crate::extract;

pub fn chunk_file(path: &Path, metadata: &DocumentMetadata, max_chars: usize) -> Result<Vec<Chunk>> {
    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let elements = extract::parse_elements(&json)?;
    let chunks = Chunker::new(max_chars).chunk(&elements, metadata);
    check_chunk_lengths(&chunks, max_chars)?;
    Ok(chunks)
}

pub fn run_chunk(config: &Config, path: &Path, document_id: &str, json: bool) -> Result<()> {
    let metadata = DocumentMetadata {
        owner_id: "local".to_string(),
        document_id: document_id.to_string(),
        filename: path.file_name().map(|n| n.to_string_lossy().to_string()),
        ..Default::default()
    };
    let chunks = chunk_file(path, &metadata, config.chunking.max_chars)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&chunks)?);
        return Ok(());
    }

    for chunk in &chunks {
        let pages: Vec<String> = chunk.page_indices.iter().map(|p| (p + 1).to_string()).collect();
        println!(
            "{} [{}] pages {} ({} chars{})",
            chunk.id,
            chunk.chunk_type,
            pages.join(","),
            chunk.content.chars().count(),
            if chunk.has_table { ", table" } else { "" }
        );
    }
    println!("{} chunks", chunks.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_chunk_file_splits_on_major_heading() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc_content_list.json");
        std::fs::write(
            &path,
            r#"[
                {"type": "text", "text": "Item 7. Management's Discussion", "text_level": 1, "page_idx": 0},
                {"type": "text", "text": "Revenue increased 8%.", "page_idx": 0},
                {"type": "text", "text": "Item 8. Financial Statements", "text_level": 1, "page_idx": 1},
                {"type": "table", "text": "| Revenue | 383 |", "page_idx": 1}
            ]"#,
        )
        .unwrap();

        let meta = DocumentMetadata {
            owner_id: "u".to_string(),
            document_id: "doc".to_string(),
            ..Default::default()
        };
        let chunks = chunk_file(&path, &meta, 2000).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].id, "doc_chunk_0");
        assert!(chunks[1].has_table);
        assert!(chunk_file(&tmp.path().join("missing.json"), &meta, 2000).is_err());
    }
}
