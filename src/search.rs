//! `fin search`: one hybrid retrieval, no refinement or generation.
//!
//! Useful for checking what the refinement loop will see on its first
//! attempt. Scores are printed as `relevance (semantic / keyword)`.

use anyhow::Result;
use finsight_core::filter::SearchFilter;
use finsight_core::models::{ProcessedQuery, RetrievedChunk};

use crate::app;
use crate::config::Config;
use crate::db;

pub async fn run_search(
    config: &Config,
    query: &str,
    filter: SearchFilter,
    top_k: Option<usize>,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let pool = db::connect(config).await?;
    let retriever = app::retriever(config, &pool)?;
    let top_k = top_k.unwrap_or(config.retrieval.final_top_k);

    let processed = ProcessedQuery::passthrough(query);
    let results = retriever.retrieve(&processed, &filter, top_k).await?;

    if results.is_empty() {
        println!("No results.");
    } else {
        for (i, result) in results.iter().enumerate() {
            print_result(i + 1, result);
        }
    }

    pool.close().await;
    Ok(())
}

fn describe_source(result: &RetrievedChunk) -> String {
    let meta = &result.chunk.metadata;
    let mut parts = Vec::new();
    parts.push(meta.company.clone().unwrap_or_else(|| "(unknown company)".to_string()));
    if let Some(doc_type) = &meta.document_type {
        parts.push(doc_type.clone());
    }
    match (meta.fiscal_year, meta.fiscal_quarter) {
        (Some(y), Some(q)) => parts.push(format!("FY{} Q{}", y, q)),
        (Some(y), None) => parts.push(format!("FY{}", y)),
        _ => {}
    }
    parts.push(format!("p.{}", result.chunk.page_index + 1));
    parts.join(" / ")
}

fn excerpt(content: &str, max_chars: usize) -> String {
    let flat = content.replace('\n', " ");
    let flat = flat.trim();
    if flat.chars().count() <= max_chars {
        return flat.to_string();
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}...", cut.trim_end())
}

fn print_result(rank: usize, result: &RetrievedChunk) {
    println!(
        "{}. [{:.3}] {}",
        rank,
        result.relevance_score,
        describe_source(result)
    );
    println!(
        "    scores: semantic {:.3} / keyword {:.3} (cosine {:.3}, vector rank {})",
        result.scores.semantic, result.scores.keyword, result.scores.similarity, result.scores.vector_rank
    );
    println!("    type: {}", result.chunk.chunk_type);
    println!("    excerpt: \"{}\"", excerpt(&result.chunk.content, 200));
    println!("    id: {}", result.chunk.id);
    println!();
}
