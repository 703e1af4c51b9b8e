//! Extraction collaborator adapter.
//!
//! The layout-extraction tool runs out of process and writes a
//! `{stem}_content_list.json` file per source document: a JSON array of page
//! elements. This module finds that file, waits for it on an adaptive
//! schedule, and decodes the elements.
//!
//! A source path that is itself a `.json` file is read directly, which is
//! how pre-extracted documents are submitted.
//!
//! Lookup order under `extraction.output_dir`:
//!
//! 1. `{stem}/auto/{stem}_content_list.json`
//! 2. `{stem}/vlm/{stem}_content_list.json`
//! 3. `{stem}/{stem}_content_list.json`
//! 4. `{stem}_content_list.json`
//! 5. any `{stem}_content_list.json` found by a recursive walk

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use finsight_core::models::Element;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::ExtractionConfig;

/// Total time to wait for a document of `page_count` pages.
pub fn wait_budget(config: &ExtractionConfig, page_count: u32) -> Duration {
    let ms = config
        .base_wait_ms
        .saturating_add(config.per_page_wait_ms.saturating_mul(u64::from(page_count)));
    Duration::from_millis(ms.min(config.max_wait_ms))
}

/// Split `total` into `polls` exponentially growing sleeps (1, 2, 4, ...
/// parts of `total / (2^polls - 1)`).
pub fn poll_delays(total: Duration, polls: u32) -> Vec<Duration> {
    if polls == 0 {
        return Vec::new();
    }
    let polls = polls.min(16);
    let parts = (1u64 << polls) - 1;
    let unit = total.as_millis() as u64 / parts;
    (0..polls)
        .map(|i| Duration::from_millis(unit << i))
        .collect()
}

fn content_list_name(stem: &str) -> String {
    format!("{}_content_list.json", stem)
}

pub fn candidate_paths(output_dir: &Path, stem: &str) -> Vec<PathBuf> {
    let name = content_list_name(stem);
    vec![
        output_dir.join(stem).join("auto").join(&name),
        output_dir.join(stem).join("vlm").join(&name),
        output_dir.join(stem).join(&name),
        output_dir.join(&name),
    ]
}

/// First existing content list for `stem`, if any. Blocks on filesystem
/// calls; async callers go through [`locate_content_list`].
pub fn find_content_list(output_dir: &Path, stem: &str) -> Option<PathBuf> {
    if let Some(found) = candidate_paths(output_dir, stem).into_iter().find(|p| p.is_file()) {
        return Some(found);
    }

    let name = content_list_name(stem);
    WalkDir::new(output_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name().to_string_lossy() == name)
        .map(|e| e.into_path())
}

/// [`find_content_list`] on the blocking thread pool.
pub async fn locate_content_list(output_dir: &Path, stem: &str) -> Result<Option<PathBuf>> {
    let (dir, stem) = (output_dir.to_path_buf(), stem.to_string());
    tokio::task::spawn_blocking(move || find_content_list(&dir, &stem))
        .await
        .context("content list search panicked")
}

/// Poll for `stem`'s content list until found or the schedule runs out.
pub async fn await_content_list(
    config: &ExtractionConfig,
    output_dir: &Path,
    stem: &str,
    page_count: u32,
) -> Result<PathBuf> {
    let delays = poll_delays(wait_budget(config, page_count), config.max_polls);

    if let Some(found) = locate_content_list(output_dir, stem).await? {
        return Ok(found);
    }
    for (poll, delay) in delays.iter().enumerate() {
        debug!(stem, poll = poll + 1, delay_ms = delay.as_millis() as u64, "waiting for content list");
        tokio::time::sleep(*delay).await;
        if let Some(found) = locate_content_list(output_dir, stem).await? {
            return Ok(found);
        }
    }

    bail!(
        "content list for '{}' not found under {} after {} polls; expected one of: {:?}",
        stem,
        output_dir.display(),
        delays.len(),
        candidate_paths(output_dir, stem)
    )
}

/// Decode a content list. Elements of kinds the chunker does not know
/// (headers, footers, page numbers) are skipped.
pub fn parse_elements(json: &str) -> Result<Vec<Element>> {
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(json).context("content list is not a JSON array")?;

    let mut elements = Vec::with_capacity(raw.len());
    let mut skipped = 0usize;
    for value in raw {
        match serde_json::from_value::<Element>(value) {
            Ok(element) => elements.push(element),
            Err(e) => {
                skipped += 1;
                debug!(error = %e, "skipping element");
            }
        }
    }
    if skipped > 0 {
        warn!(skipped, kept = elements.len(), "content list had unusable elements");
    }
    Ok(elements)
}

/// Pages spanned by `elements` (highest zero-based page index + 1).
pub fn page_count(elements: &[Element]) -> u32 {
    elements.iter().map(|e| e.page_index + 1).max().unwrap_or(0)
}

/// Produce the elements for `source`.
///
/// `page_hint` sizes the wait when the page count is known up front.
pub async fn extract(config: &ExtractionConfig, source: &Path, page_hint: u32) -> Result<Vec<Element>> {
    let is_json = source
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let path = if is_json {
        source.to_path_buf()
    } else {
        let output_dir = config.output_dir.as_deref().with_context(|| {
            format!(
                "{} needs extraction but extraction.output_dir is not set",
                source.display()
            )
        })?;
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .with_context(|| format!("no file stem in {}", source.display()))?;
        await_content_list(config, output_dir, &stem, page_hint).await?
    };

    let json = tokio::fs::read_to_string(&path)
        .await
        .with_context(|| format!("Failed to read content list {}", path.display()))?;
    let elements = parse_elements(&json)?;
    info!(path = %path.display(), elements = elements.len(), "loaded content list");
    Ok(elements)
}
