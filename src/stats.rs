//! `fin queue stats`: queue depth and document progress.

use std::collections::BTreeMap;

use anyhow::Result;
use finsight_core::queue::{QueueStat, TaskQueue, TaskStatus, TaskType};
use sqlx::Row;

use crate::config::Config;
use crate::db;
use crate::queue::SqliteTaskQueue;

/// Counts laid out as one row per task type, one column per status.
pub fn render_table(stats: &[QueueStat]) -> Vec<String> {
    let mut cells: BTreeMap<(TaskType, TaskStatus), u64> = BTreeMap::new();
    for s in stats {
        *cells.entry((s.task_type, s.status)).or_default() += s.count;
    }

    let mut lines = Vec::new();
    let mut header = format!("  {:<8}", "TYPE");
    for status in TaskStatus::ALL {
        header.push_str(&format!(" {:>10}", status.as_str().to_uppercase()));
    }
    lines.push(header);
    lines.push(format!("  {}", "-".repeat(8 + 11 * TaskStatus::ALL.len())));

    for task_type in TaskType::ALL {
        let mut line = format!("  {:<8}", task_type.as_str());
        for status in TaskStatus::ALL {
            let n = cells.get(&(task_type, status)).copied().unwrap_or(0);
            line.push_str(&format!(" {:>10}", n));
        }
        lines.push(line);
    }
    lines
}

pub async fn run_queue_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let queue = SqliteTaskQueue::new(pool.clone());
    let stats = queue.stats().await?;

    let total: u64 = stats.iter().map(|s| s.count).sum();
    println!("finsight queue");
    println!("==============");
    println!();
    println!("  Database:  {}", config.db.path.display());
    println!("  Tasks:     {}", total);
    println!();
    for line in render_table(&stats) {
        println!("{}", line);
    }

    let doc_rows = sqlx::query("SELECT status, COUNT(*) AS n FROM documents GROUP BY status ORDER BY status")
        .fetch_all(&pool)
        .await?;
    if !doc_rows.is_empty() {
        println!();
        println!("  Documents:");
        for row in &doc_rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            println!("    {:<12} {}", status, n);
        }
    }

    let failures = sqlx::query(
        r#"
        SELECT document_id, task_type, last_error FROM processing_tasks
        WHERE status = 'failed'
        ORDER BY updated_at DESC
        LIMIT 5
        "#,
    )
    .fetch_all(&pool)
    .await?;
    if !failures.is_empty() {
        println!();
        println!("  Recent failures:");
        for row in &failures {
            let document_id: String = row.get("document_id");
            let task_type: String = row.get("task_type");
            let error: Option<String> = row.get("last_error");
            println!(
                "    {} [{}] {}",
                document_id,
                task_type,
                error.unwrap_or_default()
            );
        }
    }

    pool.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_table_places_counts() {
        let stats = vec![
            QueueStat {
                task_type: TaskType::Embed,
                status: TaskStatus::Retrying,
                count: 3,
            },
            QueueStat {
                task_type: TaskType::Parse,
                status: TaskStatus::Completed,
                count: 7,
            },
        ];
        let lines = render_table(&stats);
        assert_eq!(lines.len(), 2 + TaskType::ALL.len());
        assert!(lines[0].contains("RETRYING"));

        let parse = lines.iter().find(|l| l.trim_start().starts_with("parse")).unwrap();
        let cols: Vec<&str> = parse.split_whitespace().collect();
        assert_eq!(cols, vec!["parse", "0", "0", "7", "0", "0"]);

        let embed = lines.iter().find(|l| l.trim_start().starts_with("embed")).unwrap();
        assert!(embed.trim_end().ends_with('3'));
    }
}
