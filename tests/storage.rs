//! Tests against a real SQLite database in a temp directory.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use finsight::config::{self, Config};
use finsight::ingest::{self, SubmitRequest};
use finsight::queue::SqliteTaskQueue;
use finsight::store::SqliteChunkStore;
use finsight::worker::WorkerPool;
use finsight::{app, ask, db, memory, migrate};
use finsight_core::chunk::Chunker;
use finsight_core::embedding::{Embedder, HashingEmbedder};
use finsight_core::error::LeaseLost;
use finsight_core::filter::{SearchFilter, YearFilter};
use finsight_core::generator::{GenerationTask, ScriptedGenerator};
use finsight_core::models::{DocumentMetadata, Element};
use finsight_core::pipeline::{AnswerPipeline, PipelineSettings};
use finsight_core::queue::{NewTask, TaskQueue, TaskStatus, TaskType};
use finsight_core::search::{HybridParams, HybridRetriever};
use finsight_core::store::ChunkStore;
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;

const LEASE: Duration = Duration::from_secs(600);

async fn setup() -> (TempDir, SqlitePool) {
    let tmp = TempDir::new().unwrap();
    let pool = db::connect_path(&tmp.path().join("finsight.sqlite")).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    (tmp, pool)
}

fn write_config(dir: &Path) -> Config {
    let path = dir.join("finsight.toml");
    std::fs::write(
        &path,
        format!(
            r#"[db]
path = "{}/finsight.sqlite"

[embedding]
provider = "local"
dims = 128

[worker]
pool_size = 2
poll_interval_ms = 10
"#,
            dir.display()
        ),
    )
    .unwrap();
    config::load_config(&path).unwrap()
}

/// Register a document row so chunk foreign keys resolve.
async fn register(pool: &SqlitePool, dir: &Path, document_id: &str, owner: &str, company: &str) {
    let source = dir.join(format!("{}_content_list.json", document_id));
    std::fs::write(&source, "[]").unwrap();
    let queue = SqliteTaskQueue::new(pool.clone());
    ingest::submit(
        pool,
        &queue,
        SubmitRequest {
            source,
            owner_id: owner.to_string(),
            document_id: Some(document_id.to_string()),
            company: Some(company.to_string()),
            fiscal_year: Some(2023),
            ..Default::default()
        },
        3,
    )
    .await
    .unwrap();
}

async fn index_text(store: &SqliteChunkStore, embedder: &HashingEmbedder, meta: DocumentMetadata, texts: &[&str]) {
    let elements: Vec<Element> = texts
        .iter()
        .enumerate()
        .map(|(i, t)| Element::heading(*t, 1, i as u32))
        .collect();
    let chunks = Chunker::default().chunk(&elements, &meta);
    let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let vectors = embedder.embed(&contents).await.unwrap();
    store.upsert_chunks(&chunks).await.unwrap();
    let pairs: Vec<(String, Vec<f32>)> = chunks.iter().map(|c| c.id.clone()).zip(vectors).collect();
    store.upsert_vectors(&pairs).await.unwrap();
}

fn meta(owner: &str, document_id: &str, company: &str) -> DocumentMetadata {
    DocumentMetadata {
        owner_id: owner.to_string(),
        document_id: document_id.to_string(),
        company: Some(company.to_string()),
        fiscal_year: Some(2023),
        ..Default::default()
    }
}

// ============ Chunk store ============

#[tokio::test]
async fn test_store_search_is_owner_scoped() {
    let (tmp, pool) = setup().await;
    register(&pool, tmp.path(), "aapl", "u1", "Apple").await;
    register(&pool, tmp.path(), "msft", "u2", "Microsoft").await;

    let embedder = HashingEmbedder::new(128);
    let store = SqliteChunkStore::new(pool.clone(), embedder.model_name());
    index_text(&store, &embedder, meta("u1", "aapl", "Apple"), &["Apple revenue grew in 2023"]).await;
    index_text(&store, &embedder, meta("u2", "msft", "Microsoft"), &["Microsoft revenue grew in 2023"]).await;

    let query = embedder.embed(&["revenue grew".to_string()]).await.unwrap().remove(0);

    let hits = store.vector_search(&query, &SearchFilter::for_owner("u1"), 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].chunk.metadata.owner_id, "u1");

    let nobody = store.vector_search(&query, &SearchFilter::default(), 10).await.unwrap();
    assert!(nobody.is_empty());
}

#[tokio::test]
async fn test_store_filters_and_ranks() {
    let (tmp, pool) = setup().await;
    register(&pool, tmp.path(), "aapl", "u1", "Apple").await;

    let embedder = HashingEmbedder::new(128);
    let store = SqliteChunkStore::new(pool.clone(), embedder.model_name());
    index_text(
        &store,
        &embedder,
        meta("u1", "aapl", "Apple"),
        &["iPhone revenue by region", "Services gross margin", "Risk factors overview"],
    )
    .await;

    let query = embedder.embed(&["iPhone revenue".to_string()]).await.unwrap().remove(0);
    let mut filter = SearchFilter::for_owner("u1");
    filter.companies = vec!["APPLE".to_string()];
    filter.fiscal_year = Some(YearFilter::Range { start: 2022, end: 2024 });

    let hits = store.vector_search(&query, &filter, 2).await.unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].chunk.id, "aapl_chunk_0");
    assert!(hits[0].similarity >= hits[1].similarity);

    filter.fiscal_year = Some(YearFilter::Exact(2019));
    assert!(store.vector_search(&query, &filter, 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_store_upsert_overwrites_and_delete_removes() {
    let (tmp, pool) = setup().await;
    register(&pool, tmp.path(), "aapl", "u1", "Apple").await;

    let embedder = HashingEmbedder::new(64);
    let store = SqliteChunkStore::new(pool.clone(), embedder.model_name());
    index_text(&store, &embedder, meta("u1", "aapl", "Apple"), &["first draft", "second part"]).await;
    index_text(&store, &embedder, meta("u1", "aapl", "Apple"), &["revised draft", "second part"]).await;

    let chunks = store.document_chunks("aapl").await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].chunk_index, 0);
    assert!(chunks[0].content.contains("revised"));

    let removed = store.delete_document_chunks("aapl").await.unwrap();
    assert_eq!(removed, 2);
    assert!(store.document_chunks("aapl").await.unwrap().is_empty());

    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(vectors, 0);
}

#[tokio::test]
async fn test_store_replace_is_atomic() {
    let (tmp, pool) = setup().await;
    register(&pool, tmp.path(), "aapl", "u1", "Apple").await;

    let embedder = HashingEmbedder::new(64);
    let store = SqliteChunkStore::new(pool.clone(), embedder.model_name());
    index_text(&store, &embedder, meta("u1", "aapl", "Apple"), &["first draft", "second part"]).await;

    // The unregistered document's chunk violates its foreign key mid-write.
    let mut replacement = Chunker::default().chunk(&[Element::heading("rewritten", 1, 0)], &meta("u1", "aapl", "Apple"));
    replacement.extend(Chunker::default().chunk(&[Element::heading("orphan", 1, 0)], &meta("u1", "ghost", "Apple")));
    assert!(store.replace_document_chunks("aapl", &replacement).await.is_err());

    let kept = store.document_chunks("aapl").await.unwrap();
    assert_eq!(kept.len(), 2);
    assert!(kept[0].content.contains("first draft"));
    let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors WHERE document_id = 'aapl'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(vectors, 2);

    let removed = store.replace_document_chunks("aapl", &replacement[..1]).await.unwrap();
    assert_eq!(removed, 2);
    let now = store.document_chunks("aapl").await.unwrap();
    assert_eq!(now.len(), 1);
    assert!(now[0].content.contains("rewritten"));
}

// ============ Task queue ============

#[tokio::test]
async fn test_queue_claim_is_exclusive_until_lease_expires() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool);
    let id = queue
        .enqueue(NewTask::new("doc", TaskType::Parse, json!({})))
        .await
        .unwrap();

    let task = queue.claim("w1", Duration::from_millis(500)).await.unwrap().unwrap();
    assert_eq!(task.id, id);
    assert_eq!(task.attempts, 1);
    assert_eq!(task.status, TaskStatus::Processing);
    assert!(task.lease_expires_at.unwrap() > task.locked_at.unwrap());
    assert!(queue.claim("w2", Duration::ZERO).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(600)).await;
    let stolen = queue.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(stolen.id, id);
    assert_eq!(stolen.locked_by.as_deref(), Some("w2"));
    assert_eq!(stolen.attempts, 2);
}

#[tokio::test]
async fn test_queue_priority_then_age() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool);
    let low = queue.enqueue(NewTask::new("a", TaskType::Parse, json!({}))).await.unwrap();
    let high = queue
        .enqueue(NewTask::new("b", TaskType::Chunk, json!({})).priority(5))
        .await
        .unwrap();

    assert_eq!(queue.claim("w", LEASE).await.unwrap().unwrap().id, high);
    assert_eq!(queue.claim("w", LEASE).await.unwrap().unwrap().id, low);
    assert!(queue.claim("w", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_queue_fail_retries_then_fails() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool);
    let id = queue
        .enqueue(NewTask::new("doc", TaskType::Embed, json!({})).max_attempts(2))
        .await
        .unwrap();

    queue.claim("w", LEASE).await.unwrap().unwrap();
    assert!(queue.fail(&id, "w", "timeout").await.unwrap());
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status, TaskStatus::Retrying);

    queue.claim("w", LEASE).await.unwrap().unwrap();
    assert!(!queue.fail(&id, "w", "timeout again").await.unwrap());
    let task = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.last_error.as_deref(), Some("timeout again"));
    assert!(queue.claim("w", LEASE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_queue_abandon_and_unknown_ids() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool);
    let id = queue
        .enqueue(NewTask::new("doc", TaskType::Chunk, json!({})).max_attempts(5))
        .await
        .unwrap();
    queue.claim("w", LEASE).await.unwrap().unwrap();
    queue.abandon(&id, "w", "chunk too long").await.unwrap();
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status, TaskStatus::Failed);

    for err in [
        queue.complete("missing", "w").await.unwrap_err(),
        queue.fail("missing", "w", "x").await.unwrap_err(),
        queue.abandon("missing", "w", "x").await.unwrap_err(),
    ] {
        assert!(!LeaseLost::is(&err));
        assert!(err.to_string().contains("unknown task"));
    }
}

#[tokio::test]
async fn test_queue_stale_worker_cannot_settle_reclaimed_task() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool);
    let id = queue
        .enqueue(NewTask::new("doc", TaskType::Parse, json!({})))
        .await
        .unwrap();

    queue.claim("w1", Duration::from_millis(200)).await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(250)).await;
    let reclaimed = queue.claim("w2", LEASE).await.unwrap().unwrap();
    assert_eq!(reclaimed.id, id);

    assert!(LeaseLost::is(&queue.fail(&id, "w1", "stale").await.unwrap_err()));
    assert!(LeaseLost::is(&queue.abandon(&id, "w1", "stale").await.unwrap_err()));
    assert!(LeaseLost::is(&queue.complete(&id, "w1").await.unwrap_err()));

    let held = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(held.status, TaskStatus::Processing);
    assert_eq!(held.locked_by.as_deref(), Some("w2"));
    assert!(held.last_error.is_none());
    assert!(queue.claim("w3", LEASE).await.unwrap().is_none());

    queue.complete(&id, "w2").await.unwrap();
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_queue_enqueue_unique_skips_open_duplicates() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool);
    let embed = || NewTask::new("doc", TaskType::Embed, json!({}));

    let first = queue.enqueue_unique(embed()).await.unwrap().unwrap();
    assert!(queue.enqueue_unique(embed()).await.unwrap().is_none());
    queue.claim("w", LEASE).await.unwrap().unwrap();
    assert!(queue.enqueue_unique(embed()).await.unwrap().is_none());

    queue.complete(&first, "w").await.unwrap();
    assert!(queue.enqueue_unique(embed()).await.unwrap().is_some());
    assert!(queue
        .enqueue_unique(NewTask::new("doc", TaskType::Index, json!({})))
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_queue_stats_group_by_type_and_status() {
    let (_tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool);
    for doc in ["a", "b", "c"] {
        queue.enqueue(NewTask::new(doc, TaskType::Parse, json!({}))).await.unwrap();
    }
    let claimed = queue.claim("w", LEASE).await.unwrap().unwrap();
    queue.complete(&claimed.id, "w").await.unwrap();

    let stats = queue.stats().await.unwrap();
    let count = |status: TaskStatus| {
        stats
            .iter()
            .filter(|s| s.task_type == TaskType::Parse && s.status == status)
            .map(|s| s.count)
            .sum::<u64>()
    };
    assert_eq!(count(TaskStatus::Pending), 2);
    assert_eq!(count(TaskStatus::Completed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_queue_concurrent_claims_are_exclusive() {
    let (_tmp, pool) = setup().await;
    let queue = Arc::new(SqliteTaskQueue::new(pool));
    for i in 0..20 {
        queue
            .enqueue(NewTask::new(format!("doc-{}", i), TaskType::Parse, json!({})))
            .await
            .unwrap();
    }

    let mut handles = Vec::new();
    for w in 0..4 {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(task) = queue.claim(&format!("w{}", w), LEASE).await.unwrap() {
                mine.push(task.id);
            }
            mine
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "task claimed twice");
        }
    }
    assert_eq!(seen.len(), 20);
}

// ============ Ingestion ============

#[tokio::test]
async fn test_worker_drains_document_to_ready() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path());
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();

    let source = tmp.path().join("aapl_10k_content_list.json");
    std::fs::write(
        &source,
        r#"[
            {"type": "text", "text": "Item 7. Management's Discussion", "text_level": 1, "page_idx": 0},
            {"type": "text", "text": "Total net sales were $383 billion.", "page_idx": 0},
            {"type": "text", "text": "Item 8. Financial Statements", "text_level": 1, "page_idx": 1},
            {"type": "table", "text": "| Net sales | 383,285 |", "page_idx": 1}
        ]"#,
    )
    .unwrap();

    let queue = SqliteTaskQueue::new(pool.clone());
    let submitted = ingest::submit(
        &pool,
        &queue,
        SubmitRequest {
            source,
            owner_id: "u1".to_string(),
            document_id: Some("aapl-10k".to_string()),
            company: Some("Apple".to_string()),
            fiscal_year: Some(2023),
            document_type: Some("10-K".to_string()),
            ..Default::default()
        },
        cfg.worker.max_attempts,
    )
    .await
    .unwrap();
    assert_eq!(submitted.document_id, "aapl-10k");

    let ingestor = Arc::new(app::ingestor(&cfg, &pool).unwrap());
    let report = WorkerPool::new(ingestor, &cfg.worker).drain().await.unwrap();
    assert_eq!(report.completed, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(report.lost, 0);

    let status = ingest::document_status(&pool, "aapl-10k").await.unwrap().unwrap();
    assert_eq!(status.status, "ready");
    assert_eq!(status.page_count, 2);

    let retriever = app::retriever(&cfg, &pool).unwrap();
    let processed = finsight_core::models::ProcessedQuery::passthrough("net sales");
    let results = retriever
        .retrieve(&processed, &SearchFilter::for_owner("u1"), 5)
        .await
        .unwrap();
    assert!(!results.is_empty());
    assert!(results.iter().all(|r| r.chunk.document_id == "aapl-10k"));
}

#[tokio::test]
async fn test_rerun_stage_does_not_fork_chain() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path());
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();

    let source = tmp.path().join("msft_content_list.json");
    std::fs::write(
        &source,
        r#"[{"type": "text", "text": "Azure revenue grew 29%.", "page_idx": 0}]"#,
    )
    .unwrap();
    let queue = SqliteTaskQueue::new(pool.clone());
    ingest::submit(
        &pool,
        &queue,
        SubmitRequest {
            source,
            owner_id: "u1".to_string(),
            document_id: Some("msft".to_string()),
            company: Some("Microsoft".to_string()),
            ..Default::default()
        },
        3,
    )
    .await
    .unwrap();

    let ingestor = app::ingestor(&cfg, &pool).unwrap();
    let parse = queue.claim("w1", LEASE).await.unwrap().unwrap();
    assert_eq!(parse.task_type, TaskType::Parse);
    ingestor.process(&parse).await.unwrap();
    ingestor.process(&parse).await.unwrap();

    let chunk_tasks: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM processing_tasks WHERE document_id = 'msft' AND task_type = 'chunk'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(chunk_tasks, 1);

    // A worker that lost the task cannot fail it or the document.
    let err = anyhow::anyhow!("extraction timed out");
    let lost = ingestor.record_failure(&parse, "w9", &err).await.unwrap_err();
    assert!(LeaseLost::is(&lost));
    let status = ingest::document_status(&pool, "msft").await.unwrap().unwrap();
    assert_ne!(status.status, "failed");
    assert_eq!(
        queue.get(&parse.id).await.unwrap().unwrap().locked_by.as_deref(),
        Some("w1")
    );
}

#[tokio::test]
async fn test_missing_source_marks_document_failed() {
    let tmp = TempDir::new().unwrap();
    let cfg = write_config(tmp.path());
    migrate::run_migrations(&cfg).await.unwrap();
    let pool = db::connect(&cfg).await.unwrap();

    let source = tmp.path().join("gone_content_list.json");
    std::fs::write(&source, "[]").unwrap();
    let queue = SqliteTaskQueue::new(pool.clone());
    ingest::submit(
        &pool,
        &queue,
        SubmitRequest {
            source: source.clone(),
            owner_id: "u1".to_string(),
            document_id: Some("gone".to_string()),
            ..Default::default()
        },
        1,
    )
    .await
    .unwrap();
    std::fs::remove_file(&source).unwrap();

    let ingestor = Arc::new(app::ingestor(&cfg, &pool).unwrap());
    let report = WorkerPool::new(ingestor, &cfg.worker).drain().await.unwrap();
    assert_eq!(report.failed, 1);

    let status = ingest::document_status(&pool, "gone").await.unwrap().unwrap();
    assert_eq!(status.status, "failed");
    assert!(status.error_message.is_some());
}

#[tokio::test]
async fn test_submit_rejects_bad_quarter_and_empty_owner() {
    let (tmp, pool) = setup().await;
    let queue = SqliteTaskQueue::new(pool.clone());
    let source = tmp.path().join("x_content_list.json");
    std::fs::write(&source, "[]").unwrap();

    let empty_owner = SubmitRequest {
        source: source.clone(),
        owner_id: " ".to_string(),
        ..Default::default()
    };
    assert!(ingest::submit(&pool, &queue, empty_owner, 3).await.is_err());

    let bad_quarter = SubmitRequest {
        source,
        owner_id: "u1".to_string(),
        fiscal_quarter: Some(5),
        ..Default::default()
    };
    assert!(ingest::submit(&pool, &queue, bad_quarter, 3).await.is_err());
    assert!(queue.stats().await.unwrap().is_empty());
}

// ============ Memory and turns ============

#[tokio::test]
async fn test_memory_recent_is_scoped_and_ordered() {
    let (_tmp, pool) = setup().await;
    for i in 0..4 {
        memory::record(&pool, "s1", "u1", &format!("turn {}", i)).await.unwrap();
    }
    memory::record(&pool, "s1", "u2", "other owner").await.unwrap();

    let recent = memory::recent(&pool, "s1", "u1", 2).await.unwrap();
    assert_eq!(recent, vec!["turn 2".to_string(), "turn 3".to_string()]);
    assert!(memory::recent(&pool, "s1", "u1", 0).await.unwrap().is_empty());
    assert!(memory::recent(&pool, "s2", "u1", 5).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_answer_turn_over_sqlite_records_memory() {
    let (tmp, pool) = setup().await;
    register(&pool, tmp.path(), "aapl-2023", "u1", "apple").await;

    let embedder = Arc::new(HashingEmbedder::new(128));
    let store = Arc::new(SqliteChunkStore::new(pool.clone(), embedder.model_name()));
    index_text(
        &store,
        &embedder,
        meta("u1", "aapl-2023", "apple"),
        &["Apple total revenue was $383 billion in fiscal 2023."],
    )
    .await;

    let generator = Arc::new(ScriptedGenerator::new());
    generator
        .push(
            GenerationTask::ExtractEntities,
            Ok(json!({"companies": ["Apple"], "year": 2023, "query_type": "factual"})),
        )
        .push(GenerationTask::JudgeSufficiency, Ok(json!({"sufficient": true})))
        .push(GenerationTask::Analyze, Ok(json!({"summary": "Revenue was $383B."})))
        .push(
            GenerationTask::Explain,
            Ok(json!({
                "text": "Apple reported $383 billion of revenue in fiscal 2023.",
                "cited_chunk_ids": ["aapl-2023_chunk_0"]
            })),
        );

    let retriever = HybridRetriever::new(store, embedder, HybridParams::default());
    let pipeline = AnswerPipeline::new(retriever, generator, PipelineSettings::default());

    let (output, pending) = ask::answer_turn(
        &pool,
        &pipeline,
        "What was Apple's revenue in 2023?",
        SearchFilter::for_owner("u1"),
        "s1".to_string(),
    )
    .await
    .unwrap();
    pending.await.unwrap();

    assert!(!output.answer.low_confidence);
    assert_eq!(output.answer.citations.len(), 1);
    assert_eq!(output.retrieval_attempts, 1);
    assert!(output.retrieval_sufficient);

    let history = memory::recent(&pool, "s1", "u1", 5).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].starts_with("Q: What was Apple's revenue in 2023?"));
}
