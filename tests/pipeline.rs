mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use docchunk::error::PipelineError;
use docchunk::models::{ChunkingMethod, TaskStatus};
use docchunk::pipeline::{DerivativesStage, Stage, StageContext};
use docchunk::stats::FixedRate;
use docchunk::store::Store;
use docchunk::tasks::{self, NewTask};

#[tokio::test]
async fn test_semantic_task_succeeds_with_page_numbers() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let task = h.create_default().await;

    let status = h.pipeline().run(&task.id).await.unwrap();
    assert_eq!(status, TaskStatus::Succeeded);

    let task = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert!(task.started_at.is_some());
    assert!(task.finished_at.is_some());
    assert!(task.finished_at >= task.started_at);

    let doc = h.store.get_document_for_task(&task.id).await.unwrap().unwrap();
    assert_eq!(doc.page_count, Some(2));
    assert_eq!(doc.size, Some(b"%PDF-1.4 fake".len() as i64));
    assert_eq!(doc.sha256.as_deref().map(str::len), Some(64));

    let chunks = tasks::list_task_chunks(h.store.as_ref(), &task.id).await.unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].page_numbers, vec![0]);
    assert_eq!(chunks[1].page_numbers, vec![1]);
    assert!(chunks[1].text.starts_with("## Outlook"));
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_number, i as i64);
        assert!(!chunk.text.contains("{0}-"));
        assert!(!chunk.text.contains("{1}-"));
        assert!(chunk.text.chars().count() <= 1024);
    }
}

#[tokio::test]
async fn test_recursive_task_respects_size() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let task = h
        .create(NewTask {
            url: "https://example.com/report.pdf".to_string(),
            chunking_method: Some(ChunkingMethod::Recursive),
            chunk_size: Some(120),
            chunk_overlap: Some(20),
            delete_after_minutes: None,
        })
        .await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Succeeded);

    let chunks = tasks::list_task_chunks(h.store.as_ref(), &task.id).await.unwrap();
    assert!(chunks.len() > 2);
    for chunk in &chunks {
        assert!(chunk.text.chars().count() <= 120, "too long: {:?}", chunk.text);
    }
    // nothing before the first marker, so the opening chunk has no page yet
    assert!(chunks[0].page_numbers.is_empty());
    assert!(chunks.iter().any(|c| c.page_numbers.contains(&1)));
}

#[tokio::test]
async fn test_converter_failure_marks_failed_without_chunks() {
    let mut h = Harness::new("");
    h.converter = Arc::new(FakeConverter(ConverterBehavior::Fail(
        "marker crashed".to_string(),
    )));
    let task = h.create_default().await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Failed);

    let task = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.started_at.is_some());
    assert!(task.finished_at.is_none());
    assert!(tasks::list_task_chunks(h.store.as_ref(), &task.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_empty_markdown_fails() {
    let h = Harness::new("  \n\n ");
    let task = h.create_default().await;
    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Failed);
}

#[tokio::test]
async fn test_download_failure_fails_before_processing() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.downloader = Arc::new(FakeDownloader(None));
    let task = h.create_default().await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Failed);

    let task = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert!(task.started_at.is_none());
    let doc = h.store.get_document_for_task(&task.id).await.unwrap().unwrap();
    assert!(doc.sha256.is_none());
}

#[tokio::test]
async fn test_conversion_timeout_fails_task() {
    let mut h = Harness::new("");
    h.converter = Arc::new(FakeConverter(ConverterBehavior::Slow(
        Duration::from_secs(5),
        TWO_PAGE_MARKDOWN.to_string(),
    )));
    h.settings.conversion_timeout = Duration::from_millis(50);
    let task = h.create_default().await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Failed);
}

#[tokio::test]
async fn test_cancel_during_conversion_stops_pipeline() {
    let mut h = Harness::new("");
    h.converter = Arc::new(FakeConverter(ConverterBehavior::CancelDuring(
        h.store(),
        TWO_PAGE_MARKDOWN.to_string(),
    )));
    let task = h.create_default().await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Cancelled);

    let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(stored.finished_at.is_none());
    assert!(tasks::list_task_chunks(h.store.as_ref(), &task.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_cancel_before_final_write_is_kept() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let task = h.create_default().await;

    // first Processing read is before chunking, the second before the final write
    let status = h.cancelling_pipeline(2).run(&task.id).await.unwrap();
    assert_eq!(status, TaskStatus::Cancelled);

    let stored = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert!(stored.finished_at.is_none());
}

#[tokio::test]
async fn test_cancel_before_failure_write_is_kept() {
    let h = Harness::new("  \n\n ");
    let task = h.create_default().await;

    let status = h.cancelling_pipeline(2).run(&task.id).await.unwrap();
    assert_eq!(status, TaskStatus::Cancelled);
    assert_eq!(
        h.store.get_task(&task.id).await.unwrap().unwrap().status,
        TaskStatus::Cancelled
    );
}

#[tokio::test]
async fn test_cancelled_before_run_is_rejected() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let task = h.create_default().await;
    tasks::cancel_task(h.store.as_ref(), &task.id).await.unwrap();

    let err = h.pipeline().run(&task.id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidState { .. }));
}

#[tokio::test]
async fn test_run_rejects_unknown_and_finished_tasks() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let pipeline = h.pipeline();
    assert!(matches!(
        pipeline.run("missing").await,
        Err(PipelineError::NotFound { .. })
    ));

    let task = h.create_default().await;
    pipeline.run(&task.id).await.unwrap();
    assert!(matches!(
        pipeline.run(&task.id).await,
        Err(PipelineError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_estimate_uses_historical_rate() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.stats = Arc::new(FixedRate(Some(2.0)));
    h.pages = 10;
    let task = h.create_default().await;

    h.pipeline().run(&task.id).await.unwrap();

    let task = h.store.get_task(&task.id).await.unwrap().unwrap();
    let started = task.started_at.unwrap();
    let estimate = task.estimated_finished_at.unwrap();
    let secs = (estimate - started).num_seconds();
    assert!((19..=21).contains(&secs), "estimate was {}s", secs);
}

#[tokio::test]
async fn test_no_history_leaves_estimate_empty() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let task = h.create_default().await;
    h.pipeline().run(&task.id).await.unwrap();

    let task = h.store.get_task(&task.id).await.unwrap().unwrap();
    assert!(task.estimated_finished_at.is_none());
}

#[tokio::test]
async fn test_enrichment_failures_are_not_fatal() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.seed_prompts().await;
    h.settings.generate_derivatives = true;
    h.settings.generate_embeddings = true;
    h.completion = Some(Arc::new(FakeCompletion {
        fail_on: Some("Outlook".to_string()),
        ..FakeCompletion::new("```json\n[\"What grew?\", \"Where?\"]\n```")
    }));
    h.embedder = Some(Arc::new(FakeEmbedder::new(4)));
    let task = h.create_default().await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Succeeded);

    let chunks = tasks::list_task_chunks(h.store.as_ref(), &task.id).await.unwrap();
    let first = h.store.list_derivatives(&chunks[0].id).await.unwrap();
    // two prompts, two entries each
    assert_eq!(first.len(), 4);
    assert!(first.iter().all(|d| d.llm_model == "fake-llm"));
    assert!(h.store.list_derivatives(&chunks[1].id).await.unwrap().is_empty());

    for chunk in &chunks {
        let emb = h.store.get_embedding(&chunk.id, "fake-embed").await.unwrap().unwrap();
        assert_eq!(emb.dims, 4);
        assert_eq!(emb.vector.len(), 4);
    }
}

#[tokio::test]
async fn test_slow_enrichment_is_bounded_per_call() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.seed_prompts().await;
    h.settings.generate_derivatives = true;
    h.settings.enrichment_concurrency = 1;
    h.settings.stage_timeout = Duration::from_secs(1);
    h.completion = Some(Arc::new(FakeCompletion {
        delay: Some(Duration::from_millis(400)),
        ..FakeCompletion::new("A short summary.")
    }));
    let task = h.create_default().await;

    // four calls in sequence outlast the per-call bound, but none exceeds it
    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Succeeded);
    let chunks = tasks::list_task_chunks(h.store.as_ref(), &task.id).await.unwrap();
    for chunk in &chunks {
        assert_eq!(h.store.list_derivatives(&chunk.id).await.unwrap().len(), 2);
    }
}

#[tokio::test]
async fn test_enrichment_call_timeout_skips_chunk() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.seed_prompts().await;
    h.settings.generate_derivatives = true;
    h.settings.stage_timeout = Duration::from_millis(50);
    h.completion = Some(Arc::new(FakeCompletion {
        delay: Some(Duration::from_secs(5)),
        ..FakeCompletion::new("A short summary.")
    }));
    let task = h.create_default().await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Succeeded);
    let chunks = tasks::list_task_chunks(h.store.as_ref(), &task.id).await.unwrap();
    for chunk in &chunks {
        assert!(h.store.list_derivatives(&chunk.id).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn test_embedding_dimension_mismatch_skips_chunk() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.settings.generate_embeddings = true;
    h.embedder = Some(Arc::new(FakeEmbedder {
        returned_dims: 3,
        ..FakeEmbedder::new(4)
    }));
    let task = h.create_default().await;

    assert_eq!(h.pipeline().run(&task.id).await.unwrap(), TaskStatus::Succeeded);
    let chunks = tasks::list_task_chunks(h.store.as_ref(), &task.id).await.unwrap();
    for chunk in &chunks {
        assert!(h.store.get_embedding(&chunk.id, "fake-embed").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn test_derivatives_stage_skips_existing() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.seed_prompts().await;
    let task = h.create_default().await;
    h.pipeline().run(&task.id).await.unwrap();

    let completion = Arc::new(FakeCompletion::new("A short summary."));
    h.completion = Some(completion.clone());
    let ctx = StageContext {
        settings: h.settings.clone(),
        collaborators: h.collaborators(),
    };
    let stage = DerivativesStage::new(completion.clone());
    let mut task = h.store.get_task(&task.id).await.unwrap().unwrap();

    stage.run(&ctx, &mut task).await.unwrap();
    // two chunks, two prompts
    assert_eq!(completion.calls.load(Ordering::SeqCst), 4);

    stage.run(&ctx, &mut task).await.unwrap();
    assert_eq!(completion.calls(), 4);
}

#[test]
fn test_enabled_stage_requires_provider() {
    let mut h = Harness::new(TWO_PAGE_MARKDOWN);
    h.settings.generate_derivatives = true;
    assert!(docchunk::pipeline::DocumentPipeline::new(h.settings.clone(), h.collaborators()).is_err());
}

#[tokio::test]
async fn test_process_pending_runs_oldest_first() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let a = h.create_default().await;
    let b = h.create_default().await;
    let c = h.create_default().await;
    tasks::cancel_task(h.store.as_ref(), &c.id).await.unwrap();

    let pipeline = Arc::new(h.pipeline());
    let dry = tasks::process_pending(pipeline.clone(), 10, 2, true).await.unwrap();
    assert_eq!(dry.selected, vec![a.id.clone(), b.id.clone()]);
    assert_eq!(dry.succeeded, 0);
    assert_eq!(
        h.store.get_task(&a.id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );

    let summary = tasks::process_pending(pipeline, 10, 2, false).await.unwrap();
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);

    let totals = h.store.processing_totals().await.unwrap();
    assert_eq!(totals.tasks, 2);
    assert_eq!(totals.pages, 4);
}
