//! Caller-facing task operations shared by the CLI and the HTTP server.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::chunk::ChunkingParams;
use crate::config::TasksConfig;
use crate::error::PipelineError;
use crate::models::{Chunk, ChunkingMethod, Document, Task, TaskStatus};
use crate::pipeline::DocumentPipeline;
use crate::store::Store;

/// A request to process one document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub url: String,
    #[serde(default)]
    pub chunking_method: Option<ChunkingMethod>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    #[serde(default)]
    pub chunk_overlap: Option<usize>,
    /// Minutes after creation at which the task may be purged.
    #[serde(default)]
    pub delete_after_minutes: Option<i64>,
}

/// A task together with its document.
#[derive(Debug, Clone, Serialize)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub document: Option<Document>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessSummary {
    pub selected: Vec<String>,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub errors: usize,
}

fn validate_url(url: &str) -> Result<(), PipelineError> {
    let url = url.trim();
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(PipelineError::InvalidRequest(format!(
            "url must be an absolute http(s) URL, got '{}'",
            url
        ))),
    }
}

/// Validate a request and create a `Pending` task with its document.
pub async fn create_task(
    store: &dyn Store,
    defaults: &TasksConfig,
    request: NewTask,
) -> Result<Task, PipelineError> {
    validate_url(&request.url)?;

    let params = ChunkingParams::new(
        request.chunking_method.unwrap_or(defaults.chunking_method),
        request.chunk_size.unwrap_or(defaults.chunk_size),
        request.chunk_overlap.unwrap_or(defaults.chunk_overlap),
    );
    params.validate()?;

    if let Some(minutes) = request.delete_after_minutes {
        if minutes < 0 {
            return Err(PipelineError::InvalidRequest(
                "delete_after_minutes must be >= 0".to_string(),
            ));
        }
    }

    let now = Utc::now();
    let expires_at = minutes_after(now, defaults.deletion_delay_minutes, "deletion_delay_minutes")?;
    let delete_at = request
        .delete_after_minutes
        .map(|m| minutes_after(now, m, "delete_after_minutes"))
        .transpose()?;
    let task = Task {
        id: Uuid::new_v4().to_string(),
        chunking_method: params.method,
        chunk_size: params.chunk_size,
        chunk_overlap: params.chunk_overlap,
        status: TaskStatus::Pending,
        created_at: now,
        started_at: None,
        estimated_finished_at: None,
        finished_at: None,
        expires_at: Some(expires_at),
        delete_at,
    };
    let document = Document {
        id: Uuid::new_v4().to_string(),
        task_id: task.id.clone(),
        url: request.url.trim().to_string(),
        sha256: None,
        size: None,
        page_count: None,
        markdown: None,
        created_at: now,
        updated_at: now,
    };

    store.create_task(&task).await?;
    store.create_document(&document).await?;
    info!(task_id = %task.id, url = %document.url, method = %task.chunking_method, "task created");
    Ok(task)
}

pub async fn get_task(store: &dyn Store, id: &str) -> Result<TaskView, PipelineError> {
    let task = store
        .get_task(id)
        .await?
        .ok_or_else(|| PipelineError::task_not_found(id))?;
    let document = store.get_document_for_task(id).await?;
    Ok(TaskView { task, document })
}

/// Cancel a non-terminal task.
///
/// The write only lands on the status that was read; if the pipeline moved
/// the task on meanwhile the cancel is retried against the new status.
pub async fn cancel_task(store: &dyn Store, id: &str) -> Result<Task, PipelineError> {
    loop {
        let mut task = store
            .get_task(id)
            .await?
            .ok_or_else(|| PipelineError::task_not_found(id))?;
        let expected = task.status;
        task.cancel(Utc::now())?;
        if store.update_task_if(&task, expected).await? {
            info!(task_id = %id, "task cancelled");
            return Ok(task);
        }
        // statuses only move forward, so this ends at a terminal status
    }
}

/// `now + minutes`, or `InvalidRequest` when the result is out of range.
fn minutes_after(
    now: DateTime<Utc>,
    minutes: i64,
    field: &str,
) -> Result<DateTime<Utc>, PipelineError> {
    Duration::try_minutes(minutes)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| PipelineError::InvalidRequest(format!("{} is out of range: {}", field, minutes)))
}

/// Delete a task and everything it owns. Refused while it is processing.
pub async fn delete_task(store: &dyn Store, id: &str) -> Result<(), PipelineError> {
    let task = store
        .get_task(id)
        .await?
        .ok_or_else(|| PipelineError::task_not_found(id))?;
    if task.status == TaskStatus::Processing {
        return Err(PipelineError::InvalidState {
            task_id: task.id,
            status: task.status,
            action: "delete",
        });
    }
    store.delete_task(id).await?;
    info!(task_id = %id, "task deleted");
    Ok(())
}

pub async fn list_task_chunks(store: &dyn Store, id: &str) -> Result<Vec<Chunk>, PipelineError> {
    if store.get_task(id).await?.is_none() {
        return Err(PipelineError::task_not_found(id));
    }
    match store.get_document_for_task(id).await? {
        Some(doc) => Ok(store.list_chunks(&doc.id).await?),
        None => Ok(Vec::new()),
    }
}

/// Run up to `limit` pending tasks, oldest first, with at most
/// `max_concurrent` in flight. With `dry_run` only the selection is returned.
pub async fn process_pending(
    pipeline: Arc<DocumentPipeline>,
    limit: i64,
    max_concurrent: usize,
    dry_run: bool,
) -> Result<ProcessSummary, PipelineError> {
    let pending = pipeline
        .store()
        .list_tasks(Some(TaskStatus::Pending), limit)
        .await?;
    let mut summary = ProcessSummary {
        selected: pending.iter().map(|t| t.id.clone()).collect(),
        ..ProcessSummary::default()
    };
    if dry_run || pending.is_empty() {
        return Ok(summary);
    }

    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut set = JoinSet::new();
    for task in pending {
        let pipeline = pipeline.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = pipeline.run(&task.id).await;
            (task.id, result)
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(TaskStatus::Succeeded))) => summary.succeeded += 1,
            Ok((_, Ok(TaskStatus::Cancelled))) => summary.cancelled += 1,
            Ok((_, Ok(_))) => summary.failed += 1,
            Ok((task_id, Err(e))) => {
                summary.errors += 1;
                warn!(task_id = %task_id, error = %e, "task could not be run");
            }
            Err(e) => {
                summary.errors += 1;
                warn!(error = %e, "pipeline worker panicked");
            }
        }
    }
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        errors = summary.errors,
        "pending tasks processed"
    );
    Ok(summary)
}

/// Delete every task whose purge time has passed. Returns the purged ids.
///
/// Tasks still processing are skipped.
pub async fn purge_expired(
    store: &dyn Store,
    now: DateTime<Utc>,
    include_null_dates: bool,
) -> Result<Vec<String>, PipelineError> {
    let due = store.tasks_due_for_purge(now, include_null_dates).await?;
    let mut purged = Vec::with_capacity(due.len());
    for id in due {
        match delete_task(store, &id).await {
            Ok(()) => purged.push(id),
            Err(PipelineError::InvalidState { .. }) => {
                warn!(task_id = %id, "task is processing, not purged");
            }
            Err(PipelineError::NotFound { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    info!(count = purged.len(), "expired tasks purged");
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn request(url: &str) -> NewTask {
        NewTask {
            url: url.to_string(),
            ..NewTask::default()
        }
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("https://example.com/a.pdf").is_ok());
        assert!(validate_url("http://localhost:8000/x").is_ok());
        assert!(validate_url("ftp://example.com/a.pdf").is_err());
        assert!(validate_url("https://").is_err());
        assert!(validate_url("").is_err());
    }

    #[tokio::test]
    async fn test_create_fills_defaults_and_dates() {
        let store = InMemoryStore::new();
        let defaults = TasksConfig::default();
        let mut req = request("https://example.com/a.pdf");
        req.delete_after_minutes = Some(10);
        let task = create_task(&store, &defaults, req).await.unwrap();

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.chunking_method, ChunkingMethod::Semantic);
        assert_eq!(task.chunk_size, 1024);
        assert_eq!(
            task.expires_at,
            Some(task.created_at + Duration::minutes(43200))
        );
        assert_eq!(task.delete_at, Some(task.created_at + Duration::minutes(10)));

        let view = get_task(&store, &task.id).await.unwrap();
        assert_eq!(view.document.unwrap().url, "https://example.com/a.pdf");
    }

    #[tokio::test]
    async fn test_create_rejects_bad_overlap() {
        let store = InMemoryStore::new();
        let mut req = request("https://example.com/a.pdf");
        req.chunking_method = Some(ChunkingMethod::Recursive);
        req.chunk_size = Some(100);
        req.chunk_overlap = Some(100);
        let err = create_task(&store, &TasksConfig::default(), req)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
        assert!(store.list_tasks(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_out_of_range_delete_after() {
        let store = InMemoryStore::new();
        let err = create_task(
            &store,
            &TasksConfig::default(),
            NewTask {
                delete_after_minutes: Some(i64::MAX),
                ..request("https://e.com/a")
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "bad_request");
        assert!(err.to_string().contains("delete_after_minutes"));

        let huge_delay = TasksConfig {
            deletion_delay_minutes: i64::MAX / 2,
            ..TasksConfig::default()
        };
        let err = create_task(&store, &huge_delay, request("https://e.com/b"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "bad_request");
        assert!(store.list_tasks(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_twice_is_invalid_state() {
        let store = InMemoryStore::new();
        let task = create_task(&store, &TasksConfig::default(), request("https://e.com/a"))
            .await
            .unwrap();
        let cancelled = cancel_task(&store, &task.id).await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        let err = cancel_task(&store, &task.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_unknown_task_is_not_found() {
        let store = InMemoryStore::new();
        assert!(matches!(
            get_task(&store, "nope").await,
            Err(PipelineError::NotFound { .. })
        ));
        assert!(matches!(
            cancel_task(&store, "nope").await,
            Err(PipelineError::NotFound { .. })
        ));
        assert!(matches!(
            list_task_chunks(&store, "nope").await,
            Err(PipelineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_refused_while_processing() {
        let store = InMemoryStore::new();
        let mut task = create_task(&store, &TasksConfig::default(), request("https://e.com/a"))
            .await
            .unwrap();
        task.status = TaskStatus::Processing;
        store.update_task(&task).await.unwrap();
        assert!(matches!(
            delete_task(&store, &task.id).await,
            Err(PipelineError::InvalidState { .. })
        ));

        task.status = TaskStatus::Failed;
        store.update_task(&task).await.unwrap();
        delete_task(&store, &task.id).await.unwrap();
        assert!(store.get_task(&task.id).await.unwrap().is_none());
        assert!(store.get_document_for_task(&task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_purge_uses_delete_at_then_expires_at() {
        let store = InMemoryStore::new();
        let defaults = TasksConfig {
            deletion_delay_minutes: 60,
            ..TasksConfig::default()
        };
        let short = create_task(
            &store,
            &defaults,
            NewTask {
                delete_after_minutes: Some(1),
                ..request("https://e.com/a")
            },
        )
        .await
        .unwrap();
        let long = create_task(&store, &defaults, request("https://e.com/b"))
            .await
            .unwrap();

        let in_five = Utc::now() + Duration::minutes(5);
        let purged = purge_expired(&store, in_five, false).await.unwrap();
        assert_eq!(purged, vec![short.id.clone()]);
        assert!(store.get_task(&long.id).await.unwrap().is_some());

        let in_two_hours = Utc::now() + Duration::minutes(120);
        let purged = purge_expired(&store, in_two_hours, false).await.unwrap();
        assert_eq!(purged, vec![long.id]);
    }
}
