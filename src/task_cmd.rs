//! CLI entry points for the task commands.
//!
//! Results are printed to stdout as JSON so scripts can consume them; logs
//! go to stderr.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::chunk::{chunk_document, ChunkingParams};
use crate::config::Config;
use crate::db;
use crate::models::ChunkingMethod;
use crate::pipeline::DocumentPipeline;
use crate::store::SqliteStore;
use crate::tasks::{self, NewTask};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn open(config: &Config) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(db::open_store(config).await?))
}

/// Create a task. With `wait`, run it through the pipeline before returning.
pub async fn run_task_create(config: &Config, request: NewTask, wait: bool) -> Result<()> {
    let store = open(config).await?;
    let task = tasks::create_task(store.as_ref(), &config.tasks, request).await?;

    if wait {
        let pipeline = DocumentPipeline::from_config(config, store.clone())?;
        pipeline.run(&task.id).await?;
        print_json(&tasks::get_task(store.as_ref(), &task.id).await?)?;
    } else {
        print_json(&task)?;
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_task_show(config: &Config, id: &str) -> Result<()> {
    let store = open(config).await?;
    print_json(&tasks::get_task(store.as_ref(), id).await?)?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_task_cancel(config: &Config, id: &str) -> Result<()> {
    let store = open(config).await?;
    print_json(&tasks::cancel_task(store.as_ref(), id).await?)?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_task_delete(config: &Config, id: &str) -> Result<()> {
    let store = open(config).await?;
    tasks::delete_task(store.as_ref(), id).await?;
    println!("deleted {}", id);
    store.pool().close().await;
    Ok(())
}

pub async fn run_task_chunks(config: &Config, id: &str) -> Result<()> {
    let store = open(config).await?;
    print_json(&tasks::list_task_chunks(store.as_ref(), id).await?)?;
    store.pool().close().await;
    Ok(())
}

pub async fn run_process_pending(config: &Config, limit: i64, dry_run: bool) -> Result<()> {
    let store = open(config).await?;
    let pipeline = Arc::new(DocumentPipeline::from_config(config, store.clone())?);
    let summary = tasks::process_pending(
        pipeline,
        limit,
        config.pipeline.max_concurrent_tasks,
        dry_run,
    )
    .await?;

    if dry_run {
        println!("process-pending (dry-run)");
        println!("  pending tasks: {}", summary.selected.len());
        for id in &summary.selected {
            println!("    {}", id);
        }
    } else {
        println!("process-pending");
        println!("  selected:  {}", summary.selected.len());
        println!("  succeeded: {}", summary.succeeded);
        println!("  failed:    {}", summary.failed);
        println!("  cancelled: {}", summary.cancelled);
        if summary.errors > 0 {
            println!("  errors:    {}", summary.errors);
        }
    }

    store.pool().close().await;
    Ok(())
}

pub async fn run_purge(config: &Config, include_null_dates: bool) -> Result<()> {
    let store = open(config).await?;
    let purged = tasks::purge_expired(store.as_ref(), Utc::now(), include_null_dates).await?;
    println!("purge");
    println!("  deleted tasks: {}", purged.len());
    store.pool().close().await;
    Ok(())
}

/// Chunk a local markdown file without touching the database.
///
/// Parameters fall back to the `[tasks]` defaults.
pub async fn run_chunk_file(
    config: &Config,
    path: &Path,
    method: Option<ChunkingMethod>,
    chunk_size: Option<usize>,
    chunk_overlap: Option<usize>,
) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let defaults = config.tasks.default_params();
    let params = ChunkingParams::new(
        method.unwrap_or(defaults.method),
        chunk_size.unwrap_or(defaults.chunk_size),
        chunk_overlap.unwrap_or(defaults.chunk_overlap),
    );
    let document_id = path.display().to_string();
    let chunks = chunk_document(&document_id, &text, &params)?;
    print_json(&chunks)
}
