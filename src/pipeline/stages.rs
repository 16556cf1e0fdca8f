//! The four pipeline stages.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{chunk_document, sha256_hex, ChunkingParams};
use crate::completion::{derivative_prompt, split_reply, CompletionProvider};
use crate::embedding::EmbeddingProvider;
use crate::error::PipelineError;
use crate::models::{Chunk, ChunkDerivative, ChunkEmbedding, Prompt, Task};
use crate::store::Store;

use super::{PipelineSettings, Stage, StageContext};

/// Download, estimate, convert to markdown.
pub struct ConversionStage;

#[async_trait]
impl Stage for ConversionStage {
    fn name(&self) -> &'static str {
        "conversion"
    }

    fn timeout(&self, settings: &PipelineSettings) -> Option<Duration> {
        Some(settings.conversion_timeout)
    }

    async fn run(&self, ctx: &StageContext, task: &mut Task) -> Result<(), PipelineError> {
        let c = &ctx.collaborators;
        let mut doc = ctx.load_document(&task.id).await?;

        let bytes = c
            .downloader
            .fetch(&doc.url)
            .await
            .map_err(|e| PipelineError::DownloadFailure {
                url: doc.url.clone(),
                reason: format!("{:#}", e),
            })?;
        doc.sha256 = Some(sha256_hex(&bytes));
        doc.size = Some(bytes.len() as i64);

        let counter = c.page_counter.clone();
        let (bytes, pages) = tokio::task::spawn_blocking(move || {
            let pages = counter.page_count(&bytes);
            (bytes, pages)
        })
        .await
        .map_err(|e| PipelineError::ConversionFailure(format!("page count failed: {}", e)))?;

        let now = Utc::now();
        let estimate = match c.stats.average_seconds_per_page().await {
            Ok(Some(rate)) => estimate_finish(now, rate, pages),
            Ok(None) => None,
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "could not compute processing estimate");
                None
            }
        };

        let expected = task.status;
        task.start_processing(now, estimate)?;
        ctx.save_task(task, expected).await?;
        ctx.store().update_document(&doc).await?;
        info!(
            task_id = %task.id,
            bytes = bytes.len(),
            pages,
            estimated_finished_at = ?task.estimated_finished_at,
            "processing started"
        );

        let conversion = c
            .converter
            .convert(&bytes)
            .await
            .map_err(|e| PipelineError::ConversionFailure(format!("{:#}", e)))?;
        info!(
            task_id = %task.id,
            markdown_chars = conversion.markdown.chars().count(),
            images = conversion.images.len(),
            "conversion finished"
        );

        doc.markdown = Some(conversion.markdown);
        doc.page_count = Some(i64::from(pages));
        doc.updated_at = Utc::now();
        ctx.store().update_document(&doc).await?;
        Ok(())
    }
}

/// `now + rate * pages` seconds; `None` if it does not fit a timestamp.
fn estimate_finish(now: DateTime<Utc>, seconds_per_page: f64, pages: u32) -> Option<DateTime<Utc>> {
    let millis = (seconds_per_page * f64::from(pages) * 1000.0).round();
    if !millis.is_finite() {
        return None;
    }
    TimeDelta::try_milliseconds(millis as i64).and_then(|d| now.checked_add_signed(d))
}

/// Split the markdown and replace the document's chunk set.
pub struct ChunkingStage;

#[async_trait]
impl Stage for ChunkingStage {
    fn name(&self) -> &'static str {
        "chunking"
    }

    async fn run(&self, ctx: &StageContext, task: &mut Task) -> Result<(), PipelineError> {
        let doc = ctx.load_document(&task.id).await?;
        let markdown = doc
            .markdown
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .ok_or_else(|| PipelineError::EmptyContent(doc.id.clone()))?;

        let params = ChunkingParams::from_task(task);
        let chunks = chunk_document(&doc.id, markdown, &params).map_err(|e| match e {
            PipelineError::InvalidRequest(msg) => PipelineError::ChunkingFailure(msg),
            other => other,
        })?;
        if chunks.is_empty() {
            return Err(PipelineError::EmptyContent(doc.id));
        }

        ctx.store().replace_chunks(&doc.id, &chunks).await?;
        info!(
            task_id = %task.id,
            method = %params.method,
            chunks = chunks.len(),
            "chunks stored"
        );
        Ok(())
    }
}

/// Generate summaries, questions and other prompt output per chunk.
pub struct DerivativesStage {
    provider: Arc<dyn CompletionProvider>,
}

impl DerivativesStage {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Stage for DerivativesStage {
    fn name(&self) -> &'static str {
        "derivatives"
    }

    fn timeout(&self, _settings: &PipelineSettings) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: &StageContext, task: &mut Task) -> Result<(), PipelineError> {
        let doc = ctx.load_document(&task.id).await?;
        let prompts = ctx.store().list_active_prompts().await?;
        let chunks = ctx.store().list_chunks(&doc.id).await?;

        let mut jobs: Vec<(Prompt, Chunk)> = Vec::new();
        for prompt in &prompts {
            for chunk in &chunks {
                if ctx.store().has_derivative(&chunk.id, &prompt.id).await? {
                    continue;
                }
                jobs.push((prompt.clone(), chunk.clone()));
            }
        }
        let skipped = prompts.len() * chunks.len() - jobs.len();

        let store = ctx.collaborators.store.clone();
        let provider = self.provider.clone();
        let limit = ctx.settings.stage_timeout;
        let (done, failed) = run_bounded(jobs, ctx.settings.enrichment_concurrency, |(prompt, chunk)| {
            derive_chunk(store.clone(), provider.clone(), limit, prompt, chunk)
        })
        .await;

        info!(task_id = %task.id, done, failed, skipped, "derivatives generated");
        Ok(())
    }
}

async fn derive_chunk(
    store: Arc<dyn Store>,
    provider: Arc<dyn CompletionProvider>,
    limit: Duration,
    prompt: Prompt,
    chunk: Chunk,
) -> Result<(), PipelineError> {
    let enrichment_err = |reason: String| PipelineError::EnrichmentFailure {
        chunk_id: chunk.id.clone(),
        reason,
    };

    let full_prompt = derivative_prompt(&prompt.content, &chunk.text);
    let call = provider.complete(&full_prompt);
    let reply = tokio::time::timeout(limit, call)
        .await
        .map_err(|_| enrichment_err(format!("{}: timed out after {}s", prompt.name, limit.as_secs())))?
        .map_err(|e| enrichment_err(format!("{}: {:#}", prompt.name, e)))?;

    let now = Utc::now();
    let derivatives: Vec<ChunkDerivative> = split_reply(&reply)
        .into_iter()
        .map(|content| ChunkDerivative {
            id: Uuid::new_v4().to_string(),
            chunk_id: chunk.id.clone(),
            prompt_id: prompt.id.clone(),
            kind: prompt.kind.clone(),
            content,
            llm_provider: provider.provider_name().to_string(),
            llm_model: provider.model_name().to_string(),
            created_at: now,
        })
        .collect();
    if derivatives.is_empty() {
        return Err(enrichment_err(format!("{}: empty reply", prompt.name)));
    }

    store.insert_derivatives(&derivatives).await?;
    debug!(chunk_id = %chunk.id, prompt = %prompt.name, count = derivatives.len(), "derivatives stored");
    Ok(())
}

/// Embed every chunk that has no vector for the provider's model yet.
pub struct EmbeddingsStage {
    provider: Arc<dyn EmbeddingProvider>,
}

impl EmbeddingsStage {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl Stage for EmbeddingsStage {
    fn name(&self) -> &'static str {
        "embeddings"
    }

    fn timeout(&self, _settings: &PipelineSettings) -> Option<Duration> {
        None
    }

    async fn run(&self, ctx: &StageContext, task: &mut Task) -> Result<(), PipelineError> {
        let doc = ctx.load_document(&task.id).await?;
        let chunks = ctx.store().list_chunks(&doc.id).await?;
        let model = self.provider.model_name().to_string();

        let mut pending = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if !ctx.store().has_embedding(&chunk.id, &model).await? {
                pending.push(chunk);
            }
        }

        let store = ctx.collaborators.store.clone();
        let provider = self.provider.clone();
        let limit = ctx.settings.stage_timeout;
        let (done, failed) = run_bounded(pending, ctx.settings.enrichment_concurrency, |chunk| {
            embed_chunk(store.clone(), provider.clone(), limit, chunk)
        })
        .await;

        info!(task_id = %task.id, model = %model, done, failed, "embeddings generated");
        Ok(())
    }
}

async fn embed_chunk(
    store: Arc<dyn Store>,
    provider: Arc<dyn EmbeddingProvider>,
    limit: Duration,
    chunk: Chunk,
) -> Result<(), PipelineError> {
    let enrichment_err = |reason: String| PipelineError::EnrichmentFailure {
        chunk_id: chunk.id.clone(),
        reason,
    };

    let vector = tokio::time::timeout(limit, provider.embed(&chunk.text))
        .await
        .map_err(|_| enrichment_err(format!("timed out after {}s", limit.as_secs())))?
        .map_err(|e| enrichment_err(format!("{:#}", e)))?;

    if vector.len() != provider.dims() {
        return Err(enrichment_err(format!(
            "expected {} dimensions, got {}",
            provider.dims(),
            vector.len()
        )));
    }

    store
        .upsert_embedding(&ChunkEmbedding {
            chunk_id: chunk.id,
            provider: provider.provider_name().to_string(),
            model: provider.model_name().to_string(),
            dims: vector.len(),
            vector,
            created_at: Utc::now(),
        })
        .await?;
    Ok(())
}

/// Run `job` over `items` with at most `limit` in flight.
///
/// Failures are logged and counted, never propagated. Returns
/// `(succeeded, failed)`.
async fn run_bounded<T, F, Fut>(items: Vec<T>, limit: usize, job: F) -> (usize, usize)
where
    T: Send + 'static,
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), PipelineError>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(limit.max(1)));
    let mut set = JoinSet::new();

    for item in items {
        let fut = job(item);
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            fut.await
        });
    }

    let mut done = 0;
    let mut failed = 0;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => done += 1,
            Ok(Err(PipelineError::EnrichmentFailure { chunk_id, reason })) => {
                failed += 1;
                warn!(chunk_id = %chunk_id, error = %reason, "enrichment failed, chunk skipped");
            }
            Ok(Err(e)) => {
                failed += 1;
                warn!(error = %e, "enrichment failed, chunk skipped");
            }
            Err(e) => {
                failed += 1;
                warn!(error = %e, "enrichment worker panicked");
            }
        }
    }
    (done, failed)
}
