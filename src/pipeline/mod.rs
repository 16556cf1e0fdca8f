//! Document pipeline: drives one task through its stages.
//!
//! # Stages
//!
//! ```text
//! Conversion ──▶ Chunking ──▶ [Derivatives] ──▶ [Embeddings]
//! ```
//!
//! The stage list is fixed at construction from the enable flags in
//! [`PipelineSettings`]. Stages run strictly in order for one task.
//!
//! # Run protocol
//!
//! 1. A `Pending` task moves to `Starting`. Terminal or `Processing` tasks
//!    are rejected with `InvalidState`.
//! 2. Before every stage the task is re-read; a `Cancelled` task ends the
//!    run with no further writes.
//! 3. Conversion and chunking run under a stage timeout (conversion has a
//!    long one). The enrichment stages instead bound every provider call,
//!    so their total time may grow with the chunk count.
//! 4. Any stage error marks the task `Failed` and stops the chain, unless
//!    the task was cancelled meanwhile, in which case it stays `Cancelled`.
//! 5. After the last stage the task moves to `Succeeded`.
//!
//! Status writes go through [`Store::update_task_if`] with the status read
//! just before, so a cancel landing between the read and the write is never
//! overwritten.
//!
//! [`DocumentPipeline::run`] returns the status the task ended in; errors
//! are only returned for problems with the request itself (`NotFound`,
//! `InvalidState`) or for store failures while recording the outcome.

pub mod stages;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::completion::{self, CompletionProvider};
use crate::config::Config;
use crate::convert::{Converter, MarkerConverter, PageCounter, PdfPageCounter};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::PipelineError;
use crate::fetch::{Downloader, HttpDownloader};
use crate::models::{Document, Task, TaskStatus};
use crate::stats::{HistoricalStats, StoreHistoricalStats};
use crate::store::Store;

pub use stages::{ChunkingStage, ConversionStage, DerivativesStage, EmbeddingsStage};

/// Explicit pipeline settings, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub conversion_timeout: Duration,
    pub stage_timeout: Duration,
    pub enrichment_concurrency: usize,
    pub generate_derivatives: bool,
    pub generate_embeddings: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            conversion_timeout: config.conversion_timeout(),
            stage_timeout: config.stage_timeout(),
            enrichment_concurrency: config.pipeline.enrichment_concurrency.max(1),
            generate_derivatives: config.tasks.generate_chunk_derivatives,
            generate_embeddings: config.tasks.generate_embeddings,
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            conversion_timeout: Duration::from_secs(7200),
            stage_timeout: Duration::from_secs(300),
            enrichment_concurrency: 4,
            generate_derivatives: false,
            generate_embeddings: false,
        }
    }
}

/// External collaborators the stages call.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn Store>,
    pub downloader: Arc<dyn Downloader>,
    pub converter: Arc<dyn Converter>,
    pub page_counter: Arc<dyn PageCounter>,
    pub stats: Arc<dyn HistoricalStats>,
    pub completion: Option<Arc<dyn CompletionProvider>>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Collaborators {
    /// Production collaborators: HTTP download, marker conversion, lopdf
    /// page counts, store-backed history and the configured providers.
    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let completion = if config.tasks.generate_chunk_derivatives {
            Some(completion::create_provider(&config.completion)?)
        } else {
            None
        };
        let embedder = if config.tasks.generate_embeddings {
            Some(embedding::create_provider(&config.embedding)?)
        } else {
            None
        };
        Ok(Self {
            downloader: Arc::new(HttpDownloader::new(Duration::from_secs(
                config.conversion.download_timeout_secs,
            ))?),
            converter: Arc::new(MarkerConverter::from_config(&config.conversion)),
            page_counter: Arc::new(PdfPageCounter),
            stats: Arc::new(StoreHistoricalStats::new(store.clone())),
            store,
            completion,
            embedder,
        })
    }
}

/// Shared state handed to every stage.
pub struct StageContext {
    pub settings: PipelineSettings,
    pub collaborators: Collaborators,
}

impl StageContext {
    pub fn store(&self) -> &dyn Store {
        self.collaborators.store.as_ref()
    }

    pub async fn load_task(&self, task_id: &str) -> Result<Task, PipelineError> {
        self.store()
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::task_not_found(task_id))
    }

    pub async fn load_document(&self, task_id: &str) -> Result<Document, PipelineError> {
        self.store()
            .get_document_for_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound {
                kind: "document",
                id: task_id.to_string(),
            })
    }

    /// Persist `task` if its stored status is still `expected`.
    ///
    /// A task that moved on in the meantime, usually by being cancelled, is
    /// reported as `InvalidState` with its current status.
    pub async fn save_task(&self, task: &Task, expected: TaskStatus) -> Result<(), PipelineError> {
        if self.store().update_task_if(task, expected).await? {
            return Ok(());
        }
        let stored = self.load_task(&task.id).await?;
        Err(PipelineError::InvalidState {
            task_id: task.id.clone(),
            status: stored.status,
            action: "continue processing",
        })
    }
}

/// One step of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Bound on the whole stage, `None` for no bound.
    fn timeout(&self, settings: &PipelineSettings) -> Option<Duration> {
        Some(settings.stage_timeout)
    }

    async fn run(&self, ctx: &StageContext, task: &mut Task) -> Result<(), PipelineError>;
}

pub struct DocumentPipeline {
    ctx: StageContext,
    stages: Vec<Box<dyn Stage>>,
}

impl DocumentPipeline {
    pub fn new(settings: PipelineSettings, collaborators: Collaborators) -> anyhow::Result<Self> {
        let mut stages: Vec<Box<dyn Stage>> =
            vec![Box::new(ConversionStage), Box::new(ChunkingStage)];

        if settings.generate_derivatives {
            let Some(provider) = collaborators.completion.clone() else {
                bail!("chunk derivatives are enabled but no completion provider is configured");
            };
            stages.push(Box::new(DerivativesStage::new(provider)));
        }
        if settings.generate_embeddings {
            let Some(provider) = collaborators.embedder.clone() else {
                bail!("embeddings are enabled but no embedding provider is configured");
            };
            stages.push(Box::new(EmbeddingsStage::new(provider)));
        }

        Ok(Self {
            ctx: StageContext {
                settings,
                collaborators,
            },
            stages,
        })
    }

    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        Self::new(
            PipelineSettings::from_config(config),
            Collaborators::from_config(config, store)?,
        )
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.ctx.collaborators.store.clone()
    }

    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Run a task through every stage and return its final status.
    pub async fn run(&self, task_id: &str) -> Result<TaskStatus, PipelineError> {
        let mut task = self.ctx.load_task(task_id).await?;
        match task.status {
            TaskStatus::Pending => {
                task.transition_to(TaskStatus::Starting, Utc::now())?;
                self.ctx.save_task(&task, TaskStatus::Pending).await?;
            }
            TaskStatus::Starting => {}
            status => {
                return Err(PipelineError::InvalidState {
                    task_id: task.id,
                    status,
                    action: "run",
                })
            }
        }
        info!(task_id, stages = ?self.stage_names(), "pipeline started");

        for stage in &self.stages {
            let mut task = self.ctx.load_task(task_id).await?;
            if task.status == TaskStatus::Cancelled {
                info!(task_id, stage = stage.name(), "task cancelled, stopping");
                return Ok(TaskStatus::Cancelled);
            }

            let result = match stage.timeout(&self.ctx.settings) {
                Some(limit) => {
                    match tokio::time::timeout(limit, stage.run(&self.ctx, &mut task)).await {
                        Ok(result) => result,
                        Err(_) => Err(PipelineError::Timeout {
                            stage: stage.name(),
                            secs: limit.as_secs(),
                        }),
                    }
                }
                None => stage.run(&self.ctx, &mut task).await,
            };

            if let Err(e) = result {
                return self.fail(task_id, stage.name(), e).await;
            }
            info!(task_id, stage = stage.name(), "stage finished");
        }

        let status = self.finish(task_id, TaskStatus::Succeeded).await?;
        if status == TaskStatus::Succeeded {
            info!(task_id, "task succeeded");
        } else {
            info!(task_id, "task cancelled before completion");
        }
        Ok(status)
    }

    async fn fail(
        &self,
        task_id: &str,
        stage: &'static str,
        err: PipelineError,
    ) -> Result<TaskStatus, PipelineError> {
        let status = self.finish(task_id, TaskStatus::Failed).await?;
        if status == TaskStatus::Cancelled {
            info!(task_id, stage, error = %err, "stage stopped after cancellation");
        } else if err.is_fatal() {
            warn!(task_id, stage, code = err.code(), error = %err, "stage failed");
        } else {
            error!(task_id, stage, code = err.code(), error = %err, "stage failed unexpectedly");
        }
        Ok(status)
    }

    /// Move the task to the terminal status `next` unless it was cancelled.
    ///
    /// Returns the status the task ended in.
    async fn finish(&self, task_id: &str, next: TaskStatus) -> Result<TaskStatus, PipelineError> {
        let mut task = self.ctx.load_task(task_id).await?;
        if task.status == TaskStatus::Cancelled {
            return Ok(TaskStatus::Cancelled);
        }
        let expected = task.status;
        task.transition_to(next, Utc::now())?;
        if self.ctx.store().update_task_if(&task, expected).await? {
            return Ok(next);
        }

        // the status changed between the read and the write
        match self.ctx.load_task(task_id).await?.status {
            TaskStatus::Cancelled => Ok(TaskStatus::Cancelled),
            status => Err(PipelineError::InvalidState {
                task_id: task_id.to_string(),
                status,
                action: "finish",
            }),
        }
    }
}
