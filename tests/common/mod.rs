//! Fake collaborators shared by the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docchunk::completion::CompletionProvider;
use docchunk::config::TasksConfig;
use docchunk::convert::{Conversion, Converter, PageCounter};
use docchunk::embedding::EmbeddingProvider;
use docchunk::fetch::Downloader;
use docchunk::migrate::default_prompts;
use docchunk::models::{
    Chunk, ChunkDerivative, ChunkEmbedding, Document, Prompt, Task, TaskStatus,
};
use docchunk::pipeline::{Collaborators, DocumentPipeline, PipelineSettings};
use docchunk::stats::{FixedRate, HistoricalStats};
use docchunk::store::{InMemoryStore, ProcessingTotals, Store, StoreCounts};
use docchunk::tasks::{self, NewTask};

/// Two pages of converter output with page markers.
pub const TWO_PAGE_MARKDOWN: &str = "# Introduction\n\n\
This report describes the yearly results of the cooperative. Revenue grew in every region.\n\n\
Costs stayed flat compared to the previous year.\n\n\
{0}------------------------------------------------\n\n\
## Outlook\n\n\
The board expects moderate growth next year and plans two new sites.\n\n\
| Region | Sites |\n|---|---|\n| North | 3 |\n| South | 2 |\n\n\
{1}------------------------------------------------\n";

pub struct FakeDownloader(pub Option<Vec<u8>>);

impl FakeDownloader {
    pub fn ok() -> Self {
        Self(Some(b"%PDF-1.4 fake".to_vec()))
    }
}

#[async_trait]
impl Downloader for FakeDownloader {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        match &self.0 {
            Some(bytes) => Ok(bytes.clone()),
            None => bail!("404 Not Found for {}", url),
        }
    }
}

pub enum ConverterBehavior {
    Markdown(String),
    Fail(String),
    /// Sleep before returning the markdown.
    Slow(Duration, String),
    /// Cancel every processing task, then return the markdown.
    CancelDuring(Arc<dyn Store>, String),
}

pub struct FakeConverter(pub ConverterBehavior);

impl FakeConverter {
    pub fn markdown(md: &str) -> Self {
        Self(ConverterBehavior::Markdown(md.to_string()))
    }
}

#[async_trait]
impl Converter for FakeConverter {
    async fn convert(&self, _bytes: &[u8]) -> Result<Conversion> {
        let markdown = match &self.0 {
            ConverterBehavior::Markdown(md) => md.clone(),
            ConverterBehavior::Fail(reason) => bail!("{}", reason),
            ConverterBehavior::Slow(delay, md) => {
                tokio::time::sleep(*delay).await;
                md.clone()
            }
            ConverterBehavior::CancelDuring(store, md) => {
                for task in store.list_tasks(Some(TaskStatus::Processing), 100).await? {
                    tasks::cancel_task(store.as_ref(), &task.id).await?;
                }
                md.clone()
            }
        };
        Ok(Conversion {
            markdown,
            images: Vec::new(),
        })
    }
}

pub struct FixedPages(pub u32);

impl PageCounter for FixedPages {
    fn page_count(&self, _bytes: &[u8]) -> u32 {
        self.0
    }
}

/// Replies with `reply`, or fails for prompts whose chunk text contains `fail_on`.
pub struct FakeCompletion {
    pub reply: String,
    pub fail_on: Option<String>,
    /// Sleep before every reply.
    pub delay: Option<Duration>,
    pub calls: AtomicUsize,
}

impl FakeCompletion {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            fail_on: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionProvider for FakeCompletion {
    fn provider_name(&self) -> &str {
        "fake"
    }
    fn model_name(&self) -> &str {
        "fake-llm"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(needle) = &self.fail_on {
            if prompt.contains(needle.as_str()) {
                bail!("503 Service Unavailable");
            }
        }
        Ok(self.reply.clone())
    }
}

/// Returns `returned_dims` values while claiming `dims`.
pub struct FakeEmbedder {
    pub dims: usize,
    pub returned_dims: usize,
    pub calls: AtomicUsize,
}

impl FakeEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            returned_dims: dims,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn provider_name(&self) -> &str {
        "fake"
    }
    fn model_name(&self) -> &str {
        "fake-embed"
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok((0..self.returned_dims)
            .map(|i| (text.len() + i) as f32)
            .collect())
    }
}

/// Cancels a task right after the `cancel_on_read`-th read that finds it
/// `Processing`, and hands the reader the stale copy.
pub struct CancellingStore {
    pub inner: Arc<InMemoryStore>,
    pub cancel_on_read: usize,
    processing_reads: AtomicUsize,
}

impl CancellingStore {
    pub fn new(inner: Arc<InMemoryStore>, cancel_on_read: usize) -> Self {
        Self {
            inner,
            cancel_on_read,
            processing_reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Store for CancellingStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        self.inner.create_task(task).await
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let task = self.inner.get_task(id).await?;
        if task.as_ref().is_some_and(|t| t.status == TaskStatus::Processing) {
            let n = self.processing_reads.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.cancel_on_read {
                tasks::cancel_task(self.inner.as_ref(), id).await?;
            }
        }
        Ok(task)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.inner.update_task(task).await
    }

    async fn update_task_if(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        self.inner.update_task_if(task, expected).await
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>> {
        self.inner.list_tasks(status, limit).await
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        self.inner.delete_task(id).await
    }

    async fn tasks_due_for_purge(
        &self,
        now: DateTime<Utc>,
        include_null_dates: bool,
    ) -> Result<Vec<String>> {
        self.inner.tasks_due_for_purge(now, include_null_dates).await
    }

    async fn create_document(&self, doc: &Document) -> Result<()> {
        self.inner.create_document(doc).await
    }

    async fn get_document_for_task(&self, task_id: &str) -> Result<Option<Document>> {
        self.inner.get_document_for_task(task_id).await
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        self.inner.update_document(doc).await
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        self.inner.replace_chunks(document_id, chunks).await
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        self.inner.list_chunks(document_id).await
    }

    async fn list_active_prompts(&self) -> Result<Vec<Prompt>> {
        self.inner.list_active_prompts().await
    }

    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<()> {
        self.inner.upsert_prompt(prompt).await
    }

    async fn has_derivative(&self, chunk_id: &str, prompt_id: &str) -> Result<bool> {
        self.inner.has_derivative(chunk_id, prompt_id).await
    }

    async fn insert_derivatives(&self, derivatives: &[ChunkDerivative]) -> Result<()> {
        self.inner.insert_derivatives(derivatives).await
    }

    async fn list_derivatives(&self, chunk_id: &str) -> Result<Vec<ChunkDerivative>> {
        self.inner.list_derivatives(chunk_id).await
    }

    async fn has_embedding(&self, chunk_id: &str, model: &str) -> Result<bool> {
        self.inner.has_embedding(chunk_id, model).await
    }

    async fn upsert_embedding(&self, embedding: &ChunkEmbedding) -> Result<()> {
        self.inner.upsert_embedding(embedding).await
    }

    async fn get_embedding(&self, chunk_id: &str, model: &str) -> Result<Option<ChunkEmbedding>> {
        self.inner.get_embedding(chunk_id, model).await
    }

    async fn processing_totals(&self) -> Result<ProcessingTotals> {
        self.inner.processing_totals().await
    }

    async fn counts(&self) -> Result<StoreCounts> {
        self.inner.counts().await
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub settings: PipelineSettings,
    pub downloader: Arc<dyn Downloader>,
    pub converter: Arc<dyn Converter>,
    pub pages: u32,
    pub stats: Arc<dyn HistoricalStats>,
    pub completion: Option<Arc<dyn CompletionProvider>>,
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl Harness {
    pub fn new(markdown: &str) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            settings: PipelineSettings::default(),
            downloader: Arc::new(FakeDownloader::ok()),
            converter: Arc::new(FakeConverter::markdown(markdown)),
            pages: 2,
            stats: Arc::new(FixedRate(None)),
            completion: None,
            embedder: None,
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        self.store.clone()
    }

    pub async fn seed_prompts(&self) {
        for prompt in default_prompts() {
            self.store.upsert_prompt(&prompt).await.unwrap();
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store(),
            downloader: self.downloader.clone(),
            converter: self.converter.clone(),
            page_counter: Arc::new(FixedPages(self.pages)),
            stats: self.stats.clone(),
            completion: self.completion.clone(),
            embedder: self.embedder.clone(),
        }
    }

    pub fn pipeline(&self) -> DocumentPipeline {
        DocumentPipeline::new(self.settings.clone(), self.collaborators()).unwrap()
    }

    /// A pipeline whose store cancels the task on its `nth` `Processing` read.
    pub fn cancelling_pipeline(&self, nth: usize) -> DocumentPipeline {
        let mut collaborators = self.collaborators();
        collaborators.store = Arc::new(CancellingStore::new(self.store.clone(), nth));
        DocumentPipeline::new(self.settings.clone(), collaborators).unwrap()
    }

    pub async fn create(&self, request: NewTask) -> Task {
        tasks::create_task(self.store.as_ref(), &TasksConfig::default(), request)
            .await
            .unwrap()
    }

    pub async fn create_default(&self) -> Task {
        self.create(NewTask {
            url: "https://example.com/report.pdf".to_string(),
            ..NewTask::default()
        })
        .await
    }
}
