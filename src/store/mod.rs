//! Storage abstraction for docchunk.
//!
//! The [`Store`] trait covers every persistence operation the pipeline and
//! the caller operations need, so the pipeline can run against SQLite in
//! production and an in-memory store in tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{
    Chunk, ChunkDerivative, ChunkEmbedding, Document, Prompt, Task, TaskStatus,
};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Aggregate over succeeded tasks that have both timing and page data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ProcessingTotals {
    pub tasks: i64,
    pub elapsed_secs: i64,
    pub pages: i64,
}

impl ProcessingTotals {
    /// Weighted average: total elapsed time over total pages.
    pub fn seconds_per_page(&self) -> Option<f64> {
        if self.pages <= 0 {
            return None;
        }
        Some(self.elapsed_secs as f64 / self.pages as f64)
    }
}

/// Row counts for the `stats` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreCounts {
    pub tasks_by_status: Vec<(TaskStatus, i64)>,
    pub documents: i64,
    pub chunks: i64,
    pub chunks_with_derivatives: i64,
    pub derivatives: i64,
    pub chunks_with_embeddings: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_task`](Store::create_task) / [`update_task`](Store::update_task) | Persist task state |
/// | [`update_task_if`](Store::update_task_if) | Status transition guarded by the current status |
/// | [`list_tasks`](Store::list_tasks) | Tasks oldest first, optionally by status |
/// | [`delete_task`](Store::delete_task) | Remove a task and everything it owns |
/// | [`replace_chunks`](Store::replace_chunks) | Atomically swap a document's chunk set |
/// | [`insert_derivatives`](Store::insert_derivatives) | Store prompt output for a chunk |
/// | [`upsert_embedding`](Store::upsert_embedding) | Store a chunk vector for one model |
/// | [`processing_totals`](Store::processing_totals) | History for time estimates |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>>;

    /// Overwrite the stored task with `task`.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Overwrite the stored task only while its status is still `expected`.
    ///
    /// Returns `false`, writing nothing, when the status has moved on or the
    /// task no longer exists.
    async fn update_task_if(&self, task: &Task, expected: TaskStatus) -> Result<bool>;

    /// Tasks ordered by `created_at` ascending.
    async fn list_tasks(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>>;

    /// Delete a task with its document, chunks, derivatives and embeddings.
    ///
    /// Returns `false` if the task did not exist.
    async fn delete_task(&self, id: &str) -> Result<bool>;

    /// Ids of tasks whose purge time (`delete_at`, else `expires_at`) is at
    /// or before `now`. With `include_null_dates`, tasks with neither date
    /// are included too.
    async fn tasks_due_for_purge(
        &self,
        now: DateTime<Utc>,
        include_null_dates: bool,
    ) -> Result<Vec<String>>;

    async fn create_document(&self, doc: &Document) -> Result<()>;

    async fn get_document_for_task(&self, task_id: &str) -> Result<Option<Document>>;

    async fn update_document(&self, doc: &Document) -> Result<()>;

    /// Replace all chunks for a document in one all-or-nothing step.
    ///
    /// Derivatives and embeddings of the old chunks are removed with them.
    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a document in `chunk_number` order.
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn list_active_prompts(&self) -> Result<Vec<Prompt>>;

    /// Insert or replace a prompt, keyed by name.
    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<()>;

    async fn has_derivative(&self, chunk_id: &str, prompt_id: &str) -> Result<bool>;

    async fn insert_derivatives(&self, derivatives: &[ChunkDerivative]) -> Result<()>;

    async fn list_derivatives(&self, chunk_id: &str) -> Result<Vec<ChunkDerivative>>;

    async fn has_embedding(&self, chunk_id: &str, model: &str) -> Result<bool>;

    /// Insert or replace the vector for `(chunk_id, model)`.
    async fn upsert_embedding(&self, embedding: &ChunkEmbedding) -> Result<()>;

    async fn get_embedding(&self, chunk_id: &str, model: &str) -> Result<Option<ChunkEmbedding>>;

    /// Elapsed seconds and page totals over succeeded tasks.
    ///
    /// A task's page count is `max(page_number) + 1` across its chunks;
    /// tasks without page data are left out.
    async fn processing_totals(&self) -> Result<ProcessingTotals>;

    async fn counts(&self) -> Result<StoreCounts>;
}

/// Page count of one task's chunk set, as used by [`Store::processing_totals`].
pub(crate) fn pages_spanned<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Option<i64> {
    chunks
        .into_iter()
        .flat_map(|c| c.page_numbers.iter().copied())
        .max()
        .map(|max| i64::from(max) + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_per_page() {
        let none = ProcessingTotals::default();
        assert_eq!(none.seconds_per_page(), None);
        let totals = ProcessingTotals {
            tasks: 2,
            elapsed_secs: 300,
            pages: 60,
        };
        assert_eq!(totals.seconds_per_page(), Some(5.0));
    }
}
