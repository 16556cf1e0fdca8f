//! In-memory [`Store`] implementation for tests and embedded use.
//!
//! All tables live in one [`MemoryState`] behind a `tokio::sync::RwLock`, so
//! every operation is atomic with respect to the others.

use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::models::{
    Chunk, ChunkDerivative, ChunkEmbedding, Document, Prompt, Task, TaskStatus,
};

use super::{pages_spanned, ProcessingTotals, Store, StoreCounts};

#[derive(Default)]
struct MemoryState {
    tasks: HashMap<String, Task>,
    documents: HashMap<String, Document>,
    chunks: Vec<Chunk>,
    prompts: HashMap<String, Prompt>,
    derivatives: Vec<ChunkDerivative>,
    embeddings: HashMap<(String, String), ChunkEmbedding>,
}

impl MemoryState {
    fn document_for_task(&self, task_id: &str) -> Option<&Document> {
        self.documents.values().find(|d| d.task_id == task_id)
    }

    fn drop_chunks_of(&mut self, document_id: &str) {
        let gone: Vec<String> = self
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .map(|c| c.id.clone())
            .collect();
        self.chunks.retain(|c| c.document_id != document_id);
        self.derivatives.retain(|d| !gone.contains(&d.chunk_id));
        self.embeddings.retain(|(chunk_id, _), _| !gone.contains(chunk_id));
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().await;
        if state.tasks.contains_key(&task.id) {
            bail!("task {} already exists", task.id);
        }
        state.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.state.read().await.tasks.get(id).cloned())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task.id) {
            Some(stored) => *stored = task.clone(),
            None => bail!("task {} does not exist", task.id),
        }
        Ok(())
    }

    async fn update_task_if(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.tasks.get_mut(&task.id) {
            Some(stored) if stored.status == expected => {
                *stored = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write().await;
        if state.tasks.remove(id).is_none() {
            return Ok(false);
        }
        let doc_ids: Vec<String> = state
            .documents
            .values()
            .filter(|d| d.task_id == id)
            .map(|d| d.id.clone())
            .collect();
        for doc_id in doc_ids {
            state.drop_chunks_of(&doc_id);
            state.documents.remove(&doc_id);
        }
        Ok(true)
    }

    async fn tasks_due_for_purge(
        &self,
        now: DateTime<Utc>,
        include_null_dates: bool,
    ) -> Result<Vec<String>> {
        let state = self.state.read().await;
        let mut due: Vec<&Task> = state
            .tasks
            .values()
            .filter(|t| match t.purge_at() {
                Some(at) => at <= now,
                None => include_null_dates,
            })
            .collect();
        due.sort_by_key(|t| t.created_at);
        Ok(due.into_iter().map(|t| t.id.clone()).collect())
    }

    async fn create_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.state.write().await;
        if state.document_for_task(&doc.task_id).is_some() {
            bail!("task {} already has a document", doc.task_id);
        }
        state.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document_for_task(&self, task_id: &str) -> Result<Option<Document>> {
        Ok(self.state.read().await.document_for_task(task_id).cloned())
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.state.write().await;
        match state.documents.get_mut(&doc.id) {
            Some(stored) => *stored = doc.clone(),
            None => bail!("document {} does not exist", doc.id),
        }
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.documents.contains_key(document_id) {
            bail!("document {} does not exist", document_id);
        }
        state.drop_chunks_of(document_id);
        state.chunks.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let state = self.state.read().await;
        let mut chunks: Vec<Chunk> = state
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_number);
        Ok(chunks)
    }

    async fn list_active_prompts(&self) -> Result<Vec<Prompt>> {
        let state = self.state.read().await;
        let mut prompts: Vec<Prompt> = state
            .prompts
            .values()
            .filter(|p| p.is_active)
            .cloned()
            .collect();
        prompts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(prompts)
    }

    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<()> {
        let mut state = self.state.write().await;
        state.prompts.insert(prompt.name.clone(), prompt.clone());
        Ok(())
    }

    async fn has_derivative(&self, chunk_id: &str, prompt_id: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .derivatives
            .iter()
            .any(|d| d.chunk_id == chunk_id && d.prompt_id == prompt_id))
    }

    async fn insert_derivatives(&self, derivatives: &[ChunkDerivative]) -> Result<()> {
        let mut state = self.state.write().await;
        state.derivatives.extend(derivatives.iter().cloned());
        Ok(())
    }

    async fn list_derivatives(&self, chunk_id: &str) -> Result<Vec<ChunkDerivative>> {
        let state = self.state.read().await;
        Ok(state
            .derivatives
            .iter()
            .filter(|d| d.chunk_id == chunk_id)
            .cloned()
            .collect())
    }

    async fn has_embedding(&self, chunk_id: &str, model: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state
            .embeddings
            .contains_key(&(chunk_id.to_string(), model.to_string())))
    }

    async fn upsert_embedding(&self, embedding: &ChunkEmbedding) -> Result<()> {
        let mut state = self.state.write().await;
        state.embeddings.insert(
            (embedding.chunk_id.clone(), embedding.model.clone()),
            embedding.clone(),
        );
        Ok(())
    }

    async fn get_embedding(&self, chunk_id: &str, model: &str) -> Result<Option<ChunkEmbedding>> {
        let state = self.state.read().await;
        Ok(state
            .embeddings
            .get(&(chunk_id.to_string(), model.to_string()))
            .cloned())
    }

    async fn processing_totals(&self) -> Result<ProcessingTotals> {
        let state = self.state.read().await;
        let mut totals = ProcessingTotals::default();

        for task in state.tasks.values() {
            if task.status != TaskStatus::Succeeded {
                continue;
            }
            let (Some(started), Some(finished)) = (task.started_at, task.finished_at) else {
                continue;
            };
            let Some(doc) = state.document_for_task(&task.id) else {
                continue;
            };
            let chunks = state.chunks.iter().filter(|c| c.document_id == doc.id);
            let Some(pages) = pages_spanned(chunks) else {
                continue;
            };
            totals.tasks += 1;
            totals.elapsed_secs += (finished - started).num_seconds();
            totals.pages += pages;
        }
        Ok(totals)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let state = self.state.read().await;
        let tasks_by_status = TaskStatus::ALL
            .into_iter()
            .map(|s| {
                let n = state.tasks.values().filter(|t| t.status == s).count() as i64;
                (s, n)
            })
            .collect();

        let mut derived: Vec<&str> = state.derivatives.iter().map(|d| d.chunk_id.as_str()).collect();
        derived.sort_unstable();
        derived.dedup();
        let mut embedded: Vec<&str> = state.embeddings.keys().map(|(c, _)| c.as_str()).collect();
        embedded.sort_unstable();
        embedded.dedup();

        Ok(StoreCounts {
            tasks_by_status,
            documents: state.documents.len() as i64,
            chunks: state.chunks.len() as i64,
            chunks_with_derivatives: derived.len() as i64,
            derivatives: state.derivatives.len() as i64,
            chunks_with_embeddings: embedded.len() as i64,
        })
    }
}
