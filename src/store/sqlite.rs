//! SQLite-backed [`Store`] implementation.
//!
//! Timestamps are stored as Unix seconds, `page_numbers` as a JSON array and
//! embedding vectors as little-endian `f32` blobs. The schema is created by
//! [`crate::migrate::run_migrations`].

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{
    Chunk, ChunkDerivative, ChunkEmbedding, Document, Prompt, Task, TaskStatus,
};

use super::{ProcessingTotals, Store, StoreCounts};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(ts, 0).with_context(|| format!("timestamp out of range: {}", ts))
}

fn from_opt_ts(ts: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ts.map(from_ts).transpose()
}

const TASK_COLUMNS: &str = "id, chunking_method, chunk_size, chunk_overlap, status, created_at, \
     started_at, estimated_finished_at, finished_at, expires_at, delete_at";

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    let method: String = row.get("chunking_method");
    let status: String = row.get("status");
    let chunk_size: i64 = row.get("chunk_size");
    let chunk_overlap: i64 = row.get("chunk_overlap");
    Ok(Task {
        id: row.get("id"),
        chunking_method: method.parse()?,
        chunk_size: usize::try_from(chunk_size).context("negative chunk_size")?,
        chunk_overlap: usize::try_from(chunk_overlap).context("negative chunk_overlap")?,
        status: status.parse()?,
        created_at: from_ts(row.get("created_at"))?,
        started_at: from_opt_ts(row.get("started_at"))?,
        estimated_finished_at: from_opt_ts(row.get("estimated_finished_at"))?,
        finished_at: from_opt_ts(row.get("finished_at"))?,
        expires_at: from_opt_ts(row.get("expires_at"))?,
        delete_at: from_opt_ts(row.get("delete_at"))?,
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.get("id"),
        task_id: row.get("task_id"),
        url: row.get("url"),
        sha256: row.get("sha256"),
        size: row.get("size"),
        page_count: row.get("page_count"),
        markdown: row.get("markdown"),
        created_at: from_ts(row.get("created_at"))?,
        updated_at: from_ts(row.get("updated_at"))?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let chunk_type: String = row.get("chunk_type");
    let pages: String = row.get("page_numbers");
    Ok(Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_number: row.get("chunk_number"),
        chunk_type: chunk_type.parse()?,
        text: row.get("text"),
        page_numbers: serde_json::from_str(&pages)
            .with_context(|| format!("invalid page_numbers: {}", pages))?,
        hash: row.get("hash"),
    })
}

fn prompt_from_row(row: &SqliteRow) -> Prompt {
    let is_active: i64 = row.get("is_active");
    Prompt {
        id: row.get("id"),
        name: row.get("name"),
        kind: row.get("kind"),
        content: row.get("content"),
        version: row.get("version"),
        is_active: is_active != 0,
    }
}

fn derivative_from_row(row: &SqliteRow) -> Result<ChunkDerivative> {
    Ok(ChunkDerivative {
        id: row.get("id"),
        chunk_id: row.get("chunk_id"),
        prompt_id: row.get("prompt_id"),
        kind: row.get("kind"),
        content: row.get("content"),
        llm_provider: row.get("llm_provider"),
        llm_model: row.get("llm_model"),
        created_at: from_ts(row.get("created_at"))?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, chunking_method, chunk_size, chunk_overlap, status,
                               created_at, started_at, estimated_finished_at, finished_at,
                               expires_at, delete_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(task.chunking_method.as_str())
        .bind(task.chunk_size as i64)
        .bind(task.chunk_overlap as i64)
        .bind(task.status.as_str())
        .bind(to_ts(task.created_at))
        .bind(task.started_at.map(to_ts))
        .bind(task.estimated_finished_at.map(to_ts))
        .bind(task.finished_at.map(to_ts))
        .bind(task.expires_at.map(to_ts))
        .bind(task.delete_at.map(to_ts))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                chunking_method = ?, chunk_size = ?, chunk_overlap = ?, status = ?,
                started_at = ?, estimated_finished_at = ?, finished_at = ?,
                expires_at = ?, delete_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.chunking_method.as_str())
        .bind(task.chunk_size as i64)
        .bind(task.chunk_overlap as i64)
        .bind(task.status.as_str())
        .bind(task.started_at.map(to_ts))
        .bind(task.estimated_finished_at.map(to_ts))
        .bind(task.finished_at.map(to_ts))
        .bind(task.expires_at.map(to_ts))
        .bind(task.delete_at.map(to_ts))
        .bind(&task.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            anyhow::bail!("task {} does not exist", task.id);
        }
        Ok(())
    }

    async fn update_task_if(&self, task: &Task, expected: TaskStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks SET
                chunking_method = ?, chunk_size = ?, chunk_overlap = ?, status = ?,
                started_at = ?, estimated_finished_at = ?, finished_at = ?,
                expires_at = ?, delete_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(task.chunking_method.as_str())
        .bind(task.chunk_size as i64)
        .bind(task.chunk_overlap as i64)
        .bind(task.status.as_str())
        .bind(task.started_at.map(to_ts))
        .bind(task.estimated_finished_at.map(to_ts))
        .bind(task.finished_at.map(to_ts))
        .bind(task.expires_at.map(to_ts))
        .bind(task.delete_at.map(to_ts))
        .bind(&task.id)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_tasks(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE (? IS NULL OR status = ?) ORDER BY created_at ASC, id ASC LIMIT ?",
            TASK_COLUMNS
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(status.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn delete_task(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let chunk_ids = "SELECT c.id FROM chunks c JOIN documents d ON d.id = c.document_id WHERE d.task_id = ?";
        sqlx::query(&format!("DELETE FROM embeddings WHERE chunk_id IN ({})", chunk_ids))
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!(
            "DELETE FROM chunk_derivatives WHERE chunk_id IN ({})",
            chunk_ids
        ))
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE task_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM documents WHERE task_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn tasks_due_for_purge(
        &self,
        now: DateTime<Utc>,
        include_null_dates: bool,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT id FROM tasks
            WHERE COALESCE(delete_at, expires_at) <= ?
               OR (? AND delete_at IS NULL AND expires_at IS NULL)
            ORDER BY created_at ASC
            "#,
        )
        .bind(to_ts(now))
        .bind(include_null_dates)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn create_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, task_id, url, sha256, size, page_count, markdown,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.task_id)
        .bind(&doc.url)
        .bind(&doc.sha256)
        .bind(doc.size)
        .bind(doc.page_count)
        .bind(&doc.markdown)
        .bind(to_ts(doc.created_at))
        .bind(to_ts(doc.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document_for_task(&self, task_id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, task_id, url, sha256, size, page_count, markdown, created_at, updated_at FROM documents WHERE task_id = ?",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn update_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE documents SET
                url = ?, sha256 = ?, size = ?, page_count = ?, markdown = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&doc.url)
        .bind(&doc.sha256)
        .bind(doc.size)
        .bind(doc.page_count)
        .bind(&doc.markdown)
        .bind(to_ts(doc.updated_at))
        .bind(&doc.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn replace_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM embeddings WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "DELETE FROM chunk_derivatives WHERE chunk_id IN (SELECT id FROM chunks WHERE document_id = ?)",
        )
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;

        for chunk in chunks {
            let pages = serde_json::to_string(&chunk.page_numbers)?;
            sqlx::query(
                r#"
                INSERT INTO chunks (id, document_id, chunk_number, chunk_type, text, page_numbers, hash)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_number)
            .bind(chunk.chunk_type.as_str())
            .bind(&chunk.text)
            .bind(&pages)
            .bind(&chunk.hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(
            "SELECT id, document_id, chunk_number, chunk_type, text, page_numbers, hash FROM chunks WHERE document_id = ? ORDER BY chunk_number ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn list_active_prompts(&self) -> Result<Vec<Prompt>> {
        let rows = sqlx::query(
            "SELECT id, name, kind, content, version, is_active FROM prompts WHERE is_active = 1 ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(prompt_from_row).collect())
    }

    async fn upsert_prompt(&self, prompt: &Prompt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO prompts (id, name, kind, content, version, is_active)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                kind = excluded.kind,
                content = excluded.content,
                version = excluded.version,
                is_active = excluded.is_active
            "#,
        )
        .bind(&prompt.id)
        .bind(&prompt.name)
        .bind(&prompt.kind)
        .bind(&prompt.content)
        .bind(prompt.version)
        .bind(prompt.is_active as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn has_derivative(&self, chunk_id: &str, prompt_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM chunk_derivatives WHERE chunk_id = ? AND prompt_id = ?",
        )
        .bind(chunk_id)
        .bind(prompt_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_derivatives(&self, derivatives: &[ChunkDerivative]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for d in derivatives {
            sqlx::query(
                r#"
                INSERT INTO chunk_derivatives (id, chunk_id, prompt_id, kind, content,
                                               llm_provider, llm_model, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&d.id)
            .bind(&d.chunk_id)
            .bind(&d.prompt_id)
            .bind(&d.kind)
            .bind(&d.content)
            .bind(&d.llm_provider)
            .bind(&d.llm_model)
            .bind(to_ts(d.created_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_derivatives(&self, chunk_id: &str) -> Result<Vec<ChunkDerivative>> {
        let rows = sqlx::query(
            "SELECT id, chunk_id, prompt_id, kind, content, llm_provider, llm_model, created_at FROM chunk_derivatives WHERE chunk_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(chunk_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(derivative_from_row).collect()
    }

    async fn has_embedding(&self, chunk_id: &str, model: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT COUNT(*) > 0 FROM embeddings WHERE chunk_id = ? AND model = ?",
        )
        .bind(chunk_id)
        .bind(model)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn upsert_embedding(&self, embedding: &ChunkEmbedding) -> Result<()> {
        let blob = vec_to_blob(&embedding.vector);
        sqlx::query(
            r#"
            INSERT INTO embeddings (chunk_id, provider, model, dims, embedding, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id, model) DO UPDATE SET
                provider = excluded.provider,
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at
            "#,
        )
        .bind(&embedding.chunk_id)
        .bind(&embedding.provider)
        .bind(&embedding.model)
        .bind(embedding.dims as i64)
        .bind(&blob)
        .bind(to_ts(embedding.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_embedding(&self, chunk_id: &str, model: &str) -> Result<Option<ChunkEmbedding>> {
        let row = sqlx::query(
            "SELECT chunk_id, provider, model, dims, embedding, created_at FROM embeddings WHERE chunk_id = ? AND model = ?",
        )
        .bind(chunk_id)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let dims: i64 = row.get("dims");
        let blob: Vec<u8> = row.get("embedding");
        Ok(Some(ChunkEmbedding {
            chunk_id: row.get("chunk_id"),
            provider: row.get("provider"),
            model: row.get("model"),
            dims: usize::try_from(dims).context("negative dims")?,
            vector: blob_to_vec(&blob),
            created_at: from_ts(row.get("created_at"))?,
        }))
    }

    async fn processing_totals(&self) -> Result<ProcessingTotals> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS tasks,
                   COALESCE(SUM(elapsed), 0) AS elapsed,
                   COALESCE(SUM(pages), 0) AS pages
            FROM (
                SELECT t.finished_at - t.started_at AS elapsed,
                       (SELECT MAX(CAST(p.value AS INTEGER)) + 1
                        FROM documents d
                        JOIN chunks c ON c.document_id = d.id,
                             json_each(c.page_numbers) p
                        WHERE d.task_id = t.id) AS pages
                FROM tasks t
                WHERE t.status = 'Succeeded'
                  AND t.started_at IS NOT NULL
                  AND t.finished_at IS NOT NULL
            )
            WHERE pages IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(ProcessingTotals {
            tasks: row.get("tasks"),
            elapsed_secs: row.get("elapsed"),
            pages: row.get("pages"),
        })
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM tasks GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut by_status: Vec<(TaskStatus, i64)> =
            TaskStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        for row in &rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            let status: TaskStatus = status.parse()?;
            if let Some(entry) = by_status.iter_mut().find(|(s, _)| *s == status) {
                entry.1 = n;
            }
        }

        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        let derivatives: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_derivatives")
            .fetch_one(&self.pool)
            .await?;
        let chunks_with_derivatives: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT chunk_id) FROM chunk_derivatives")
                .fetch_one(&self.pool)
                .await?;
        let chunks_with_embeddings: i64 =
            sqlx::query_scalar("SELECT COUNT(DISTINCT chunk_id) FROM embeddings")
                .fetch_one(&self.pool)
                .await?;

        Ok(StoreCounts {
            tasks_by_status: by_status,
            documents,
            chunks,
            chunks_with_derivatives,
            derivatives,
            chunks_with_embeddings,
        })
    }
}
