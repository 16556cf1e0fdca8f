//! Idempotent schema creation and default prompt seeding.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::models::Prompt;
use crate::store::{SqliteStore, Store};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        chunking_method TEXT NOT NULL,
        chunk_size INTEGER NOT NULL,
        chunk_overlap INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        started_at INTEGER,
        estimated_finished_at INTEGER,
        finished_at INTEGER,
        expires_at INTEGER,
        delete_at INTEGER
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL UNIQUE,
        url TEXT NOT NULL,
        sha256 TEXT,
        size INTEGER,
        page_count INTEGER,
        markdown TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        FOREIGN KEY (task_id) REFERENCES tasks(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        chunk_number INTEGER NOT NULL,
        chunk_type TEXT NOT NULL,
        text TEXT NOT NULL,
        page_numbers TEXT NOT NULL DEFAULT '[]',
        hash TEXT NOT NULL,
        UNIQUE(document_id, chunk_number),
        FOREIGN KEY (document_id) REFERENCES documents(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS prompts (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL UNIQUE,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 1,
        is_active INTEGER NOT NULL DEFAULT 1
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunk_derivatives (
        id TEXT PRIMARY KEY,
        chunk_id TEXT NOT NULL,
        prompt_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        content TEXT NOT NULL,
        llm_provider TEXT NOT NULL,
        llm_model TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        FOREIGN KEY (chunk_id) REFERENCES chunks(id),
        FOREIGN KEY (prompt_id) REFERENCES prompts(id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS embeddings (
        chunk_id TEXT NOT NULL,
        provider TEXT NOT NULL,
        model TEXT NOT NULL,
        dims INTEGER NOT NULL,
        embedding BLOB NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (chunk_id, model),
        FOREIGN KEY (chunk_id) REFERENCES chunks(id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)",
    "CREATE INDEX IF NOT EXISTS idx_derivatives_chunk_prompt ON chunk_derivatives(chunk_id, prompt_id)",
];

/// The prompts every fresh database starts with.
pub fn default_prompts() -> Vec<Prompt> {
    vec![
        Prompt {
            id: Uuid::new_v4().to_string(),
            name: "default_summarize".to_string(),
            kind: "summary".to_string(),
            content: "Create a concise summary of the following content. The summary should \
                      capture the main points and key details, ideally in 1 sentence and less \
                      than 200 characters. Write the summary in the same language as the \
                      content. Respond with the summary only."
                .to_string(),
            version: 1,
            is_active: true,
        },
        Prompt {
            id: Uuid::new_v4().to_string(),
            name: "default_create_questions".to_string(),
            kind: "question".to_string(),
            content: "Which questions does the following content answer? Write the questions \
                      as if they were search queries in a large database. Maximum 7 questions. \
                      Write the questions in the same language as the content. Respond with a \
                      JSON array of the questions, and no additional text."
                .to_string(),
            version: 1,
            is_active: true,
        },
    ]
}

/// Create every table and index on an open pool, then seed missing prompts.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(*statement).execute(pool).await?;
    }

    for prompt in default_prompts() {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM prompts WHERE name = ?")
            .bind(&prompt.name)
            .fetch_one(pool)
            .await?;
        if !exists {
            SqliteStore::new(pool.clone()).upsert_prompt(&prompt).await?;
            info!(prompt = %prompt.name, "seeded default prompt");
        }
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}
