//! Core data models used throughout docchunk.
//!
//! These types represent the tasks, documents, chunks, and enrichment
//! records that flow through the processing pipeline and the store.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a [`Task`].
///
/// Allowed transitions live in [`crate::task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Starting,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 6] = [
        TaskStatus::Pending,
        TaskStatus::Starting,
        TaskStatus::Processing,
        TaskStatus::Succeeded,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Starting => "Starting",
            TaskStatus::Processing => "Processing",
            TaskStatus::Succeeded => "Succeeded",
            TaskStatus::Failed => "Failed",
            TaskStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| anyhow::anyhow!("unknown task status: '{}'", s))
    }
}

/// Which splitter a task uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkingMethod {
    #[default]
    Semantic,
    Recursive,
}

impl ChunkingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkingMethod::Semantic => "semantic",
            ChunkingMethod::Recursive => "recursive",
        }
    }
}

impl fmt::Display for ChunkingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChunkingMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "semantic" => Ok(ChunkingMethod::Semantic),
            "recursive" => Ok(ChunkingMethod::Recursive),
            other => anyhow::bail!(
                "unknown chunking method: '{}'. Must be semantic or recursive.",
                other
            ),
        }
    }
}

/// Closed set of chunk kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    #[default]
    Paragraph,
    Heading,
    Table,
    Image,
    Text,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkType::Paragraph => "paragraph",
            ChunkType::Heading => "heading",
            ChunkType::Table => "table",
            ChunkType::Image => "image",
            ChunkType::Text => "text",
        }
    }
}

impl FromStr for ChunkType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "paragraph" => Ok(ChunkType::Paragraph),
            "heading" => Ok(ChunkType::Heading),
            "table" => Ok(ChunkType::Table),
            "image" => Ok(ChunkType::Image),
            "text" => Ok(ChunkType::Text),
            other => anyhow::bail!("unknown chunk type: '{}'", other),
        }
    }
}

/// One document-processing request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    pub id: String,
    pub chunking_method: ChunkingMethod,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub estimated_finished_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub delete_at: Option<DateTime<Utc>>,
}

/// The source document of a task and, once converted, its markdown.
///
/// This is the "content unit" chunks belong to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    pub task_id: String,
    pub url: String,
    pub sha256: Option<String>,
    pub size: Option<i64>,
    pub page_count: Option<i64>,
    #[serde(skip_serializing)]
    pub markdown: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chunk of a document's markdown.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_number: i64,
    pub chunk_type: ChunkType,
    pub text: String,
    pub page_numbers: Vec<u32>,
    pub hash: String,
}

/// A stored LLM prompt used to derive content from chunks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prompt {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub content: String,
    pub version: i64,
    pub is_active: bool,
}

/// Content generated from a chunk by a prompt (summary, question, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkDerivative {
    pub id: String,
    pub chunk_id: String,
    pub prompt_id: String,
    pub kind: String,
    pub content: String,
    pub llm_provider: String,
    pub llm_model: String,
    pub created_at: DateTime<Utc>,
}

/// An embedding vector for a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkEmbedding {
    pub chunk_id: String,
    pub provider: String,
    pub model: String,
    pub dims: usize,
    pub vector: Vec<f32>,
    pub created_at: DateTime<Utc>,
}
