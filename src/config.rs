use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::chunk::ChunkingParams;
use crate::models::ChunkingMethod;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Defaults applied to new tasks, and which enrichment stages run.
#[derive(Debug, Deserialize, Clone)]
pub struct TasksConfig {
    #[serde(default)]
    pub chunking_method: ChunkingMethod,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_deletion_delay_minutes")]
    pub deletion_delay_minutes: i64,
    #[serde(default)]
    pub generate_chunk_derivatives: bool,
    #[serde(default)]
    pub generate_embeddings: bool,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            chunking_method: ChunkingMethod::Semantic,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            deletion_delay_minutes: default_deletion_delay_minutes(),
            generate_chunk_derivatives: false,
            generate_embeddings: false,
        }
    }
}

impl TasksConfig {
    pub fn default_params(&self) -> ChunkingParams {
        ChunkingParams::new(self.chunking_method, self.chunk_size, self.chunk_overlap)
    }
}

fn default_chunk_size() -> usize {
    1024
}
fn default_chunk_overlap() -> usize {
    256
}
fn default_deletion_delay_minutes() -> i64 {
    24 * 60 * 30
}

/// External converter process settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ConversionConfig {
    #[serde(default = "default_conversion_command")]
    pub command: String,
    #[serde(default = "default_conversion_args")]
    pub args: Vec<String>,
    #[serde(default = "default_conversion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            command: default_conversion_command(),
            args: default_conversion_args(),
            timeout_secs: default_conversion_timeout_secs(),
            download_timeout_secs: default_download_timeout_secs(),
        }
    }
}

fn default_conversion_command() -> String {
    "marker_single".to_string()
}
fn default_conversion_args() -> Vec<String> {
    vec!["--paginate_output".to_string()]
}
fn default_conversion_timeout_secs() -> u64 {
    7200
}
fn default_download_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Bound on the chunking stage and on each enrichment provider call.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_enrichment_concurrency")]
    pub enrichment_concurrency: usize,
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: default_stage_timeout_secs(),
            enrichment_concurrency: default_enrichment_concurrency(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
        }
    }
}

fn default_stage_timeout_secs() -> u64 {
    300
}
fn default_enrichment_concurrency() -> usize {
    4
}
fn default_max_concurrent_tasks() -> usize {
    2
}

/// LLM completion provider used for chunk derivatives.
#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_completion_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            max_retries: default_max_retries(),
            timeout_secs: default_completion_timeout_secs(),
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_completion_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            url: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

impl Config {
    /// A config with every default and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            tasks: TasksConfig::default(),
            conversion: ConversionConfig::default(),
            pipeline: PipelineConfig::default(),
            completion: CompletionConfig::default(),
            embedding: EmbeddingConfig::default(),
            server: ServerConfig::default(),
        }
    }

    pub fn conversion_timeout(&self) -> Duration {
        Duration::from_secs(self.conversion.timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.pipeline.stage_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.chunk_size == 0 {
            anyhow::bail!("tasks.chunk_size must be > 0");
        }
        if self.tasks.chunking_method == ChunkingMethod::Recursive
            && self.tasks.chunk_overlap >= self.tasks.chunk_size
        {
            anyhow::bail!("tasks.chunk_overlap must be smaller than tasks.chunk_size");
        }
        if self.tasks.deletion_delay_minutes < 0 {
            anyhow::bail!("tasks.deletion_delay_minutes must be >= 0");
        }
        if chrono::Duration::try_minutes(self.tasks.deletion_delay_minutes).is_none() {
            anyhow::bail!("tasks.deletion_delay_minutes is out of range");
        }
        if self.conversion.command.trim().is_empty() {
            anyhow::bail!("conversion.command must not be empty");
        }
        if self.conversion.timeout_secs == 0 || self.conversion.download_timeout_secs == 0 {
            anyhow::bail!("conversion timeouts must be > 0");
        }
        if self.pipeline.stage_timeout_secs == 0 {
            anyhow::bail!("pipeline.stage_timeout_secs must be > 0");
        }
        if self.pipeline.enrichment_concurrency == 0 {
            anyhow::bail!("pipeline.enrichment_concurrency must be >= 1");
        }
        if self.pipeline.max_concurrent_tasks == 0 {
            anyhow::bail!("pipeline.max_concurrent_tasks must be >= 1");
        }

        match self.completion.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown completion provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.completion.is_enabled() && self.completion.model.is_none() {
            anyhow::bail!(
                "completion.model must be specified when provider is '{}'",
                self.completion.provider
            );
        }
        if self.tasks.generate_chunk_derivatives && !self.completion.is_enabled() {
            anyhow::bail!("tasks.generate_chunk_derivatives requires a [completion] provider");
        }

        match self.embedding.provider.as_str() {
            "disabled" | "openai" | "ollama" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, openai, or ollama.",
                other
            ),
        }
        if self.embedding.is_enabled() {
            if self.embedding.dims.is_none() || self.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    self.embedding.provider
                );
            }
            if self.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    self.embedding.provider
                );
            }
        }
        if self.tasks.generate_embeddings && !self.embedding.is_enabled() {
            anyhow::bail!("tasks.generate_embeddings requires an [embedding] provider");
        }

        Ok(())
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}
