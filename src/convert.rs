//! Conversion of downloaded documents to markdown.
//!
//! The converter is an external program (by default `marker_single`). It is
//! run as
//!
//! ```text
//! <command> <input.pdf> <args...> --output_dir <tmpdir>
//! ```
//!
//! and is expected to write `<tmpdir>/<stem>/<stem>.md` plus any extracted
//! images next to it. A non-zero exit or a missing markdown file is a
//! conversion failure. The temporary directory is removed afterwards.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::config::ConversionConfig;

const INPUT_STEM: &str = "document";
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

/// An image written by the converter alongside the markdown.
#[derive(Debug, Clone)]
pub struct ExtractedImage {
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub markdown: String,
    pub images: Vec<ExtractedImage>,
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, bytes: &[u8]) -> Result<Conversion>;
}

/// Runs an external marker-style converter in a temporary directory.
pub struct MarkerConverter {
    command: String,
    args: Vec<String>,
}

impl MarkerConverter {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(config.command.clone(), config.args.clone())
    }
}

#[async_trait]
impl Converter for MarkerConverter {
    async fn convert(&self, bytes: &[u8]) -> Result<Conversion> {
        let dir = tempfile::tempdir().context("Failed to create temporary directory")?;
        let input = dir.path().join(format!("{}.pdf", INPUT_STEM));
        tokio::fs::write(&input, bytes)
            .await
            .with_context(|| format!("Failed to write {}", input.display()))?;

        let output = Command::new(&self.command)
            .arg(&input)
            .args(&self.args)
            .arg("--output_dir")
            .arg(dir.path())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "'{}' exited with {}: {}",
                self.command,
                output.status,
                tail(stderr.trim(), 2000)
            );
        }
        debug!(
            command = %self.command,
            stdout = %tail(String::from_utf8_lossy(&output.stdout).trim(), 2000),
            "converter finished"
        );

        let out_dir = dir.path().join(INPUT_STEM);
        let markdown_path = out_dir.join(format!("{}.md", INPUT_STEM));
        if !tokio::fs::try_exists(&markdown_path).await.unwrap_or(false) {
            bail!("markdown file not found: {}", markdown_path.display());
        }
        let markdown = tokio::fs::read_to_string(&markdown_path)
            .await
            .with_context(|| format!("Failed to read {}", markdown_path.display()))?;

        let images = collect_images(&out_dir).await?;
        Ok(Conversion { markdown, images })
    }
}

async fn collect_images(dir: &Path) -> Result<Vec<ExtractedImage>> {
    let mut images = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path: PathBuf = entry.path();
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if !is_image {
            continue;
        }
        images.push(ExtractedImage {
            name: entry.file_name().to_string_lossy().into_owned(),
            size: entry.metadata().await?.len(),
        });
    }
    images.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(images)
}

/// The last `max` chars of `s`.
fn tail(s: &str, max: usize) -> &str {
    let count = s.chars().count();
    if count <= max {
        return s;
    }
    let skip = count - max;
    match s.char_indices().nth(skip) {
        Some((i, _)) => &s[i..],
        None => s,
    }
}

/// Best-effort page count of a source document.
///
/// Implementations may parse the whole document; async callers run them on
/// the blocking pool.
pub trait PageCounter: Send + Sync {
    /// Number of pages, or 1 when it cannot be determined.
    fn page_count(&self, bytes: &[u8]) -> u32;
}

/// Counts PDF pages with `lopdf`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PdfPageCounter;

impl PageCounter for PdfPageCounter {
    fn page_count(&self, bytes: &[u8]) -> u32 {
        match lopdf::Document::load_mem(bytes) {
            Ok(doc) => (doc.get_pages().len() as u32).max(1),
            Err(e) => {
                debug!(error = %e, "could not read page count, assuming 1");
                1
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_counter_defaults_to_one() {
        assert_eq!(PdfPageCounter.page_count(b"not a pdf"), 1);
    }

    #[test]
    fn test_tail_keeps_end() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
        assert_eq!(tail("äöü", 2), "öü");
    }

    #[tokio::test]
    async fn test_collect_images_lists_only_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.PNG"), b"1234").unwrap();
        std::fs::write(dir.path().join("a.jpg"), b"12").unwrap();
        std::fs::write(dir.path().join("document.md"), b"# doc").unwrap();

        let images = collect_images(dir.path()).await.unwrap();
        let names: Vec<&str> = images.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.PNG"]);
        assert_eq!(images[1].size, 4);
    }

    #[tokio::test]
    async fn test_missing_command_is_an_error() {
        let converter = MarkerConverter::new("docchunk-no-such-converter", vec![]);
        let err = converter.convert(b"%PDF-1.4").await.unwrap_err();
        assert!(err.to_string().contains("docchunk-no-such-converter"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_is_an_error() {
        let converter = MarkerConverter::new("false", vec![]);
        assert!(converter.convert(b"%PDF-1.4").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_markdown_is_an_error() {
        // `true` succeeds without writing any output
        let converter = MarkerConverter::new("true", vec![]);
        let err = converter.convert(b"%PDF-1.4").await.unwrap_err();
        assert!(err.to_string().contains("markdown file not found"));
    }
}
