//! Chunking engine: splitters, page annotation, and chunk records.
//!
//! [`chunk_document`] is the entry point used by the pipeline. It runs the
//! configured splitter ([`semantic`] or [`recursive`]), then the
//! [`pages::PageAnnotator`], and turns the result into [`Chunk`] records
//! with gapless zero-based `chunk_number`s.
//!
//! Each chunk receives a fresh UUID and a SHA-256 hash of its text.
//!
//! # Example
//!
//! ```rust
//! use docchunk::chunk::{chunk_document, ChunkingParams};
//! use docchunk::models::ChunkingMethod;
//!
//! let params = ChunkingParams::new(ChunkingMethod::Semantic, 60, 0);
//! let chunks = chunk_document("doc-1", "# Title\n\nBody {0}---", &params).unwrap();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].page_numbers, vec![0]);
//! ```

pub mod pages;
pub mod recursive;
pub mod semantic;

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::PipelineError;
use crate::models::{Chunk, ChunkType, ChunkingMethod, Task};

pub use pages::{annotate_pages, AnnotatedChunk, PageAnnotator};
pub use recursive::RecursiveSplitter;
pub use semantic::split_semantic;

/// Splitter selection and size parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkingParams {
    pub method: ChunkingMethod,
    pub chunk_size: usize,
    /// Only used by the recursive splitter.
    pub chunk_overlap: usize,
}

impl ChunkingParams {
    pub fn new(method: ChunkingMethod, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            method,
            chunk_size,
            chunk_overlap,
        }
    }

    pub fn from_task(task: &Task) -> Self {
        Self::new(task.chunking_method, task.chunk_size, task.chunk_overlap)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.chunk_size == 0 {
            return Err(PipelineError::InvalidRequest(
                "chunk_size must be > 0".to_string(),
            ));
        }
        if self.method == ChunkingMethod::Recursive && self.chunk_overlap >= self.chunk_size {
            return Err(PipelineError::InvalidRequest(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Run only the splitter. Markers are left in place.
pub fn split_text(text: &str, params: &ChunkingParams) -> Vec<String> {
    match params.method {
        ChunkingMethod::Semantic => split_semantic(text, params.chunk_size),
        ChunkingMethod::Recursive => {
            RecursiveSplitter::new(params.chunk_size, params.chunk_overlap).split(text)
        }
    }
}

/// Split, annotate, and build chunk records for one document.
///
/// Chunks left empty once their page markers are removed are dropped; their
/// page numbers still carry forward to the next chunk.
pub fn chunk_document(
    document_id: &str,
    text: &str,
    params: &ChunkingParams,
) -> Result<Vec<Chunk>, PipelineError> {
    params.validate()?;

    let annotated = annotate_pages(split_text(text, params));

    let chunks: Vec<Chunk> = annotated
        .into_iter()
        .filter(|a| !a.text.is_empty())
        .enumerate()
        .map(|(i, a)| {
            let kind = match params.method {
                ChunkingMethod::Semantic => classify(&a.text),
                ChunkingMethod::Recursive => ChunkType::Text,
            };
            make_chunk(document_id, i as i64, kind, a)
        })
        .collect();

    verify(&chunks, params)?;
    Ok(chunks)
}

/// Guess the kind of a semantic chunk from its markdown.
pub fn classify(text: &str) -> ChunkType {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    if lines.len() == 1 && semantic::is_heading_line(lines[0]) {
        ChunkType::Heading
    } else if !lines.is_empty() && lines.iter().all(|l| l.starts_with('|')) {
        ChunkType::Table
    } else if !lines.is_empty() && lines.iter().all(|l| is_image_line(l)) {
        ChunkType::Image
    } else {
        ChunkType::Paragraph
    }
}

fn is_image_line(line: &str) -> bool {
    line.starts_with("![") && line.ends_with(')') && line.contains("](")
}

fn verify(chunks: &[Chunk], params: &ChunkingParams) -> Result<(), PipelineError> {
    for (i, chunk) in chunks.iter().enumerate() {
        if chunk.chunk_number != i as i64 {
            return Err(PipelineError::ChunkingFailure(format!(
                "chunk at position {} has number {}",
                i, chunk.chunk_number
            )));
        }
        let oversized = chunk.text.chars().count() > params.chunk_size;
        let allowed = match params.method {
            // only a single line longer than the limit may exceed it
            ChunkingMethod::Semantic => !chunk.text.contains('\n'),
            ChunkingMethod::Recursive => false,
        };
        if oversized && !allowed {
            return Err(PipelineError::ChunkingFailure(format!(
                "chunk {} exceeds {} chars",
                chunk.chunk_number, params.chunk_size
            )));
        }
    }
    Ok(())
}

/// Create a single [`Chunk`] with a UUID and SHA-256 content hash.
fn make_chunk(document_id: &str, index: i64, kind: ChunkType, chunk: AnnotatedChunk) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_number: index,
        chunk_type: kind,
        hash: hash_text(&chunk.text),
        text: chunk.text,
        page_numbers: chunk.page_numbers,
    }
}

pub fn hash_text(text: &str) -> String {
    sha256_hex(text.as_bytes())
}

/// Lowercase hex SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn semantic(size: usize) -> ChunkingParams {
        ChunkingParams::new(ChunkingMethod::Semantic, size, 0)
    }

    #[test]
    fn test_end_to_end_semantic() {
        let text = "# Title\n\nParagraph one.\n\n# Next\n\nParagraph two.";
        let chunks = chunk_document("doc1", text, &semantic(60)).unwrap();
        let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(texts, vec!["# Title\n\nParagraph one.", "# Next\n\nParagraph two."]);
        assert_eq!(chunks[0].chunk_type, ChunkType::Paragraph);
    }

    #[test]
    fn test_chunk_numbers_gapless_after_dropping_marker_only_chunks() {
        let text = "intro text\n\n{0}------\n\n# Second page\n\nmore text";
        // size 12 forces every block into its own chunk
        let chunks = chunk_document("doc1", text, &semantic(12)).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_number, i as i64);
            assert!(!c.text.is_empty());
        }
        assert!(chunks[0].page_numbers.is_empty());
        assert_eq!(chunks.last().unwrap().page_numbers, vec![0]);
    }

    #[test]
    fn test_markers_removed_and_pages_recorded() {
        let text = "page zero body {0}-----\n\npage one body {1}-----";
        let chunks = chunk_document("doc1", text, &semantic(1000)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].page_numbers, vec![0, 1]);
        assert!(!chunks[0].text.contains('{'));
    }

    #[test]
    fn test_recursive_chunks_are_text() {
        let params = ChunkingParams::new(ChunkingMethod::Recursive, 20, 5);
        let text = "lorem ipsum dolor sit amet consectetur adipiscing elit sed do";
        let chunks = chunk_document("doc1", text, &params).unwrap();
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.chunk_type == ChunkType::Text));
    }

    #[test]
    fn test_invalid_params_rejected() {
        let zero = ChunkingParams::new(ChunkingMethod::Semantic, 0, 0);
        assert!(matches!(
            chunk_document("d", "x", &zero),
            Err(PipelineError::InvalidRequest(_))
        ));
        let overlap = ChunkingParams::new(ChunkingMethod::Recursive, 10, 10);
        assert!(overlap.validate().is_err());
        // overlap is ignored by the semantic splitter
        assert!(ChunkingParams::new(ChunkingMethod::Semantic, 10, 256)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("## Only a heading"), ChunkType::Heading);
        assert_eq!(classify("| a | b |\n|---|---|\n| 1 | 2 |"), ChunkType::Table);
        assert_eq!(classify("![figure](img/fig1.png)"), ChunkType::Image);
        assert_eq!(classify("# Heading\n\nBody"), ChunkType::Paragraph);
    }

    #[test]
    fn test_hash_is_stable() {
        let a = chunk_document("d", "same text", &semantic(100)).unwrap();
        let b = chunk_document("d", "same text", &semantic(100)).unwrap();
        assert_eq!(a[0].hash, b[0].hash);
        assert_ne!(a[0].id, b[0].id);
    }

    #[test]
    fn test_empty_text_yields_no_chunks() {
        assert!(chunk_document("d", "  \n\n ", &semantic(100)).unwrap().is_empty());
    }
}
