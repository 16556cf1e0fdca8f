//! Page-number annotation from converter page markers.
//!
//! The converter ends every page with a marker such as `{12}------`. Chunks
//! containing markers take the marked page numbers (in order of appearance)
//! and lose the marker text. Chunks without a marker inherit the last page
//! number seen so far in the same document, or no page at all when no
//! marker has appeared yet.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

static PAGE_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\d+)\}-+").expect("page marker pattern is valid"));

/// A chunk's text with markers removed, plus the pages it spans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnnotatedChunk {
    pub text: String,
    pub page_numbers: Vec<u32>,
}

/// Stateful annotator; use one instance per document.
#[derive(Debug, Default)]
pub struct PageAnnotator {
    last_page: Option<u32>,
}

impl PageAnnotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn annotate(&mut self, chunk: &str) -> AnnotatedChunk {
        if !PAGE_MARKER.is_match(chunk) {
            return AnnotatedChunk {
                text: chunk.trim().to_string(),
                page_numbers: self.last_page.into_iter().collect(),
            };
        }

        // markers too large for a page number are stripped but not recorded
        let pages: Vec<u32> = PAGE_MARKER
            .captures_iter(chunk)
            .filter_map(|caps| caps[1].parse::<u32>().ok())
            .collect();
        if let Some(last) = pages.last() {
            self.last_page = Some(*last);
        }
        let page_numbers = if pages.is_empty() {
            self.last_page.into_iter().collect()
        } else {
            pages
        };

        AnnotatedChunk {
            text: PAGE_MARKER.replace_all(chunk, "").trim().to_string(),
            page_numbers,
        }
    }
}

/// Annotate an ordered chunk sequence belonging to one document.
pub fn annotate_pages<I, S>(chunks: I) -> Vec<AnnotatedChunk>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut annotator = PageAnnotator::new();
    chunks
        .into_iter()
        .map(|c| annotator.annotate(c.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_carry_forward() {
        let out = annotate_pages(["no marker", "{3}--", "no marker"]);
        let pages: Vec<Vec<u32>> = out.iter().map(|c| c.page_numbers.clone()).collect();
        assert_eq!(pages, vec![vec![], vec![3], vec![3]]);
        assert_eq!(out[1].text, "");
    }

    #[test]
    fn test_multiple_markers_in_order() {
        let out = annotate_pages(["end of one\n\n{0}-----\n\nstart of two {1}---- tail"]);
        assert_eq!(out[0].page_numbers, vec![0, 1]);
        assert_eq!(out[0].text, "end of one\n\n\n\nstart of two  tail");
    }

    #[test]
    fn test_last_marker_wins_for_carry() {
        let out = annotate_pages(["{4}-{2}-", "plain"]);
        assert_eq!(out[0].page_numbers, vec![4, 2]);
        assert_eq!(out[1].page_numbers, vec![2]);
    }

    #[test]
    fn test_braces_without_dashes_are_not_markers() {
        let out = annotate_pages(["{5}", "value {6} here"]);
        assert!(out[0].page_numbers.is_empty());
        assert_eq!(out[0].text, "{5}");
        assert!(out[1].page_numbers.is_empty());
    }

    #[test]
    fn test_state_resets_per_annotator() {
        let first = annotate_pages(["{9}--"]);
        assert_eq!(first[0].page_numbers, vec![9]);
        let second = annotate_pages(["plain"]);
        assert!(second[0].page_numbers.is_empty());
    }

    #[test]
    fn test_text_is_trimmed() {
        let mut annotator = PageAnnotator::new();
        let out = annotator.annotate("  body text {7}---  ");
        assert_eq!(out.text, "body text");
        assert_eq!(annotator.annotate("next").page_numbers, vec![7]);
    }

    #[test]
    fn test_oversized_marker_keeps_last_page() {
        let out = annotate_pages(["{2}--", "tail {99999999999}--"]);
        assert_eq!(out[1].text, "tail");
        assert_eq!(out[1].page_numbers, vec![2]);

        let out = annotate_pages(["{99999999999}-- first"]);
        assert_eq!(out[0].text, "first");
        assert!(out[0].page_numbers.is_empty());
    }
}
