//! Separator-cascade splitter with overlapping context.
//!
//! Text that does not fit in `chunk_size` is split on the first separator;
//! pieces keep the separator as a prefix and are packed greedily. A packed
//! buffer that is still too large is split again with the remaining
//! separators. The empty separator is the terminal fallback and cuts fixed
//! windows of `chunk_size` chars, stepping by `chunk_size - chunk_overlap`.
//!
//! Every chunk after the first starts with the last `chunk_overlap` chars of
//! the chunk before it. With a zero overlap each chunk is trimmed; with a
//! non-zero overlap only the input as a whole is trimmed, so chunk
//! boundaries are not disturbed.

use super::semantic::char_len;

/// Paragraph break, line break, space, then character level.
pub const DEFAULT_SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl RecursiveSplitter {
    /// Create a splitter with the default separator cascade.
    ///
    /// `chunk_size` is clamped to at least 1 and `chunk_overlap` to below
    /// `chunk_size`; callers validate user input before getting here.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self::with_separators(chunk_size, chunk_overlap, &DEFAULT_SEPARATORS)
    }

    pub fn with_separators<S: AsRef<str>>(
        chunk_size: usize,
        chunk_overlap: usize,
        separators: &[S],
    ) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size - 1),
            separators: separators.iter().map(|s| s.as_ref().to_string()).collect(),
        }
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        let text = text.trim();
        let mut chunks = Vec::new();
        if text.is_empty() {
            return chunks;
        }
        self.split_into(text, &self.separators, &mut chunks);

        if self.chunk_overlap == 0 {
            chunks
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        } else {
            chunks.retain(|c| !c.trim().is_empty());
            chunks
        }
    }

    fn split_into(&self, text: &str, separators: &[String], out: &mut Vec<String>) {
        let Some((separator, remaining)) = separators.split_first() else {
            out.push(text.to_string());
            return;
        };
        if char_len(text) <= self.chunk_size {
            out.push(text.to_string());
            return;
        }
        if separator.is_empty() {
            self.hard_cut(text, out);
            return;
        }

        let mut buffer = String::new();
        let mut buffer_len = 0usize;
        // chars at the front of `buffer` that were carried over from the previous chunk
        let mut carried = 0usize;

        for (i, part) in text.split(separator.as_str()).enumerate() {
            let piece = if i == 0 {
                part.to_string()
            } else {
                format!("{}{}", separator, part)
            };
            let piece_len = char_len(&piece);

            if buffer_len > carried && buffer_len + piece_len > self.chunk_size {
                self.flush(&buffer, buffer_len, remaining, out);
                buffer = self.overlap_tail(out);
                buffer_len = char_len(&buffer);
                carried = buffer_len;
            }

            buffer.push_str(&piece);
            buffer_len += piece_len;
        }

        if buffer_len > carried {
            self.flush(&buffer, buffer_len, remaining, out);
        }
    }

    fn flush(&self, buffer: &str, buffer_len: usize, remaining: &[String], out: &mut Vec<String>) {
        if buffer_len > self.chunk_size {
            self.split_into(buffer, remaining, out);
        } else {
            out.push(buffer.to_string());
        }
    }

    /// The trailing `chunk_overlap` chars of the last emitted chunk.
    fn overlap_tail(&self, out: &[String]) -> String {
        match out.last() {
            Some(last) if self.chunk_overlap > 0 => {
                let skip = char_len(last).saturating_sub(self.chunk_overlap);
                last.chars().skip(skip).collect()
            }
            _ => String::new(),
        }
    }

    fn hard_cut(&self, text: &str, out: &mut Vec<String>) {
        let mut bounds: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
        bounds.push(text.len());
        let total = bounds.len() - 1;
        let step = (self.chunk_size - self.chunk_overlap).max(1);

        let mut start = 0usize;
        while start < total {
            let end = (start + self.chunk_size).min(total);
            out.push(text[bounds[start]..bounds[end]].to_string());
            if end == total {
                break;
            }
            start += step;
        }
    }
}
