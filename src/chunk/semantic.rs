//! Paragraph- and heading-aware markdown splitter.
//!
//! # Algorithm
//!
//! 1. Normalize line endings to `\n`.
//! 2. Split on runs of blank lines into trimmed, non-empty raw blocks.
//! 3. Attach a bare heading block to the block that follows it, unless that
//!    block is a heading too. Merged blocks are not merged again.
//! 4. Pack blocks greedily (joined by a blank line) while the chunk stays
//!    within `max_size`. A block that starts with a heading opens a new chunk.
//! 5. A block larger than `max_size` on its own is split line by line.
//!
//! Sizes are counted in `char`s.

/// Separator between logical blocks packed into one chunk.
const BLOCK_JOINER: &str = "\n\n";

/// Split markdown into chunks of at most `max_size` chars, preferring
/// paragraph and heading boundaries.
///
/// A chunk only exceeds `max_size` when it is a single line that is longer
/// than `max_size` by itself.
pub fn split_semantic(markdown: &str, max_size: usize) -> Vec<String> {
    let text = normalize_line_endings(markdown);
    let blocks = merge_logical_blocks(split_into_blocks(&text));

    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for block in blocks {
        let block_len = char_len(&block);

        if block_len > max_size {
            flush(&mut chunks, &mut current, &mut current_len);
            chunks.extend(split_large_block(&block, max_size));
            continue;
        }

        if !current.is_empty() {
            let would_be = current_len + BLOCK_JOINER.len() + block_len;
            if would_be > max_size || starts_with_heading(&block) {
                flush(&mut chunks, &mut current, &mut current_len);
            }
        }

        if !current.is_empty() {
            current.push_str(BLOCK_JOINER);
            current_len += BLOCK_JOINER.len();
        }
        current.push_str(&block);
        current_len += block_len;
    }

    flush(&mut chunks, &mut current, &mut current_len);
    chunks
}

fn flush(chunks: &mut Vec<String>, current: &mut String, current_len: &mut usize) {
    if !current.is_empty() {
        chunks.push(std::mem::take(current));
    }
    *current_len = 0;
}

pub(crate) fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Split on one or more blank (or whitespace-only) lines.
pub(crate) fn split_into_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut lines: Vec<&str> = Vec::new();

    for line in text.split('\n') {
        if line.trim().is_empty() {
            push_block(&mut blocks, &lines);
            lines.clear();
        } else {
            lines.push(line);
        }
    }
    push_block(&mut blocks, &lines);
    blocks
}

fn push_block(blocks: &mut Vec<String>, lines: &[&str]) {
    let block = lines.join("\n");
    let trimmed = block.trim();
    if !trimmed.is_empty() {
        blocks.push(trimmed.to_string());
    }
}

/// Keep each bare heading attached to the content below it.
pub(crate) fn merge_logical_blocks(raw: Vec<String>) -> Vec<String> {
    let mut merged = Vec::with_capacity(raw.len());
    let mut iter = raw.into_iter().peekable();

    while let Some(current) = iter.next() {
        let attach = is_heading(&current) && iter.peek().is_some_and(|next| !is_heading(next));
        match iter.next_if(|_| attach) {
            Some(next) => merged.push(format!("{}{}{}", current, BLOCK_JOINER, next)),
            None => merged.push(current),
        }
    }
    merged
}

/// A block is a heading when it is a single `#`..`######` heading line.
pub fn is_heading(block: &str) -> bool {
    let trimmed = block.trim();
    !trimmed.contains('\n') && is_heading_line(trimmed)
}

/// Matches `^#{1,6}\s+.+` on a single line.
pub(crate) fn is_heading_line(line: &str) -> bool {
    let hashes = line.chars().take_while(|c| *c == '#').count();
    if !(1..=6).contains(&hashes) {
        return false;
    }
    let mut rest = line[hashes..].chars();
    matches!(rest.next(), Some(c) if c.is_whitespace()) && rest.next().is_some()
}

fn starts_with_heading(block: &str) -> bool {
    block.lines().next().is_some_and(is_heading_line)
}

/// Fallback for a block larger than `max_size`: accumulate lines, flushing
/// before a line that would overflow the buffer.
pub(crate) fn split_large_block(block: &str, max_size: usize) -> Vec<String> {
    if char_len(block) <= max_size {
        return vec![block.to_string()];
    }

    let mut pieces = Vec::new();
    let mut buffer = String::new();
    let mut buffer_len = 0usize;

    for line in block.split('\n') {
        if buffer.is_empty() && line.trim().is_empty() {
            continue;
        }
        let line_len = char_len(line);
        if !buffer.is_empty() && buffer_len + 1 + line_len > max_size {
            push_piece(&mut pieces, &buffer);
            buffer.clear();
            buffer_len = 0;
            if line.trim().is_empty() {
                continue;
            }
        }
        if !buffer.is_empty() {
            buffer.push('\n');
            buffer_len += 1;
        }
        buffer.push_str(line);
        buffer_len += line_len;
    }
    push_piece(&mut pieces, &buffer);
    pieces
}

fn push_piece(pieces: &mut Vec<String>, buffer: &str) {
    let piece = buffer.trim_end();
    if !piece.is_empty() {
        pieces.push(piece.to_string());
    }
}

pub(crate) fn char_len(s: &str) -> usize {
    s.chars().count()
}
