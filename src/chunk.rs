//! Boundary-aware text chunker for tool descriptions.
//!
//! Splits a tool's embedding text into [`ToolChunk`]s that respect a
//! configurable `max_chunk_chars` limit. Splitting prefers semantic
//! boundaries (paragraph, then line, then sentence) and carries a bounded
//! overlap between adjacent chunks so no boundary context is lost.
//!
//! Every chunk after the first begins with a continuation prefix
//! `"{tool_name}: ... "`, so the embedding model always sees which tool
//! the text belongs to.
//!
//! # Algorithm
//!
//! 1. If `max_chunk_chars` is 0 or the text fits, return it verbatim.
//! 2. Pick the first separator of `"\n\n"` → `"\n"` → `". "` that occurs
//!    in the text; split there, re-attaching the separator to the end of
//!    each preceding part.
//! 3. Greedily merge segments into a buffer until adding the next segment
//!    would exceed `max_chunk_chars`; then flush and start a new buffer
//!    seeded with the continuation prefix plus the last `overlap_chars`
//!    of the previous chunk.
//! 4. A single segment longer than `max_chunk_chars` is hard-split into
//!    `max_chunk_chars`-length pieces, each seeded the same way.
//!
//! All length accounting and slicing is in characters, never bytes, so
//! multi-byte text cannot be split mid-codepoint.

use crate::models::ToolChunk;

/// Split `text` into bounded overlapping chunks.
///
/// # Guarantees
///
/// - At least one chunk is always returned.
/// - `chunks[i].index == i` and `chunks[i].total == chunks.len()`.
/// - Every chunk after the first starts with `"{tool_name}: ... "`.
/// - With `overlap_chars > 0`, the last `overlap_chars` characters of
///   each chunk reappear in the next one.
pub fn chunk_text(
    text: &str,
    tool_name: &str,
    max_chunk_chars: usize,
    overlap_chars: usize,
) -> Vec<ToolChunk> {
    if max_chunk_chars == 0 || char_len(text) <= max_chunk_chars {
        return vec![ToolChunk {
            index: 0,
            total: 1,
            text: text.to_string(),
        }];
    }

    let prefix = format!("{tool_name}: ... ");
    let segments = split_segments(text);
    let mut out: Vec<String> = Vec::new();
    let mut buf = String::new();

    for seg in segments {
        let seg_len = char_len(&seg);

        if seg_len > max_chunk_chars {
            if !buf.is_empty() {
                out.push(std::mem::take(&mut buf));
            }
            hard_split(&seg, max_chunk_chars, overlap_chars, &prefix, &mut out);
            continue;
        }

        if !buf.is_empty() && char_len(&buf) + seg_len > max_chunk_chars {
            out.push(std::mem::take(&mut buf));
        }

        if buf.is_empty() {
            match out.last() {
                Some(prev) => {
                    buf = seed_buffer(&prefix, prev, overlap_chars);
                    buf.push_str(&seg);
                }
                None => buf.push_str(&seg),
            }
        } else {
            buf.push_str(&seg);
        }
    }

    if !buf.is_empty() {
        out.push(buf);
    }

    let total = out.len();
    out.into_iter()
        .enumerate()
        .map(|(index, text)| ToolChunk { index, total, text })
        .collect()
}

/// Slice an oversized segment into `max`-character pieces.
///
/// The first piece is emitted verbatim only when it opens the whole
/// sequence; every other piece gets the continuation seed so the chain
/// of overlaps stays unbroken.
fn hard_split(seg: &str, max: usize, overlap: usize, prefix: &str, out: &mut Vec<String>) {
    let chars: Vec<char> = seg.chars().collect();
    let mut pos = 0;
    while pos < chars.len() {
        let end = (pos + max).min(chars.len());
        let piece: String = chars[pos..end].iter().collect();
        match out.last() {
            None => out.push(piece),
            Some(prev) => {
                let mut text = seed_buffer(prefix, prev, overlap);
                text.push_str(&piece);
                out.push(text);
            }
        }
        pos = end;
    }
}

/// Continuation seed for a new chunk: prefix plus the tail of the
/// previous chunk (when overlap is enabled).
fn seed_buffer(prefix: &str, prev: &str, overlap: usize) -> String {
    let mut s = String::with_capacity(prefix.len() + overlap);
    s.push_str(prefix);
    if overlap > 0 {
        s.push_str(last_chars(prev, overlap));
    }
    s
}

/// Split on the first separator of the hierarchy that occurs in the text,
/// re-attaching the separator to the end of each preceding part.
///
/// Concatenating the returned segments reproduces the input exactly.
fn split_segments(text: &str) -> Vec<String> {
    for sep in ["\n\n", "\n", ". "] {
        if text.contains(sep) {
            let parts: Vec<&str> = text.split(sep).collect();
            let last = parts.len() - 1;
            let mut segments = Vec::with_capacity(parts.len());
            for (i, part) in parts.into_iter().enumerate() {
                if i < last {
                    segments.push(format!("{part}{sep}"));
                } else if !part.is_empty() {
                    segments.push(part.to_string());
                }
            }
            return segments;
        }
    }
    vec![text.to_string()]
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// The last `n` characters of `s` (the whole string when shorter).
fn last_chars(s: &str, n: usize) -> &str {
    let len = s.chars().count();
    if n >= len {
        return s;
    }
    match s.char_indices().nth(len - n) {
        Some((byte_pos, _)) => &s[byte_pos..],
        None => s,
    }
}
