//! Line-window text chunker.
//!
//! Splits a source file into [`Chunk`]s of at most `max_lines` lines and
//! `max_chars` characters, with `overlap_lines` of overlap between
//! neighbours so citations carry real line ranges.
//!
//! # Algorithm
//!
//! 1. Split the text into lines (`\n` or `\r\n`).
//! 2. Detect fenced blocks: a line whose trimmed start is ```` ``` ```` or
//!    `~~~` opens a fence that the next line starting with the same marker
//!    closes. Unclosed fences are ignored.
//! 3. Grow a window from `start` until either limit is hit.
//! 4. If the cut lands inside a fence, move it back to just before the
//!    fence, provided that still moves past the previous cut. Otherwise cut
//!    hard at the limit.
//! 5. Advance `start` to `end - overlap`, where the overlap shrinks in
//!    proportion when the window was cut short by the character budget. If
//!    the overlapped window cannot reach past the previous `end`, restart
//!    at that `end` with no overlap, so no chunk is contained in the one
//!    before it.
//! 6. A single line longer than `max_chars` becomes several chunks that
//!    share its line number.
//!
//! The output depends only on the text and [`ChunkParams`]: no randomness,
//! no clocks.
//!
//! # Example
//!
//! ```rust
//! use repo_guide_core::chunk::{chunk_file, ChunkParams};
//!
//! let text = (1..=100).map(|i| format!("line {i}")).collect::<Vec<_>>().join("\n");
//! let params = ChunkParams { max_lines: 60, overlap_lines: 10, max_chars: 10_000 };
//! let chunks = chunk_file("src/lib.rs", &text, &params);
//! assert_eq!(chunks.len(), 2);
//! assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 60));
//! assert_eq!((chunks[1].start_line, chunks[1].end_line), (51, 100));
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::models::Chunk;

/// Size limits for one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkParams {
    pub max_lines: usize,
    pub overlap_lines: usize,
    pub max_chars: usize,
}

impl Default for ChunkParams {
    fn default() -> Self {
        Self {
            max_lines: 60,
            overlap_lines: 10,
            max_chars: 2400,
        }
    }
}

/// Chunk one file. Returns an empty vector for empty or blank text.
pub fn chunk_file(file_path: &str, text: &str, params: &ChunkParams) -> Vec<Chunk> {
    let lines: Vec<&str> = text.lines().collect();
    let n = lines.len();
    let max_lines = params.max_lines.max(1);
    let max_chars = params.max_chars.max(1);

    let fences = find_fences(&lines);
    let mut builder = ChunkBuilder::new(file_path);

    let mut start = 0usize;
    let mut prev_end = 0usize;

    while start < n {
        if lines[start].chars().count() > max_chars {
            builder.push_long_line(start, lines[start], max_chars);
            prev_end = start + 1;
            start += 1;
            continue;
        }

        let mut end = window_end(&lines, start, max_lines, max_chars);
        if end <= prev_end {
            start = prev_end;
            continue;
        }

        if end < n {
            if let Some(open) = fence_cut(&fences, end) {
                if open > start && open > prev_end {
                    end = open;
                }
            }
        }

        builder.push(start, end, &lines[start..end]);

        if end >= n {
            break;
        }

        let span = end - start;
        let overlap = (params.overlap_lines.min(max_lines) * span / max_lines).min(span - 1);
        prev_end = end;
        start = end - overlap;
    }

    builder.finish()
}

/// Exclusive end of the window starting at `start`. Always covers at least
/// one line.
fn window_end(lines: &[&str], start: usize, max_lines: usize, max_chars: usize) -> usize {
    let limit = (start + max_lines).min(lines.len());
    let mut chars = 0usize;
    let mut end = start;
    while end < limit {
        let cost = lines[end].chars().count() + usize::from(end > start);
        if end > start && chars + cost > max_chars {
            break;
        }
        chars += cost;
        end += 1;
    }
    end.max(start + 1)
}

/// `(open, close)` line indices of every closed fenced block.
fn find_fences(lines: &[&str]) -> Vec<(usize, usize)> {
    let mut fences = Vec::new();
    let mut open: Option<(usize, &str)> = None;
    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        let marker = if trimmed.starts_with("```") {
            "```"
        } else if trimmed.starts_with("~~~") {
            "~~~"
        } else {
            continue;
        };
        match open {
            Some((start, m)) if m == marker => {
                fences.push((start, i));
                open = None;
            }
            Some(_) => {}
            None => open = Some((i, marker)),
        }
    }
    fences
}

/// If cutting before line `end` would split a fence, the fence's opening
/// line.
fn fence_cut(fences: &[(usize, usize)], end: usize) -> Option<usize> {
    fences
        .iter()
        .find(|(open, close)| *open < end && end <= *close)
        .map(|(open, _)| *open)
}

struct ChunkBuilder<'a> {
    file_path: &'a str,
    chunks: Vec<Chunk>,
}

impl<'a> ChunkBuilder<'a> {
    fn new(file_path: &'a str) -> Self {
        Self {
            file_path,
            chunks: Vec::new(),
        }
    }

    fn push(&mut self, start: usize, end: usize, lines: &[&str]) {
        let text = lines.join("\n");
        if text.trim().is_empty() {
            return;
        }
        self.emit(start + 1, end, text);
    }

    fn push_long_line(&mut self, index: usize, line: &str, max_chars: usize) {
        let chars: Vec<char> = line.chars().collect();
        for piece in chars.chunks(max_chars) {
            let text: String = piece.iter().collect();
            if !text.trim().is_empty() {
                self.emit(index + 1, index + 1, text);
            }
        }
    }

    fn emit(&mut self, start_line: usize, end_line: usize, text: String) {
        let sequence_index = self.chunks.len() as u32;
        self.chunks.push(Chunk {
            file_path: self.file_path.to_string(),
            start_line: start_line as u32,
            end_line: end_line as u32,
            hash: content_hash(&text),
            text,
            sequence_index,
        });
    }

    fn finish(self) -> Vec<Chunk> {
        self.chunks
    }
}

/// SHA-256 of a chunk's text, hex encoded.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> String {
        (1..=n)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn params(max_lines: usize, overlap_lines: usize, max_chars: usize) -> ChunkParams {
        ChunkParams {
            max_lines,
            overlap_lines,
            max_chars,
        }
    }

    #[test]
    fn test_empty_and_blank_text() {
        assert!(chunk_file("a.rs", "", &ChunkParams::default()).is_empty());
        assert!(chunk_file("a.rs", "\n\n   \n", &ChunkParams::default()).is_empty());
    }

    #[test]
    fn test_small_file_single_chunk() {
        let chunks = chunk_file("a.rs", "fn main() {}\n", &ChunkParams::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 1);
        assert_eq!(chunks[0].text, "fn main() {}");
        assert_eq!(chunks[0].sequence_index, 0);
    }

    #[test]
    fn test_overlap_windows() {
        let chunks = chunk_file("a.rs", &numbered(25), &params(10, 3, 10_000));
        let spans: Vec<(u32, u32)> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(spans, vec![(1, 10), (8, 17), (15, 24), (22, 25)]);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.sequence_index, i as u32);
        }
    }

    #[test]
    fn test_text_matches_line_span() {
        let text = numbered(30);
        let lines: Vec<&str> = text.lines().collect();
        for c in chunk_file("a.rs", &text, &params(7, 2, 10_000)) {
            let expected = lines[(c.start_line - 1) as usize..c.end_line as usize].join("\n");
            assert_eq!(c.text, expected);
        }
    }

    #[test]
    fn test_char_budget_cuts_on_line_breaks() {
        let chunks = chunk_file("a.rs", &numbered(20), &params(100, 0, 20));
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.text.chars().count() <= 20, "chunk too long: {:?}", c.text);
            assert!(!c.text.ends_with('\n'));
        }
        assert_eq!(chunks.last().unwrap().end_line, 20);
    }

    #[test]
    fn test_fence_not_split() {
        let mut lines: Vec<String> = (1..=6).map(|i| format!("intro {}", i)).collect();
        lines.push("```rust".to_string());
        lines.extend((1..=5).map(|i| format!("let x{} = {};", i, i)));
        lines.push("```".to_string());
        lines.extend((1..=4).map(|i| format!("outro {}", i)));
        let text = lines.join("\n");

        let chunks = chunk_file("README.md", &text, &params(10, 0, 10_000));
        // The window would end at line 10, inside the fence (lines 7-13).
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 6));
        assert_eq!(chunks[1].start_line, 7);
        assert!(chunks[1].end_line >= 13);
        assert!(chunks[1].text.starts_with("```rust"));
        assert!(chunks[1].text.contains("\n```"));
    }

    #[test]
    fn test_oversized_fence_hard_cut() {
        let mut lines = vec!["```".to_string()];
        lines.extend((1..=30).map(|i| format!("code {}", i)));
        lines.push("```".to_string());
        let chunks = chunk_file("README.md", &lines.join("\n"), &params(10, 2, 10_000));
        assert!(chunks.len() > 1);
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 10));
        assert_eq!(chunks.last().unwrap().end_line, 32);
    }

    #[test]
    fn test_unclosed_fence_ignored() {
        let mut lines = vec!["intro".to_string(), "```".to_string()];
        lines.extend((1..=20).map(|i| format!("code {}", i)));
        let chunks = chunk_file("a.md", &lines.join("\n"), &params(10, 0, 10_000));
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 10));
    }

    #[test]
    fn test_long_line_split() {
        let long = "x".repeat(25);
        let text = format!("short\n{}\ntail", long);
        let chunks = chunk_file("min.js", &text, &params(60, 10, 10));
        assert!(chunks.iter().all(|c| c.text.chars().count() <= 10));
        let long_pieces: Vec<&Chunk> = chunks.iter().filter(|c| c.start_line == 2).collect();
        assert_eq!(long_pieces.len(), 3);
        assert!(long_pieces.iter().all(|c| c.end_line == 2));
        assert_eq!(chunks.last().unwrap().text, "tail");
    }

    #[test]
    fn test_multibyte_utf8() {
        let text = "┌──────────────────┐\n│ Hello world      │\n└──────────────────┘";
        let chunks = chunk_file("box.txt", text, &params(60, 0, 7));
        assert!(!chunks.is_empty());
        for c in &chunks {
            assert!(c.text.chars().count() <= 7);
        }
    }

    #[test]
    fn test_crlf_lines() {
        let chunks = chunk_file("a.txt", "one\r\ntwo\r\nthree\r\n", &ChunkParams::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "one\ntwo\nthree");
        assert_eq!(chunks[0].end_line, 3);
    }

    #[test]
    fn test_overlap_larger_than_window_still_advances() {
        let chunks = chunk_file("a.rs", &numbered(12), &params(3, 10, 10_000));
        assert!(chunks.len() >= 4);
        for pair in chunks.windows(2) {
            assert!(pair[1].start_line > pair[0].start_line);
        }
        assert_eq!(chunks.last().unwrap().end_line, 12);
    }

    fn is_nested(outer: &Chunk, inner: &Chunk) -> bool {
        inner.start_line >= outer.start_line && inner.end_line <= outer.end_line
    }

    #[test]
    fn test_long_line_after_window_does_not_nest() {
        let text = format!("{}\n{}", numbered(10), "y".repeat(3000));
        let chunks = chunk_file("a.js", &text, &ChunkParams::default());
        let spans: Vec<(u32, u32)> = chunks.iter().map(|c| (c.start_line, c.end_line)).collect();
        assert_eq!(spans, vec![(1, 10), (11, 11), (11, 11)]);
    }

    #[test]
    fn test_wide_lines_keep_bounded_chunk_count() {
        let text = (1..=100)
            .map(|i| format!("{:03}{}", i, "w".repeat(297)))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_file("wide.txt", &text, &ChunkParams::default());
        assert!(chunks.len() <= 20, "{} chunks", chunks.len());
        assert_eq!(chunks.last().unwrap().end_line, 100);
        for pair in chunks.windows(2) {
            assert!(pair[1].end_line > pair[0].end_line);
            assert!(!is_nested(&pair[0], &pair[1]), "{:?} inside {:?}", pair[1].start_line, pair[0].start_line);
            assert!(pair[1].start_line <= pair[0].end_line + 1, "gap between chunks");
        }
    }

    #[test]
    fn test_no_chunk_nested_in_previous() {
        let mut lines: Vec<String> = Vec::new();
        for i in 0..80 {
            let width = if i % 7 == 0 { 900 } else { 20 + i };
            lines.push(format!("{}{}", i, "z".repeat(width)));
        }
        let text = lines.join("\n");
        let chunks = chunk_file("mixed.txt", &text, &params(12, 4, 1000));
        for pair in chunks.windows(2) {
            let single_line = pair[0].start_line == pair[0].end_line
                && (pair[0].start_line, pair[0].end_line) == (pair[1].start_line, pair[1].end_line);
            if !single_line {
                assert!(!is_nested(&pair[0], &pair[1]), "{:?}", (pair[0].start_line, pair[0].end_line, pair[1].start_line, pair[1].end_line));
            }
        }
        assert_eq!(chunks.last().unwrap().end_line, 80);
    }

    #[test]
    fn test_deterministic() {
        let text = format!("{}\n```\nfenced\n```\n{}", numbered(40), numbered(40));
        let p = params(9, 3, 120);
        let c1 = chunk_file("a.md", &text, &p);
        let c2 = chunk_file("a.md", &text, &p);
        assert_eq!(c1, c2);
    }

    #[test]
    fn test_hash_is_sha256_of_text() {
        let chunks = chunk_file("a.rs", "hello", &ChunkParams::default());
        assert_eq!(
            chunks[0].hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }
}
