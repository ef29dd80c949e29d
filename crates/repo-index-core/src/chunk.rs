//! Deterministic, offset-addressed text chunker.
//!
//! Splits a file's text into [`Chunk`]s that are independently embedded and
//! retrieved. Every chunk's `text` is exactly `file_text[start_offset..end_offset]`
//! and its id is derived from the path and those offsets, so identical input
//! and parameters always produce identical ids and digests.
//!
//! # Strategies
//!
//! - [`ChunkStrategy::Structural`]: detect top-level definitions (functions,
//!   classes, impls, ...) and Markdown headings with per-language patterns,
//!   pull each boundary up over the decorators, attributes and doc comments
//!   directly above it, then greedily merge adjacent small sections up to
//!   `max_chunk_size`. Sections that are still too large fall back to the
//!   sliding window. Files without a known language are windowed.
//! - [`ChunkStrategy::Window`]: sliding byte windows of `max_chunk_size`
//!   with `overlap` bytes shared between neighbours. Window ends prefer a
//!   newline, then a space, in the second half of the window.
//!
//! Leading and trailing whitespace is trimmed from each chunk span, and
//! whitespace-only spans are skipped, so empty text yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use repo_index_core::chunk::{chunk, ChunkerConfig};
//! use repo_index_core::models::Language;
//!
//! let config = ChunkerConfig::default();
//! let chunks: Vec<_> = chunk("a.py", "def f(): pass", Some(Language::Python), &config).collect();
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_id, "a.py#0-13");
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::digest;
use crate::models::{chunk_id, Chunk, Language};

/// How chunk boundaries are chosen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    #[default]
    Structural,
    Window,
}

/// Chunker parameters. Part of the cache identity of a chunk, since changing
/// them changes offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Maximum chunk length in bytes.
    pub max_chunk_size: usize,
    /// Bytes shared between consecutive windows. Must be below `max_chunk_size`.
    pub overlap: usize,
    pub strategy: ChunkStrategy,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: 1500,
            overlap: 150,
            strategy: ChunkStrategy::Structural,
        }
    }
}

static PYTHON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:async\s+def|def|class)\s").expect("valid boundary pattern")
});
static RUST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:pub(?:\([^)]*\))?\s+)?(?:(?:async|unsafe|const|extern)\s+)*(?:fn|struct|enum|trait|impl|mod|type|union|macro_rules!)\b",
    )
    .expect("valid boundary pattern")
});
static GO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(?:func|type)\s").expect("valid boundary pattern"));
static JS_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:export\s+)?(?:default\s+)?(?:declare\s+)?(?:async\s+)?(?:function\*?|class|interface|type|enum|const|let|var)\s",
    )
    .expect("valid boundary pattern")
});
static CLASS_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^(?:(?:public|private|protected|internal|static|final|abstract|open|sealed|data|partial|override)\s+)*(?:class|interface|enum|struct|record|object|fun|func|function|trait|protocol|extension|namespace)\s",
    )
    .expect("valid boundary pattern")
});
static C_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:typedef\s+)?(?:struct|class|namespace|enum|union|template)\b")
        .expect("valid boundary pattern")
});
static RUBY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:def|class|module)\s").expect("valid boundary pattern")
});
static SHELL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:function\s+[\w-]+|[\w-]+\s*\(\)\s*\{)").expect("valid boundary pattern")
});
static MARKDOWN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{1,6}\s").expect("valid boundary pattern"));

fn boundary_pattern(language: Language) -> Option<&'static Regex> {
    let pattern = match language {
        Language::Python => &PYTHON,
        Language::Rust => &RUST,
        Language::Go => &GO,
        Language::Javascript
        | Language::Typescript
        | Language::TypescriptReact
        | Language::JavascriptReact => &JS_LIKE,
        Language::Java
        | Language::Kotlin
        | Language::Csharp
        | Language::Swift
        | Language::Php => &CLASS_LIKE,
        Language::C | Language::Cpp => &C_LIKE,
        Language::Ruby => &RUBY,
        Language::Shell => &SHELL,
        Language::Markdown => &MARKDOWN,
        _ => return None,
    };
    Some(LazyLock::force(pattern))
}

/// Whether a line belongs to the definition below it (decorator, attribute,
/// or comment).
fn is_preamble_line(line: &str, language: Language) -> bool {
    let t = line.trim_start();
    if t.is_empty() {
        return false;
    }
    if language == Language::Markdown {
        return false;
    }
    if t.starts_with('#') && !matches!(language, Language::Python | Language::Shell | Language::Ruby)
    {
        // `#[attr]` in Rust, `#[Attr]` in PHP 8, preprocessor lines in C.
        return t.starts_with("#[") || t.starts_with("#if") || t.starts_with("#define");
    }
    t.starts_with('@')
        || t.starts_with('#')
        || t.starts_with("//")
        || t.starts_with("/*")
        || t.starts_with('*')
        || t.starts_with("--")
}

/// Byte offset of the start of the line preceding `line_start`, if any.
fn previous_line_start(text: &str, line_start: usize) -> Option<usize> {
    if line_start == 0 {
        return None;
    }
    let before = &text[..line_start - 1];
    Some(before.rfind('\n').map(|i| i + 1).unwrap_or(0))
}

/// Section start offsets for the structural strategy, always starting at 0.
fn structural_boundaries(text: &str, language: Option<Language>) -> Vec<usize> {
    let mut starts = vec![0];
    let (Some(language), Some(re)) = (language, language.and_then(boundary_pattern)) else {
        return starts;
    };

    for m in re.find_iter(text) {
        let mut start = m.start();
        let floor = starts.last().copied().unwrap_or(0);
        while let Some(prev) = previous_line_start(text, start) {
            if prev < floor {
                break;
            }
            let line = &text[prev..start - 1];
            if !is_preamble_line(line, language) {
                break;
            }
            start = prev;
        }
        if start > floor {
            starts.push(start);
        }
    }
    starts
}

/// Greedily merge contiguous sections into spans of at most `max` bytes.
/// A single section larger than `max` becomes its own span.
fn merge_sections(starts: &[usize], len: usize, max: usize) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut current: Option<(usize, usize)> = None;

    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(len);
        current = match current {
            Some((s, _)) if end - s <= max => Some((s, end)),
            Some(done) => {
                spans.push(done);
                Some((start, end))
            }
            None => Some((start, end)),
        };
    }
    if let Some(last) = current {
        spans.push(last);
    }
    spans
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn next_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index + 1;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i.min(s.len())
}

/// Shrink `[start, end)` to exclude surrounding whitespace.
fn trim_span(text: &str, start: usize, end: usize) -> Option<(usize, usize)> {
    let slice = &text[start..end];
    let lead = slice.len() - slice.trim_start().len();
    let trail = slice.len() - slice.trim_end().len();
    if lead == slice.len() {
        return None;
    }
    Some((start + lead, end - trail))
}

/// Lazy sequence of chunks for one file.
///
/// A clone continues independently from the current position. Calling
/// [`chunk`] again restarts from the beginning with identical output.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    path: &'a str,
    text: &'a str,
    max: usize,
    overlap: usize,
    spans: Vec<(usize, usize)>,
    span_idx: usize,
    /// Window cursor inside an oversized span.
    cursor: Option<usize>,
    last: Option<(usize, usize)>,
}

impl<'a> Chunks<'a> {
    fn make(&self, start: usize, end: usize) -> Option<Chunk> {
        let (start, end) = trim_span(self.text, start, end)?;
        let text = &self.text[start..end];
        Some(Chunk {
            chunk_id: chunk_id(self.path, start, end),
            source_path: self.path.to_string(),
            text: text.to_string(),
            start_offset: start,
            end_offset: end,
            content_digest: digest::digest(text.as_bytes()),
        })
    }

    /// End of the window starting at `pos` inside a span ending at `span_end`.
    fn window_end(&self, pos: usize, span_end: usize) -> usize {
        if span_end - pos <= self.max {
            return span_end;
        }
        let limit = floor_char_boundary(self.text, pos + self.max);
        if limit <= pos {
            return next_char_boundary(self.text, pos);
        }
        let window = &self.text[pos..limit];
        let min_break = self.max / 2;
        window
            .rfind('\n')
            .filter(|&i| i >= min_break)
            .or_else(|| window.rfind(' ').filter(|&i| i >= min_break))
            .map(|i| pos + i + 1)
            .unwrap_or(limit)
    }
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            let &(span_start, span_end) = self.spans.get(self.span_idx)?;

            let (start, end) = if span_end - span_start <= self.max {
                self.span_idx += 1;
                (span_start, span_end)
            } else {
                let pos = self.cursor.unwrap_or(span_start);
                let end = self.window_end(pos, span_end);
                if end >= span_end {
                    self.cursor = None;
                    self.span_idx += 1;
                } else {
                    let back = floor_char_boundary(self.text, end.saturating_sub(self.overlap));
                    self.cursor = Some(if back > pos { back } else { end });
                }
                (pos, end)
            };

            if let Some(c) = self.make(start, end) {
                let span = (c.start_offset, c.end_offset);
                if self.last == Some(span) {
                    continue;
                }
                self.last = Some(span);
                return Some(c);
            }
        }
    }
}

/// Split `text` (the content of `path`) into chunks.
pub fn chunk<'a>(
    path: &'a str,
    text: &'a str,
    language: Option<Language>,
    config: &ChunkerConfig,
) -> Chunks<'a> {
    let max = config.max_chunk_size.max(1);
    let overlap = config.overlap.min(max - 1);

    let spans = if text.trim().is_empty() {
        Vec::new()
    } else {
        match config.strategy {
            ChunkStrategy::Window => vec![(0, text.len())],
            ChunkStrategy::Structural => {
                let starts = structural_boundaries(text, language);
                merge_sections(&starts, text.len(), max)
            }
        }
    };

    Chunks {
        path,
        text,
        max,
        overlap,
        spans,
        span_idx: 0,
        cursor: None,
        last: None,
    }
}
