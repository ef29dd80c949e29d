//! Core data models shared by the index components.
//!
//! - [`FileRecord`]: one scanned file in a manifest.
//! - [`Chunk`]: an offset-addressed slice of a file's text.
//! - [`EmbeddingRecord`]: a vector computed for a chunk digest by one model.
//! - [`ChunkRef`]: a ranked retrieval result handed to consumers.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;

/// Language guessed from a file's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
    TypescriptReact,
    JavascriptReact,
    Go,
    Rust,
    Java,
    Cpp,
    C,
    Csharp,
    Ruby,
    Php,
    Swift,
    Kotlin,
    Shell,
    Markdown,
    Json,
    Yaml,
    Xml,
    Html,
    Css,
    Sql,
}

impl Language {
    /// Map a lowercase file extension (without the dot) to a language.
    pub fn from_extension(ext: &str) -> Option<Self> {
        let lang = match ext {
            "py" => Self::Python,
            "js" => Self::Javascript,
            "ts" => Self::Typescript,
            "tsx" => Self::TypescriptReact,
            "jsx" => Self::JavascriptReact,
            "go" => Self::Go,
            "rs" => Self::Rust,
            "java" => Self::Java,
            "cpp" | "h" | "hpp" => Self::Cpp,
            "c" => Self::C,
            "cs" => Self::Csharp,
            "rb" => Self::Ruby,
            "php" => Self::Php,
            "swift" => Self::Swift,
            "kt" => Self::Kotlin,
            "sh" => Self::Shell,
            "md" => Self::Markdown,
            "json" => Self::Json,
            "yml" | "yaml" => Self::Yaml,
            "xml" => Self::Xml,
            "html" => Self::Html,
            "css" => Self::Css,
            "sql" => Self::Sql,
            _ => return None,
        };
        Some(lang)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Option<Self> {
        let ext = path.as_ref().extension()?.to_str()?.to_ascii_lowercase();
        Self::from_extension(&ext)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::Javascript => "javascript",
            Self::Typescript => "typescript",
            Self::TypescriptReact => "typescript-react",
            Self::JavascriptReact => "javascript-react",
            Self::Go => "go",
            Self::Rust => "rust",
            Self::Java => "java",
            Self::Cpp => "cpp",
            Self::C => "c",
            Self::Csharp => "csharp",
            Self::Ruby => "ruby",
            Self::Php => "php",
            Self::Swift => "swift",
            Self::Kotlin => "kotlin",
            Self::Shell => "shell",
            Self::Markdown => "markdown",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Xml => "xml",
            Self::Html => "html",
            Self::Css => "css",
            Self::Sql => "sql",
        }
    }
}

/// A scanned file, keyed by its repository-relative path.
///
/// Records are never mutated. A content change produces a new record with a
/// new digest that supersedes the old one in the next manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the scanned root, `/`-separated.
    pub relative_path: String,
    pub content_digest: ContentDigest,
    pub byte_size: u64,
    pub last_modified: DateTime<Utc>,
    pub language_guess: Option<Language>,
}

/// A contiguous slice of a file's text.
///
/// Offsets are byte offsets into the UTF-8 text of `source_path` and always
/// fall on character boundaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_path: String,
    pub text: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Digest of `text`; the embedding cache key.
    pub content_digest: ContentDigest,
}

/// Derive a chunk id from its source path and byte span.
pub fn chunk_id(path: &str, start: usize, end: usize) -> String {
    format!("{path}#{start}-{end}")
}

/// A dense vector computed for one chunk digest by one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub chunk_digest: ContentDigest,
    pub vector: Vec<f32>,
    pub model_id: String,
}

/// A ranked retrieval result.
///
/// Carries enough location information for consumers to cite the exact
/// region of source it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub chunk_id: String,
    pub source_path: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Combined, normalized score in `[0, 1]`.
    pub score: f64,
    /// Raw cosine similarity, if the chunk appeared in the dense results.
    pub dense_score: Option<f64>,
    /// Raw BM25 score, if the chunk appeared in the sparse results.
    pub sparse_score: Option<f64>,
    pub text: String,
}
