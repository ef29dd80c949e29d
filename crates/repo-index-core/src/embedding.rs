//! Embedding provider trait, provider errors and vector utilities.
//!
//! The index never names a vendor. Everything that computes vectors sits
//! behind [`EmbeddingProvider`] and is injected by the application. This
//! crate ships one implementation, [`HashedProvider`], a deterministic
//! offline embedder used for tests and network-free operation. HTTP-backed
//! providers (OpenAI, Ollama) live in the `repo-index` app crate.

use std::time::Duration;

use async_trait::async_trait;

use crate::sparse::tokenize;

/// Failure of one provider call.
///
/// Providers make a single attempt per call; retry policy belongs to the
/// caller, which uses [`ProviderError::is_retryable`] to decide.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("embedding provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("embedding provider transport error: {0}")]
    Transport(String),
    #[error("embedding provider call timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid embedding provider response: {0}")]
    InvalidResponse(String),
    #[error("embedding provider rejected input: {0}")]
    Rejected(String),
}

impl ProviderError {
    /// Rate limits, server errors, transport failures and timeouts are worth
    /// retrying. Everything else fails immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => *status == 429 || *status >= 500,
            Self::Transport(_) | Self::Timeout(_) => true,
            Self::InvalidResponse(_) | Self::Rejected(_) => false,
        }
    }
}

/// Capability that turns texts into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier; part of every embedding cache key.
    fn model_id(&self) -> &str;

    /// Length of every returned vector.
    fn dims(&self) -> usize;

    /// Embed a batch. On success the output has one vector per input, in
    /// input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Deterministic, network-free embedder.
///
/// Each token of the text (see [`tokenize`]) is wrapped in `<` `>` and split
/// into character trigrams; each trigram is hashed (FNV-1a) into one of
/// `dims` buckets with a hash-derived sign. The result is L2-normalized.
/// Texts sharing word fragments end up close under cosine similarity.
#[derive(Debug, Clone)]
pub struct HashedProvider {
    model_id: String,
    dims: usize,
}

/// Default model id of [`HashedProvider`].
pub const HASHED_MODEL_ID: &str = "hashed-trigram-v1";

impl HashedProvider {
    pub fn new(dims: usize) -> Self {
        Self::with_model_id(HASHED_MODEL_ID, dims)
    }

    pub fn with_model_id(model_id: impl Into<String>, dims: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dims: dims.max(1),
        }
    }

    /// Embed one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for token in tokenize(text) {
            let padded: Vec<char> = std::iter::once('<')
                .chain(token.chars())
                .chain(std::iter::once('>'))
                .collect();
            for gram in padded.windows(3) {
                let s: String = gram.iter().collect();
                let h = fnv1a(s.as_bytes());
                let bucket = (h % self.dims as u64) as usize;
                v[bucket] += if h >> 63 == 1 { -1.0 } else { 1.0 };
            }
        }
        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashedProvider {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0100_0000_01b3);
    }
    h
}

/// Scale `v` to unit length in place. Zero vectors are left unchanged.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Encode a float vector as little-endian `f32` bytes.
///
/// ```rust
/// use repo_index_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes. Trailing bytes that do not form a
/// whole `f32` are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::cosine_similarity;

    #[test]
    fn blob_roundtrip() {
        let v = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&v)), v);
    }

    #[test]
    fn retry_classification() {
        let http = |status| ProviderError::Http {
            status,
            body: String::new(),
        };
        assert!(http(429).is_retryable());
        assert!(http(503).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(!ProviderError::InvalidResponse("bad".into()).is_retryable());
        assert!(!ProviderError::Rejected("too long".into()).is_retryable());
    }

    #[test]
    fn hashed_is_deterministic_and_normalized() {
        let p = HashedProvider::new(256);
        let a = p.embed_one("def f(): pass");
        let b = p.embed_one("def f(): pass");
        assert_eq!(a, b);
        assert_eq!(a.len(), 256);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn hashed_shares_fragments() {
        let p = HashedProvider::new(256);
        let q = p.embed_one("function definition");
        let code = p.embed_one("def f(): pass");
        let prose = p.embed_one("hello world");
        assert!(cosine_similarity(&q, &code) > cosine_similarity(&q, &prose));
    }

    #[test]
    fn hashed_empty_text_is_zero_vector() {
        let p = HashedProvider::new(8);
        assert!(p.embed_one("  ").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn hashed_embed_batch() {
        let p = HashedProvider::new(32);
        let texts = vec!["alpha".to_string(), "beta".to_string()];
        let out = p.embed(&texts).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], p.embed_one("alpha"));
        assert_eq!(p.model_id(), HASHED_MODEL_ID);
        assert_eq!(p.dims(), 32);
    }
}
