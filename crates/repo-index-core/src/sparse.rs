//! Incremental BM25 inverted index over chunk text.
//!
//! Documents are chunk ids. Adding a document records its term frequencies
//! and updates the postings lists; removing it decrements them and drops
//! postings that reach zero, so the index never needs a rebuild after an
//! incremental update.
//!
//! Scoring is Okapi BM25 evaluated at query time from the current postings:
//!
//! ```text
//! score(q, d) = Σ IDF(t) · tf(t,d)·(k1+1) / (tf(t,d) + k1·(1 − b + b·|d|/avgdl))
//! IDF(t)      = ln((N − n(t) + 0.5) / (n(t) + 0.5) + 1)
//! ```
//!
//! The persisted form holds only per-document term frequencies; postings and
//! length totals are rebuilt on deserialization.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Default term-frequency saturation.
pub const DEFAULT_K1: f64 = 1.2;
/// Default length normalization.
pub const DEFAULT_B: f64 = 0.75;

// ── Tokenizer ───────────────────────────────────────────────────────────────

/// Tokenize text for indexing and querying.
///
/// Splits on non-alphanumeric characters, then on camelCase, acronym and
/// digit boundaries, lowercases, and drops tokens shorter than two bytes.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for segment in text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
    {
        for part in split_camel_case(segment) {
            let lower = part.to_lowercase();
            if lower.len() >= 2 {
                tokens.push(lower);
            }
        }
    }
    tokens
}

/// "getHTTPResponse" -> ["get", "HTTP", "Response"], "item2count" -> ["item", "2", "count"]
fn split_camel_case(s: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = s.char_indices().collect();
    let mut parts = Vec::new();
    let mut start = 0;

    for i in 1..chars.len() {
        let prev = chars[i - 1].1;
        let curr = chars[i].1;
        let lower_to_upper = prev.is_lowercase() && curr.is_uppercase();
        let upper_run_end =
            i >= 2 && chars[i - 2].1.is_uppercase() && prev.is_uppercase() && curr.is_lowercase();
        let digit_boundary = (prev.is_alphabetic() && curr.is_ascii_digit())
            || (prev.is_ascii_digit() && curr.is_alphabetic());

        if lower_to_upper || upper_run_end || digit_boundary {
            let split_at = if upper_run_end { chars[i - 1].0 } else { chars[i].0 };
            if split_at > start {
                parts.push(&s[start..split_at]);
                start = split_at;
            }
        }
    }
    if start < s.len() {
        parts.push(&s[start..]);
    }
    parts
}

// ── Index ───────────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct SparseIndexData {
    k1: f64,
    b: f64,
    documents: BTreeMap<String, BTreeMap<String, u32>>,
}

/// BM25 index supporting incremental add and remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "SparseIndexData", into = "SparseIndexData")]
pub struct SparseIndex {
    k1: f64,
    b: f64,
    /// term -> (doc id -> term frequency)
    postings: BTreeMap<String, BTreeMap<String, u32>>,
    /// doc id -> (term -> term frequency)
    documents: BTreeMap<String, BTreeMap<String, u32>>,
    /// doc id -> length in tokens
    doc_lengths: BTreeMap<String, u32>,
    total_len: u64,
}

impl Default for SparseIndex {
    fn default() -> Self {
        Self::with_params(DEFAULT_K1, DEFAULT_B)
    }
}

impl From<SparseIndexData> for SparseIndex {
    fn from(data: SparseIndexData) -> Self {
        let mut index = Self::with_params(data.k1, data.b);
        for (id, terms) in data.documents {
            index.insert_terms(id, terms);
        }
        index
    }
}

impl From<SparseIndex> for SparseIndexData {
    fn from(index: SparseIndex) -> Self {
        Self {
            k1: index.k1,
            b: index.b,
            documents: index.documents,
        }
    }
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_params(k1: f64, b: f64) -> Self {
        Self {
            k1,
            b,
            postings: BTreeMap::new(),
            documents: BTreeMap::new(),
            doc_lengths: BTreeMap::new(),
            total_len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.documents.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.documents.keys().map(String::as_str)
    }

    /// Number of distinct terms with at least one posting.
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    /// Number of documents containing `term`.
    pub fn doc_freq(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, BTreeMap::len)
    }

    /// Index `text` under `id`, replacing any previous document with that id.
    pub fn add(&mut self, id: &str, text: &str) {
        self.remove(id);
        let mut terms: BTreeMap<String, u32> = BTreeMap::new();
        for token in tokenize(text) {
            *terms.entry(token).or_insert(0) += 1;
        }
        self.insert_terms(id.to_string(), terms);
    }

    fn insert_terms(&mut self, id: String, terms: BTreeMap<String, u32>) {
        let len: u32 = terms.values().sum();
        for (term, &tf) in &terms {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.clone(), tf);
        }
        self.total_len += u64::from(len);
        self.doc_lengths.insert(id.clone(), len);
        self.documents.insert(id, terms);
    }

    /// Remove a document. Returns whether it was present.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(terms) = self.documents.remove(id) else {
            return false;
        };
        for term in terms.keys() {
            if let Some(list) = self.postings.get_mut(term) {
                list.remove(id);
                if list.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        if let Some(len) = self.doc_lengths.remove(id) {
            self.total_len = self.total_len.saturating_sub(u64::from(len));
        }
        true
    }

    fn idf(&self, doc_freq: usize) -> f64 {
        let n = self.documents.len() as f64;
        let df = doc_freq as f64;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    /// Rank documents against `query`. Only documents sharing at least one
    /// term are returned, ordered by descending score then ascending id.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f64)> {
        if top_k == 0 || self.documents.is_empty() {
            return Vec::new();
        }
        let avgdl = (self.total_len as f64 / self.documents.len() as f64).max(1.0);
        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();

        let mut scores: BTreeMap<&str, f64> = BTreeMap::new();
        for term in &terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(list.len());
            for (id, &tf) in list {
                let tf = f64::from(tf);
                let dl = f64::from(self.doc_lengths.get(id).copied().unwrap_or(0));
                let norm = tf + self.k1 * (1.0 - self.b + self.b * dl / avgdl);
                *scores.entry(id.as_str()).or_insert(0.0) += idf * tf * (self.k1 + 1.0) / norm;
            }
        }

        let mut ranked: Vec<(String, f64)> = scores
            .into_iter()
            .filter(|(_, s)| *s > 0.0)
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(top_k);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_handles_code() {
        assert_eq!(
            tokenize("getHTTPResponse(user_id)"),
            vec!["get", "http", "response", "user", "id"]
        );
        assert_eq!(tokenize("item2count x"), vec!["item", "count"]);
        assert_eq!(tokenize("def f(): pass"), vec!["def", "pass"]);
        assert!(tokenize("  ,; ").is_empty());
    }

    #[test]
    fn ranks_matching_documents() {
        let mut idx = SparseIndex::new();
        idx.add("a", "parse the config file and validate config");
        idx.add("b", "render the html template");
        idx.add("c", "config loader");

        let hits = idx.search("config", 10);
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a") && ids.contains(&"c"));
        assert!(hits.iter().all(|(_, s)| *s > 0.0));
        assert!(idx.search("nonexistent", 10).is_empty());
    }

    #[test]
    fn remove_drops_postings() {
        let mut idx = SparseIndex::new();
        idx.add("a", "alpha beta");
        idx.add("b", "beta gamma");
        assert_eq!(idx.doc_freq("beta"), 2);

        assert!(idx.remove("a"));
        assert!(!idx.remove("a"));
        assert_eq!(idx.doc_freq("beta"), 1);
        assert_eq!(idx.doc_freq("alpha"), 0);
        assert!(idx.search("alpha", 5).is_empty());
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn incremental_matches_fresh_build() {
        let mut incremental = SparseIndex::new();
        incremental.add("x", "old text about widgets");
        incremental.add("y", "gadgets and widgets");
        incremental.remove("x");
        incremental.add("z", "widgets everywhere");

        let mut fresh = SparseIndex::new();
        fresh.add("y", "gadgets and widgets");
        fresh.add("z", "widgets everywhere");

        assert_eq!(incremental, fresh);
        assert_eq!(incremental.search("widgets", 5), fresh.search("widgets", 5));
    }

    #[test]
    fn re_adding_replaces_document() {
        let mut idx = SparseIndex::new();
        idx.add("a", "first version");
        idx.add("a", "second draft");
        assert_eq!(idx.len(), 1);
        assert!(idx.search("first", 5).is_empty());
        assert_eq!(idx.search("draft", 5).len(), 1);
    }

    #[test]
    fn ties_break_by_id() {
        let mut idx = SparseIndex::new();
        idx.add("b", "same words");
        idx.add("a", "same words");
        idx.add("c", "other");
        let hits = idx.search("same", 10);
        assert_eq!(hits[0].0, "a");
        assert_eq!(hits[1].0, "b");
        assert_eq!(hits[0].1, hits[1].1);
    }

    #[test]
    fn top_k_truncates() {
        let mut idx = SparseIndex::new();
        for i in 0..10 {
            idx.add(&format!("d{i}"), "shared term");
        }
        assert_eq!(idx.search("shared", 3).len(), 3);
        assert!(idx.search("shared", 0).is_empty());
    }

    #[test]
    fn serde_rebuilds_postings() {
        let mut idx = SparseIndex::new();
        idx.add("a", "alpha beta beta");
        idx.add("b", "gamma");
        let json = serde_json::to_string(&idx).unwrap();
        assert!(!json.contains("postings"));
        let back: SparseIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, idx);
        assert_eq!(back.search("beta", 5), idx.search("beta", 5));
    }
}
