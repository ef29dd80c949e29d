//! Ignore rules for the repository walk, applied through [`ignore::WalkBuilder`].
//!
//! Three sources decide whether a path is skipped:
//!
//! 1. always-excluded patterns: built-in defaults (`.git/`, `.idea/`,
//!    `__pycache__/`, `*.pyc`, `node_modules/`, `.idea-producer/`),
//!    `scan.extra_ignores`, and the index storage directory when it lies
//!    inside the root. They are installed as walker overrides and win over
//!    every ignore file;
//! 2. `.gitignore` files at any depth, when `scan.use_gitignore` is set;
//! 3. the agent ignore file (`.idea-agent-ignore` by default), read at any
//!    depth with gitignore syntax.
//!
//! Ignore files follow gitignore semantics, including `!` negation and
//! nested files that only apply below their own directory. Ignored
//! directories are pruned. Global git excludes and ignore files above the
//! root are not consulted, and no `.git` directory is required.

use std::path::Path;

use ::ignore::overrides::{Override, OverrideBuilder};
use ::ignore::{Walk, WalkBuilder};
use tracing::warn;

use crate::config::ScanConfig;

pub const DEFAULT_IGNORES: &[&str] = &[
    ".git/",
    ".idea/",
    "__pycache__/",
    "*.pyc",
    "node_modules/",
    ".idea-producer/",
];

/// Rule sources for one repository walk.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    excluded: Vec<String>,
    ignore_file: Option<String>,
    use_gitignore: bool,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            excluded: DEFAULT_IGNORES.iter().map(|p| p.to_string()).collect(),
            ignore_file: None,
            use_gitignore: false,
        }
    }
}

impl IgnoreRules {
    /// Build the rule set for scanning `root`.
    ///
    /// `storage_dir` is excluded when it lies inside `root`.
    pub fn load(root: &Path, scan: &ScanConfig, storage_dir: Option<&Path>) -> Self {
        let mut rules = Self {
            ignore_file: Some(scan.ignore_file.clone()).filter(|f| !f.is_empty()),
            use_gitignore: scan.use_gitignore,
            ..Self::default()
        };
        rules.exclude(&scan.extra_ignores);

        if let Some(rel) = storage_dir.and_then(|dir| dir.strip_prefix(root).ok()) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            if !rel.is_empty() {
                rules.exclude([format!("/{rel}/")]);
            }
        }
        rules
    }

    /// Add always-excluded gitignore-style patterns.
    ///
    /// Negated patterns cannot re-include anything here and are skipped.
    pub fn exclude<I, S>(&mut self, patterns: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            let pattern = pattern.as_ref().trim_end();
            if pattern.is_empty() || pattern.starts_with('#') {
                continue;
            }
            if pattern.starts_with('!') {
                warn!(pattern, "negated patterns are not supported in extra_ignores; skipping");
                continue;
            }
            self.excluded.push(pattern.to_string());
        }
    }

    /// Always-excluded patterns, in the order they were added.
    pub fn excluded(&self) -> impl Iterator<Item = &str> {
        self.excluded.iter().map(String::as_str)
    }

    /// Compile the always-excluded patterns into walker overrides for `root`.
    ///
    /// An override glob prefixed with `!` means "ignore"; unprefixed globs
    /// would switch the walker to whitelist mode, so none are added.
    pub fn overrides(&self, root: &Path) -> Result<Override, ::ignore::Error> {
        let mut builder = OverrideBuilder::new(root);
        for pattern in &self.excluded {
            if let Err(e) = builder.add(&format!("!{pattern}")) {
                warn!(pattern = %pattern, error = %e, "skipping invalid ignore pattern");
            }
        }
        builder.build()
    }

    /// A deterministic walker over `root` honouring these rules.
    pub fn walker(&self, root: &Path, follow_links: bool) -> Result<Walk, ::ignore::Error> {
        let mut builder = WalkBuilder::new(root);
        builder
            .hidden(false)
            .parents(false)
            .ignore(false)
            .git_ignore(self.use_gitignore)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .follow_links(follow_links)
            .overrides(self.overrides(root)?)
            .sort_by_file_name(|a, b| a.cmp(b));
        if let Some(name) = &self.ignore_file {
            builder.add_custom_ignore_filename(name);
        }
        Ok(builder.build())
    }
}
