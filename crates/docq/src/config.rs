//! Configuration surface for opening a [`crate::Database`] (SPEC_FULL.md §6).
//!
//! Mirrors the `KimberliteConfig` fluent-builder pattern: a required
//! constructor argument (the data file path) plus chained `.with_*` setters
//! for everything else.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use docq_query::index::TokenizerBuilder;
use docq_query::index::default_tokenizers;

/// Where a [`crate::Database`] keeps its data.
#[derive(Debug, Clone)]
pub enum StorePath {
    /// An on-disk SQLite file.
    File(PathBuf),
    /// A private, non-shared in-memory database (lives only as long as the
    /// connection is open; useful for tests).
    Memory,
}

/// Configuration for opening a [`crate::Database`].
pub struct EngineConfig {
    pub(crate) path: StorePath,
    pub(crate) busy_timeout: Duration,
    /// Testing-only escape hatch (SPEC_FULL.md §6): forces the Aggregation
    /// Planner to emit a single `STREAM` step for every pipeline. Must not
    /// affect correctness, only performance.
    pub(crate) force_stream_fallback: bool,
    pub(crate) tokenizers: HashMap<String, Box<dyn TokenizerBuilder>>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("path", &self.path)
            .field("busy_timeout", &self.busy_timeout)
            .field("force_stream_fallback", &self.force_stream_fallback)
            .field("tokenizers", &self.tokenizers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EngineConfig {
    /// Opens (or creates) the SQLite file at `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: StorePath::File(path.as_ref().to_path_buf()),
            busy_timeout: Duration::from_secs(5),
            force_stream_fallback: false,
            tokenizers: default_tokenizers(),
        }
    }

    /// Opens a private in-memory database. The data vanishes when the
    /// returned [`crate::Database`] is dropped.
    pub fn in_memory() -> Self {
        Self {
            path: StorePath::Memory,
            busy_timeout: Duration::from_secs(5),
            force_stream_fallback: false,
            tokenizers: default_tokenizers(),
        }
    }

    /// Sets how long a mutating statement waits on SQLite's write lock
    /// before giving up (SPEC_FULL.md §5 "Timeouts").
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Registers tokenizer `name` for FTS index creation (SPEC_FULL.md §4.3
    /// "Tokenizer extensibility"). Overrides a built-in tokenizer of the
    /// same name.
    #[must_use]
    pub fn with_tokenizer(mut self, name: impl Into<String>, builder: Box<dyn TokenizerBuilder>) -> Self {
        self.tokenizers.insert(name.into(), builder);
        self
    }

    /// Forces every `aggregate()` call to run through the whole-pipeline
    /// in-process evaluator, bypassing SQL fusion entirely. For testing
    /// that the streaming evaluator agrees with the planned execution
    /// (SPEC_FULL.md §8 invariant 8 relies on this being semantics-preserving).
    #[must_use]
    pub fn with_forced_fallback(mut self, forced: bool) -> Self {
        self.force_stream_fallback = forced;
        self
    }
}
