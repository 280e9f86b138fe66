//! Error types for brewer.
//!
//! All errors use `thiserror` so callers can branch on the failure kind
//! (not-found vs. parse vs. invariant vs. I/O) without string matching.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for brewer operations.
pub type Result<T> = std::result::Result<T, BrewError>;

/// Main error type for brewer.
#[derive(Error, Debug)]
pub enum BrewError {
    // Not-found errors
    #[error("unable to find a manifest named {repo:?} (in {library:?} or as a remote URL)")]
    ManifestNotFound { repo: String, library: PathBuf },

    #[error("tag not found in manifest for {repo:?}: {tag:?}")]
    TagNotFound { repo: String, tag: String },

    #[error("unable to resolve registry reference {reference:?}: {reason}")]
    RefUnresolvable { reference: String, reason: String },

    // Parse errors
    #[error("manifest parse error at line {line}: {reason}: {text:?}")]
    ManifestParse {
        line: usize,
        text: String,
        reason: String,
    },

    #[error("invalid Maintainers: {value:?} (expected format {expected:?})")]
    InvalidMaintainers { value: String, expected: String },

    #[error("failed decoding JSON for {digest:?}: {source}")]
    JsonDecode {
        digest: String,
        #[source]
        source: serde_json::Error,
    },

    // Invariant violations
    #[error("duplicate tag {tag:?} in manifest (tags {tags:?})")]
    DuplicateTag { tag: String, tags: String },

    #[error("unsupported architecture {arch:?} (tags {tags:?})")]
    UnsupportedArchitecture { arch: String, tags: String },

    #[error("unknown builder {builder:?} (tags {tags:?})")]
    UnknownBuilder { builder: String, tags: String },

    #[error("size of {digest:?} is {actual} bytes but the descriptor declares {expected}")]
    SizeMismatch {
        digest: String,
        expected: i64,
        actual: i64,
    },

    #[error("digest of {digest:?} not correct")]
    DigestMismatch { digest: String },

    #[error("invalid OCI layout: {reason}")]
    InvalidLayout { reason: String },

    // I/O and external processes
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("command {argv:?} failed: {stderr}")]
    Process { argv: String, stderr: String },

    #[error("failed fetching git commit {commit:?}:\n{}", .attempts.join("\n"))]
    GitFetch {
        commit: String,
        attempts: Vec<String>,
    },

    #[error("git error: {0}")]
    Git(String),

    #[error("registry error for {reference:?}: {reason}")]
    Registry { reference: String, reason: String },

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    // Concurrency
    #[error("content store write conflict on {reference:?}")]
    Conflict { reference: String },

    // Graph
    #[error("dependency cycle involving {names:?}")]
    Cycle { names: Vec<String> },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BrewError {
    /// Wrap an `io::Error` with the path it happened on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True for the not-found family (manifest, tag, registry ref).
    ///
    /// Parents/children walks swallow these for non-root nodes.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrewError::ManifestNotFound { .. }
                | BrewError::TagNotFound { .. }
                | BrewError::RefUnresolvable { .. }
        )
    }
}
