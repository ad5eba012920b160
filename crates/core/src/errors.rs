//! Error types for the revtree core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Source repository errors
// ---------------------------------------------------------------------------

/// Errors raised by a [`SourceRepository`](crate::source::SourceRepository)
/// implementation.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The `svn` binary was not found on `$PATH`.
    #[error("svn binary not found: {0}")]
    BinaryNotFound(String),

    /// An `svn` command exited with a non-zero status.
    #[error("svn command failed (exit {exit_code}): {stderr}")]
    CommandFailed { exit_code: i32, stderr: String },

    /// Could not parse the XML output produced by `svn`.
    #[error("failed to parse svn XML output: {0}")]
    XmlParseError(String),

    /// The requested revision does not exist.
    #[error("revision {0} not found")]
    RevisionNotFound(i64),

    /// No node exists at the given path and revision.
    #[error("no node '{path}' at revision {rev}")]
    NoSuchNode { path: String, rev: i64 },

    /// Generic I/O wrapper.
    #[error("source repository I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Graph building errors
// ---------------------------------------------------------------------------

/// Errors from changeset classification and graph building.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The requested window contains no changeset at all.
    #[error("{}No changeset", context_prefix(.context))]
    EmptyRange { context: Option<String> },

    /// One changeset touches paths that belong to two different branches.
    #[error("Incoherent path '{found}' != '{expected}' @ rev {rev}")]
    BranchPath {
        rev: i64,
        expected: String,
        found: String,
    },

    /// Underlying source repository failure.
    #[error("graph source error: {0}")]
    Source(#[from] SourceError),

    /// A graph export could not be (de)serialized.
    #[error("graph export error: {0}")]
    Export(#[from] serde_json::Error),
}

fn context_prefix(context: &Option<String>) -> String {
    match context {
        Some(c) => format!("{c}: "),
        None => String::new(),
    }
}

// ---------------------------------------------------------------------------
// Sync errors
// ---------------------------------------------------------------------------

/// Errors from the incremental synchronizer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another sync is in progress on this synchronizer.
    #[error("sync already running (started at {started_at})")]
    AlreadyRunning { started_at: String },

    /// Graph building failed for a sync target.
    #[error("sync graph error: {0}")]
    Graph(#[from] GraphError),

    /// Underlying source repository failure.
    #[error("sync source error: {0}")]
    Source(#[from] SourceError),

    /// Database error during sync.
    #[error("sync database error: {0}")]
    Database(#[from] DatabaseError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// The branch/tag path pattern cannot be used.
    #[error("invalid branch pattern '{pattern}': {detail}")]
    InvalidPattern { pattern: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite persistence layer.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(#[from] rusqlite::Error),

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A stored column could not be decoded.
    #[error("corrupt {column} value '{value}'")]
    Corrupt { column: String, value: String },

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
