//! revtree core library.
//!
//! Reconstructs the branch, tag and merge graph of a Subversion repository
//! and keeps an incremental projection of it in SQLite: path pattern
//! matching, changeset classification, graph building, merge-info
//! resolution, branch placement, persistence and the synchronizer.

pub mod builder;
pub mod classifier;
pub mod config;
pub mod db;
pub mod errors;
pub mod mergeinfo;
pub mod models;
pub mod optimizer;
pub mod pattern;
pub mod snapshot;
pub mod source;
pub mod svn;
pub mod sync_engine;

// Re-exports for convenience.
pub use builder::{BuildRange, GraphBuilder, RevisionGraph};
pub use config::RevtreeConfig;
pub use db::Database;
pub use pattern::BranchPattern;
pub use snapshot::{GraphSnapshot, SnapshotOptions};
pub use source::{MemoryRepository, SourceRepository};
pub use svn::SvnClient;
pub use sync_engine::{SyncReport, Synchronizer};
