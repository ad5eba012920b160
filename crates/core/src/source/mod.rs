//! The source-repository collaborator.
//!
//! Everything revtree knows about history comes through
//! [`SourceRepository`]. Two implementations ship with the crate: the `svn`
//! CLI backed [`SvnClient`](crate::svn::SvnClient) and the in-memory
//! [`MemoryRepository`] used for fixtures and tests.

pub mod memory;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::errors::SourceError;
use crate::models::{ChangesetRecord, NodeKind};

pub use memory::MemoryRepository;

/// Versioned properties of a node or a revision.
pub type Properties = BTreeMap<String, String>;

/// A node as seen at some revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub path: String,
    pub kind: NodeKind,
    /// Last revision at or before the requested one that changed the node.
    pub rev: i64,
}

/// One step in the history of a node: the node lived at `path` and changed
/// in `rev`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLocation {
    pub path: String,
    pub rev: i64,
}

/// Read access to a versioned repository.
///
/// All paths are normalized: no leading separator.
pub trait SourceRepository {
    /// Full changeset of one revision, revision properties included.
    fn changeset(&self, rev: i64) -> Result<ChangesetRecord, SourceError>;

    /// Versioned properties of `path` at `rev`.
    fn node_properties(&self, path: &str, rev: i64) -> Result<Properties, SourceError>;

    /// The node at `path@rev`; fails with [`SourceError::NoSuchNode`].
    fn node(&self, path: &str, rev: i64) -> Result<Node, SourceError>;

    /// History of `path@rev`, newest first, following copies.
    fn node_history(&self, path: &str, rev: i64) -> Result<Vec<NodeLocation>, SourceError>;

    /// The location the node lived at before its latest change; for a copied
    /// directory this is the copy source.
    fn previous_version(&self, path: &str, rev: i64) -> Result<Option<NodeLocation>, SourceError> {
        Ok(self.node_history(path, rev)?.into_iter().nth(1))
    }

    fn oldest_revision(&self) -> Result<i64, SourceError>;

    fn youngest_revision(&self) -> Result<i64, SourceError>;

    /// The revision preceding `rev`, `None` at the start of history.
    fn previous_revision(&self, rev: i64) -> Result<Option<i64>, SourceError>;

    /// Changesets committed within `[start, end]`.
    fn changesets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ChangesetRecord>, SourceError>;
}

/// True when `path` equals `root` or lies below it.
pub(crate) fn is_within(path: &str, root: &str) -> bool {
    root.is_empty()
        || path == root
        || (path.len() > root.len() && path.starts_with(root) && path.as_bytes()[root.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_within() {
        assert!(is_within("branches/foo", "branches/foo"));
        assert!(is_within("branches/foo/a.txt", "branches/foo"));
        assert!(!is_within("branches/foobar", "branches/foo"));
        assert!(is_within("anything", ""));
    }
}
