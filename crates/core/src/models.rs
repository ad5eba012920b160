//! Domain model types used throughout revtree.
//!
//! These types bridge the source repository, the graph builder, the
//! database layer, and the read path.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Changesets (read-only, owned by the source repository)
// ---------------------------------------------------------------------------

/// Node kind of a changed path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Dir,
}

/// Operation applied to a changed path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Add,
    Copy,
    Delete,
    Modify,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Copy => write!(f, "copy"),
            Self::Delete => write!(f, "delete"),
            Self::Modify => write!(f, "modify"),
        }
    }
}

/// One path-level change of a changeset.
///
/// Paths never carry a leading separator (`branches/foo`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathChange {
    pub path: String,
    pub kind: NodeKind,
    pub op: ChangeOp,
    pub base_path: Option<String>,
    pub base_rev: Option<i64>,
}

impl PathChange {
    /// Convenience constructor for a change without copy information.
    pub fn new(path: impl Into<String>, kind: NodeKind, op: ChangeOp) -> Self {
        Self {
            path: normalize_path(&path.into()),
            kind,
            op,
            base_path: None,
            base_rev: None,
        }
    }

    /// Convenience constructor for a directory or file copy.
    pub fn copy(
        path: impl Into<String>,
        kind: NodeKind,
        base_path: impl Into<String>,
        base_rev: i64,
    ) -> Self {
        Self {
            path: normalize_path(&path.into()),
            kind,
            op: ChangeOp::Copy,
            base_path: Some(normalize_path(&base_path.into())),
            base_rev: Some(base_rev),
        }
    }
}

/// A single revision read from the source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetRecord {
    pub revision: i64,
    pub author: String,
    pub date: DateTime<Utc>,
    pub message: String,
    pub changes: Vec<PathChange>,
    /// Revision properties (`svn:log`, `rth:deliver`, ...).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ChangesetRecord {
    /// Revision property value, or `None` when the property is unset or empty.
    pub fn prop(&self, name: &str) -> Option<&str> {
        self.properties
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// Strip the leading path separator used by the repository layer.
pub fn normalize_path(path: &str) -> String {
    path.trim_start_matches('/').trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Graph entities
// ---------------------------------------------------------------------------

/// Where a branch or tag was copied from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Provenance {
    pub path: String,
    pub revision: i64,
}

impl Provenance {
    pub fn new(path: impl Into<String>, revision: i64) -> Self {
        Self {
            path: path.into(),
            revision,
        }
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.path, self.revision)
    }
}

/// A tracked branch, as built in memory or loaded from storage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BranchEntity {
    /// Branch root path; stable across the branch lifetime.
    pub path: String,
    /// Distinguishes successive lives of the same path.
    #[serde(default)]
    pub generation: u32,
    pub name: String,
    pub date: Option<DateTime<Utc>>,
    revisions: Vec<i64>,
    pub terminal_rev: Option<i64>,
    pub source: Option<Provenance>,
}

impl BranchEntity {
    pub fn new(path: impl Into<String>, name: impl Into<String>, generation: u32) -> Self {
        Self {
            path: path.into(),
            generation,
            name: name.into(),
            date: None,
            revisions: Vec::new(),
            terminal_rev: None,
            source: None,
        }
    }

    /// Rebuild an entity from stored parts; revisions are sorted and
    /// deduplicated.
    pub fn from_parts(
        path: impl Into<String>,
        name: impl Into<String>,
        generation: u32,
        mut revisions: Vec<i64>,
        terminal_rev: Option<i64>,
        source: Option<Provenance>,
    ) -> Self {
        revisions.sort_unstable();
        revisions.dedup();
        Self {
            path: path.into(),
            generation,
            name: name.into(),
            date: None,
            revisions,
            terminal_rev,
            source,
        }
    }

    /// Ascending revision list.
    pub fn revisions(&self) -> &[i64] {
        &self.revisions
    }

    pub fn first_rev(&self) -> Option<i64> {
        self.revisions.first().copied()
    }

    pub fn last_rev(&self) -> Option<i64> {
        self.revisions.last().copied()
    }

    pub fn contains(&self, rev: i64) -> bool {
        self.revisions.binary_search(&rev).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.terminal_rev.is_some()
    }

    /// Insert a revision keeping the list sorted. Returns `false` when the
    /// revision was already present or the branch is closed before `rev`.
    pub fn add_revision(&mut self, rev: i64) -> bool {
        if let Some(terminal) = self.terminal_rev {
            if rev > terminal {
                warn!(branch = %self.path, rev, terminal, "refusing revision after terminal revision");
                return false;
            }
        }
        match self.revisions.binary_search(&rev) {
            Ok(_) => false,
            Err(pos) => {
                self.revisions.insert(pos, rev);
                true
            }
        }
    }

    /// Close the branch at `rev`. The terminal revision is set only once.
    pub fn close(&mut self, rev: i64) {
        if self.terminal_rev.is_none() {
            self.add_revision(rev);
            self.terminal_rev = Some(rev);
        }
    }

    /// Revisions within `[lo, hi]`.
    pub fn revisions_in(&self, lo: i64, hi: i64) -> impl Iterator<Item = i64> + '_ {
        self.revisions
            .iter()
            .copied()
            .filter(move |r| lo <= *r && *r <= hi)
    }

    /// Comma-separated storage form of the revision list.
    pub fn revisions_csv(&self) -> String {
        self.revisions
            .iter()
            .map(i64::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// A tag: a directory copy bound to a single revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagEntity {
    pub name: String,
    pub pretty_name: String,
    pub tag_revision: i64,
    pub source: Option<Provenance>,
}

/// A persisted per-revision row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RevisionEntry {
    pub revision: i64,
    pub branch: String,
    pub branch_name: String,
    pub author: String,
    pub date: DateTime<Utc>,
    pub last: bool,
    pub clone: Option<Provenance>,
}

// ---------------------------------------------------------------------------
// Deliver / bring annotations
// ---------------------------------------------------------------------------

/// Kind of manual integration annotation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationKind {
    Deliver,
    Bring,
}

impl IntegrationKind {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Self::Deliver => "revtree_delivers",
            Self::Bring => "revtree_brings",
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deliver => write!(f, "deliver"),
            Self::Bring => write!(f, "bring"),
        }
    }
}

/// A deliver or bring record attached to one branch revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrationRecord {
    pub kind: IntegrationKind,
    pub branch: String,
    pub revision: i64,
    pub raw: String,
}

impl IntegrationRecord {
    /// Integrated revisions, newest first. Malformed items are skipped.
    pub fn revisions(&self) -> Vec<i64> {
        let mut revs: Vec<i64> = self
            .raw
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|item| !item.is_empty())
            .filter_map(|item| match item.trim_start_matches('r').parse::<i64>() {
                Ok(rev) => Some(rev),
                Err(_) => {
                    warn!(kind = %self.kind, branch = %self.branch, revision = self.revision, item, "skipping malformed revision");
                    None
                }
            })
            .collect();
        revs.sort_unstable_by(|a, b| b.cmp(a));
        revs.dedup();
        revs
    }
}

// ---------------------------------------------------------------------------
// Derived merge edges
// ---------------------------------------------------------------------------

/// A merge edge computed by one resolver pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MergeOperation {
    pub source_branch: String,
    pub first_rev: i64,
    pub last_rev: i64,
    pub target_branch: String,
    pub target_rev: i64,
}

impl fmt::Display for MergeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}:{}-{} -> {}@{}",
            self.source_branch, self.first_rev, self.last_rev, self.target_branch, self.target_rev
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_revisions_stay_sorted() {
        let mut b = BranchEntity::new("trunk", "trunk", 0);
        assert!(b.add_revision(5));
        assert!(b.add_revision(2));
        assert!(b.add_revision(9));
        assert!(!b.add_revision(5));
        assert_eq!(b.revisions(), &[2, 5, 9]);
        assert_eq!(b.first_rev(), Some(2));
        assert_eq!(b.last_rev(), Some(9));
        assert_eq!(b.revisions_csv(), "2,5,9");
    }

    #[test]
    fn test_closed_branch_refuses_later_revisions() {
        let mut b = BranchEntity::new("branches/foo", "foo", 0);
        b.add_revision(3);
        b.close(6);
        b.close(8);
        assert_eq!(b.terminal_rev, Some(6));
        assert!(!b.add_revision(7));
        // a hole before the terminal revision is still accepted
        assert!(b.add_revision(4));
        assert_eq!(b.revisions(), &[3, 4, 6]);
    }

    #[test]
    fn test_integration_revisions_descending() {
        let rec = IntegrationRecord {
            kind: IntegrationKind::Deliver,
            branch: "branches/foo".into(),
            revision: 10,
            raw: "3,12, 7,bogus,r9".into(),
        };
        assert_eq!(rec.revisions(), vec![12, 9, 7, 3]);
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/branches/foo/"), "branches/foo");
        assert_eq!(normalize_path("trunk"), "trunk");
    }

    #[test]
    fn test_changeset_prop_ignores_empty() {
        let mut properties = BTreeMap::new();
        properties.insert("rth:bring".to_string(), String::new());
        properties.insert("rth:deliver".to_string(), "4".to_string());
        let cs = ChangesetRecord {
            revision: 1,
            author: "alice".into(),
            date: Utc::now(),
            message: String::new(),
            changes: Vec::new(),
            properties,
        };
        assert_eq!(cs.prop("rth:bring"), None);
        assert_eq!(cs.prop("rth:deliver"), Some("4"));
    }
}
