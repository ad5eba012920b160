//! Changeset classification.
//!
//! A raw changeset is turned into a [`ChangesetEvent`] by matching its
//! changed paths against the configured [`BranchPattern`].

use tracing::{debug, info, warn};

use crate::errors::{GraphError, SourceError};
use crate::models::{ChangeOp, ChangesetRecord, NodeKind, PathChange, Provenance};
use crate::pattern::BranchPattern;
use crate::source::SourceRepository;

/// Outcome of classifying one changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangesetEvent {
    Branch(BranchEvent),
    Tag(TagEvent),
    Unclassified { reason: String },
}

impl ChangesetEvent {
    fn unclassified(reason: impl Into<String>) -> Self {
        Self::Unclassified {
            reason: reason.into(),
        }
    }
}

/// A changeset that belongs to exactly one branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchEvent {
    /// Branch id (the `branch` group).
    pub branch: String,
    /// Display name (`branchname` group, else the id).
    pub name: String,
    /// The changeset deletes the branch root.
    pub terminal: bool,
    /// Raw copy source (source branch id, source revision) of a branch
    /// creation.
    pub clone: Option<Provenance>,
}

/// A tag creation or deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagEvent {
    Created {
        name: String,
        pretty_name: String,
        source: Option<Provenance>,
    },
    Deleted {
        name: String,
    },
}

/// Classify `changeset` against `pattern`.
///
/// Only tag creation consults `repo` (the tagged node must exist). A
/// changeset whose paths span two branches yields
/// [`GraphError::BranchPath`].
pub fn classify<R>(
    changeset: &ChangesetRecord,
    pattern: &BranchPattern,
    repo: &R,
) -> Result<ChangesetEvent, GraphError>
where
    R: SourceRepository + ?Sized,
{
    let Some(first) = changeset.changes.first() else {
        return Ok(ChangesetEvent::unclassified("no change"));
    };
    let Some(first_match) = pattern.matches(&first.path) else {
        return Ok(ChangesetEvent::unclassified(format!(
            "unrecognized path '{}'",
            first.path
        )));
    };
    if first_match.tag.is_some() {
        return classify_tag(changeset, pattern, repo);
    }
    if first_match.branch.is_some() {
        if let Some(event) = simple_branch(changeset, pattern) {
            return Ok(ChangesetEvent::Branch(event));
        }
        return plain_branch(changeset, pattern);
    }
    Ok(ChangesetEvent::unclassified(format!(
        "path '{}' is neither a branch nor a tag",
        first.path
    )))
}

/// A single directory copy or delete at a branch root.
fn simple_branch(changeset: &ChangesetRecord, pattern: &BranchPattern) -> Option<BranchEvent> {
    let [change] = changeset.changes.as_slice() else {
        return None;
    };
    if change.kind != NodeKind::Dir {
        return None;
    }
    let target = pattern.matches(&change.path)?;
    if !target.is_root() {
        return None;
    }
    let branch = target.branch.clone()?;
    let name = target.pretty_branch().unwrap_or_else(|| branch.clone());
    match change.op {
        ChangeOp::Copy => {
            let source = change.base_path.as_deref().and_then(|p| pattern.branch_of(p))?;
            let base_rev = change.base_rev?;
            debug!(rev = changeset.revision, %branch, %source, base_rev, "branch creation");
            Some(BranchEvent {
                branch,
                name,
                terminal: false,
                clone: Some(Provenance::new(source, base_rev)),
            })
        }
        ChangeOp::Delete => {
            debug!(rev = changeset.revision, %branch, "branch deletion");
            Some(BranchEvent {
                branch,
                name,
                terminal: true,
                clone: None,
            })
        }
        _ => None,
    }
}

/// Every changed path lies in the same branch.
fn plain_branch(
    changeset: &ChangesetRecord,
    pattern: &BranchPattern,
) -> Result<ChangesetEvent, GraphError> {
    let mut current: Option<(String, String)> = None;
    for change in &changeset.changes {
        let Some(m) = pattern.matches(&change.path) else {
            return Ok(ChangesetEvent::unclassified(format!(
                "path '{}' outside any branch",
                change.path
            )));
        };
        let Some(branch) = m.branch.clone() else {
            return Ok(ChangesetEvent::unclassified(format!(
                "path '{}' outside any branch",
                change.path
            )));
        };
        match &current {
            None => {
                let name = m.pretty_branch().unwrap_or_else(|| branch.clone());
                current = Some((branch, name));
            }
            Some((expected, _)) if *expected != branch => {
                return Err(GraphError::BranchPath {
                    rev: changeset.revision,
                    expected: expected.clone(),
                    found: branch,
                });
            }
            Some(_) => {}
        }
    }
    Ok(match current {
        Some((branch, name)) => ChangesetEvent::Branch(BranchEvent {
            branch,
            name,
            terminal: false,
            clone: None,
        }),
        None => ChangesetEvent::unclassified("no change"),
    })
}

fn classify_tag<R>(
    changeset: &ChangesetRecord,
    pattern: &BranchPattern,
    repo: &R,
) -> Result<ChangesetEvent, GraphError>
where
    R: SourceRepository + ?Sized,
{
    let rev = changeset.revision;
    let [change] = changeset.changes.as_slice() else {
        warn!(rev, "tag: too complex");
        return Ok(ChangesetEvent::unclassified("tag: too complex"));
    };
    if change.kind != NodeKind::Dir {
        warn!(rev, path = %change.path, "tag: not a dir");
        return Ok(ChangesetEvent::unclassified("tag: not a dir"));
    }
    let Some(target) = pattern.matches(&change.path) else {
        return Ok(ChangesetEvent::unclassified("tag: unrecognized path"));
    };
    let Some(name) = target.tag.clone() else {
        return Ok(ChangesetEvent::unclassified("tag: no tag group"));
    };
    match change.op {
        ChangeOp::Delete => {
            info!(rev, path = %change.path, "tag deleted");
            Ok(ChangesetEvent::Tag(TagEvent::Deleted { name }))
        }
        ChangeOp::Copy if target.is_root() => {
            let source = match tag_source(change, pattern, repo, rev)? {
                Some(source) => source,
                None => return Ok(ChangesetEvent::unclassified("tag: node does not exist")),
            };
            let pretty_name = target.pretty_tag().unwrap_or_else(|| name.clone());
            info!(rev, tag = %name, source = ?source, "tag created");
            Ok(ChangesetEvent::Tag(TagEvent::Created {
                name,
                pretty_name,
                source,
            }))
        }
        ChangeOp::Copy => {
            warn!(rev, path = %change.path, "tag: cannot have path");
            Ok(ChangesetEvent::unclassified("tag: cannot have path"))
        }
        op => {
            warn!(rev, path = %change.path, %op, "tag: not a copy");
            Ok(ChangesetEvent::unclassified("tag: not a copy"))
        }
    }
}

/// Provenance of a tag copy. `Ok(None)` when the tagged node does not
/// exist; `Ok(Some(None))` when it exists without a previous version.
fn tag_source<R>(
    change: &PathChange,
    pattern: &BranchPattern,
    repo: &R,
    rev: i64,
) -> Result<Option<Option<Provenance>>, GraphError>
where
    R: SourceRepository + ?Sized,
{
    match repo.node(&change.path, rev) {
        Ok(_) => {}
        Err(SourceError::NoSuchNode { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let previous = repo.previous_version(&change.path, rev)?;
    Ok(Some(previous.map(|loc| {
        let path = match pattern.matches(&loc.path) {
            Some(m) if m.is_root() && m.branch.is_some() => m.branch.unwrap_or(loc.path),
            _ => loc.path,
        };
        Provenance::new(path, loc.rev)
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::DEFAULT_BRANCH_RE;
    use crate::source::MemoryRepository;

    fn pattern() -> BranchPattern {
        BranchPattern::new(DEFAULT_BRANCH_RE).unwrap()
    }

    fn base_repo() -> MemoryRepository {
        let mut repo = MemoryRepository::new();
        repo.commit("alice", vec![PathChange::new("trunk", NodeKind::Dir, ChangeOp::Add)]);
        repo.commit("alice", vec![PathChange::new("trunk/a.txt", NodeKind::File, ChangeOp::Add)]);
        repo
    }

    fn classify_rev(repo: &MemoryRepository, rev: i64) -> Result<ChangesetEvent, GraphError> {
        let cs = repo.changeset(rev).unwrap();
        classify(&cs, &pattern(), repo)
    }

    #[test]
    fn test_branch_creation_from_trunk() {
        let mut repo = base_repo();
        let rev = repo.commit("bob", vec![PathChange::copy("/branches/foo", NodeKind::Dir, "/trunk", 2)]);
        let event = classify_rev(&repo, rev).unwrap();
        assert_eq!(
            event,
            ChangesetEvent::Branch(BranchEvent {
                branch: "branches/foo".into(),
                name: "foo".into(),
                terminal: false,
                clone: Some(Provenance::new("trunk", 2)),
            })
        );
    }

    #[test]
    fn test_two_branches_in_one_changeset() {
        let mut repo = base_repo();
        let rev = repo.commit(
            "bob",
            vec![
                PathChange::new("branches/foo/a", NodeKind::File, ChangeOp::Modify),
                PathChange::new("branches/bar/b", NodeKind::File, ChangeOp::Modify),
            ],
        );
        let err = classify_rev(&repo, rev).unwrap_err();
        assert!(matches!(
            err,
            GraphError::BranchPath { rev: 3, ref expected, ref found }
                if expected == "branches/foo" && found == "branches/bar"
        ));
    }

    #[test]
    fn test_plain_changeset() {
        let repo = base_repo();
        let event = classify_rev(&repo, 2).unwrap();
        match event {
            ChangesetEvent::Branch(b) => {
                assert_eq!(b.branch, "trunk");
                assert!(!b.terminal);
                assert!(b.clone.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_branch_root_deletion_is_terminal() {
        let mut repo = base_repo();
        repo.commit("bob", vec![PathChange::copy("branches/foo", NodeKind::Dir, "trunk", 2)]);
        let rev = repo.commit("bob", vec![PathChange::new("branches/foo", NodeKind::Dir, ChangeOp::Delete)]);
        match classify_rev(&repo, rev).unwrap() {
            ChangesetEvent::Branch(b) => assert!(b.terminal),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_subdirectory_copy_is_plain_change() {
        let mut repo = base_repo();
        let rev = repo.commit("bob", vec![PathChange::copy("trunk/lib", NodeKind::Dir, "vendor/lib", 1)]);
        match classify_rev(&repo, rev).unwrap() {
            ChangesetEvent::Branch(b) => {
                assert_eq!(b.branch, "trunk");
                assert!(b.clone.is_none());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unrecognized_path() {
        let mut repo = base_repo();
        let rev = repo.commit("bob", vec![PathChange::new("README", NodeKind::File, ChangeOp::Add)]);
        assert!(matches!(
            classify_rev(&repo, rev).unwrap(),
            ChangesetEvent::Unclassified { .. }
        ));
        let rev = repo.commit(
            "bob",
            vec![
                PathChange::new("trunk/a.txt", NodeKind::File, ChangeOp::Modify),
                PathChange::new("README", NodeKind::File, ChangeOp::Modify),
            ],
        );
        assert!(matches!(
            classify_rev(&repo, rev).unwrap(),
            ChangesetEvent::Unclassified { .. }
        ));
    }

    #[test]
    fn test_tag_creation_and_deletion() {
        let mut repo = base_repo();
        let rev = repo.commit("carol", vec![PathChange::copy("tags/v1.0", NodeKind::Dir, "trunk", 2)]);
        assert_eq!(
            classify_rev(&repo, rev).unwrap(),
            ChangesetEvent::Tag(TagEvent::Created {
                name: "tags/v1.0".into(),
                pretty_name: "v1.0".into(),
                source: Some(Provenance::new("trunk", 2)),
            })
        );
        let rev = repo.commit("carol", vec![PathChange::new("tags/v1.0", NodeKind::Dir, ChangeOp::Delete)]);
        assert_eq!(
            classify_rev(&repo, rev).unwrap(),
            ChangesetEvent::Tag(TagEvent::Deleted {
                name: "tags/v1.0".into()
            })
        );
    }

    #[test]
    fn test_complex_tag_is_rejected() {
        let mut repo = base_repo();
        let rev = repo.commit(
            "carol",
            vec![
                PathChange::copy("tags/v1.0", NodeKind::Dir, "trunk", 2),
                PathChange::new("tags/v1.0/extra", NodeKind::File, ChangeOp::Add),
            ],
        );
        assert!(matches!(
            classify_rev(&repo, rev).unwrap(),
            ChangesetEvent::Unclassified { .. }
        ));
        let rev = repo.commit("carol", vec![PathChange::new("tags/v1.0/file", NodeKind::File, ChangeOp::Modify)]);
        assert!(matches!(
            classify_rev(&repo, rev).unwrap(),
            ChangesetEvent::Unclassified { .. }
        ));
    }
}
