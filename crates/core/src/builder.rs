//! Revision graph building.
//!
//! [`GraphBuilder`] fetches a window of changesets from a
//! [`SourceRepository`], classifies each one and folds the events into
//! branch and tag entities.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::classifier::{classify, ChangesetEvent, TagEvent};
use crate::errors::{GraphError, SourceError};
use crate::models::{BranchEntity, ChangesetRecord, Provenance, TagEntity};
use crate::pattern::BranchPattern;
use crate::source::SourceRepository;

/// Default revision property carrying deliver annotations.
pub const DEFAULT_DELIVER_PROP: &str = "rth:deliver";
/// Default revision property carrying bring annotations.
pub const DEFAULT_BRING_PROP: &str = "rth:bring";

/// The window of history to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildRange {
    /// Inclusive revision bounds. A missing lower bound means the oldest
    /// revision; a missing or overlarge upper bound means the youngest.
    Revisions { lo: Option<i64>, hi: Option<i64> },
    /// Changesets committed within the inclusive time window.
    Time {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl BuildRange {
    /// Every revision of the repository.
    pub fn all() -> Self {
        Self::Revisions { lo: None, hi: None }
    }

    /// Exactly one revision.
    pub fn single(rev: i64) -> Self {
        Self::Revisions {
            lo: Some(rev),
            hi: Some(rev),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Revisions { lo, hi } => format!(
                "r{}:r{}",
                lo.map_or("oldest".to_string(), |r| r.to_string()),
                hi.map_or("youngest".to_string(), |r| r.to_string())
            ),
            Self::Time { start, end } => format!("{start}..{end}"),
        }
    }
}

/// Identity of an in-memory branch: its path and the life it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchKey {
    pub path: String,
    pub generation: u32,
}

/// What one revision of the window turned out to be.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RevisionKind {
    Branch {
        key: BranchKey,
        name: String,
        /// The revision deletes the branch root.
        last: bool,
        /// Raw copy source of a branch creation.
        clone: Option<Provenance>,
    },
    TagCreated {
        tag: TagEntity,
    },
    TagDeleted {
        name: String,
    },
    Skipped {
        reason: String,
    },
}

/// Per-revision classification record, in the form the synchronizer
/// persists it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedRevision {
    pub revision: i64,
    pub author: String,
    pub date: DateTime<Utc>,
    pub kind: RevisionKind,
    pub deliver: Option<String>,
    pub bring: Option<String>,
}

/// Result of one build pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionGraph {
    /// Branches in creation order.
    pub branches: Vec<BranchEntity>,
    /// Live tags by name.
    pub tags: BTreeMap<String, TagEntity>,
    /// Every processed revision, ascending.
    pub revisions: Vec<ClassifiedRevision>,
    /// First and last processed revision.
    pub range: Option<(i64, i64)>,
}

impl RevisionGraph {
    pub fn branch(&self, key: &BranchKey) -> Option<&BranchEntity> {
        self.branches
            .iter()
            .find(|b| b.path == key.path && b.generation == key.generation)
    }

    /// All generations of the branch at `path`.
    pub fn branches_at<'a>(&'a self, path: &'a str) -> impl Iterator<Item = &'a BranchEntity> + 'a {
        self.branches.iter().filter(move |b| b.path == path)
    }

    /// Revisions that were not attributed to a branch or a tag creation.
    pub fn skipped(&self) -> impl Iterator<Item = &ClassifiedRevision> {
        self.revisions
            .iter()
            .filter(|r| matches!(r.kind, RevisionKind::Skipped { .. }))
    }

    pub fn to_json(&self) -> Result<String, GraphError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, GraphError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Builds [`RevisionGraph`]s out of a source repository.
pub struct GraphBuilder<'a, R: SourceRepository + ?Sized> {
    repo: &'a R,
    pattern: &'a BranchPattern,
    deliver_prop: String,
    bring_prop: String,
}

impl<'a, R: SourceRepository + ?Sized> GraphBuilder<'a, R> {
    pub fn new(repo: &'a R, pattern: &'a BranchPattern) -> Self {
        Self {
            repo,
            pattern,
            deliver_prop: DEFAULT_DELIVER_PROP.to_string(),
            bring_prop: DEFAULT_BRING_PROP.to_string(),
        }
    }

    /// Override the revision properties read as deliver/bring annotations.
    pub fn with_integration_props(mut self, deliver: impl Into<String>, bring: impl Into<String>) -> Self {
        self.deliver_prop = deliver.into();
        self.bring_prop = bring.into();
        self
    }

    /// Build the graph of `range`.
    ///
    /// Fails with [`GraphError::EmptyRange`] when the window holds no
    /// changeset.
    #[instrument(skip(self), fields(range = %range.describe()))]
    pub fn build(&self, range: BuildRange) -> Result<RevisionGraph, GraphError> {
        let mut changesets = self.fetch(range)?;
        if changesets.is_empty() {
            return Err(GraphError::EmptyRange {
                context: Some(range.describe()),
            });
        }
        changesets.sort_by_key(|cs| cs.revision);

        let mut state = BuildState::default();
        for changeset in &changesets {
            self.dispatch(changeset, &mut state)?;
        }
        let mut graph = state.finish();
        graph.range = Some((changesets[0].revision, changesets[changesets.len() - 1].revision));
        self.resolve_provenance(&mut graph);

        info!(
            changesets = changesets.len(),
            branches = graph.branches.len(),
            tags = graph.tags.len(),
            skipped = graph.skipped().count(),
            "built revision graph"
        );
        Ok(graph)
    }

    /// Fetch the window newest first.
    fn fetch(&self, range: BuildRange) -> Result<Vec<ChangesetRecord>, GraphError> {
        match range {
            BuildRange::Revisions { lo, hi } => {
                let oldest = self.repo.oldest_revision()?;
                let youngest = self.repo.youngest_revision()?;
                let rev_min = lo.unwrap_or(oldest);
                let rev_max = hi.map_or(youngest, |h| h.min(youngest));
                let mut changesets = Vec::new();
                let mut rev = rev_max;
                while rev_min <= rev {
                    match self.repo.changeset(rev) {
                        Ok(cs) => changesets.push(cs),
                        Err(SourceError::RevisionNotFound(missing)) => {
                            debug!(rev = missing, "no changeset for revision");
                        }
                        Err(e) => return Err(e.into()),
                    }
                    match self.repo.previous_revision(rev)? {
                        Some(prev) => rev = prev,
                        None => break,
                    }
                }
                Ok(changesets)
            }
            BuildRange::Time { start, end } => {
                let mut changesets = self.repo.changesets_between(start, end)?;
                changesets.sort_by_key(|cs| std::cmp::Reverse(cs.revision));
                Ok(changesets)
            }
        }
    }

    fn dispatch(&self, changeset: &ChangesetRecord, state: &mut BuildState) -> Result<(), GraphError> {
        let rev = changeset.revision;
        let kind = match classify(changeset, self.pattern, self.repo) {
            Ok(ChangesetEvent::Branch(event)) => {
                let key = state.append(&event.branch, &event.name, changeset, event.terminal);
                RevisionKind::Branch {
                    key,
                    name: event.name,
                    last: event.terminal,
                    clone: event.clone,
                }
            }
            Ok(ChangesetEvent::Tag(TagEvent::Created {
                name,
                pretty_name,
                source,
            })) => {
                let tag = TagEntity {
                    name: name.clone(),
                    pretty_name,
                    tag_revision: rev,
                    source,
                };
                if state.tags.insert(name.clone(), tag.clone()).is_some() {
                    warn!(rev, tag = %name, "ubiquitous tag");
                }
                RevisionKind::TagCreated { tag }
            }
            Ok(ChangesetEvent::Tag(TagEvent::Deleted { name })) => {
                if state.tags.remove(&name).is_some() {
                    info!(rev, tag = %name, "removing deleted tag");
                }
                RevisionKind::TagDeleted { name }
            }
            Ok(ChangesetEvent::Unclassified { reason }) => {
                warn!(rev, %reason, "changeset neither a known branch or tag");
                RevisionKind::Skipped { reason }
            }
            Err(e @ GraphError::BranchPath { .. }) => {
                warn!(rev, error = %e, "excluding changeset");
                RevisionKind::Skipped {
                    reason: e.to_string(),
                }
            }
            Err(e) => return Err(e),
        };
        state.revisions.push(ClassifiedRevision {
            revision: rev,
            author: changeset.author.clone(),
            date: changeset.date,
            kind,
            deliver: changeset.prop(&self.deliver_prop).map(str::to_string),
            bring: changeset.prop(&self.bring_prop).map(str::to_string),
        });
        Ok(())
    }

    /// Resolve each branch's raw copy source to the stable location of the
    /// source node.
    fn resolve_provenance(&self, graph: &mut RevisionGraph) {
        let clones: HashMap<BranchKey, Provenance> = graph
            .revisions
            .iter()
            .filter_map(|r| match &r.kind {
                RevisionKind::Branch {
                    key,
                    clone: Some(clone),
                    ..
                } => Some((key.clone(), clone.clone())),
                _ => None,
            })
            .collect();
        for branch in &mut graph.branches {
            let key = BranchKey {
                path: branch.path.clone(),
                generation: branch.generation,
            };
            let Some(clone) = clones.get(&key) else {
                continue;
            };
            match self.repo.node(&clone.path, clone.revision) {
                Ok(node) => {
                    debug!(branch = %branch.path, source = %clone, resolved_rev = node.rev, "resolved provenance");
                    branch.source = Some(Provenance::new(node.path, node.rev));
                }
                Err(e) => {
                    warn!(branch = %branch.path, source = %clone, error = %e, "unresolvable provenance");
                    branch.source = None;
                }
            }
        }
    }
}

#[derive(Default)]
struct BuildState {
    branches: Vec<BranchEntity>,
    /// Index of the open generation of each path.
    open: HashMap<String, usize>,
    generations: HashMap<String, u32>,
    tags: BTreeMap<String, TagEntity>,
    revisions: Vec<ClassifiedRevision>,
}

impl BuildState {
    /// Append `changeset` to the open generation of `path`, opening a new one
    /// if needed.
    fn append(&mut self, path: &str, name: &str, changeset: &ChangesetRecord, terminal: bool) -> BranchKey {
        let idx = match self.open.get(path) {
            Some(idx) => *idx,
            None => {
                let generation = self.generations.entry(path.to_string()).or_insert(0);
                let mut branch = BranchEntity::new(path, name, *generation);
                branch.date = Some(changeset.date);
                *generation += 1;
                self.branches.push(branch);
                let idx = self.branches.len() - 1;
                self.open.insert(path.to_string(), idx);
                idx
            }
        };
        let branch = &mut self.branches[idx];
        if terminal {
            branch.close(changeset.revision);
            self.open.remove(path);
        } else {
            branch.add_revision(changeset.revision);
        }
        BranchKey {
            path: branch.path.clone(),
            generation: branch.generation,
        }
    }

    fn finish(self) -> RevisionGraph {
        RevisionGraph {
            branches: self.branches,
            tags: self.tags,
            revisions: self.revisions,
            range: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeOp, NodeKind, PathChange};
    use crate::pattern::DEFAULT_BRANCH_RE;
    use crate::source::MemoryRepository;

    fn pattern() -> BranchPattern {
        BranchPattern::new(DEFAULT_BRANCH_RE).unwrap()
    }

    fn file(path: &str) -> PathChange {
        PathChange::new(path, NodeKind::File, ChangeOp::Modify)
    }

    /// r1 trunk, r2 trunk edit, r3 branch foo, r4 foo edit, r5 tag v1,
    /// r6 foo deleted, r7 foo recreated, r8 foo edit, r9 README
    fn history() -> MemoryRepository {
        let mut repo = MemoryRepository::new();
        repo.commit("alice", vec![PathChange::new("trunk", NodeKind::Dir, ChangeOp::Add)]);
        repo.commit("alice", vec![PathChange::new("trunk/a", NodeKind::File, ChangeOp::Add)]);
        repo.commit("bob", vec![PathChange::copy("branches/foo", NodeKind::Dir, "trunk", 2)]);
        repo.commit("bob", vec![file("branches/foo/a")]);
        repo.commit("carol", vec![PathChange::copy("tags/v1", NodeKind::Dir, "trunk", 2)]);
        repo.commit("bob", vec![PathChange::new("branches/foo", NodeKind::Dir, ChangeOp::Delete)]);
        repo.commit("bob", vec![PathChange::copy("branches/foo", NodeKind::Dir, "trunk", 5)]);
        repo.commit("bob", vec![file("branches/foo/a")]);
        repo.commit("dave", vec![PathChange::new("README", NodeKind::File, ChangeOp::Add)]);
        repo
    }

    #[test]
    fn test_build_full_history() {
        let repo = history();
        let pattern = pattern();
        let graph = GraphBuilder::new(&repo, &pattern).build(BuildRange::all()).unwrap();

        assert_eq!(graph.range, Some((1, 9)));
        assert_eq!(graph.revisions.len(), 9);
        let paths: Vec<(&str, u32)> = graph.branches.iter().map(|b| (b.path.as_str(), b.generation)).collect();
        assert_eq!(paths, vec![("trunk", 0), ("branches/foo", 0), ("branches/foo", 1)]);

        let first = graph.branch(&BranchKey { path: "branches/foo".into(), generation: 0 }).unwrap();
        assert_eq!(first.revisions(), &[3, 4, 6]);
        assert_eq!(first.terminal_rev, Some(6));
        assert_eq!(first.source, Some(Provenance::new("trunk", 2)));
        assert_eq!(first.name, "foo");

        let second = graph.branch(&BranchKey { path: "branches/foo".into(), generation: 1 }).unwrap();
        assert_eq!(second.revisions(), &[7, 8]);
        assert!(second.terminal_rev.is_none());
        // trunk did not change between r2 and r5
        assert_eq!(second.source, Some(Provenance::new("trunk", 2)));

        assert_eq!(graph.tags.len(), 1);
        assert_eq!(graph.tags["tags/v1"].tag_revision, 5);
        assert_eq!(graph.skipped().map(|r| r.revision).collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn test_revisions_strictly_increasing() {
        let repo = history();
        let pattern = pattern();
        let graph = GraphBuilder::new(&repo, &pattern).build(BuildRange::all()).unwrap();
        for branch in &graph.branches {
            let revs = branch.revisions();
            assert!(revs.windows(2).all(|w| w[0] < w[1]));
            assert_eq!(branch.first_rev(), revs.iter().min().copied());
            assert_eq!(branch.last_rev(), revs.iter().max().copied());
        }
    }

    #[test]
    fn test_bounded_range_clamps_to_youngest() {
        let repo = history();
        let pattern = pattern();
        let graph = GraphBuilder::new(&repo, &pattern)
            .build(BuildRange::Revisions { lo: Some(7), hi: Some(100) })
            .unwrap();
        assert_eq!(graph.range, Some((7, 9)));
        let foo = graph.branches_at("branches/foo").next().unwrap();
        assert_eq!(foo.generation, 0);
        assert_eq!(foo.revisions(), &[7, 8]);
    }

    #[test]
    fn test_empty_range() {
        let repo = history();
        let pattern = pattern();
        let err = GraphBuilder::new(&repo, &pattern)
            .build(BuildRange::Revisions { lo: Some(20), hi: None })
            .unwrap_err();
        assert!(matches!(err, GraphError::EmptyRange { .. }));
    }

    #[test]
    fn test_tag_deletion_and_ubiquitous_tag() {
        let mut repo = history();
        repo.commit("carol", vec![PathChange::copy("tags/v1", NodeKind::Dir, "branches/foo", 8)]);
        repo.commit("carol", vec![PathChange::new("tags/v2", NodeKind::Dir, ChangeOp::Add)]);
        let pattern = pattern();
        let graph = GraphBuilder::new(&repo, &pattern).build(BuildRange::all()).unwrap();
        let v1 = &graph.tags["tags/v1"];
        assert_eq!(v1.tag_revision, 10);
        assert_eq!(v1.source, Some(Provenance::new("branches/foo", 8)));
        // a plain add under tags/ is not a tag
        assert!(!graph.tags.contains_key("tags/v2"));

        let mut repo = history();
        repo.commit("carol", vec![PathChange::new("tags/v1", NodeKind::Dir, ChangeOp::Delete)]);
        let graph = GraphBuilder::new(&repo, &pattern).build(BuildRange::all()).unwrap();
        assert!(graph.tags.is_empty());
        assert!(matches!(graph.revisions[9].kind, RevisionKind::TagDeleted { .. }));
    }

    #[test]
    fn test_integration_props_are_collected() {
        let mut repo = history();
        repo.set_revision_property(8, "rth:deliver", "4");
        repo.set_revision_property(8, "custom:bring", "2,3");
        let pattern = pattern();
        let graph = GraphBuilder::new(&repo, &pattern)
            .with_integration_props("rth:deliver", "custom:bring")
            .build(BuildRange::single(8))
            .unwrap();
        let rev = &graph.revisions[0];
        assert_eq!(rev.deliver.as_deref(), Some("4"));
        assert_eq!(rev.bring.as_deref(), Some("2,3"));
    }

    #[test]
    fn test_time_window() {
        let repo = history();
        let pattern = pattern();
        let graph = GraphBuilder::new(&repo, &pattern)
            .build(BuildRange::Time {
                start: MemoryRepository::date_of(3),
                end: MemoryRepository::date_of(4),
            })
            .unwrap();
        assert_eq!(graph.range, Some((3, 4)));
        assert_eq!(graph.branches.len(), 1);
    }

    #[test]
    fn test_export_roundtrip_preserves_branches() {
        let repo = history();
        let pattern = pattern();
        let graph = GraphBuilder::new(&repo, &pattern).build(BuildRange::all()).unwrap();
        let reloaded = RevisionGraph::from_json(&graph.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, graph);
        for (a, b) in graph.branches.iter().zip(&reloaded.branches) {
            assert_eq!(a.revisions(), b.revisions());
            assert_eq!(a.first_rev(), b.first_rev());
            assert_eq!(a.last_rev(), b.last_rev());
            assert_eq!(a.terminal_rev, b.terminal_rev);
        }
    }
}
