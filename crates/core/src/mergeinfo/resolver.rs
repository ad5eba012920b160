//! Newly introduced merge edges of a branch.

use std::collections::HashSet;

use tracing::{debug, instrument, warn};

use super::parser::{parse_mergeinfo, MergeToken};
use super::ranges::RevisionSet;
use crate::errors::SourceError;
use crate::models::{BranchEntity, MergeOperation, Provenance};
use crate::source::SourceRepository;

/// Default versioned property holding merge tracking information.
pub const DEFAULT_MERGEINFO_PROP: &str = "svn:mergeinfo";

/// Computes [`MergeOperation`]s from merge-info properties.
///
/// `catalog` holds every known branch and is used to walk provenance
/// chains; `rendered` is the set of branches merge sources may resolve to.
pub struct MergeInfoResolver<'a, R: SourceRepository + ?Sized> {
    repo: &'a R,
    catalog: &'a [BranchEntity],
    rendered: &'a [BranchEntity],
    prop: String,
}

impl<'a, R: SourceRepository + ?Sized> MergeInfoResolver<'a, R> {
    pub fn new(repo: &'a R, catalog: &'a [BranchEntity], rendered: &'a [BranchEntity]) -> Self {
        Self {
            repo,
            catalog,
            rendered,
            prop: DEFAULT_MERGEINFO_PROP.to_string(),
        }
    }

    pub fn with_property(mut self, prop: impl Into<String>) -> Self {
        self.prop = prop.into();
        self
    }

    /// Merge edges introduced by `revisions` of `branch`, in ascending
    /// revision order.
    #[instrument(skip(self, branch, revisions), fields(branch = %branch.path, generation = branch.generation))]
    pub fn resolve(&self, branch: &BranchEntity, revisions: &[i64]) -> Result<Vec<MergeOperation>, SourceError> {
        let (inherited, mut merged) = self.inherited(branch)?;

        let mut revs = revisions.to_vec();
        revs.sort_unstable();
        revs.dedup();

        let mut operations = Vec::new();
        for rev in revs {
            if branch.terminal_rev == Some(rev) {
                continue;
            }
            let tokens: Vec<MergeToken> = self
                .mergeinfo(&branch.path, rev)?
                .into_iter()
                .filter(|t| !inherited.contains(&t.raw))
                .collect();
            for token in tokens {
                if let Some(op) = self.edge(&token, branch, rev, &mut merged) {
                    debug!(%op, "merge edge");
                    operations.push(op);
                }
            }
        }
        Ok(operations)
    }

    /// Tokens recorded along the provenance chain of `branch`, and the
    /// revisions they cover.
    fn inherited(&self, branch: &BranchEntity) -> Result<(HashSet<String>, RevisionSet), SourceError> {
        let mut tokens = HashSet::new();
        let mut covered = RevisionSet::new();
        let mut visited: HashSet<Provenance> = HashSet::new();
        let mut current = branch.source.clone();
        while let Some(source) = current {
            if !visited.insert(source.clone()) {
                warn!(branch = %branch.path, %source, "provenance cycle, stopping walk");
                break;
            }
            for token in self.mergeinfo(&source.path, source.revision)? {
                covered.extend(&token.revisions);
                tokens.insert(token.raw);
            }
            current = self
                .catalog_branch(&source.path, source.revision)
                .and_then(|b| b.source.clone());
        }
        Ok((tokens, covered))
    }

    /// The known generation of `path` holding `rev`, else its first one.
    fn catalog_branch(&self, path: &str, rev: i64) -> Option<&'a BranchEntity> {
        let catalog = self.catalog;
        catalog
            .iter()
            .find(|b| b.path == path && b.contains(rev))
            .or_else(|| catalog.iter().find(|b| b.path == path))
    }

    fn mergeinfo(&self, path: &str, rev: i64) -> Result<Vec<MergeToken>, SourceError> {
        let props = match self.repo.node_properties(path, rev) {
            Ok(props) => props,
            Err(SourceError::NoSuchNode { .. }) => {
                debug!(path, rev, "no node, no mergeinfo");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };
        Ok(props
            .get(&self.prop)
            .map(|value| parse_mergeinfo(value))
            .unwrap_or_default())
    }

    /// Turn one new token into an edge, recording what it merged.
    fn edge(
        &self,
        token: &MergeToken,
        target: &BranchEntity,
        rev: i64,
        merged: &mut RevisionSet,
    ) -> Option<MergeOperation> {
        let candidates: Vec<&BranchEntity> = self
            .rendered
            .iter()
            .filter(|b| b.path == token.source)
            .collect();
        if candidates.is_empty() {
            debug!(source = %token.source, "merge source not rendered");
            return None;
        }

        let mut uncovered = RevisionSet::new();
        for &(lo, hi) in token.revisions.intervals() {
            uncovered.extend(&merged.uncovered(lo, hi));
        }
        if uncovered.is_empty() {
            return None;
        }
        merged.extend(&uncovered);

        candidates.into_iter().find_map(|source| {
            let revs: Vec<i64> = source
                .revisions()
                .iter()
                .copied()
                .filter(|r| uncovered.contains(*r))
                .collect();
            let (first, last) = (*revs.first()?, *revs.last()?);
            Some(MergeOperation {
                source_branch: source.path.clone(),
                first_rev: first,
                last_rev: last,
                target_branch: target.path.clone(),
                target_rev: rev,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::{DateTime, Utc};

    use super::*;
    use crate::models::ChangesetRecord;
    use crate::source::{Node, NodeLocation, Properties};

    /// A repository whose merge-info is fixed per `(path, rev)`.
    struct FixedProps(HashMap<(String, i64), String>);

    impl SourceRepository for FixedProps {
        fn changeset(&self, rev: i64) -> Result<ChangesetRecord, SourceError> {
            Err(SourceError::RevisionNotFound(rev))
        }
        fn node_properties(&self, path: &str, rev: i64) -> Result<Properties, SourceError> {
            let mut props = Properties::new();
            if let Some(v) = self.0.get(&(path.to_string(), rev)) {
                props.insert(DEFAULT_MERGEINFO_PROP.to_string(), v.clone());
            }
            Ok(props)
        }
        fn node(&self, path: &str, rev: i64) -> Result<Node, SourceError> {
            Err(SourceError::NoSuchNode {
                path: path.into(),
                rev,
            })
        }
        fn node_history(&self, _: &str, _: i64) -> Result<Vec<NodeLocation>, SourceError> {
            Ok(Vec::new())
        }
        fn oldest_revision(&self) -> Result<i64, SourceError> {
            Ok(1)
        }
        fn youngest_revision(&self) -> Result<i64, SourceError> {
            Ok(1)
        }
        fn previous_revision(&self, _: i64) -> Result<Option<i64>, SourceError> {
            Ok(None)
        }
        fn changesets_between(
            &self,
            _: DateTime<Utc>,
            _: DateTime<Utc>,
        ) -> Result<Vec<ChangesetRecord>, SourceError> {
            Ok(Vec::new())
        }
    }

    fn fixed(entries: &[(&str, i64, &str)]) -> FixedProps {
        FixedProps(
            entries
                .iter()
                .map(|(p, r, v)| ((p.to_string(), *r), v.to_string()))
                .collect(),
        )
    }

    fn branch(path: &str, revs: &[i64], source: Option<Provenance>) -> BranchEntity {
        BranchEntity::from_parts(path, path, 0, revs.to_vec(), None, source)
    }

    fn edges<R: SourceRepository + ?Sized>(resolver: &MergeInfoResolver<'_, R>, b: &BranchEntity) -> Vec<String> {
        resolver
            .resolve(b, b.revisions())
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn test_new_edge_after_inherited_tokens() {
        let repo = fixed(&[("Y", 10, "/Z:1-5"), ("X", 12, "/Z:1-8")]);
        let z = branch("Z", &[1, 2, 3, 4, 5, 6, 7, 8], None);
        let y = branch("Y", &[9, 10], None);
        let x = branch("X", &[11, 12], Some(Provenance::new("Y", 10)));
        let all = vec![z, y, x.clone()];
        let resolver = MergeInfoResolver::new(&repo, &all, &all);
        let ops = resolver.resolve(&x, x.revisions()).unwrap();
        assert_eq!(
            ops,
            vec![MergeOperation {
                source_branch: "Z".into(),
                first_rev: 6,
                last_rev: 8,
                target_branch: "X".into(),
                target_rev: 12,
            }]
        );
    }

    #[test]
    fn test_transitive_inheritance_and_running_set() {
        // W -> Y -> X
        let repo = fixed(&[
            ("W", 7, "/Z:1-2"),
            ("Y", 9, "/Z:1-4"),
            ("X", 11, "/Z:1-4\n/V:5"),
            ("X", 12, "/Z:1-6\n/V:5"),
            ("X", 13, "/Z:1-6\n/V:5\n/Q:1-9"),
        ]);
        let z = branch("Z", &[1, 2, 3, 4, 6], None);
        let v = branch("V", &[5], None);
        let w = branch("W", &[7], None);
        let y = branch("Y", &[8, 9], Some(Provenance::new("W", 7)));
        let x = branch("X", &[10, 11, 12, 13], Some(Provenance::new("Y", 9)));
        let all = vec![z, v, w, y, x.clone()];
        let resolver = MergeInfoResolver::new(&repo, &all, &all);
        // Q is not rendered; repeated tokens add nothing
        assert_eq!(edges(&resolver, &x), vec!["/V:5-5 -> X@11", "/Z:6-6 -> X@12"]);
    }

    #[test]
    fn test_source_must_be_rendered() {
        let repo = fixed(&[("X", 5, "/Z:1-3")]);
        let z = branch("Z", &[1, 2, 3], None);
        let x = branch("X", &[4, 5], None);
        let catalog = vec![z, x.clone()];
        let rendered = vec![x.clone()];
        let resolver = MergeInfoResolver::new(&repo, &catalog, &rendered);
        assert!(edges(&resolver, &x).is_empty());
    }

    #[test]
    fn test_terminal_revision_is_skipped() {
        let repo = fixed(&[("X", 12, "/Z:1-3")]);
        let z = branch("Z", &[1, 2, 3], None);
        let x = BranchEntity::from_parts("X", "X", 0, vec![11, 12], Some(12), None);
        let all = vec![z, x.clone()];
        let resolver = MergeInfoResolver::new(&repo, &all, &all);
        assert!(edges(&resolver, &x).is_empty());
    }

    #[test]
    fn test_provenance_cycle_terminates() {
        let repo = fixed(&[("A", 3, "/Z:1"), ("B", 4, "/Z:2")]);
        let a = branch("A", &[3], Some(Provenance::new("B", 4)));
        let b = branch("B", &[4], Some(Provenance::new("A", 3)));
        let x = branch("X", &[5], Some(Provenance::new("A", 3)));
        let all = vec![a, b, x.clone()];
        let resolver = MergeInfoResolver::new(&repo, &all, &all);
        assert!(edges(&resolver, &x).is_empty());
    }

    #[test]
    fn test_custom_property_name() {
        let repo = fixed(&[("X", 5, "/Z:1-3")]);
        let z = branch("Z", &[1, 2, 3], None);
        let x = branch("X", &[4, 5], None);
        let all = vec![z, x.clone()];
        let resolver = MergeInfoResolver::new(&repo, &all, &all).with_property("custom:merges");
        assert!(edges(&resolver, &x).is_empty());
    }
}
