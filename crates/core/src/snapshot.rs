//! Read path: a render-ready view of the persisted graph.

use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::db::Database;
use crate::errors::CoreError;
use crate::mergeinfo::{MergeInfoResolver, DEFAULT_MERGEINFO_PROP};
use crate::models::{BranchEntity, MergeOperation, TagEntity};
use crate::optimizer::optimize;
use crate::source::SourceRepository;

/// What to include in a [`GraphSnapshot`].
#[derive(Debug, Clone)]
pub struct SnapshotOptions {
    /// Inclusive revision window; defaults to everything persisted.
    pub window: Option<(i64, i64)>,
    /// Keep branches that were deleted.
    pub include_deleted: bool,
    /// Node property holding merge-info.
    pub mergeinfo_prop: String,
}

impl Default for SnapshotOptions {
    fn default() -> Self {
        Self {
            window: None,
            include_deleted: false,
            mergeinfo_prop: DEFAULT_MERGEINFO_PROP.to_string(),
        }
    }
}

/// Branches, merge edges and tags of one window, in display order.
///
/// A snapshot reflects the store at load time and is meant for a single
/// render pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSnapshot {
    pub window: Option<(i64, i64)>,
    pub branches: Vec<BranchEntity>,
    pub merges: Vec<MergeOperation>,
    pub tags: Vec<TagEntity>,
}

impl GraphSnapshot {
    #[instrument(skip(db, repo, options), fields(window = ?options.window))]
    pub fn load<R: SourceRepository + ?Sized>(
        db: &Database,
        repo: &R,
        options: &SnapshotOptions,
    ) -> Result<Self, CoreError> {
        let catalog = db.branches()?;
        let tags = db.tags()?;

        let Some((lo, hi)) = options.window.or_else(|| persisted_window(&catalog, &tags)) else {
            info!("nothing persisted, empty snapshot");
            return Ok(Self::default());
        };

        let rendered: Vec<BranchEntity> = catalog
            .iter()
            .filter(|b| options.include_deleted || !b.is_closed())
            .filter(|b| b.revisions_in(lo, hi).next().is_some())
            .cloned()
            .collect();

        let resolver = MergeInfoResolver::new(repo, &catalog, &rendered).with_property(&options.mergeinfo_prop);
        let mut merges = Vec::new();
        for branch in &rendered {
            let revisions: Vec<i64> = branch.revisions_in(lo, hi).collect();
            merges.extend(resolver.resolve(branch, &revisions)?);
        }
        merges.sort_by_key(|m| m.target_rev);

        let branches: Vec<BranchEntity> = optimize(&rendered).into_iter().cloned().collect();
        let tags: Vec<TagEntity> = tags
            .into_iter()
            .filter(|t| lo <= t.tag_revision && t.tag_revision <= hi)
            .collect();

        debug!(
            branches = branches.len(),
            merges = merges.len(),
            tags = tags.len(),
            "snapshot loaded"
        );
        Ok(Self {
            window: Some((lo, hi)),
            branches,
            merges,
            tags,
        })
    }

    /// Merge edges arriving on `branch`.
    pub fn merges_into<'a>(&'a self, branch: &'a str) -> impl Iterator<Item = &'a MergeOperation> + 'a {
        self.merges.iter().filter(move |m| m.target_branch == branch)
    }
}

/// Oldest to youngest persisted revision.
fn persisted_window(branches: &[BranchEntity], tags: &[TagEntity]) -> Option<(i64, i64)> {
    let revs = branches
        .iter()
        .flat_map(|b| b.first_rev().into_iter().chain(b.last_rev()))
        .chain(tags.iter().map(|t| t.tag_revision));
    revs.fold(None, |acc, r| match acc {
        None => Some((r, r)),
        Some((lo, hi)) => Some((lo.min(r), hi.max(r))),
    })
}
