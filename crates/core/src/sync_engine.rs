//! Incremental projection of the revision graph into the database.
//!
//! The [`Synchronizer`] brings the persisted rows in line with the source
//! repository. A bounded sync is idempotent and fills every hole between
//! the oldest and the youngest persisted revision:
//!
//! 1. Compute the known revisions (revision, tag and skipped rows).
//! 2. Derive the targets: holes, the requested upper bound, and unknown
//!    revisions of the requested range.
//! 3. Build and persist each target on its own, one immediate transaction
//!    per revision.
//!
//! A lock flag prevents two syncs from running on the same synchronizer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::builder::{
    BranchKey, BuildRange, ClassifiedRevision, GraphBuilder, RevisionGraph, RevisionKind, DEFAULT_BRING_PROP,
    DEFAULT_DELIVER_PROP,
};
use crate::db::queries::{self, BranchUpdate};
use crate::db::Database;
use crate::errors::{DatabaseError, GraphError, SyncError};
use crate::models::{IntegrationKind, Provenance, RevisionEntry};
use crate::pattern::BranchPattern;
use crate::source::SourceRepository;

/// Statistics from a single sync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    /// Revisions the sync attempted.
    pub targets: usize,
    /// Branch revisions and tag events written.
    pub persisted: usize,
    /// Revisions recorded as skipped (not part of any branch).
    pub skipped: usize,
    /// Revisions found already persisted.
    pub already_present: usize,
    /// Targets without any changeset.
    pub empty: usize,
    /// Targets aborted by a source or storage error.
    pub failed: usize,
    pub started_at: String,
    pub completed_at: Option<String>,
}

/// What persisting one classified revision did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Persisted,
    Skipped,
    AlreadyPresent,
}

/// Keeps the persisted graph in sync with a source repository.
pub struct Synchronizer<'a, R: SourceRepository + ?Sized> {
    db: &'a Database,
    repo: &'a R,
    pattern: &'a BranchPattern,
    deliver_prop: String,
    bring_prop: String,
    /// Atomic flag preventing concurrent syncs.
    running: AtomicBool,
}

impl<'a, R: SourceRepository + ?Sized> Synchronizer<'a, R> {
    pub fn new(db: &'a Database, repo: &'a R, pattern: &'a BranchPattern) -> Self {
        Self {
            db,
            repo,
            pattern,
            deliver_prop: DEFAULT_DELIVER_PROP.to_string(),
            bring_prop: DEFAULT_BRING_PROP.to_string(),
            running: AtomicBool::new(false),
        }
    }

    /// Override the revision properties read as deliver/bring annotations.
    pub fn with_integration_props(mut self, deliver: impl Into<String>, bring: impl Into<String>) -> Self {
        self.deliver_prop = deliver.into();
        self.bring_prop = bring.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn builder(&self) -> GraphBuilder<'a, R> {
        GraphBuilder::new(self.repo, self.pattern).with_integration_props(&self.deliver_prop, &self.bring_prop)
    }

    // -----------------------------------------------------------------------
    // Main entry points
    // -----------------------------------------------------------------------

    /// Synchronize `range`, or rebuild everything when `range` is `None`.
    ///
    /// Per-revision failures are logged and counted in the report; only
    /// errors affecting the whole sync are returned.
    pub fn sync(&self, range: Option<(i64, i64)>) -> Result<SyncReport, SyncError> {
        let started_at = Utc::now().to_rfc3339();
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::AlreadyRunning { started_at });
        }
        let _guard = SyncLockGuard(&self.running);

        let mut report = SyncReport {
            started_at,
            ..Default::default()
        };
        match range {
            None => self.full_sync(&mut report)?,
            Some((lo, hi)) => self.bounded_sync(lo, hi, &mut report)?,
        }
        report.completed_at = Some(Utc::now().to_rfc3339());

        info!(
            targets = report.targets,
            persisted = report.persisted,
            skipped = report.skipped,
            already_present = report.already_present,
            empty = report.empty,
            failed = report.failed,
            "sync complete"
        );
        Ok(report)
    }

    /// Re-apply the properties of an already persisted revision.
    ///
    /// Returns `false` when the revision has no revision row.
    #[instrument(skip(self))]
    pub fn resync(&self, rev: i64) -> Result<bool, SyncError> {
        if !queries::revision_row_exists(&self.db.conn(), rev)? {
            info!(rev, "revision not persisted, nothing to resync");
            return Ok(false);
        }
        let graph = self.builder().build(BuildRange::single(rev))?;
        let Some(classified) = graph.revisions.iter().find(|r| r.revision == rev) else {
            warn!(rev, "revision vanished from the source repository");
            return Ok(false);
        };
        let RevisionKind::Branch { key, name, last, clone } = &classified.kind else {
            warn!(rev, "revision no longer belongs to a branch, leaving it untouched");
            return Ok(false);
        };

        let entry = RevisionEntry {
            revision: rev,
            branch: key.path.clone(),
            branch_name: name.clone(),
            author: classified.author.clone(),
            date: classified.date,
            last: *last,
            clone: stored_clone(&graph, key, clone.as_ref()),
        };
        self.db.immediate_transaction(|conn| {
            queries::update_revision(conn, &entry)?;
            queries::set_integration(conn, IntegrationKind::Deliver, &key.path, rev, classified.deliver.as_deref())?;
            queries::set_integration(conn, IntegrationKind::Bring, &key.path, rev, classified.bring.as_deref())?;
            Ok(())
        })?;
        info!(rev, branch = %key.path, "resynced revision properties");
        Ok(true)
    }

    /// Remove every revtree table. [`Database::initialize`] recreates them.
    pub fn drop_tables(&self) -> Result<(), SyncError> {
        warn!("dropping all revtree tables");
        self.db.drop_tables()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync modes
    // -----------------------------------------------------------------------

    fn full_sync(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        info!("full resync requested, clearing persisted graph");
        self.db.transaction(queries::clear_all)?;

        let graph = match self.builder().build(BuildRange::all()) {
            Ok(graph) => graph,
            Err(GraphError::EmptyRange { .. }) => {
                info!("repository holds no changeset");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        for classified in &graph.revisions {
            report.targets += 1;
            self.persist_counted(&graph, classified, report);
        }
        Ok(())
    }

    fn bounded_sync(&self, lo: i64, hi: i64, report: &mut SyncReport) -> Result<(), SyncError> {
        let targets = self.targets(lo.min(hi), lo.max(hi))?;
        debug!(count = targets.len(), "sync targets computed");

        for rev in targets {
            report.targets += 1;
            let graph = match self.builder().build(BuildRange::single(rev)) {
                Ok(graph) => graph,
                Err(GraphError::EmptyRange { .. }) => {
                    debug!(rev, "no changeset, skipping target");
                    report.empty += 1;
                    continue;
                }
                Err(e) => {
                    error!(rev, error = %e, "failed to build revision");
                    report.failed += 1;
                    continue;
                }
            };
            for classified in &graph.revisions {
                self.persist_counted(&graph, classified, report);
            }
        }
        Ok(())
    }

    /// Revisions a bounded sync of `[lo, hi]` must process, ascending.
    fn targets(&self, lo: i64, hi: i64) -> Result<Vec<i64>, SyncError> {
        let known = self.db.known_revisions()?;
        let (Some(&min), Some(&max)) = (known.first(), known.last()) else {
            debug!(lo, hi, "nothing persisted yet");
            return Ok((lo..=hi).collect());
        };

        let mut targets: BTreeSet<i64> = (min..=max).filter(|r| !known.contains(r)).collect();
        if let Some(&lowest) = targets.first() {
            if lowest < lo {
                info!(requested = lo, effective = lowest, "widening lower bound to fill holes");
            }
        }
        targets.insert(hi);
        targets.extend((lo..=hi).filter(|r| !known.contains(r)));
        Ok(targets.into_iter().collect())
    }

    // -----------------------------------------------------------------------
    // Per-revision persistence
    // -----------------------------------------------------------------------

    fn persist_counted(&self, graph: &RevisionGraph, classified: &ClassifiedRevision, report: &mut SyncReport) {
        match self.persist(graph, classified) {
            Ok(Outcome::Persisted) => report.persisted += 1,
            Ok(Outcome::Skipped) => report.skipped += 1,
            Ok(Outcome::AlreadyPresent) => {
                debug!(rev = classified.revision, "revision already persisted");
                report.already_present += 1;
            }
            Err(e) => {
                error!(rev = classified.revision, error = %e, "failed to persist revision");
                report.failed += 1;
            }
        }
    }

    /// Write one revision atomically.
    fn persist(&self, graph: &RevisionGraph, classified: &ClassifiedRevision) -> Result<Outcome, DatabaseError> {
        self.db.immediate_transaction(|conn| {
            if queries::revision_is_known(conn, classified.revision)? {
                return Ok(Outcome::AlreadyPresent);
            }
            write_revision(conn, graph, classified)
        })
    }
}

fn write_revision(
    conn: &Connection,
    graph: &RevisionGraph,
    classified: &ClassifiedRevision,
) -> Result<Outcome, DatabaseError> {
    let rev = classified.revision;
    match &classified.kind {
        RevisionKind::Branch { key, name, last, clone } => {
            queries::insert_revision(
                conn,
                &RevisionEntry {
                    revision: rev,
                    branch: key.path.clone(),
                    branch_name: name.clone(),
                    author: classified.author.clone(),
                    date: classified.date,
                    last: *last,
                    clone: stored_clone(graph, key, clone.as_ref()),
                },
            )?;
            if let Some(raw) = &classified.deliver {
                queries::set_integration(conn, IntegrationKind::Deliver, &key.path, rev, Some(raw))?;
            }
            if let Some(raw) = &classified.bring {
                queries::set_integration(conn, IntegrationKind::Bring, &key.path, rev, Some(raw))?;
            }
            let source = clone
                .as_ref()
                .and_then(|_| graph.branch(key))
                .and_then(|b| b.source.as_ref());
            queries::upsert_branch(
                conn,
                &BranchUpdate {
                    path: &key.path,
                    name,
                    revision: rev,
                    date: classified.date,
                    terminal: *last,
                    source,
                },
            )?;
            debug!(rev, branch = %key.path, "persisted branch revision");
            Ok(Outcome::Persisted)
        }
        RevisionKind::TagCreated { tag } => {
            queries::insert_tag(conn, tag)?;
            Ok(Outcome::Persisted)
        }
        RevisionKind::TagDeleted { name } => {
            queries::remove_tag(conn, name, rev)?;
            queries::insert_skipped(conn, rev, &queries::tag_deleted_reason(name))?;
            Ok(Outcome::Persisted)
        }
        RevisionKind::Skipped { reason } => {
            queries::insert_skipped(conn, rev, reason)?;
            Ok(Outcome::Skipped)
        }
    }
}

/// Copy source recorded on a revision row: the resolved provenance of the
/// created branch, the raw copy source when it could not be resolved.
fn stored_clone(graph: &RevisionGraph, key: &BranchKey, clone: Option<&Provenance>) -> Option<Provenance> {
    let raw = clone?;
    graph
        .branch(key)
        .and_then(|b| b.source.clone())
        .or_else(|| Some(raw.clone()))
}

/// Clears the running flag on drop, even on panic.
struct SyncLockGuard<'a>(&'a AtomicBool);

impl Drop for SyncLockGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
