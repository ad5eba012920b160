//! Typed query helpers for every table in the revtree database.
//!
//! Read accessors are methods on [`Database`]. Write helpers are free
//! functions over a [`Connection`] so that the synchronizer can compose them
//! inside one transaction.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info, warn};

use super::Database;
use crate::errors::DatabaseError;
use crate::models::{BranchEntity, IntegrationKind, IntegrationRecord, Provenance, RevisionEntry, TagEntity};

const BRANCH_COLUMNS: &str =
    "id, branch, name, date, firstrev, lastrev, revisions, srcpath, srcrev, terminalrev";

/// Raw `revtree_branches` row before decoding.
struct BranchRow {
    id: i64,
    branch: String,
    name: String,
    date: Option<String>,
    revisions: String,
    srcpath: Option<String>,
    srcrev: Option<i64>,
    terminalrev: Option<i64>,
}

impl BranchRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            branch: row.get(1)?,
            name: row.get(2)?,
            date: row.get(3)?,
            revisions: row.get(6)?,
            srcpath: row.get(7)?,
            srcrev: row.get(8)?,
            terminalrev: row.get(9)?,
        })
    }

    fn decode(self, generation: u32) -> Result<(i64, BranchEntity), DatabaseError> {
        let source = match (self.srcpath, self.srcrev) {
            (Some(path), Some(rev)) => Some(Provenance::new(path, rev)),
            _ => None,
        };
        let mut entity = BranchEntity::from_parts(
            self.branch,
            self.name,
            generation,
            parse_revisions(&self.revisions)?,
            self.terminalrev,
            source,
        );
        entity.date = self.date.as_deref().map(parse_datetime).transpose()?;
        Ok((self.id, entity))
    }
}

/// Load branch rows matching `filter` (a SQL suffix), oldest life first,
/// with generations numbered per path.
fn load_branches(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<(i64, BranchEntity)>, DatabaseError> {
    let sql = format!("SELECT {BRANCH_COLUMNS} FROM revtree_branches {filter} ORDER BY firstrev, id");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params, BranchRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    let mut generations: HashMap<String, u32> = HashMap::new();
    rows.into_iter()
        .map(|row| {
            let generation = generations.entry(row.branch.clone()).or_insert(0);
            let current = *generation;
            *generation += 1;
            row.decode(current)
        })
        .collect()
}

/// Parse the comma-separated revision list of a branch row.
pub(crate) fn parse_revisions(csv: &str) -> Result<Vec<i64>, DatabaseError> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<i64>().map_err(|_| DatabaseError::Corrupt {
                column: "revisions".into(),
                value: csv.to_string(),
            })
        })
        .collect()
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DatabaseError::Corrupt {
            column: "date".into(),
            value: s.to_string(),
        })
}

fn encode_clone(clone: Option<&Provenance>) -> Result<Option<String>, DatabaseError> {
    clone
        .map(|p| {
            serde_json::to_string(p).map_err(|e| DatabaseError::Corrupt {
                column: "clone".into(),
                value: e.to_string(),
            })
        })
        .transpose()
}

fn decode_clone(raw: Option<String>) -> Result<Option<Provenance>, DatabaseError> {
    raw.filter(|s| !s.is_empty())
        .map(|s| {
            serde_json::from_str(&s).map_err(|_| DatabaseError::Corrupt {
                column: "clone".into(),
                value: s.clone(),
            })
        })
        .transpose()
}

fn join_revisions(revisions: &[i64]) -> String {
    revisions
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// Read accessors
// ---------------------------------------------------------------------------

impl Database {
    // -- branches -----------------------------------------------------------

    /// All branches, every generation, oldest first.
    pub fn branches(&self) -> Result<Vec<BranchEntity>, DatabaseError> {
        let conn = self.conn();
        Ok(load_branches(&conn, "", &[])?
            .into_iter()
            .map(|(_, b)| b)
            .collect())
    }

    /// Branches stored under `name` (the branch path). When `rev` is given
    /// and one generation contains it, only that generation is returned.
    pub fn branches_by_name(&self, name: &str, rev: Option<i64>) -> Result<Vec<BranchEntity>, DatabaseError> {
        let conn = self.conn();
        let branches: Vec<BranchEntity> = load_branches(&conn, "WHERE branch = ?1", &[&name])?
            .into_iter()
            .map(|(_, b)| b)
            .collect();
        if let Some(rev) = rev {
            if let Some(hit) = branches.iter().find(|b| b.contains(rev)) {
                return Ok(vec![hit.clone()]);
            }
        }
        Ok(branches)
    }

    /// The branch generation holding `rev`, if any.
    pub fn branch_containing(&self, rev: i64) -> Result<Option<BranchEntity>, DatabaseError> {
        let path: Option<String> = {
            let conn = self.conn();
            conn.query_row(
                "SELECT branch FROM revtree_revisions WHERE revision = ?1",
                params![rev],
                |row| row.get(0),
            )
            .optional()?
        };
        let Some(path) = path else {
            return Ok(None);
        };
        Ok(self
            .branches_by_name(&path, Some(rev))?
            .into_iter()
            .find(|b| b.contains(rev)))
    }

    /// Distinct branch paths.
    pub fn branch_names(&self) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT branch FROM revtree_branches ORDER BY branch")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    /// `(branch path, terminal revision)` of every stored branch row.
    pub fn branch_names_with_terminal(&self) -> Result<Vec<(String, Option<i64>)>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT branch, terminalrev FROM revtree_branches ORDER BY firstrev, id")?;
        let names = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    // -- tags ---------------------------------------------------------------

    /// Tags that have not been deleted, by tag revision.
    pub fn tags(&self) -> Result<Vec<TagEntity>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT name, prettyname, tag_revision, branch, revision FROM revtree_tags
             WHERE removed_rev IS NULL ORDER BY tag_revision",
        )?;
        let tags = stmt
            .query_map([], |row| {
                let branch: Option<String> = row.get(3)?;
                let revision: Option<i64> = row.get(4)?;
                Ok(TagEntity {
                    name: row.get(0)?,
                    pretty_name: row.get(1)?,
                    tag_revision: row.get(2)?,
                    source: branch.zip(revision).map(|(p, r)| Provenance::new(p, r)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tags)
    }

    // -- delivers / brings --------------------------------------------------

    /// Deliver or bring records of `branch`, ascending by revision.
    pub fn integrations(&self, kind: IntegrationKind, branch: &str) -> Result<Vec<IntegrationRecord>, DatabaseError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT branch, revision, raw FROM {} WHERE branch = ?1 ORDER BY revision",
            kind.table()
        );
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(params![branch], |row| {
                Ok(IntegrationRecord {
                    kind,
                    branch: row.get(0)?,
                    revision: row.get(1)?,
                    raw: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn delivers(&self, branch: &str) -> Result<Vec<IntegrationRecord>, DatabaseError> {
        self.integrations(IntegrationKind::Deliver, branch)
    }

    pub fn brings(&self, branch: &str) -> Result<Vec<IntegrationRecord>, DatabaseError> {
        self.integrations(IntegrationKind::Bring, branch)
    }

    // -- revisions ----------------------------------------------------------

    /// Distinct committers of branch revisions.
    pub fn authors(&self) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT DISTINCT author FROM revtree_revisions ORDER BY author")?;
        let authors = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(authors)
    }

    /// Every revision row, newest first.
    pub fn revisions(&self) -> Result<Vec<RevisionEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT revision, branch, branch_name, author, date, last, clone
             FROM revtree_revisions ORDER BY revision DESC",
        )?;
        let raw = stmt
            .query_map([], raw_revision_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(decode_revision_row).collect()
    }

    pub fn revision(&self, rev: i64) -> Result<Option<RevisionEntry>, DatabaseError> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                "SELECT revision, branch, branch_name, author, date, last, clone
                 FROM revtree_revisions WHERE revision = ?1",
                params![rev],
                raw_revision_row,
            )
            .optional()?;
        raw.map(decode_revision_row).transpose()
    }

    /// Revisions already accounted for: branch revisions, tag creations and
    /// skipped changesets.
    pub fn known_revisions(&self) -> Result<BTreeSet<i64>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT revision FROM revtree_revisions
             UNION SELECT tag_revision FROM revtree_tags
             UNION SELECT revision FROM revtree_skipped",
        )?;
        let revs = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<BTreeSet<i64>, _>>()?;
        Ok(revs)
    }
}

type RawRevisionRow = (i64, String, String, String, String, bool, Option<String>);

fn raw_revision_row(row: &Row<'_>) -> rusqlite::Result<RawRevisionRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn decode_revision_row(raw: RawRevisionRow) -> Result<RevisionEntry, DatabaseError> {
    let (revision, branch, branch_name, author, date, last, clone) = raw;
    Ok(RevisionEntry {
        revision,
        branch,
        branch_name,
        author,
        date: parse_datetime(&date)?,
        last,
        clone: decode_clone(clone)?,
    })
}

// ---------------------------------------------------------------------------
// Write helpers (run inside a transaction)
// ---------------------------------------------------------------------------

/// Whether `rev` is already persisted in any row family.
pub(crate) fn revision_is_known(conn: &Connection, rev: i64) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT (SELECT COUNT(*) FROM revtree_revisions WHERE revision = ?1)
              + (SELECT COUNT(*) FROM revtree_tags WHERE tag_revision = ?1)
              + (SELECT COUNT(*) FROM revtree_skipped WHERE revision = ?1)",
        params![rev],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn revision_row_exists(conn: &Connection, rev: i64) -> Result<bool, DatabaseError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM revtree_revisions WHERE revision = ?1",
        params![rev],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn insert_revision(conn: &Connection, entry: &RevisionEntry) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO revtree_revisions (revision, branch, branch_name, author, date, last, clone)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.revision,
            entry.branch,
            entry.branch_name,
            entry.author,
            entry.date.to_rfc3339(),
            entry.last,
            encode_clone(entry.clone.as_ref())?,
        ],
    )?;
    debug!(rev = entry.revision, branch = %entry.branch, "inserted revision row");
    Ok(())
}

pub(crate) fn update_revision(conn: &Connection, entry: &RevisionEntry) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE revtree_revisions
         SET branch = ?2, branch_name = ?3, author = ?4, date = ?5, last = ?6, clone = ?7
         WHERE revision = ?1",
        params![
            entry.revision,
            entry.branch,
            entry.branch_name,
            entry.author,
            entry.date.to_rfc3339(),
            entry.last,
            encode_clone(entry.clone.as_ref())?,
        ],
    )?;
    debug!(rev = entry.revision, branch = %entry.branch, "updated revision row");
    Ok(())
}

/// Insert, overwrite, or (with `raw = None`) delete a deliver/bring row.
pub(crate) fn set_integration(
    conn: &Connection,
    kind: IntegrationKind,
    branch: &str,
    rev: i64,
    raw: Option<&str>,
) -> Result<(), DatabaseError> {
    let table = kind.table();
    match raw {
        Some(raw) => {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (branch, revision, raw) VALUES (?1, ?2, ?3)
                     ON CONFLICT(branch, revision) DO UPDATE SET raw = excluded.raw"
                ),
                params![branch, rev, raw],
            )?;
            debug!(%kind, branch, rev, raw, "stored integration record");
        }
        None => {
            let removed = conn.execute(
                &format!("DELETE FROM {table} WHERE branch = ?1 AND revision = ?2"),
                params![branch, rev],
            )?;
            if removed > 0 {
                debug!(%kind, branch, rev, "removed integration record");
            }
        }
    }
    Ok(())
}

/// One revision to merge into the stored branch rows.
#[derive(Debug, Clone)]
pub(crate) struct BranchUpdate<'a> {
    pub path: &'a str,
    pub name: &'a str,
    pub revision: i64,
    pub date: DateTime<Utc>,
    pub terminal: bool,
    pub source: Option<&'a Provenance>,
}

/// Merge a revision into the row of the branch life it belongs to.
///
/// The target is the oldest row for the path that is still open or was
/// closed at or after the revision; without one, a new row is inserted.
/// Revisions may arrive out of order when holes are filled.
pub(crate) fn upsert_branch(conn: &Connection, update: &BranchUpdate<'_>) -> Result<(), DatabaseError> {
    let rev = update.revision;
    let rows = load_branches(conn, "WHERE branch = ?1", &[&update.path])?;
    let target = rows
        .into_iter()
        .find(|(_, b)| b.terminal_rev.map_or(true, |t| t >= rev));

    let Some((id, branch)) = target else {
        conn.execute(
            "INSERT INTO revtree_branches
                 (branch, name, date, firstrev, lastrev, revisions, srcpath, srcrev, terminalrev)
             VALUES (?1, ?2, ?3, ?4, ?4, ?5, ?6, ?7, ?8)",
            params![
                update.path,
                update.name,
                update.date.to_rfc3339(),
                rev,
                rev.to_string(),
                update.source.map(|s| s.path.as_str()),
                update.source.map(|s| s.revision),
                update.terminal.then_some(rev),
            ],
        )?;
        info!(branch = update.path, rev, "new branch row");
        return Ok(());
    };

    let mut revisions = branch.revisions().to_vec();
    if let Err(pos) = revisions.binary_search(&rev) {
        revisions.insert(pos, rev);
    }
    let mut terminal = branch.terminal_rev;
    let mut detached = Vec::new();
    if update.terminal {
        match terminal {
            None => {
                terminal = Some(rev);
                let keep = revisions.partition_point(|r| *r <= rev);
                detached = revisions.split_off(keep);
            }
            Some(t) if t != rev => {
                warn!(branch = update.path, rev, terminal = t, "branch already closed, keeping terminal revision");
            }
            Some(_) => {}
        }
    }
    let date = match branch.first_rev() {
        Some(first) if first < rev => branch.date,
        _ => Some(update.date),
    };
    // A creation older than the row starts the life that keeps its earliest
    // revisions; later lives are split off with their own clone.
    let source = match (branch.first_rev(), update.source) {
        (Some(first), Some(created)) if rev < first => {
            if branch.source.as_ref().is_some_and(|s| s != created) {
                debug!(branch = update.path, rev, first, "earlier creation replaces row provenance");
            }
            Some(created)
        }
        _ => branch.source.as_ref().or(update.source),
    };
    let first = revisions.first().copied().unwrap_or(rev);
    let last = revisions.last().copied().unwrap_or(rev);

    conn.execute(
        "UPDATE revtree_branches
         SET date = ?2, firstrev = ?3, lastrev = ?4, revisions = ?5,
             srcpath = ?6, srcrev = ?7, terminalrev = ?8
         WHERE id = ?1",
        params![
            id,
            date.map(|d| d.to_rfc3339()),
            first,
            last,
            join_revisions(&revisions),
            source.map(|s| s.path.as_str()),
            source.map(|s| s.revision),
            terminal,
        ],
    )?;
    debug!(branch = update.path, id, rev, first, last, "updated branch row");

    if !detached.is_empty() {
        reopen_detached(conn, update, &detached)?;
    }
    Ok(())
}

/// Revisions persisted after a late-arriving terminal revision belong to a
/// later life of the branch: move them to a new open row.
fn reopen_detached(conn: &Connection, update: &BranchUpdate<'_>, detached: &[i64]) -> Result<(), DatabaseError> {
    let first = detached[0];
    let (date, clone): (Option<String>, Option<String>) = conn
        .query_row(
            "SELECT date, clone FROM revtree_revisions WHERE revision = ?1",
            params![first],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
        .unwrap_or((None, None));
    let source = decode_clone(clone)?;
    warn!(
        branch = update.path,
        terminal = update.revision,
        moved = detached.len(),
        "terminal revision filled late, splitting branch row"
    );
    conn.execute(
        "INSERT INTO revtree_branches
             (branch, name, date, firstrev, lastrev, revisions, srcpath, srcrev, terminalrev)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL)",
        params![
            update.path,
            update.name,
            date,
            first,
            detached[detached.len() - 1],
            join_revisions(detached),
            source.as_ref().map(|s| s.path.as_str()),
            source.as_ref().map(|s| s.revision),
        ],
    )?;
    Ok(())
}

/// Record a tag creation. Returns `false` when the same tag creation is
/// already stored.
pub(crate) fn insert_tag(conn: &Connection, tag: &TagEntity) -> Result<bool, DatabaseError> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM revtree_tags WHERE name = ?1 AND tag_revision = ?2",
        params![tag.name, tag.tag_revision],
        |row| row.get(0),
    )?;
    if exists > 0 {
        debug!(tag = %tag.name, rev = tag.tag_revision, "tag already exists");
        return Ok(false);
    }
    let replaced = conn.execute(
        "UPDATE revtree_tags SET removed_rev = ?2
         WHERE name = ?1 AND tag_revision < ?2
           AND (removed_rev IS NULL OR removed_rev > ?2)",
        params![tag.name, tag.tag_revision],
    )?;
    if replaced > 0 {
        warn!(tag = %tag.name, rev = tag.tag_revision, "ubiquitous tag");
    }
    conn.execute(
        "INSERT INTO revtree_tags (name, prettyname, tag_revision, branch, revision)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            tag.name,
            tag.pretty_name,
            tag.tag_revision,
            tag.source.as_ref().map(|s| s.path.as_str()),
            tag.source.as_ref().map(|s| s.revision),
        ],
    )?;
    // A deletion or re-creation persisted before this creation was filled in
    conn.execute(
        "UPDATE revtree_tags SET removed_rev = (
             SELECT MIN(rev) FROM (
                 SELECT revision AS rev FROM revtree_skipped
                 WHERE revision > ?2 AND reason = ?3
                 UNION ALL
                 SELECT tag_revision AS rev FROM revtree_tags
                 WHERE name = ?1 AND tag_revision > ?2))
         WHERE name = ?1 AND tag_revision = ?2",
        params![tag.name, tag.tag_revision, tag_deleted_reason(&tag.name)],
    )?;
    Ok(true)
}

/// Mark the live tag `name` created before `rev` as deleted at `rev`.
pub(crate) fn remove_tag(conn: &Connection, name: &str, rev: i64) -> Result<(), DatabaseError> {
    let removed = conn.execute(
        "UPDATE revtree_tags SET removed_rev = ?2
         WHERE name = ?1 AND tag_revision < ?2
           AND (removed_rev IS NULL OR removed_rev > ?2)",
        params![name, rev],
    )?;
    info!(tag = name, rev, removed, "tag deleted");
    Ok(())
}

/// Skip reason recorded for the deletion of tag `name`.
pub(crate) fn tag_deleted_reason(name: &str) -> String {
    format!("tag deleted: {name}")
}

/// Remember a revision that contributes no branch revision.
pub(crate) fn insert_skipped(conn: &Connection, rev: i64, reason: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO revtree_skipped (revision, reason) VALUES (?1, ?2)",
        params![rev, reason],
    )?;
    Ok(())
}

/// Delete every persisted row, keeping the schema.
pub(crate) fn clear_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "DELETE FROM revtree_branches;
         DELETE FROM revtree_revisions;
         DELETE FROM revtree_tags;
         DELETE FROM revtree_delivers;
         DELETE FROM revtree_brings;
         DELETE FROM revtree_skipped;",
    )?;
    info!("cleared revtree rows");
    Ok(())
}
