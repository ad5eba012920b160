//! In-memory [`SourceRepository`] for fixtures and tests.
//!
//! Models just enough of Subversion's node semantics for graph building:
//! directory copies carry history, deletions end a node's life, and
//! versioned properties follow a node across copies.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::debug;

use super::{is_within, Node, NodeLocation, Properties, SourceRepository};
use crate::errors::SourceError;
use crate::models::{ChangeOp, ChangesetRecord, NodeKind, PathChange};

/// An append-only repository held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryRepository {
    changesets: BTreeMap<i64, ChangesetRecord>,
    /// `(path, rev) -> properties set on that node at that revision`.
    node_props: BTreeMap<String, BTreeMap<i64, Properties>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deterministic commit date: one minute per revision from 2020-01-01.
    pub fn date_of(rev: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_default()
            + Duration::minutes(rev)
    }

    /// Append a changeset as the next revision and return its number.
    pub fn commit(&mut self, author: &str, changes: Vec<PathChange>) -> i64 {
        let rev = self.changesets.keys().next_back().copied().unwrap_or(0) + 1;
        self.insert(ChangesetRecord {
            revision: rev,
            author: author.to_string(),
            date: Self::date_of(rev),
            message: String::new(),
            changes,
            properties: Properties::new(),
        });
        rev
    }

    /// Insert (or replace) a full changeset record.
    pub fn insert(&mut self, changeset: ChangesetRecord) {
        debug!(rev = changeset.revision, changes = changeset.changes.len(), "memory repository commit");
        self.changesets.insert(changeset.revision, changeset);
    }

    /// Set a revision property (`rth:deliver`, ...).
    pub fn set_revision_property(&mut self, rev: i64, name: &str, value: &str) {
        if let Some(cs) = self.changesets.get_mut(&rev) {
            cs.properties.insert(name.to_string(), value.to_string());
        }
    }

    /// Remove a revision property.
    pub fn delete_revision_property(&mut self, rev: i64, name: &str) {
        if let Some(cs) = self.changesets.get_mut(&rev) {
            cs.properties.remove(name);
        }
    }

    /// Set a versioned property on `path` as of `rev`.
    pub fn set_node_property(&mut self, path: &str, rev: i64, name: &str, value: &str) {
        self.node_props
            .entry(path.to_string())
            .or_default()
            .entry(rev)
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    /// Changes at or before `rev`, newest first.
    fn changes_down_from(&self, rev: i64) -> impl Iterator<Item = (i64, &PathChange)> {
        self.changesets
            .range(..=rev)
            .rev()
            .flat_map(|(r, cs)| cs.changes.iter().map(move |c| (*r, c)))
    }

    /// The most recent change relevant to `path` at or before `rev`.
    fn last_event(&self, path: &str, rev: i64) -> Option<(i64, &PathChange)> {
        self.changes_down_from(rev).find(|(_, c)| {
            is_within(&c.path, path)
                || (is_within(path, &c.path) && matches!(c.op, ChangeOp::Add | ChangeOp::Copy | ChangeOp::Delete))
        })
    }
}

impl SourceRepository for MemoryRepository {
    fn changeset(&self, rev: i64) -> Result<ChangesetRecord, SourceError> {
        self.changesets
            .get(&rev)
            .cloned()
            .ok_or(SourceError::RevisionNotFound(rev))
    }

    fn node_properties(&self, path: &str, rev: i64) -> Result<Properties, SourceError> {
        for loc in self.node_history(path, rev)? {
            let latest = self
                .node_props
                .get(&loc.path)
                .and_then(|by_rev| by_rev.range(..=loc.rev).next_back());
            if let Some((_, props)) = latest {
                return Ok(props.clone());
            }
        }
        Ok(Properties::new())
    }

    fn node(&self, path: &str, rev: i64) -> Result<Node, SourceError> {
        let no_such_node = || SourceError::NoSuchNode {
            path: path.to_string(),
            rev,
        };
        match self.last_event(path, rev) {
            Some((_, change)) if change.op == ChangeOp::Delete && is_within(path, &change.path) => {
                Err(no_such_node())
            }
            Some((r, change)) => {
                let kind = if change.path == path {
                    change.kind
                } else {
                    NodeKind::Dir
                };
                Ok(Node {
                    path: path.to_string(),
                    kind,
                    rev: r,
                })
            }
            None => Err(no_such_node()),
        }
    }

    fn node_history(&self, path: &str, rev: i64) -> Result<Vec<NodeLocation>, SourceError> {
        let mut history = Vec::new();
        let mut current = self.node(path, rev)?;
        let mut current_path = current.path.clone();
        let mut upper = current.rev;

        loop {
            let mut next = None;
            for (r, change) in self.changes_down_from(upper) {
                let touches_node = is_within(&change.path, &current_path);
                let creates_node = is_within(&current_path, &change.path)
                    && matches!(change.op, ChangeOp::Add | ChangeOp::Copy);
                if !touches_node && !creates_node {
                    continue;
                }
                if history.last().map(|l: &NodeLocation| l.rev) != Some(r) {
                    history.push(NodeLocation {
                        path: current_path.clone(),
                        rev: r,
                    });
                }
                if creates_node {
                    if let (ChangeOp::Copy, Some(base_path), Some(base_rev)) =
                        (change.op, &change.base_path, change.base_rev)
                    {
                        let suffix = &current_path[change.path.len()..];
                        next = Some((format!("{base_path}{suffix}"), base_rev, r));
                    }
                    break;
                }
            }
            match next {
                Some((src_path, src_rev, copied_at)) if src_rev < copied_at => {
                    current = match self.node(&src_path, src_rev) {
                        Ok(node) => node,
                        Err(_) => break,
                    };
                    current_path = src_path;
                    upper = current.rev;
                }
                _ => break,
            }
        }
        Ok(history)
    }

    fn oldest_revision(&self) -> Result<i64, SourceError> {
        self.changesets
            .keys()
            .next()
            .copied()
            .ok_or(SourceError::RevisionNotFound(0))
    }

    fn youngest_revision(&self) -> Result<i64, SourceError> {
        self.changesets
            .keys()
            .next_back()
            .copied()
            .ok_or(SourceError::RevisionNotFound(0))
    }

    fn previous_revision(&self, rev: i64) -> Result<Option<i64>, SourceError> {
        Ok(self.changesets.range(..rev).next_back().map(|(r, _)| *r))
    }

    fn changesets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ChangesetRecord>, SourceError> {
        Ok(self
            .changesets
            .values()
            .filter(|cs| start <= cs.date && cs.date <= end)
            .cloned()
            .collect())
    }
}
