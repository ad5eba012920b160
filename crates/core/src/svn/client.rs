//! Synchronous SVN CLI client.

use std::process::{Command, Stdio};

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, instrument, warn};

use super::parser::{parse_svn_info, parse_svn_log, parse_svn_proplist, SvnInfo};
use crate::errors::SourceError;
use crate::models::{ChangeOp, ChangesetRecord};
use crate::source::{is_within, Node, NodeLocation, Properties, SourceRepository};

/// Client for reading an SVN repository through the `svn` command line.
///
/// `url` is the repository root; every path handed to the
/// [`SourceRepository`] methods is relative to it.
#[derive(Debug, Clone)]
pub struct SvnClient {
    url: String,
    username: Option<String>,
    password: Option<String>,
}

impl SvnClient {
    /// Create a new SVN client targeting `url` with optional credentials.
    pub fn new(url: impl Into<String>, username: Option<String>, password: Option<String>) -> Self {
        let client = Self {
            url: url.into().trim_end_matches('/').to_string(),
            username,
            password,
        };
        info!(url = %client.url, username = ?client.username, "created SvnClient");
        client
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    #[instrument(skip(self), fields(url = %self.url))]
    pub fn info(&self) -> Result<SvnInfo, SourceError> {
        let output = self.run_svn(&["info", "--xml", &self.url])?;
        parse_svn_info(&output)
    }

    /// `URL/path@rev`, with the peg revision pinning the node.
    fn target(&self, path: &str, rev: i64) -> String {
        if path.is_empty() {
            format!("{}@{}", self.url, rev)
        } else {
            format!("{}/{}@{}", self.url, path, rev)
        }
    }

    fn log_history(&self, path: &str, rev: i64, limit: Option<usize>) -> Result<Vec<ChangesetRecord>, SourceError> {
        let target = self.target(path, rev);
        let rev_range = format!("{}:0", rev);
        let limit_str = limit.map(|l| l.to_string());
        let mut args: Vec<&str> = vec!["log", "--xml", "--verbose", "-r", rev_range.as_str()];
        if let Some(limit) = limit_str.as_deref() {
            args.push("--limit");
            args.push(limit);
        }
        args.push(target.as_str());
        let output = self.run_svn(&args).map_err(|e| missing_node(e, path, rev))?;
        parse_svn_log(&output)
    }

    fn run_svn(&self, args: &[&str]) -> Result<String, SourceError> {
        let mut cmd = Command::new("svn");
        cmd.args(args).arg("--non-interactive").arg("--no-auth-cache");
        if let Some(username) = &self.username {
            cmd.arg("--username").arg(username);
        }
        if let Some(password) = &self.password {
            cmd.arg("--password").arg(password);
        }
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

        debug!(cmd = ?format!("svn {}", args.join(" ")), "running svn command");
        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::BinaryNotFound("svn".into())
            } else {
                SourceError::IoError(e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(exit_code, %stderr, "svn command failed");
            return Err(SourceError::CommandFailed { exit_code, stderr });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Map the "path not found" family of svn failures to `NoSuchNode`.
fn missing_node(err: SourceError, path: &str, rev: i64) -> SourceError {
    match err {
        SourceError::CommandFailed { ref stderr, .. }
            if stderr.contains("170000")
                || stderr.contains("160013")
                || stderr.contains("non-existent")
                || stderr.contains("not found") =>
        {
            SourceError::NoSuchNode {
                path: path.to_string(),
                rev,
            }
        }
        other => other,
    }
}

/// Walk a newest-first log of `path`, tracking renames and copies, and
/// return the successive locations of the node.
fn trace_locations(path: &str, entries: &[ChangesetRecord]) -> Vec<NodeLocation> {
    let mut locations = Vec::with_capacity(entries.len());
    let mut current = path.to_string();
    for entry in entries {
        locations.push(NodeLocation {
            path: current.clone(),
            rev: entry.revision,
        });
        let origin = entry
            .changes
            .iter()
            .filter(|c| is_within(&current, &c.path))
            .filter(|c| matches!(c.op, ChangeOp::Add | ChangeOp::Copy))
            .max_by_key(|c| c.path.len());
        if let Some(change) = origin {
            match (&change.base_path, change.op) {
                (Some(base), ChangeOp::Copy) => {
                    let suffix = &current[change.path.len()..];
                    current = format!("{base}{suffix}");
                }
                _ => break,
            }
        }
    }
    locations
}

fn svn_date(dt: &DateTime<Utc>) -> String {
    format!("{{{}}}", dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

impl SourceRepository for SvnClient {
    #[instrument(skip(self), fields(url = %self.url))]
    fn changeset(&self, rev: i64) -> Result<ChangesetRecord, SourceError> {
        let rev_str = rev.to_string();
        let output = self
            .run_svn(&["log", "--xml", "--verbose", "--with-all-revprops", "-r", &rev_str, &self.url])
            .map_err(|e| match e {
                SourceError::CommandFailed { ref stderr, .. } if stderr.contains("No such revision") => {
                    SourceError::RevisionNotFound(rev)
                }
                other => other,
            })?;
        parse_svn_log(&output)?
            .into_iter()
            .find(|cs| cs.revision == rev)
            .ok_or(SourceError::RevisionNotFound(rev))
    }

    #[instrument(skip(self), fields(url = %self.url))]
    fn node_properties(&self, path: &str, rev: i64) -> Result<Properties, SourceError> {
        let target = self.target(path, rev);
        let output = self
            .run_svn(&["proplist", "-v", "--xml", &target])
            .map_err(|e| missing_node(e, path, rev))?;
        Ok(parse_svn_proplist(&output))
    }

    #[instrument(skip(self), fields(url = %self.url))]
    fn node(&self, path: &str, rev: i64) -> Result<Node, SourceError> {
        let target = self.target(path, rev);
        let output = self
            .run_svn(&["info", "--xml", &target])
            .map_err(|e| missing_node(e, path, rev))?;
        let info = parse_svn_info(&output)?;
        Ok(Node {
            path: path.to_string(),
            kind: info.kind,
            rev: info.last_changed_rev,
        })
    }

    #[instrument(skip(self), fields(url = %self.url))]
    fn node_history(&self, path: &str, rev: i64) -> Result<Vec<NodeLocation>, SourceError> {
        let entries = self.log_history(path, rev, None)?;
        Ok(trace_locations(path, &entries))
    }

    #[instrument(skip(self), fields(url = %self.url))]
    fn previous_version(&self, path: &str, rev: i64) -> Result<Option<NodeLocation>, SourceError> {
        let entries = self.log_history(path, rev, Some(2))?;
        Ok(trace_locations(path, &entries).into_iter().nth(1))
    }

    fn oldest_revision(&self) -> Result<i64, SourceError> {
        Ok(if self.youngest_revision()? >= 1 { 1 } else { 0 })
    }

    fn youngest_revision(&self) -> Result<i64, SourceError> {
        let info = self.info()?;
        debug!(youngest = info.revision, "youngest revision");
        Ok(info.revision)
    }

    /// Revision 0 never holds changes, so history starts at 1.
    fn previous_revision(&self, rev: i64) -> Result<Option<i64>, SourceError> {
        Ok((rev > 1).then(|| rev - 1))
    }

    #[instrument(skip(self), fields(url = %self.url))]
    fn changesets_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ChangesetRecord>, SourceError> {
        let rev_range = format!("{}:{}", svn_date(&start), svn_date(&end));
        let output = self.run_svn(&[
            "log",
            "--xml",
            "--verbose",
            "--with-all-revprops",
            "-r",
            &rev_range,
            &self.url,
        ])?;
        // Date ranges include the revision in effect at `start`
        let entries: Vec<ChangesetRecord> = parse_svn_log(&output)?
            .into_iter()
            .filter(|cs| start <= cs.date && cs.date <= end)
            .collect();
        debug!(count = entries.len(), "changesets in time window");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeKind, PathChange};
    use chrono::TimeZone;

    fn entry(revision: i64, changes: Vec<PathChange>) -> ChangesetRecord {
        ChangesetRecord {
            revision,
            author: "alice".into(),
            date: Utc::now(),
            message: String::new(),
            changes,
            properties: Properties::new(),
        }
    }

    #[test]
    fn test_client_construction() {
        let client = SvnClient::new("https://svn.example.com/repo/", None, None);
        assert_eq!(client.url(), "https://svn.example.com/repo");
        assert_eq!(client.target("branches/foo", 12), "https://svn.example.com/repo/branches/foo@12");
        assert_eq!(client.target("", 3), "https://svn.example.com/repo@3");
    }

    #[test]
    fn test_trace_locations_follows_copy() {
        let entries = vec![
            entry(8, vec![PathChange::new("branches/foo/a", NodeKind::File, ChangeOp::Modify)]),
            entry(5, vec![PathChange::copy("branches/foo", NodeKind::Dir, "trunk", 4)]),
            entry(4, vec![PathChange::new("trunk/a", NodeKind::File, ChangeOp::Modify)]),
            entry(1, vec![PathChange::new("trunk", NodeKind::Dir, ChangeOp::Add)]),
        ];
        let locs = trace_locations("branches/foo", &entries);
        let flat: Vec<(&str, i64)> = locs.iter().map(|l| (l.path.as_str(), l.rev)).collect();
        assert_eq!(
            flat,
            vec![("branches/foo", 8), ("branches/foo", 5), ("trunk", 4), ("trunk", 1)]
        );
    }

    #[test]
    fn test_missing_node_mapping() {
        let err = SourceError::CommandFailed {
            exit_code: 1,
            stderr: "svn: E170000: URL 'x' non-existent in revision 3".into(),
        };
        assert!(matches!(missing_node(err, "x", 3), SourceError::NoSuchNode { .. }));

        let err = SourceError::CommandFailed {
            exit_code: 1,
            stderr: "svn: E215004: Authentication failed".into(),
        };
        assert!(matches!(missing_node(err, "x", 3), SourceError::CommandFailed { .. }));
    }

    #[test]
    fn test_svn_date_format() {
        let dt = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(svn_date(&dt), "{2024-03-01T12:30:00Z}");
    }
}
