//! `svn:mergeinfo` property parsing.
//!
//! A property value is a newline-separated list of
//! `/source/path:range[,range...]` tokens where a range is `N` or `N-M`,
//! optionally followed by the non-inheritable marker `*`.

use tracing::warn;

use super::ranges::RevisionSet;

/// One line of a merge-info property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeToken {
    /// The line as written, used to compare against inherited tokens.
    pub raw: String,
    /// Source branch path without the leading separator.
    pub source: String,
    pub revisions: RevisionSet,
}

/// Parse a merge-info value; malformed lines are skipped with a warning.
pub fn parse_mergeinfo(value: &str) -> Vec<MergeToken> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match parse_token(line) {
            Some(token) => Some(token),
            None => {
                warn!(token = line, "skipping malformed mergeinfo token");
                None
            }
        })
        .collect()
}

fn parse_token(line: &str) -> Option<MergeToken> {
    let (path, ranges) = line.rsplit_once(':')?;
    let source = path.trim_start_matches('/');
    if source.is_empty() || ranges.is_empty() {
        return None;
    }
    let mut revisions = RevisionSet::new();
    for range in ranges.split(',') {
        let range = range.trim().trim_end_matches('*');
        let (lo, hi) = match range.split_once('-') {
            Some((lo, hi)) => (lo.parse::<i64>().ok()?, hi.parse::<i64>().ok()?),
            None => {
                let rev = range.parse::<i64>().ok()?;
                (rev, rev)
            }
        };
        if lo > hi || lo < 0 {
            return None;
        }
        revisions.insert(lo, hi);
    }
    Some(MergeToken {
        raw: line.to_string(),
        source: source.to_string(),
        revisions,
    })
}
