//! Parsers for SVN XML output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::SourceError;
use crate::models::{normalize_path, ChangeOp, ChangesetRecord, NodeKind, PathChange};
use crate::source::Properties;

/// Subset of `svn info --xml` used by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SvnInfo {
    pub root_url: String,
    pub url: String,
    pub kind: NodeKind,
    /// Revision the info was requested at (`<entry revision=...>`).
    pub revision: i64,
    /// Last changed revision (`<commit revision=...>`).
    pub last_changed_rev: i64,
}

pub fn parse_svn_info(xml: &str) -> Result<SvnInfo, SourceError> {
    debug!("parsing svn info XML ({} bytes)", xml.len());
    let url = extract_tag_content(xml, "url")
        .ok_or_else(|| SourceError::XmlParseError("missing <url> in svn info".into()))?;
    let root_url = extract_tag_content(xml, "root")
        .ok_or_else(|| SourceError::XmlParseError("missing <root> in svn info".into()))?;
    let revision = extract_attribute(xml, "entry", "revision")
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| SourceError::XmlParseError("missing revision in svn info".into()))?;
    let last_changed_rev = extract_attribute(xml, "commit", "revision")
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(revision);
    let kind = match extract_attribute(xml, "entry", "kind").as_deref() {
        Some("file") => NodeKind::File,
        _ => NodeKind::Dir,
    };
    Ok(SvnInfo {
        root_url,
        url,
        kind,
        revision,
        last_changed_rev,
    })
}

/// Parse `svn log --xml --verbose [--with-all-revprops]` output.
pub fn parse_svn_log(xml: &str) -> Result<Vec<ChangesetRecord>, SourceError> {
    debug!("parsing svn log XML ({} bytes)", xml.len());
    let mut entries = Vec::new();
    for part in xml.split("<logentry").skip(1) {
        let entry_xml = match part.find("</logentry>") {
            Some(pos) => &part[..pos],
            None => part,
        };
        let revision = match extract_attr_from_str(entry_xml, "revision")
            .and_then(|s| s.parse::<i64>().ok())
        {
            Some(rev) => rev,
            None => {
                warn!("skipping SVN log entry with missing or unparseable revision attribute");
                continue;
            }
        };
        let properties = match entry_xml.find("<revprops") {
            Some(pos) => parse_properties(&entry_xml[pos..]),
            None => Properties::new(),
        };
        // With --with-all-revprops the standard fields may only appear as properties
        let author = extract_tag_content(entry_xml, "author")
            .or_else(|| properties.get("svn:author").cloned())
            .unwrap_or_default();
        let date = extract_tag_content(entry_xml, "date")
            .or_else(|| properties.get("svn:date").cloned())
            .map(|d| parse_svn_date(&d))
            .unwrap_or_default();
        let message = extract_tag_content(entry_xml, "msg")
            .or_else(|| properties.get("svn:log").cloned())
            .unwrap_or_default();
        let changes = parse_changed_paths(entry_xml);
        entries.push(ChangesetRecord {
            revision,
            author,
            date,
            message,
            changes,
            properties,
        });
    }
    debug!(count = entries.len(), "parsed svn log entries");
    Ok(entries)
}

/// Parse `svn proplist --xml -v` output (first target only).
pub fn parse_svn_proplist(xml: &str) -> Properties {
    parse_properties(xml)
}

fn parse_properties(xml: &str) -> Properties {
    let mut props = Properties::new();
    for part in xml.split("<property").skip(1) {
        let Some(name) = extract_attr_from_str(part, "name") else {
            continue;
        };
        let value = match (part.find('>'), part.find("</property>")) {
            (Some(open), Some(close)) if open < close => xml_unescape(&part[open + 1..close]),
            _ => String::new(),
        };
        props.insert(name, value);
    }
    props
}

fn parse_svn_date(s: &str) -> DateTime<Utc> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(e) => {
            warn!(date = s, error = %e, "unparseable svn date");
            DateTime::<Utc>::default()
        }
    }
}

fn extract_tag_content(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut search_from = 0;
    while let Some(rel_pos) = xml[search_from..].find(&open) {
        let start_pos = search_from + rel_pos;
        let after_open = &xml[start_pos + open.len()..];
        // Next char must be '>' or whitespace, otherwise <urlencoded> matches <url>
        if let Some(ch) = after_open.chars().next() {
            if ch != '>' && !ch.is_ascii_whitespace() {
                search_from = start_pos + open.len();
                continue;
            }
        }
        let content_start = after_open.find('>')? + 1;
        let content = &after_open[content_start..];
        let end_pos = content.find(&close)?;
        return Some(xml_unescape(content[..end_pos].trim()));
    }
    None
}

/// Unescape standard XML entities.
fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn extract_attribute(xml: &str, tag: &str, attr: &str) -> Option<String> {
    let open = format!("<{} ", tag);
    let start_pos = xml.find(&open)?;
    let after_tag = &xml[start_pos + open.len()..];
    let tag_end = after_tag.find('>')?;
    extract_attr_from_str(&after_tag[..tag_end], attr)
}

fn extract_attr_from_str(s: &str, attr: &str) -> Option<String> {
    let head = match s.find('>') {
        Some(end) => &s[..end],
        None => s,
    };
    for quote in ['"', '\''] {
        let pattern = format!(" {}={}", attr, quote);
        let padded = format!(" {}", head);
        if let Some(pos) = padded.find(&pattern) {
            let after = &padded[pos + pattern.len()..];
            let end = after.find(quote)?;
            return Some(xml_unescape(&after[..end]));
        }
    }
    None
}

fn parse_changed_paths(entry_xml: &str) -> Vec<PathChange> {
    let mut paths = Vec::new();
    let paths_block = match entry_xml.find("<paths>") {
        Some(start) => {
            let rest = &entry_xml[start + "<paths>".len()..];
            match rest.find("</paths>") {
                Some(end) => &rest[..end],
                None => return paths,
            }
        }
        None => return paths,
    };
    for part in paths_block.split("<path").skip(1) {
        let fragment = match part.find("</path>") {
            Some(pos) => &part[..pos],
            None => continue,
        };
        let action = extract_attr_from_str(fragment, "action").unwrap_or_default();
        let kind = match extract_attr_from_str(fragment, "kind").as_deref() {
            Some("dir") => NodeKind::Dir,
            _ => NodeKind::File,
        };
        let base_path = extract_attr_from_str(fragment, "copyfrom-path").map(|p| normalize_path(&p));
        let base_rev = extract_attr_from_str(fragment, "copyfrom-rev")
            .and_then(|s| s.parse::<i64>().ok());
        let op = match (action.as_str(), base_path.is_some()) {
            ("A" | "R", true) => ChangeOp::Copy,
            ("A" | "R", false) => ChangeOp::Add,
            ("D", _) => ChangeOp::Delete,
            ("M", _) => ChangeOp::Modify,
            (other, _) => {
                warn!(action = other, "unknown svn path action, treating as modify");
                ChangeOp::Modify
            }
        };
        let path = match fragment.find('>') {
            Some(pos) => normalize_path(&xml_unescape(fragment[pos + 1..].trim())),
            None => String::new(),
        };
        paths.push(PathChange {
            path,
            kind,
            op,
            base_path,
            base_rev,
        });
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_svn_info() {
        let xml = r#"<info><entry kind="dir" path="foo" revision="1234">
<url>https://svn.example.com/repo/branches/foo</url>
<repository><root>https://svn.example.com/repo</root>
<uuid>a1b2c3d4</uuid></repository>
<commit revision="1200"></commit></entry></info>"#;
        let info = parse_svn_info(xml).unwrap();
        assert_eq!(info.revision, 1234);
        assert_eq!(info.last_changed_rev, 1200);
        assert_eq!(info.kind, NodeKind::Dir);
        assert_eq!(info.root_url, "https://svn.example.com/repo");
    }

    #[test]
    fn test_parse_svn_log_branch_copy() {
        let xml = r#"<log><logentry revision="200"><author>alice</author><date>2025-01-10T08:00:00.000000Z</date>
<paths><path action="A" kind="dir" copyfrom-path="/trunk" copyfrom-rev="199">/branches/feature</path></paths>
<msg>branch</msg></logentry></log>"#;
        let entries = parse_svn_log(xml).unwrap();
        assert_eq!(entries.len(), 1);
        let change = &entries[0].changes[0];
        assert_eq!(change.path, "branches/feature");
        assert_eq!(change.kind, NodeKind::Dir);
        assert_eq!(change.op, ChangeOp::Copy);
        assert_eq!(change.base_path.as_deref(), Some("trunk"));
        assert_eq!(change.base_rev, Some(199));
        assert_eq!(entries[0].date.to_rfc3339(), "2025-01-10T08:00:00+00:00");
    }

    #[test]
    fn test_parse_svn_log_actions() {
        let xml = r#"<log><logentry revision="7"><author>bob</author><date>2025-01-10T08:00:00Z</date>
<paths>
<path action="M" kind="file">/trunk/main.rs</path>
<path action="D" kind="dir">/branches/old</path>
<path action="R" kind="file">/trunk/lib.rs</path>
</paths><msg>mixed</msg></logentry></log>"#;
        let entries = parse_svn_log(xml).unwrap();
        let ops: Vec<ChangeOp> = entries[0].changes.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![ChangeOp::Modify, ChangeOp::Delete, ChangeOp::Add]);
    }

    #[test]
    fn test_parse_svn_log_revprops() {
        let xml = r#"<log><logentry revision="9"><author>bob</author><date>2025-01-10T08:00:00Z</date>
<paths><path action="M" kind="file">/trunk/a</path></paths>
<revprops><property name="svn:log">fix &amp; go</property><property name="rth:deliver">3,4</property></revprops>
</logentry></log>"#;
        let entries = parse_svn_log(xml).unwrap();
        assert_eq!(entries[0].prop("rth:deliver"), Some("3,4"));
        assert_eq!(entries[0].prop("svn:log"), Some("fix & go"));
    }

    #[test]
    fn test_parse_svn_log_skips_invalid_revision() {
        let xml = r#"<log>
<logentry><author>alice</author><date>2025-01-10T08:00:00Z</date><msg>no rev</msg></logentry>
<logentry revision="101"><author>bob</author><date>2025-01-11T08:00:00Z</date><msg>good</msg></logentry>
</log>"#;
        let entries = parse_svn_log(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].revision, 101);
        assert!(entries[0].changes.is_empty());
    }

    #[test]
    fn test_parse_svn_proplist() {
        let xml = r#"<?xml version="1.0"?>
<properties><target path="https://svn.example.com/repo/branches/foo">
<property name="svn:mergeinfo">/branches/bar:3-5
/trunk:1-9</property>
</target></properties>"#;
        let props = parse_svn_proplist(xml);
        assert_eq!(
            props.get("svn:mergeinfo").map(String::as_str),
            Some("/branches/bar:3-5\n/trunk:1-9")
        );
    }

    #[test]
    fn test_xml_unescape() {
        assert_eq!(xml_unescape("foo &amp; bar"), "foo & bar");
        assert_eq!(xml_unescape("a &lt; b &gt; c"), "a < b > c");
        assert_eq!(xml_unescape("&amp;lt;"), "&lt;");
    }

    #[test]
    fn test_extract_tag_content_no_prefix_match() {
        let xml = r#"<urlencoded>wrong</urlencoded><url>right</url>"#;
        assert_eq!(extract_tag_content(xml, "url"), Some("right".to_string()));
    }
}
