//! Compiled branch/tag path pattern.
//!
//! The pattern is a regular expression exposing named groups:
//!
//! - `branch`: branch root path (required to recognize a branch)
//! - `branchname`: optional pretty alias of the branch
//! - `tag` / `tagname`: the same for tags
//! - `path`: optional trailing sub-path below the branch or tag root

use regex_lite::Regex;
use tracing::debug;

use crate::errors::ConfigError;

/// Pattern used when the configuration does not provide one.
pub const DEFAULT_BRANCH_RE: &str = r"^(?:(?P<branch>trunk|(?:branches|sandboxes|vendor)/(?P<branchname>[^/]+))|(?P<tag>tags/(?P<tagname>[^/]+)))(?:/(?P<path>.*))?$";

/// A validated path pattern.
#[derive(Debug, Clone)]
pub struct BranchPattern {
    re: Regex,
    has_tags: bool,
}

/// The parts of a path recognized by a [`BranchPattern`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatch {
    pub branch: Option<String>,
    pub branch_name: Option<String>,
    pub tag: Option<String>,
    pub tag_name: Option<String>,
    /// Trailing sub-path; empty when the path is the root itself.
    pub sub_path: String,
}

impl PathMatch {
    /// True when the matched path is a branch or tag root.
    pub fn is_root(&self) -> bool {
        self.sub_path.is_empty()
    }

    /// Display name of the branch: `branchname` if captured, else the id.
    pub fn pretty_branch(&self) -> Option<String> {
        self.branch_name.clone().or_else(|| self.branch.clone())
    }

    /// Display name of the tag: `tagname` if captured, else the tag id.
    pub fn pretty_tag(&self) -> Option<String> {
        self.tag_name.clone().or_else(|| self.tag.clone())
    }
}

impl BranchPattern {
    /// Compile and validate a pattern.
    ///
    /// Fails when the expression does not compile or declares neither a
    /// `branch` nor a `tag` group.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let re = Regex::new(pattern).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            detail: e.to_string(),
        })?;
        let names: Vec<&str> = re.capture_names().flatten().collect();
        let has_branches = names.contains(&"branch");
        let has_tags = names.contains(&"tag");
        if !has_branches && !has_tags {
            return Err(ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                detail: "missing 'branch' or 'tag' named group".into(),
            });
        }
        debug!(pattern, has_branches, has_tags, "compiled branch pattern");
        Ok(Self { re, has_tags })
    }

    pub fn as_str(&self) -> &str {
        self.re.as_str()
    }

    /// Whether the pattern can recognize tags at all.
    pub fn has_tags(&self) -> bool {
        self.has_tags
    }

    /// Match a (normalized) repository path.
    pub fn matches(&self, path: &str) -> Option<PathMatch> {
        let caps = self.re.captures(path)?;
        let group = |name: &str| {
            caps.name(name)
                .map(|m| m.as_str().to_string())
                .filter(|s| !s.is_empty())
        };
        Some(PathMatch {
            branch: group("branch"),
            branch_name: group("branchname"),
            tag: group("tag"),
            tag_name: group("tagname"),
            sub_path: group("path").unwrap_or_default(),
        })
    }

    /// Branch id of a path, if the path lies within a branch.
    pub fn branch_of(&self, path: &str) -> Option<String> {
        self.matches(path).and_then(|m| m.branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pattern_branches() {
        let p = BranchPattern::new(DEFAULT_BRANCH_RE).unwrap();
        let m = p.matches("trunk").unwrap();
        assert_eq!(m.branch.as_deref(), Some("trunk"));
        assert_eq!(m.pretty_branch().as_deref(), Some("trunk"));
        assert!(m.is_root());

        let m = p.matches("branches/foo/src/lib.rs").unwrap();
        assert_eq!(m.branch.as_deref(), Some("branches/foo"));
        assert_eq!(m.pretty_branch().as_deref(), Some("foo"));
        assert_eq!(m.sub_path, "src/lib.rs");
        assert!(!m.is_root());
    }

    #[test]
    fn test_default_pattern_tags() {
        let p = BranchPattern::new(DEFAULT_BRANCH_RE).unwrap();
        let m = p.matches("tags/v1.0").unwrap();
        assert_eq!(m.tag.as_deref(), Some("tags/v1.0"));
        assert_eq!(m.pretty_tag().as_deref(), Some("v1.0"));
        assert!(m.branch.is_none());
        assert!(p.has_tags());
    }

    #[test]
    fn test_unrelated_path_does_not_match() {
        let p = BranchPattern::new(DEFAULT_BRANCH_RE).unwrap();
        assert!(p.matches("README").is_none());
        assert!(p.branch_of("branches").is_none());
    }

    #[test]
    fn test_pattern_without_groups_is_rejected() {
        let err = BranchPattern::new(r"^(?P<other>.*)$").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
        let err = BranchPattern::new(r"^(unclosed").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { .. }));
    }

    #[test]
    fn test_branch_only_pattern() {
        let p = BranchPattern::new(r"^(?P<branch>trunk|branches/[^/]+)(?:/(?P<path>.*))?$").unwrap();
        assert!(!p.has_tags());
        assert_eq!(p.branch_of("branches/x/a").as_deref(), Some("branches/x"));
    }
}
