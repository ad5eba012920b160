//! Merge tracking: parsing `svn:mergeinfo` and deriving merge edges.

pub mod parser;
pub mod ranges;
pub mod resolver;

pub use parser::{parse_mergeinfo, MergeToken};
pub use ranges::RevisionSet;
pub use resolver::{MergeInfoResolver, DEFAULT_MERGEINFO_PROP};
