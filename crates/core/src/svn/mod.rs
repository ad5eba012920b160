//! SVN CLI backed source repository.

pub mod client;
pub mod parser;

pub use client::SvnClient;
pub use parser::SvnInfo;
