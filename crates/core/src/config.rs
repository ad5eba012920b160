//! TOML-based configuration for revtree.
//!
//! The repository password is never stored in the file: `password_env`
//! names an environment variable resolved at runtime via
//! [`RevtreeConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::builder::{DEFAULT_BRING_PROP, DEFAULT_DELIVER_PROP};
use crate::errors::ConfigError;
use crate::mergeinfo::DEFAULT_MERGEINFO_PROP;
use crate::pattern::{BranchPattern, DEFAULT_BRANCH_RE};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevtreeConfig {
    /// Source repository settings.
    pub repository: RepositoryConfig,

    /// Branch/tag detection and property names.
    #[serde(default)]
    pub graph: GraphConfig,

    /// Persisted store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Subversion repository connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Repository root URL (e.g. `file:///srv/svn/repo`).
    pub url: String,

    #[serde(default)]
    pub username: Option<String>,

    /// Environment variable holding the password.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Resolved password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Regular expression with `branch`/`branchname` and optional
    /// `tag`/`tagname` named groups.
    #[serde(default = "default_branch_re")]
    pub branch_re: String,

    #[serde(default = "default_bring_prop")]
    pub bring_prop: String,

    #[serde(default = "default_deliver_prop")]
    pub deliver_prop: String,

    #[serde(default = "default_mergeinfo_prop")]
    pub mergeinfo_prop: String,
}

fn default_branch_re() -> String {
    DEFAULT_BRANCH_RE.into()
}
fn default_bring_prop() -> String {
    DEFAULT_BRING_PROP.into()
}
fn default_deliver_prop() -> String {
    DEFAULT_DELIVER_PROP.into()
}
fn default_mergeinfo_prop() -> String {
    DEFAULT_MERGEINFO_PROP.into()
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            branch_re: default_branch_re(),
            bring_prop: default_bring_prop(),
            deliver_prop: default_deliver_prop(),
            mergeinfo_prop: default_mergeinfo_prop(),
        }
    }
}

impl GraphConfig {
    /// Compile the configured branch pattern.
    pub fn pattern(&self) -> Result<BranchPattern, ConfigError> {
        BranchPattern::new(&self.branch_re)
    }
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path (default `revtree.db`).
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("revtree.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl RevtreeConfig {
    /// Load a [`RevtreeConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: RevtreeConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve `password_env` into `password`.
    ///
    /// A missing variable logs a warning and leaves the password unset.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.repository.password_env {
            self.repository.password = resolve_optional_env(env_name, "repository.password_env");
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repository.url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repository.url".into(),
                detail: "repository URL must not be empty".into(),
            });
        }
        for (field, value) in [
            ("graph.bring_prop", &self.graph.bring_prop),
            ("graph.deliver_prop", &self.graph.deliver_prop),
            ("graph.mergeinfo_prop", &self.graph.mergeinfo_prop),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    detail: "property name must not be empty".into(),
                });
            }
        }
        self.graph.pattern()?;
        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
