//! revtree command-line tool.
//!
//! Meant to be wired into Subversion repository hooks (`post-commit`,
//! `post-revprop-change`) and used by operators to rebuild, drop or inspect
//! the persisted branch graph.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use revtree_core::config::RevtreeConfig;
use revtree_core::db::Database;
use revtree_core::pattern::BranchPattern;
use revtree_core::snapshot::{GraphSnapshot, SnapshotOptions};
use revtree_core::svn::SvnClient;
use revtree_core::sync_engine::{SyncReport, Synchronizer};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Branch, tag and merge graph of a Subversion repository.
#[derive(Parser, Debug)]
#[command(
    name = "revtree",
    version,
    about = "Maintain and inspect the revtree branch graph of a Subversion repository"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "/etc/revtree/revtree.toml")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Persist a newly committed revision (and any holes before it).
    PostCommit {
        /// Committed revision.
        rev: i64,
    },

    /// Re-read the revision properties of a persisted revision.
    PostRevpropChange {
        /// Revision whose properties changed.
        rev: i64,
    },

    /// Drop the persisted graph and rebuild it from the whole history.
    Rebuild,

    /// Remove every revtree table.
    Drop,

    /// Print the branches, merges and tags of a revision window.
    Show {
        /// First revision of the window.
        #[arg(long)]
        from: Option<i64>,

        /// Last revision of the window.
        #[arg(long)]
        to: Option<i64>,

        /// Include deleted branches.
        #[arg(long)]
        all: bool,

        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Validate the configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli.config)?;
    init_logging(cli.log_level.as_deref().unwrap_or(&config.logging.level));

    match cli.command {
        Commands::Validate => cmd_validate(&cli.config, &config),
        Commands::PostCommit { rev } => {
            let rt = Runtime::open(&config)?;
            let report = rt
                .synchronizer(&config)
                .sync(Some((rev, rev)))
                .with_context(|| format!("failed to sync r{rev}"))?;
            print_report(&report);
            Ok(())
        }
        Commands::PostRevpropChange { rev } => {
            let rt = Runtime::open(&config)?;
            let updated = rt
                .synchronizer(&config)
                .resync(rev)
                .with_context(|| format!("failed to resync r{rev}"))?;
            if !updated {
                info!(rev, "revision is not part of the persisted graph");
            }
            Ok(())
        }
        Commands::Rebuild => {
            let rt = Runtime::open(&config)?;
            let report = rt.synchronizer(&config).sync(None).context("full rebuild failed")?;
            print_report(&report);
            Ok(())
        }
        Commands::Drop => {
            let rt = Runtime::open(&config)?;
            rt.synchronizer(&config)
                .drop_tables()
                .context("failed to drop tables")?;
            println!("All revtree tables dropped.");
            Ok(())
        }
        Commands::Show { from, to, all, json } => {
            let rt = Runtime::open(&config)?;
            cmd_show(&rt, &config, from, to, all, json)
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<RevtreeConfig> {
    let mut config = RevtreeConfig::load_from_file(path).context("failed to load configuration file")?;
    config
        .resolve_env_vars()
        .context("failed to resolve environment variables")?;
    Ok(config)
}

/// Database, repository client and branch pattern for commands that touch
/// the persisted graph.
struct Runtime {
    db: Database,
    repo: SvnClient,
    pattern: BranchPattern,
}

impl Runtime {
    fn open(config: &RevtreeConfig) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let pattern = config.graph.pattern().context("invalid branch pattern")?;
        let db = Database::new(&config.database.path).context("failed to open database")?;
        db.initialize().context("failed to initialize database")?;
        let repo = SvnClient::new(
            &config.repository.url,
            config.repository.username.clone(),
            config.repository.password.clone(),
        );
        Ok(Self { db, repo, pattern })
    }

    fn synchronizer(&self, config: &RevtreeConfig) -> Synchronizer<'_, SvnClient> {
        Synchronizer::new(&self.db, &self.repo, &self.pattern)
            .with_integration_props(&config.graph.deliver_prop, &config.graph.bring_prop)
    }
}

fn cmd_show(
    rt: &Runtime,
    config: &RevtreeConfig,
    from: Option<i64>,
    to: Option<i64>,
    all: bool,
    json: bool,
) -> Result<()> {
    let window = match (from, to) {
        (None, None) => None,
        (lo, hi) => {
            let known = rt.db.known_revisions().context("failed to read known revisions")?;
            let lo = lo.or_else(|| known.first().copied()).unwrap_or(0);
            let hi = hi.or_else(|| known.last().copied()).unwrap_or(lo);
            Some((lo, hi))
        }
    };
    let options = SnapshotOptions {
        window,
        include_deleted: all,
        mergeinfo_prop: config.graph.mergeinfo_prop.clone(),
    };
    let snapshot = GraphSnapshot::load(&rt.db, &rt.repo, &options).context("failed to load snapshot")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        print_snapshot(&snapshot);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "targets: {}, persisted: {}, skipped: {}, already present: {}, empty: {}, failed: {}",
        report.targets, report.persisted, report.skipped, report.already_present, report.empty, report.failed
    );
}

fn print_snapshot(snapshot: &GraphSnapshot) {
    let Some((lo, hi)) = snapshot.window else {
        println!("Nothing to render.");
        return;
    };
    println!("Window r{lo}:r{hi}");
    println!();
    println!("Branches:");
    for branch in &snapshot.branches {
        let source = branch
            .source
            .as_ref()
            .map_or_else(|| "-".to_string(), ToString::to_string);
        let terminal = branch
            .terminal_rev
            .map_or_else(String::new, |r| format!(" deleted@{r}"));
        println!(
            "  {:<30} {:<20} r{}-r{} ({} revisions) from {}{}",
            branch.path,
            branch.name,
            branch.first_rev().unwrap_or_default(),
            branch.last_rev().unwrap_or_default(),
            branch.revisions().len(),
            source,
            terminal
        );
    }
    println!();
    println!("Merges:");
    for merge in &snapshot.merges {
        println!("  {merge}");
    }
    println!();
    println!("Tags:");
    for tag in &snapshot.tags {
        let source = tag.source.as_ref().map_or_else(|| "-".to_string(), ToString::to_string);
        println!("  {:<30} r{} from {}", tag.pretty_name, tag.tag_revision, source);
    }
}

fn cmd_validate(config_path: &Path, config: &RevtreeConfig) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Repository URL : {}", config.repository.url);
    println!(
        "  Username       : {}",
        config.repository.username.as_deref().unwrap_or("(none)")
    );
    println!(
        "  Password       : {}",
        if config.repository.password.is_some() {
            "set"
        } else {
            "not set"
        }
    );
    println!("  Branch pattern : {}", config.graph.branch_re);
    println!("  Merge-info prop: {}", config.graph.mergeinfo_prop);
    println!("  Database       : {}", config.database.path.display());
    println!();
    println!("Configuration is valid.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(dir: &Path, url: &str) -> PathBuf {
        let db = dir.join("graph.db");
        let path = dir.join("revtree.toml");
        let contents = format!(
            "[repository]\nurl = \"{url}\"\n\n[database]\npath = \"{}\"\n",
            db.display()
        );
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn cli(config: PathBuf, command: Commands) -> Cli {
        Cli {
            config,
            log_level: Some("warn".into()),
            command,
        }
    }

    #[test]
    fn test_validate_does_not_open_database() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "file:///srv/svn/repo");

        run(cli(config, Commands::Validate)).unwrap();
        assert!(!tmp.path().join("graph.db").exists());
    }

    #[test]
    fn test_validate_reports_invalid_configuration() {
        let tmp = TempDir::new().unwrap();
        let config = write_config(tmp.path(), "");

        assert!(run(cli(config.clone(), Commands::Validate)).is_err());
        assert!(run(cli(config, Commands::Rebuild)).is_err());
        assert!(!tmp.path().join("graph.db").exists());
    }
}
