//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `user_version`
//! pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS revtree_branches (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            branch      TEXT    NOT NULL,
            name        TEXT    NOT NULL,
            date        TEXT,
            firstrev    INTEGER NOT NULL,
            lastrev     INTEGER NOT NULL,
            revisions   TEXT    NOT NULL,
            srcpath     TEXT,
            srcrev      INTEGER,
            terminalrev INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_revtree_branches_branch ON revtree_branches (branch);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_revtree_branches_open
            ON revtree_branches (branch) WHERE terminalrev IS NULL;

        CREATE TABLE IF NOT EXISTS revtree_revisions (
            revision    INTEGER PRIMARY KEY,
            branch      TEXT    NOT NULL,
            branch_name TEXT    NOT NULL,
            author      TEXT    NOT NULL DEFAULT '',
            date        TEXT    NOT NULL,
            last        INTEGER NOT NULL DEFAULT 0,
            clone       TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_revtree_revisions_branch ON revtree_revisions (branch);

        CREATE TABLE IF NOT EXISTS revtree_tags (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT    NOT NULL,
            prettyname   TEXT    NOT NULL,
            tag_revision INTEGER NOT NULL,
            branch       TEXT,
            revision     INTEGER,
            UNIQUE (name, tag_revision)
        );

        CREATE TABLE IF NOT EXISTS revtree_delivers (
            branch      TEXT    NOT NULL,
            revision    INTEGER NOT NULL,
            raw         TEXT    NOT NULL,
            UNIQUE (branch, revision)
        );

        CREATE TABLE IF NOT EXISTS revtree_brings (
            branch      TEXT    NOT NULL,
            revision    INTEGER NOT NULL,
            raw         TEXT    NOT NULL,
            UNIQUE (branch, revision)
        );
        "#,
    ),
    (
        2,
        "skipped revisions and tag removal",
        r#"
        CREATE TABLE IF NOT EXISTS revtree_skipped (
            revision    INTEGER PRIMARY KEY,
            reason      TEXT    NOT NULL DEFAULT ''
        );

        ALTER TABLE revtree_tags ADD COLUMN removed_rev INTEGER;
        CREATE INDEX IF NOT EXISTS idx_revtree_tags_name ON revtree_tags (name);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Drop every `revtree_*` table and reset the schema version marker.
pub fn drop_tables(conn: &Connection) -> Result<(), DatabaseError> {
    let tables: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'revtree\\_%' ESCAPE '\\'",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for table in &tables {
        warn!(table = %table, "dropping table");
        conn.execute_batch(&format!("DROP TABLE IF EXISTS \"{table}\";"))?;
    }
    set_schema_version(conn, 0)?;
    info!(dropped = tables.len(), "revtree tables dropped");
    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name LIKE 'revtree%' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(
            table_names(&conn),
            vec![
                "revtree_branches",
                "revtree_brings",
                "revtree_delivers",
                "revtree_revisions",
                "revtree_skipped",
                "revtree_tags",
            ]
        );
    }

    #[test]
    fn test_open_branch_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let insert = "INSERT INTO revtree_branches (branch, name, firstrev, lastrev, revisions, terminalrev)
                      VALUES ('trunk', 'trunk', 1, 1, '1', ?1)";
        conn.execute(insert, rusqlite::params![Some(1)]).unwrap();
        conn.execute(insert, rusqlite::params![None::<i64>]).unwrap();
        assert!(conn.execute(insert, rusqlite::params![None::<i64>]).is_err());
    }

    #[test]
    fn test_drop_tables_resets_version() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        drop_tables(&conn).unwrap();
        assert!(table_names(&conn).is_empty());
        assert_eq!(get_schema_version(&conn).unwrap(), 0);
        run_migrations(&conn).unwrap();
        assert_eq!(table_names(&conn).len(), 6);
    }
}
