//! Database schema and migrations.

use rusqlite::Connection;
use tracing::info;

use crate::error::{Result, StorageError};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(StorageError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version < SCHEMA_VERSION {
        info!(
            "Running migrations from version {} to {}",
            current_version, SCHEMA_VERSION
        );

        if current_version < 1 {
            migrate_v1(conn)?;
        }

        if current_version < 2 {
            migrate_v2(conn)?;
        }

        set_schema_version(conn, SCHEMA_VERSION)?;
        info!("Migrations complete");
    }

    Ok(())
}

fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Migration to version 1: domains, routing, mocks and settings.
fn migrate_v1(conn: &Connection) -> Result<()> {
    info!("Applying migration v1: Initial schema");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS domains (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            url TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    // Plain INTEGER PRIMARY KEY so new ids are max(id) + 1
    conn.execute(
        "CREATE TABLE IF NOT EXISTS local_routes (
            id INTEGER PRIMARY KEY,
            domain TEXT NOT NULL,
            target_host TEXT NOT NULL,
            target_port INTEGER NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_local_routes_domain ON local_routes (domain)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS api_mocks (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            host TEXT NOT NULL,
            path TEXT NOT NULL,
            method TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            response_body TEXT NOT NULL DEFAULT '',
            content_type TEXT NOT NULL DEFAULT 'application/json',
            enabled INTEGER NOT NULL DEFAULT 1
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS api_logging_links (
            domain_id INTEGER PRIMARY KEY REFERENCES domains (id) ON DELETE CASCADE,
            logging_enabled INTEGER NOT NULL DEFAULT 1,
            body_enabled INTEGER NOT NULL DEFAULT 0,
            schema_url TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    Ok(())
}

/// Migration to version 2: schema versions and regression test cases.
fn migrate_v2(conn: &Connection) -> Result<()> {
    info!("Applying migration v2: API schemas and test cases");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS api_schemas (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            domain_id INTEGER NOT NULL REFERENCES domains (id) ON DELETE CASCADE,
            version TEXT NOT NULL,
            spec TEXT NOT NULL,
            source TEXT NOT NULL,
            fetched_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_api_schemas_domain ON api_schemas (domain_id, fetched_at)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS api_test_cases (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            domain_id INTEGER NOT NULL REFERENCES domains (id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            method TEXT NOT NULL,
            url TEXT NOT NULL,
            headers TEXT NOT NULL DEFAULT '{}',
            body TEXT,
            expected_status INTEGER
        )",
        [],
    )?;

    Ok(())
}
