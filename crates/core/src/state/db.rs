//! # Unified Proctor Database
//!
//! Single SQLite database holding every evaluation, plan, and test case.
//! Lives at `.proctor/proctor.db` unless configured otherwise.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Default on-disk location
pub const DEFAULT_DB_PATH: &str = ".proctor/proctor.db";

/// Shared database handle. Managers borrow the connection from here.
pub struct ProctorDb {
    conn: Arc<Mutex<Connection>>,
}

impl ProctorDb {
    /// Open or create the database at `.proctor/proctor.db`
    pub fn open() -> Result<Self> {
        Self::open_at(DEFAULT_DB_PATH)
    }

    /// Open database at a specific path
    pub fn open_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }

        let conn = Connection::open(path.as_ref()).context("Failed to open proctor database")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database (tests, dry runs)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.run_migrations()?;

        Ok(db)
    }

    /// Get a shared connection for use by the managers
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// Run schema migrations
    fn run_migrations(&self) -> Result<()> {
        let conn = lock(&self.conn)?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            Self::migrate_v1(&conn)?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
                [1],
            )?;
        }

        Ok(())
    }

    /// Migration to version 1 - evaluations, plans, cases
    fn migrate_v1(conn: &Connection) -> Result<()> {
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS evaluations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL DEFAULT 'GENERATING',
                execution_mode TEXT NOT NULL DEFAULT 'cloud',
                assigned_executor TEXT,
                high_level_goal TEXT,
                results_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS test_plans (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                evaluation_id INTEGER NOT NULL REFERENCES evaluations(id),
                status TEXT NOT NULL DEFAULT 'PENDING',
                summary_json TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS test_cases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                plan_id INTEGER NOT NULL REFERENCES test_plans(id),
                evaluation_id INTEGER NOT NULL REFERENCES evaluations(id),
                name TEXT NOT NULL,
                description TEXT,
                input_data_json TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                result_json TEXT,
                execution_order INTEGER,
                assigned_executor TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_evaluations_status ON evaluations(status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_plans_evaluation ON test_plans(evaluation_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cases_plan ON test_cases(plan_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cases_status ON test_cases(status)",
            [],
        )?;

        tracing::info!(
            "ProctorDb initialized with schema version {}",
            SCHEMA_VERSION
        );

        Ok(())
    }
}

/// Lock the shared connection, mapping poison into an error
pub(crate) fn lock(conn: &Arc<Mutex<Connection>>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| anyhow::anyhow!("Lock error: {}", e))
}

/// Fixed-width RFC 3339 so lexical order is chronological order
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> String {
    timestamp(Utc::now())
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Corrupt timestamp column: {:?}", raw))
}

/// Decode an optional JSON column
pub(crate) fn parse_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|s| serde_json::from_str(&s))
        .transpose()
        .context("Corrupt JSON column")
}

pub(crate) fn encode_json(value: Option<&serde_json::Value>) -> Result<Option<String>> {
    value
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to encode JSON column")
}
