//! # Test Plan State
//!
//! Plan rows in `test_plans`. An evaluation may accumulate several plans over
//! time; the earliest-created one is the active plan.

use super::db::{encode_json, lock, now, parse_json, parse_timestamp, ProctorDb};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Status of a generated plan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Pending,
    Generating,
    Ready,
    Completed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Generating => "GENERATING",
            Self::Ready => "READY",
            Self::Completed => "COMPLETED",
        }
    }
}

impl FromStr for PlanStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "GENERATING" => Ok(Self::Generating),
            "READY" => Ok(Self::Ready),
            "COMPLETED" => Ok(Self::Completed),
            other => anyhow::bail!("Unknown plan status: {}", other),
        }
    }
}

/// Generated outline of what to test
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestPlan {
    pub id: i64,
    pub evaluation_id: i64,
    pub status: PlanStatus,
    /// Opaque structured draft from the plan generator
    #[serde(default)]
    pub summary: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

const SELECT_COLUMNS: &str = "id, evaluation_id, status, summary_json, created_at, updated_at";

/// Manager for plan rows in SQLite
#[derive(Clone)]
pub struct PlanManager {
    conn: Arc<Mutex<Connection>>,
}

impl PlanManager {
    pub fn new(db: &ProctorDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Insert a plan in GENERATING for `evaluation_id`
    pub fn create(&self, evaluation_id: i64) -> Result<TestPlan> {
        let conn = lock(&self.conn)?;
        let ts = now();

        conn.execute(
            r#"
            INSERT INTO test_plans (evaluation_id, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?3)
            "#,
            params![evaluation_id, PlanStatus::Generating.as_str(), ts],
        )
        .context("Failed to create test plan")?;

        let id = conn.last_insert_rowid();
        Self::load_with(&conn, id)?.context("Plan vanished after insert")
    }

    /// Store the generated summary and flip the plan to READY
    pub fn mark_ready(&self, id: i64, summary: &serde_json::Value) -> Result<TestPlan> {
        let conn = lock(&self.conn)?;

        let affected = conn.execute(
            "UPDATE test_plans SET status = ?1, summary_json = ?2, updated_at = ?3 WHERE id = ?4",
            params![
                PlanStatus::Ready.as_str(),
                encode_json(Some(summary))?,
                now(),
                id
            ],
        )?;

        if affected == 0 {
            anyhow::bail!("Plan not found: {}", id);
        }

        Self::load_with(&conn, id)?.context("Plan vanished after update")
    }

    pub fn load(&self, id: i64) -> Result<Option<TestPlan>> {
        let conn = lock(&self.conn)?;
        Self::load_with(&conn, id)
    }

    /// Earliest-created plan of the evaluation. The coordinator and the
    /// recovery pass both resolve plans through here.
    pub fn active_for(&self, evaluation_id: i64) -> Result<Option<TestPlan>> {
        let conn = lock(&self.conn)?;

        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM test_plans WHERE evaluation_id = ?1 ORDER BY created_at, id LIMIT 1",
                    SELECT_COLUMNS
                ),
                params![evaluation_id],
                Self::row_to_plan,
            )
            .optional()
            .context("Failed to resolve active plan")?;

        row.map(|r| r.into_plan()).transpose()
    }

    /// All plans of an evaluation, oldest first
    pub fn list_for_evaluation(&self, evaluation_id: i64) -> Result<Vec<TestPlan>> {
        let conn = lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_plans WHERE evaluation_id = ?1 ORDER BY created_at, id",
            SELECT_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![evaluation_id], Self::row_to_plan)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list plans")?;

        rows.into_iter().map(|r| r.into_plan()).collect()
    }

    fn load_with(conn: &Connection, id: i64) -> Result<Option<TestPlan>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM test_plans WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                Self::row_to_plan,
            )
            .optional()
            .context("Failed to load plan")?;

        row.map(|r| r.into_plan()).transpose()
    }

    fn row_to_plan(row: &rusqlite::Row) -> rusqlite::Result<PlanRow> {
        Ok(PlanRow {
            id: row.get(0)?,
            evaluation_id: row.get(1)?,
            status: row.get(2)?,
            summary_json: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }
}

struct PlanRow {
    id: i64,
    evaluation_id: i64,
    status: String,
    summary_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl PlanRow {
    fn into_plan(self) -> Result<TestPlan> {
        Ok(TestPlan {
            id: self.id,
            evaluation_id: self.evaluation_id,
            status: self.status.parse()?,
            summary: parse_json(self.summary_json)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}
