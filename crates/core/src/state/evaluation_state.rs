//! # Evaluation State
//!
//! Evaluation rows in the `evaluations` table. Status writes here are
//! `pub(crate)`: everything outside the crate goes through the state machine.

use super::db::{encode_json, lock, now, parse_json, parse_timestamp, ProctorDb};
use super::case_state::CaseStatus;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Lifecycle status of an evaluation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationStatus {
    Pending,
    Generating,
    Assigned,
    InProgress,
    Summarizing,
    Ready,
    Completed,
    Failed,
}

impl EvaluationStatus {
    /// Stable persisted value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Generating => "GENERATING",
            Self::Assigned => "ASSIGNED",
            Self::InProgress => "IN_PROGRESS",
            Self::Summarizing => "SUMMARIZING",
            Self::Ready => "READY",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// COMPLETED and FAILED end the lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "GENERATING" => Ok(Self::Generating),
            "ASSIGNED" => Ok(Self::Assigned),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "SUMMARIZING" => Ok(Self::Summarizing),
            "READY" => Ok(Self::Ready),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => anyhow::bail!("Unknown evaluation status: {}", other),
        }
    }
}

/// One end-to-end workflow instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Evaluation {
    pub id: i64,
    pub status: EvaluationStatus,
    /// cloud / local; opaque to the orchestrator
    pub execution_mode: String,
    #[serde(default)]
    pub assigned_executor: Option<String>,
    #[serde(default)]
    pub high_level_goal: Option<String>,
    #[serde(default)]
    pub results: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields needed to insert a new evaluation row
#[derive(Debug, Clone, Default)]
pub struct NewEvaluationRow {
    pub execution_mode: String,
    pub assigned_executor: Option<String>,
    pub high_level_goal: Option<String>,
}

/// Result of trying to claim the summarization of a plan
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionClaim {
    /// The plan (or its evaluation) no longer exists
    Missing,
    /// At least one sibling case is not COMPLETED/FAILED yet
    InProgress,
    /// Another caller already moved the evaluation on
    AlreadyFinalized(EvaluationStatus),
    /// This caller won; evaluation is now SUMMARIZING
    Claimed(Evaluation),
}

const SELECT_COLUMNS: &str = "id, status, execution_mode, assigned_executor, high_level_goal, results_json, created_at, updated_at";

/// Statuses from which the completion claim may not move an evaluation
const FINALIZED: [EvaluationStatus; 3] = [
    EvaluationStatus::Summarizing,
    EvaluationStatus::Completed,
    EvaluationStatus::Failed,
];

/// Manager for evaluation rows in SQLite
#[derive(Clone)]
pub struct EvaluationManager {
    conn: Arc<Mutex<Connection>>,
}

impl EvaluationManager {
    /// Create from shared ProctorDb connection
    pub fn new(db: &ProctorDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Insert an evaluation in GENERATING
    pub fn create(&self, row: &NewEvaluationRow) -> Result<Evaluation> {
        let conn = lock(&self.conn)?;
        let ts = now();

        conn.execute(
            r#"
            INSERT INTO evaluations (status, execution_mode, assigned_executor, high_level_goal, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5)
            "#,
            params![
                EvaluationStatus::Generating.as_str(),
                row.execution_mode,
                row.assigned_executor,
                row.high_level_goal,
                ts,
            ],
        )
        .context("Failed to create evaluation")?;

        let id = conn.last_insert_rowid();
        Self::load_with(&conn, id)?.context("Evaluation vanished after insert")
    }

    /// Load an evaluation by ID
    pub fn load(&self, id: i64) -> Result<Option<Evaluation>> {
        let conn = lock(&self.conn)?;
        Self::load_with(&conn, id)
    }

    /// Newest first
    pub fn list(&self, limit: usize, offset: usize) -> Result<Vec<Evaluation>> {
        let conn = lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluations ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2",
            SELECT_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![limit as i64, offset as i64], Self::row_to_evaluation)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list evaluations")?;

        rows.into_iter().map(|r| r.into_evaluation()).collect()
    }

    /// Oldest first, used by the recovery pass
    pub fn list_by_status(&self, status: EvaluationStatus) -> Result<Vec<Evaluation>> {
        let conn = lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM evaluations WHERE status = ?1 ORDER BY created_at, id",
            SELECT_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![status.as_str()], Self::row_to_evaluation)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list evaluations by status")?;

        rows.into_iter().map(|r| r.into_evaluation()).collect()
    }

    /// Unconditional status write
    pub(crate) fn set_status(
        &self,
        id: i64,
        status: EvaluationStatus,
    ) -> Result<Option<Evaluation>> {
        let conn = lock(&self.conn)?;

        let affected = conn.execute(
            "UPDATE evaluations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now(), id],
        )?;

        if affected == 0 {
            return Ok(None);
        }

        Self::load_with(&conn, id)
    }

    /// Status write that only applies when the current status is in `from`
    pub(crate) fn set_status_if(
        &self,
        id: i64,
        status: EvaluationStatus,
        from: &[EvaluationStatus],
    ) -> Result<Option<Evaluation>> {
        let conn = lock(&self.conn)?;

        let allowed = from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        let affected = conn.execute(
            &format!(
                "UPDATE evaluations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status IN ({})",
                allowed
            ),
            params![status.as_str(), now(), id],
        )?;

        if affected == 0 {
            return Ok(None);
        }

        Self::load_with(&conn, id)
    }

    /// Replace the opaque results payload
    pub(crate) fn set_results(
        &self,
        id: i64,
        results: &serde_json::Value,
    ) -> Result<Option<Evaluation>> {
        let conn = lock(&self.conn)?;

        let affected = conn.execute(
            "UPDATE evaluations SET results_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![encode_json(Some(results))?, now(), id],
        )?;

        if affected == 0 {
            return Ok(None);
        }

        Self::load_with(&conn, id)
    }

    /// Administrative override: status always, results only when given
    pub(crate) fn apply_override(
        &self,
        id: i64,
        status: EvaluationStatus,
        results: Option<&serde_json::Value>,
    ) -> Result<Option<Evaluation>> {
        let conn = lock(&self.conn)?;

        let affected = conn.execute(
            r#"
            UPDATE evaluations
            SET status = ?1, results_json = COALESCE(?2, results_json), updated_at = ?3
            WHERE id = ?4
            "#,
            params![status.as_str(), encode_json(results)?, now(), id],
        )?;

        if affected == 0 {
            return Ok(None);
        }

        Self::load_with(&conn, id)
    }

    /// Store the summary and move SUMMARIZING to COMPLETED in one write.
    /// Returns `None` if the evaluation left SUMMARIZING in the meantime.
    pub(crate) fn finish_summary(
        &self,
        id: i64,
        results: &serde_json::Value,
    ) -> Result<Option<Evaluation>> {
        let conn = lock(&self.conn)?;

        let affected = conn.execute(
            r#"
            UPDATE evaluations
            SET status = ?1, results_json = ?2, updated_at = ?3
            WHERE id = ?4 AND status = ?5
            "#,
            params![
                EvaluationStatus::Completed.as_str(),
                encode_json(Some(results))?,
                now(),
                id,
                EvaluationStatus::Summarizing.as_str(),
            ],
        )?;

        if affected == 0 {
            return Ok(None);
        }

        Self::load_with(&conn, id)
    }

    /// Read every sibling case of `plan_id` and, if all are terminal, move the
    /// owning evaluation to SUMMARIZING. Both happen inside one IMMEDIATE
    /// transaction so only one concurrent caller can win.
    pub(crate) fn claim_plan_completion(&self, plan_id: i64) -> Result<CompletionClaim> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let evaluation_id: Option<i64> = tx
            .query_row(
                "SELECT evaluation_id FROM test_plans WHERE id = ?1",
                params![plan_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(evaluation_id) = evaluation_id else {
            return Ok(CompletionClaim::Missing);
        };

        let statuses = {
            let mut stmt = tx.prepare("SELECT status FROM test_cases WHERE plan_id = ?1")?;
            let rows = stmt
                .query_map(params![plan_id], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        for raw in &statuses {
            let status: CaseStatus = raw.parse()?;
            if !status.is_terminal() {
                return Ok(CompletionClaim::InProgress);
            }
        }

        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM evaluations WHERE id = ?1",
                params![evaluation_id],
                |row| row.get(0),
            )
            .optional()?;

        let Some(current) = current else {
            return Ok(CompletionClaim::Missing);
        };
        let current: EvaluationStatus = current.parse()?;

        if FINALIZED.contains(&current) {
            return Ok(CompletionClaim::AlreadyFinalized(current));
        }

        tx.execute(
            "UPDATE evaluations SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![EvaluationStatus::Summarizing.as_str(), now(), evaluation_id],
        )?;

        let evaluation = Self::load_with(&tx, evaluation_id)?
            .context("Evaluation vanished during completion claim")?;

        tx.commit().context("Failed to commit completion claim")?;

        Ok(CompletionClaim::Claimed(evaluation))
    }

    pub(super) fn load_with(conn: &Connection, id: i64) -> Result<Option<Evaluation>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM evaluations WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                Self::row_to_evaluation,
            )
            .optional()
            .context("Failed to load evaluation")?;

        row.map(|r| r.into_evaluation()).transpose()
    }

    fn row_to_evaluation(row: &rusqlite::Row) -> rusqlite::Result<EvaluationRow> {
        Ok(EvaluationRow {
            id: row.get(0)?,
            status: row.get(1)?,
            execution_mode: row.get(2)?,
            assigned_executor: row.get(3)?,
            high_level_goal: row.get(4)?,
            results_json: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }
}

/// Raw column values; status decoding can fail so it happens outside rusqlite
struct EvaluationRow {
    id: i64,
    status: String,
    execution_mode: String,
    assigned_executor: Option<String>,
    high_level_goal: Option<String>,
    results_json: Option<String>,
    created_at: String,
    updated_at: String,
}

impl EvaluationRow {
    fn into_evaluation(self) -> Result<Evaluation> {
        Ok(Evaluation {
            id: self.id,
            status: self.status.parse()?,
            execution_mode: self.execution_mode,
            assigned_executor: self.assigned_executor,
            high_level_goal: self.high_level_goal,
            results: parse_json(self.results_json)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{CaseManager, CaseUpdate, NewCase, PlanManager};

    fn setup() -> (ProctorDb, EvaluationManager) {
        let db = ProctorDb::open_in_memory().unwrap();
        let mgr = EvaluationManager::new(&db);
        (db, mgr)
    }

    fn new_row(goal: &str) -> NewEvaluationRow {
        NewEvaluationRow {
            execution_mode: "cloud".to_string(),
            assigned_executor: None,
            high_level_goal: Some(goal.to_string()),
        }
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&EvaluationStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        assert_eq!(
            "SUMMARIZING".parse::<EvaluationStatus>().unwrap(),
            EvaluationStatus::Summarizing
        );
        assert!("summarizing".parse::<EvaluationStatus>().is_err());
    }

    #[test]
    fn test_create_starts_generating() {
        let (_db, mgr) = setup();
        let evaluation = mgr.create(&new_row("verify login")).unwrap();

        assert_eq!(evaluation.status, EvaluationStatus::Generating);
        assert_eq!(evaluation.high_level_goal.as_deref(), Some("verify login"));
        assert_eq!(mgr.load(evaluation.id).unwrap(), Some(evaluation));
    }

    #[test]
    fn test_set_status_if_respects_guard() {
        let (_db, mgr) = setup();
        let evaluation = mgr.create(&new_row("guarded")).unwrap();

        let skipped = mgr
            .set_status_if(
                evaluation.id,
                EvaluationStatus::Summarizing,
                &[EvaluationStatus::Completed],
            )
            .unwrap();
        assert!(skipped.is_none());

        let applied = mgr
            .set_status_if(
                evaluation.id,
                EvaluationStatus::Ready,
                &[EvaluationStatus::Generating],
            )
            .unwrap()
            .unwrap();
        assert_eq!(applied.status, EvaluationStatus::Ready);
    }

    #[test]
    fn test_list_by_status_and_newest_first() {
        let (_db, mgr) = setup();
        let first = mgr.create(&new_row("one")).unwrap();
        let second = mgr.create(&new_row("two")).unwrap();
        mgr.set_status(first.id, EvaluationStatus::Ready).unwrap();

        let generating = mgr.list_by_status(EvaluationStatus::Generating).unwrap();
        assert_eq!(generating.len(), 1);
        assert_eq!(generating[0].id, second.id);

        let listed = mgr.list(10, 0).unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[test]
    fn test_claim_plan_completion_only_once() {
        let (db, mgr) = setup();
        let plans = PlanManager::new(&db);
        let cases = CaseManager::new(&db);

        let evaluation = mgr.create(&new_row("claim")).unwrap();
        mgr.set_status(evaluation.id, EvaluationStatus::Ready).unwrap();
        let plan = plans.create(evaluation.id).unwrap();
        let inserted = cases
            .insert_batch(
                plan.id,
                evaluation.id,
                &[NewCase::named("a"), NewCase::named("b")],
            )
            .unwrap();

        cases
            .apply_update(inserted[0].id, &CaseUpdate::status(CaseStatus::Completed))
            .unwrap();
        assert_eq!(
            mgr.claim_plan_completion(plan.id).unwrap(),
            CompletionClaim::InProgress
        );

        cases
            .apply_update(inserted[1].id, &CaseUpdate::status(CaseStatus::Failed))
            .unwrap();
        match mgr.claim_plan_completion(plan.id).unwrap() {
            CompletionClaim::Claimed(e) => assert_eq!(e.status, EvaluationStatus::Summarizing),
            other => panic!("expected claim, got {:?}", other),
        }

        assert_eq!(
            mgr.claim_plan_completion(plan.id).unwrap(),
            CompletionClaim::AlreadyFinalized(EvaluationStatus::Summarizing)
        );
    }

    #[test]
    fn test_finish_summary_requires_summarizing() {
        let (_db, mgr) = setup();
        let evaluation = mgr.create(&new_row("summary")).unwrap();
        let results = serde_json::json!({"summary": "ok"});

        assert!(mgr.finish_summary(evaluation.id, &results).unwrap().is_none());

        mgr.set_status(evaluation.id, EvaluationStatus::Summarizing)
            .unwrap();
        let done = mgr.finish_summary(evaluation.id, &results).unwrap().unwrap();
        assert_eq!(done.status, EvaluationStatus::Completed);
        assert_eq!(done.results, Some(results));
    }

    #[test]
    fn test_apply_override_keeps_results_when_absent() {
        let (_db, mgr) = setup();
        let evaluation = mgr.create(&new_row("override")).unwrap();
        mgr.set_results(evaluation.id, &serde_json::json!({"summary": "s"}))
            .unwrap();

        let updated = mgr
            .apply_override(evaluation.id, EvaluationStatus::Failed, None)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, EvaluationStatus::Failed);
        assert_eq!(updated.results.unwrap()["summary"], "s");
    }

    #[test]
    fn test_claim_missing_plan() {
        let (_db, mgr) = setup();
        assert_eq!(
            mgr.claim_plan_completion(999).unwrap(),
            CompletionClaim::Missing
        );
    }
}
