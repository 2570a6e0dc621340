//! # Test Case State
//!
//! Case rows in `test_cases`, including the global dispatch claim.

use super::db::{encode_json, lock, now, parse_json, parse_timestamp, ProctorDb};
use super::evaluation_state::{Evaluation, EvaluationManager, EvaluationStatus};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

/// Status of a single test case
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseStatus {
    Pending,
    Assigned,
    InProgress,
    Completed,
    Failed,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Assigned => "ASSIGNED",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "ASSIGNED" => Ok(Self::Assigned),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => anyhow::bail!("Unknown test case status: {}", other),
        }
    }
}

/// One independently assignable unit of test work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub id: i64,
    pub plan_id: i64,
    pub evaluation_id: i64,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    pub status: CaseStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_order: Option<i64>,
    #[serde(default)]
    pub assigned_executor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert payload for a case
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewCase {
    pub name: String,
    pub description: Option<String>,
    pub input_data: Option<serde_json::Value>,
    pub execution_order: Option<i64>,
    /// Pre-hint only; the case stays PENDING
    pub assigned_executor: Option<String>,
}

impl NewCase {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Partial update; `None` leaves the column untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaseUpdate {
    #[serde(default)]
    pub status: Option<CaseStatus>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub assigned_executor: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_data: Option<serde_json::Value>,
    #[serde(default)]
    pub execution_order: Option<i64>,
}

impl CaseUpdate {
    pub fn status(status: CaseStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_executor(mut self, executor: impl Into<String>) -> Self {
        self.assigned_executor = Some(executor.into());
        self
    }
}

/// What an executor report did to a case and its evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ReportOutcome {
    /// No such case
    Missing,
    /// The evaluation is COMPLETED and late reports are dropped
    Ignored(TestCase),
    Updated(TestCase),
    /// The evaluation was COMPLETED and moved back to READY
    Reopened {
        case: TestCase,
        evaluation: Evaluation,
    },
}

const SELECT_COLUMNS: &str = "id, plan_id, evaluation_id, name, description, input_data_json, status, result_json, execution_order, assigned_executor, created_at, updated_at";

/// Manager for case rows in SQLite
#[derive(Clone)]
pub struct CaseManager {
    conn: Arc<Mutex<Connection>>,
}

impl CaseManager {
    pub fn new(db: &ProctorDb) -> Self {
        Self {
            conn: db.connection(),
        }
    }

    /// Insert every case of a plan in one transaction; nothing is written if
    /// any insert fails. `execution_order` defaults to the 1-based position.
    pub fn insert_batch(
        &self,
        plan_id: i64,
        evaluation_id: i64,
        cases: &[NewCase],
    ) -> Result<Vec<TestCase>> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ts = now();

        let mut ids = Vec::with_capacity(cases.len());
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO test_cases
                (plan_id, evaluation_id, name, description, input_data_json, status,
                 execution_order, assigned_executor, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                "#,
            )?;

            for (idx, case) in cases.iter().enumerate() {
                let order = case.execution_order.unwrap_or(idx as i64 + 1);
                stmt.execute(params![
                    plan_id,
                    evaluation_id,
                    case.name,
                    case.description,
                    encode_json(case.input_data.as_ref())?,
                    CaseStatus::Pending.as_str(),
                    order,
                    case.assigned_executor,
                    ts,
                ])
                .with_context(|| format!("Failed to insert test case '{}'", case.name))?;
                ids.push(tx.last_insert_rowid());
            }
        }

        let mut inserted = Vec::with_capacity(ids.len());
        for id in ids {
            inserted.push(Self::load_with(&tx, id)?.context("Case vanished after insert")?);
        }

        tx.commit().context("Failed to commit test cases")?;
        Ok(inserted)
    }

    pub fn load(&self, id: i64) -> Result<Option<TestCase>> {
        let conn = lock(&self.conn)?;
        Self::load_with(&conn, id)
    }

    /// Cases of a plan in execution order
    pub fn list_for_plan(&self, plan_id: i64) -> Result<Vec<TestCase>> {
        self.list_where("plan_id = ?1", plan_id)
    }

    /// Cases of an evaluation across all of its plans
    pub fn list_for_evaluation(&self, evaluation_id: i64) -> Result<Vec<TestCase>> {
        self.list_where("evaluation_id = ?1", evaluation_id)
    }

    pub fn count_for_plan(&self, plan_id: i64) -> Result<usize> {
        let conn = lock(&self.conn)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM test_cases WHERE plan_id = ?1",
            params![plan_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Claim the globally oldest PENDING case for `executor_id`.
    ///
    /// Order: evaluation creation time, then execution order (NULL last),
    /// then case id. Select and update are a single conditional statement, so
    /// two callers can never claim the same row.
    pub fn claim_next(&self, executor_id: &str) -> Result<Option<TestCase>> {
        let conn = lock(&self.conn)?;

        let claimed: Option<i64> = conn
            .query_row(
                r#"
                UPDATE test_cases
                SET status = ?1, assigned_executor = ?2, updated_at = ?3
                WHERE status = ?4
                  AND id = (
                      SELECT c.id FROM test_cases c
                      JOIN evaluations e ON e.id = c.evaluation_id
                      WHERE c.status = ?4
                      ORDER BY e.created_at, e.id,
                               c.execution_order IS NULL, c.execution_order,
                               c.id
                      LIMIT 1
                  )
                RETURNING id
                "#,
                params![
                    CaseStatus::Assigned.as_str(),
                    executor_id,
                    now(),
                    CaseStatus::Pending.as_str(),
                ],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to claim next test case")?;

        match claimed {
            Some(id) => Self::load_with(&conn, id),
            None => Ok(None),
        }
    }

    /// Apply the provided fields; returns `None` for an unknown case
    pub fn apply_update(&self, id: i64, update: &CaseUpdate) -> Result<Option<TestCase>> {
        let conn = lock(&self.conn)?;

        if Self::write_update(&conn, id, update)? == 0 {
            return Ok(None);
        }

        Self::load_with(&conn, id)
    }

    /// Apply an executor report. The evaluation status check, the case write
    /// and the COMPLETED -> READY reopen share one IMMEDIATE transaction, so a
    /// report can never land on a COMPLETED evaluation without reopening it
    /// (or being dropped when `reopen_completed` is false).
    pub(crate) fn apply_report(
        &self,
        id: i64,
        update: &CaseUpdate,
        reopen_completed: bool,
    ) -> Result<ReportOutcome> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(existing) = Self::load_with(&tx, id)? else {
            return Ok(ReportOutcome::Missing);
        };

        let evaluation_status: Option<String> = tx
            .query_row(
                "SELECT status FROM evaluations WHERE id = ?1",
                params![existing.evaluation_id],
                |row| row.get(0),
            )
            .optional()?;
        let completed = match evaluation_status {
            Some(raw) => raw.parse::<EvaluationStatus>()? == EvaluationStatus::Completed,
            None => false,
        };

        if completed && !reopen_completed {
            return Ok(ReportOutcome::Ignored(existing));
        }

        Self::write_update(&tx, id, update)?;
        let case = Self::load_with(&tx, id)?.context("Case vanished during report")?;

        let outcome = if completed {
            tx.execute(
                "UPDATE evaluations SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    EvaluationStatus::Ready.as_str(),
                    now(),
                    case.evaluation_id,
                    EvaluationStatus::Completed.as_str(),
                ],
            )?;
            let evaluation = EvaluationManager::load_with(&tx, case.evaluation_id)?
                .context("Evaluation vanished during report")?;
            ReportOutcome::Reopened { case, evaluation }
        } else {
            ReportOutcome::Updated(case)
        };

        tx.commit().context("Failed to commit case report")?;
        Ok(outcome)
    }

    fn write_update(conn: &Connection, id: i64, update: &CaseUpdate) -> Result<usize> {
        conn.execute(
            r#"
            UPDATE test_cases SET
                status = COALESCE(?1, status),
                result_json = COALESCE(?2, result_json),
                assigned_executor = COALESCE(?3, assigned_executor),
                name = COALESCE(?4, name),
                description = COALESCE(?5, description),
                input_data_json = COALESCE(?6, input_data_json),
                execution_order = COALESCE(?7, execution_order),
                updated_at = ?8
            WHERE id = ?9
            "#,
            params![
                update.status.map(|s| s.as_str()),
                encode_json(update.result.as_ref())?,
                update.assigned_executor,
                update.name,
                update.description,
                encode_json(update.input_data.as_ref())?,
                update.execution_order,
                now(),
                id,
            ],
        )
        .context("Failed to update test case")
    }

    fn list_where(&self, clause: &str, key: i64) -> Result<Vec<TestCase>> {
        let conn = lock(&self.conn)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM test_cases WHERE {} ORDER BY execution_order IS NULL, execution_order, id",
            SELECT_COLUMNS, clause
        ))?;

        let rows = stmt
            .query_map(params![key], Self::row_to_case)?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to list test cases")?;

        rows.into_iter().map(|r| r.into_case()).collect()
    }

    fn load_with(conn: &Connection, id: i64) -> Result<Option<TestCase>> {
        let row = conn
            .query_row(
                &format!("SELECT {} FROM test_cases WHERE id = ?1", SELECT_COLUMNS),
                params![id],
                Self::row_to_case,
            )
            .optional()
            .context("Failed to load test case")?;

        row.map(|r| r.into_case()).transpose()
    }

    fn row_to_case(row: &rusqlite::Row) -> rusqlite::Result<CaseRow> {
        Ok(CaseRow {
            id: row.get(0)?,
            plan_id: row.get(1)?,
            evaluation_id: row.get(2)?,
            name: row.get(3)?,
            description: row.get(4)?,
            input_data_json: row.get(5)?,
            status: row.get(6)?,
            result_json: row.get(7)?,
            execution_order: row.get(8)?,
            assigned_executor: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }
}

struct CaseRow {
    id: i64,
    plan_id: i64,
    evaluation_id: i64,
    name: String,
    description: Option<String>,
    input_data_json: Option<String>,
    status: String,
    result_json: Option<String>,
    execution_order: Option<i64>,
    assigned_executor: Option<String>,
    created_at: String,
    updated_at: String,
}

impl CaseRow {
    fn into_case(self) -> Result<TestCase> {
        Ok(TestCase {
            id: self.id,
            plan_id: self.plan_id,
            evaluation_id: self.evaluation_id,
            name: self.name,
            description: self.description,
            input_data: parse_json(self.input_data_json)?,
            status: self.status.parse()?,
            result: parse_json(self.result_json)?,
            execution_order: self.execution_order,
            assigned_executor: self.assigned_executor,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EvaluationManager, NewEvaluationRow, PlanManager};
    use std::collections::HashSet;

    struct Fixture {
        db: ProctorDb,
        cases: CaseManager,
    }

    impl Fixture {
        fn new() -> Self {
            let db = ProctorDb::open_in_memory().unwrap();
            let cases = CaseManager::new(&db);
            Self { db, cases }
        }

        /// Evaluation + plan with the given cases; returns (evaluation_id, plan_id)
        fn seed(&self, cases: &[NewCase]) -> (i64, i64) {
            let evaluation = EvaluationManager::new(&self.db)
                .create(&NewEvaluationRow {
                    execution_mode: "cloud".to_string(),
                    ..Default::default()
                })
                .unwrap();
            let plan = PlanManager::new(&self.db).create(evaluation.id).unwrap();
            self.cases
                .insert_batch(plan.id, evaluation.id, cases)
                .unwrap();
            (evaluation.id, plan.id)
        }
    }

    #[test]
    fn test_case_status_serialization() {
        let json = serde_json::to_string(&CaseStatus::InProgress).unwrap();
        assert_eq!(json, "\"IN_PROGRESS\"");
        assert!("DONE".parse::<CaseStatus>().is_err());
    }

    #[test]
    fn test_insert_batch_defaults_execution_order() {
        let fx = Fixture::new();
        let (_, plan_id) = fx.seed(&[
            NewCase::named("first"),
            NewCase {
                execution_order: Some(10),
                ..NewCase::named("second")
            },
            NewCase::named("third"),
        ]);

        let cases = fx.cases.list_for_plan(plan_id).unwrap();
        let orders: Vec<_> = cases.iter().map(|c| c.execution_order).collect();
        assert_eq!(orders, vec![Some(1), Some(3), Some(10)]);
        assert!(cases.iter().all(|c| c.status == CaseStatus::Pending));
        assert_eq!(fx.cases.count_for_plan(plan_id).unwrap(), 3);
    }

    #[test]
    fn test_claim_next_orders_across_evaluations() {
        let fx = Fixture::new();
        let (older, _) = fx.seed(&[
            NewCase {
                execution_order: Some(2),
                ..NewCase::named("older-b")
            },
            NewCase {
                execution_order: Some(1),
                ..NewCase::named("older-a")
            },
        ]);
        let (newer, _) = fx.seed(&[NewCase {
            execution_order: Some(0),
            ..NewCase::named("newer")
        }]);

        let first = fx.cases.claim_next("exec-1").unwrap().unwrap();
        assert_eq!(first.name, "older-a");
        assert_eq!(first.evaluation_id, older);
        assert_eq!(first.status, CaseStatus::Assigned);
        assert_eq!(first.assigned_executor.as_deref(), Some("exec-1"));

        let second = fx.cases.claim_next("exec-2").unwrap().unwrap();
        assert_eq!(second.name, "older-b");

        let third = fx.cases.claim_next("exec-1").unwrap().unwrap();
        assert_eq!(third.evaluation_id, newer);

        assert!(fx.cases.claim_next("exec-1").unwrap().is_none());
    }

    #[test]
    fn test_report_reopens_completed_evaluation_in_one_step() {
        let fx = Fixture::new();
        let (evaluation_id, plan_id) = fx.seed(&[NewCase::named("a")]);
        let case = fx.cases.list_for_plan(plan_id).unwrap().remove(0);
        let evaluations = EvaluationManager::new(&fx.db);
        evaluations
            .set_status(evaluation_id, EvaluationStatus::Completed)
            .unwrap();

        let update = CaseUpdate::status(CaseStatus::Failed);
        match fx.cases.apply_report(case.id, &update, true).unwrap() {
            ReportOutcome::Reopened { case, evaluation } => {
                assert_eq!(case.status, CaseStatus::Failed);
                assert_eq!(evaluation.status, EvaluationStatus::Ready);
            }
            other => panic!("expected reopen, got {:?}", other),
        }
        assert_eq!(
            evaluations.load(evaluation_id).unwrap().unwrap().status,
            EvaluationStatus::Ready
        );
    }

    #[test]
    fn test_report_on_completed_evaluation_can_be_dropped() {
        let fx = Fixture::new();
        let (evaluation_id, plan_id) = fx.seed(&[NewCase::named("a")]);
        let case = fx.cases.list_for_plan(plan_id).unwrap().remove(0);
        EvaluationManager::new(&fx.db)
            .set_status(evaluation_id, EvaluationStatus::Completed)
            .unwrap();

        let outcome = fx
            .cases
            .apply_report(case.id, &CaseUpdate::status(CaseStatus::Failed), false)
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Ignored(case.clone()));
        assert_eq!(fx.cases.load(case.id).unwrap(), Some(case));
    }

    #[test]
    fn test_report_missing_case() {
        let fx = Fixture::new();
        assert_eq!(
            fx.cases
                .apply_report(77, &CaseUpdate::status(CaseStatus::Completed), true)
                .unwrap(),
            ReportOutcome::Missing
        );
    }

    #[test]
    fn test_claim_next_ignores_non_pending() {
        let fx = Fixture::new();
        let (_, plan_id) = fx.seed(&[NewCase::named("a"), NewCase::named("b")]);
        let cases = fx.cases.list_for_plan(plan_id).unwrap();

        fx.cases
            .apply_update(cases[0].id, &CaseUpdate::status(CaseStatus::InProgress))
            .unwrap();

        let claimed = fx.cases.claim_next("exec").unwrap().unwrap();
        assert_eq!(claimed.id, cases[1].id);
        assert!(fx.cases.claim_next("exec").unwrap().is_none());
    }

    #[test]
    fn test_claim_next_never_double_assigns() {
        let fx = Fixture::new();
        let many: Vec<_> = (0..20).map(|i| NewCase::named(format!("c{}", i))).collect();
        fx.seed(&many);

        let cases = Arc::new(CaseManager::new(&fx.db));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let cases = Arc::clone(&cases);
                std::thread::spawn(move || {
                    let mut mine = Vec::new();
                    while let Some(case) = cases.claim_next(&format!("w{}", worker)).unwrap() {
                        mine.push(case.id);
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "case {} claimed twice", id);
            }
        }
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn test_apply_update_keeps_unset_fields() {
        let fx = Fixture::new();
        let (_, plan_id) = fx.seed(&[NewCase {
            description: Some("desc".to_string()),
            ..NewCase::named("case")
        }]);
        let case = &fx.cases.list_for_plan(plan_id).unwrap()[0];

        let updated = fx
            .cases
            .apply_update(
                case.id,
                &CaseUpdate::status(CaseStatus::Completed)
                    .with_result(serde_json::json!({"passed": true})),
            )
            .unwrap()
            .unwrap();

        assert_eq!(updated.status, CaseStatus::Completed);
        assert_eq!(updated.description.as_deref(), Some("desc"));
        assert_eq!(updated.result.unwrap()["passed"], true);
        assert!(fx.cases.apply_update(9999, &CaseUpdate::default()).unwrap().is_none());
    }
}
