pub mod case_state;
pub mod db;
pub mod evaluation_state;
pub mod plan_state;

pub use db::ProctorDb;

pub use case_state::{CaseManager, CaseStatus, CaseUpdate, NewCase, ReportOutcome, TestCase};
pub use evaluation_state::{
    CompletionClaim, Evaluation, EvaluationManager, EvaluationStatus, NewEvaluationRow,
};
pub use plan_state::{PlanManager, PlanStatus, TestPlan};
