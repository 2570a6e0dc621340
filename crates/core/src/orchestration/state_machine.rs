//! # Evaluation State Machine
//!
//! The single writer of `Evaluation.status`. Every write commits first and
//! is then published, so a reader of the store never sees a status that has
//! not been (or is not about to be) broadcast.

use super::broadcaster::StatusBroadcaster;
use crate::state::{Evaluation, EvaluationManager, EvaluationStatus};
use anyhow::Result;
use std::sync::Arc;

pub struct EvaluationStateMachine {
    evaluations: EvaluationManager,
    broadcaster: Arc<StatusBroadcaster>,
}

impl EvaluationStateMachine {
    pub fn new(evaluations: EvaluationManager, broadcaster: Arc<StatusBroadcaster>) -> Self {
        Self {
            evaluations,
            broadcaster,
        }
    }

    pub fn broadcaster(&self) -> &Arc<StatusBroadcaster> {
        &self.broadcaster
    }

    /// Unconditional transition. `None` if the evaluation does not exist.
    pub async fn transition(
        &self,
        evaluation_id: i64,
        status: EvaluationStatus,
    ) -> Result<Option<Evaluation>> {
        let updated = self.evaluations.set_status(evaluation_id, status)?;
        self.after_write(updated).await
    }

    /// Transition only from one of `from`; `None` when the guard did not hold
    pub async fn transition_if(
        &self,
        evaluation_id: i64,
        status: EvaluationStatus,
        from: &[EvaluationStatus],
    ) -> Result<Option<Evaluation>> {
        let updated = self.evaluations.set_status_if(evaluation_id, status, from)?;
        self.after_write(updated).await
    }

    /// Administrative status write, optionally replacing results
    pub async fn override_status(
        &self,
        evaluation_id: i64,
        status: EvaluationStatus,
        results: Option<&serde_json::Value>,
    ) -> Result<Option<Evaluation>> {
        let updated = self
            .evaluations
            .apply_override(evaluation_id, status, results)?;
        self.after_write(updated).await
    }

    /// SUMMARIZING -> COMPLETED together with the results payload
    pub async fn complete_with_results(
        &self,
        evaluation_id: i64,
        results: &serde_json::Value,
    ) -> Result<Option<Evaluation>> {
        let updated = self.evaluations.finish_summary(evaluation_id, results)?;
        self.after_write(updated).await
    }

    /// Publish a transition that was committed elsewhere (the completion
    /// claim writes inside its own transaction)
    pub async fn announce(&self, evaluation: &Evaluation) {
        self.broadcaster.publish_evaluation(evaluation).await;
    }

    async fn after_write(&self, updated: Option<Evaluation>) -> Result<Option<Evaluation>> {
        if let Some(evaluation) = &updated {
            tracing::info!(
                "Evaluation {} is now {}",
                evaluation.id,
                evaluation.status
            );
            self.broadcaster.publish_evaluation(evaluation).await;
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NewEvaluationRow, ProctorDb};
    use crate::test_support::RecordingSink;

    fn setup() -> (EvaluationStateMachine, EvaluationManager, Arc<StatusBroadcaster>) {
        let db = ProctorDb::open_in_memory().unwrap();
        let evaluations = EvaluationManager::new(&db);
        let broadcaster = Arc::new(StatusBroadcaster::new());
        (
            EvaluationStateMachine::new(evaluations.clone(), Arc::clone(&broadcaster)),
            evaluations,
            broadcaster,
        )
    }

    #[tokio::test]
    async fn test_transition_persists_then_publishes() {
        let (machine, evaluations, broadcaster) = setup();
        let evaluation = evaluations.create(&NewEvaluationRow::default()).unwrap();
        let sink = RecordingSink::new();
        broadcaster.subscribe(sink.clone(), evaluation.id).await;

        let ready = machine
            .transition(evaluation.id, EvaluationStatus::Ready)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(
            evaluations.load(evaluation.id).unwrap().unwrap().status,
            EvaluationStatus::Ready
        );
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, Some(EvaluationStatus::Ready));
        assert_eq!(events[0].updated_at, Some(ready.updated_at));
    }

    #[tokio::test]
    async fn test_guarded_transition_skips_publish() {
        let (machine, evaluations, broadcaster) = setup();
        let evaluation = evaluations.create(&NewEvaluationRow::default()).unwrap();
        let sink = RecordingSink::new();
        broadcaster.subscribe(sink.clone(), evaluation.id).await;

        let skipped = machine
            .transition_if(
                evaluation.id,
                EvaluationStatus::Ready,
                &[EvaluationStatus::Completed],
            )
            .await
            .unwrap();

        assert!(skipped.is_none());
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_missing_evaluation() {
        let (machine, _, _) = setup();
        assert!(machine
            .transition(404, EvaluationStatus::Failed)
            .await
            .unwrap()
            .is_none());
    }
}
