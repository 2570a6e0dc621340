//! # Startup Recovery
//!
//! Resumes work interrupted by a restart: evaluations stuck in SUMMARIZING
//! are summarized again (or completed with an error when they have no plan), evaluations stuck in GENERATING are bootstrapped
//! again. Both passes are idempotent and one failure never stops the pass.

use super::coordinator::OrchestrationCoordinator;
use super::summary::SummaryRunner;
use crate::state::{EvaluationManager, EvaluationStatus};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;

/// Counts from one recovery run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub summaries_resumed: usize,
    pub summaries_failed: usize,
    pub generations_resumed: usize,
    pub generations_failed: usize,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

pub struct RecoveryScanner {
    evaluations: EvaluationManager,
    summaries: Arc<SummaryRunner>,
    coordinator: Arc<OrchestrationCoordinator>,
}

impl RecoveryScanner {
    pub fn new(
        evaluations: EvaluationManager,
        summaries: Arc<SummaryRunner>,
        coordinator: Arc<OrchestrationCoordinator>,
    ) -> Self {
        Self {
            evaluations,
            summaries,
            coordinator,
        }
    }

    /// Summaries first, then generations. Runs inline; callers start
    /// serving requests after it returns.
    pub async fn run_on_startup(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.resume_summaries(&mut report).await?;
        self.resume_generations(&mut report).await?;

        if report.is_empty() {
            tracing::debug!("Nothing to recover");
        } else {
            tracing::info!("Recovery finished: {:?}", report);
        }
        Ok(report)
    }

    /// Every SUMMARIZING evaluation is finished, including ones without a
    /// plan, which complete with `summary_error`
    async fn resume_summaries(&self, report: &mut RecoveryReport) -> Result<()> {
        let stuck = self.evaluations.list_by_status(EvaluationStatus::Summarizing)?;
        if stuck.is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Resuming summarization for {} evaluation(s) on startup",
            stuck.len()
        );

        for evaluation in stuck {
            match self.summaries.run_active(evaluation.id).await {
                Ok(_) => report.summaries_resumed += 1,
                Err(e) => {
                    report.summaries_failed += 1;
                    tracing::error!(
                        "Failed to resume summarization for evaluation {}: {:#}",
                        evaluation.id,
                        e
                    );
                }
            }
        }
        Ok(())
    }

    async fn resume_generations(&self, report: &mut RecoveryReport) -> Result<()> {
        let stuck = self.evaluations.list_by_status(EvaluationStatus::Generating)?;
        if stuck.is_empty() {
            return Ok(());
        }

        tracing::info!(
            "Resuming plan generation for {} evaluation(s) on startup",
            stuck.len()
        );

        for evaluation in stuck {
            // Candidate list is not persisted; the primary executor is all we have
            let candidates: Vec<String> = evaluation.assigned_executor.iter().cloned().collect();
            match self.coordinator.bootstrap(evaluation.id, &candidates).await {
                Ok(()) => report.generations_resumed += 1,
                Err(_) => report.generations_failed += 1,
            }
        }
        Ok(())
    }
}
