//! # Task Supervisor
//!
//! Detached units of work (bootstrap, summarization) run here instead of a
//! bare `tokio::spawn`. Every task ends in a recorded [`TaskOutcome`], and
//! panics are caught and recorded as failures.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};

/// Upper bound on retained outcomes
const HISTORY_LIMIT: usize = 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Bootstrap,
    Summarize,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bootstrap => f.write_str("bootstrap"),
            Self::Summarize => f.write_str("summarize"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub kind: TaskKind,
    pub evaluation_id: i64,
    pub succeeded: bool,
    #[serde(default)]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

pub struct TaskSupervisor {
    in_flight: Arc<watch::Sender<usize>>,
    history: Arc<Mutex<VecDeque<TaskOutcome>>>,
    outcome_tx: broadcast::Sender<TaskOutcome>,
}

impl Default for TaskSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSupervisor {
    pub fn new() -> Self {
        let (in_flight, _) = watch::channel(0usize);
        let (outcome_tx, _) = broadcast::channel(256);
        Self {
            in_flight: Arc::new(in_flight),
            history: Arc::new(Mutex::new(VecDeque::new())),
            outcome_tx,
        }
    }

    /// Run `task` detached. Must be called from within a tokio runtime.
    pub fn spawn<F>(&self, kind: TaskKind, evaluation_id: i64, task: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let in_flight = Arc::clone(&self.in_flight);
        let history = Arc::clone(&self.history);
        let outcome_tx = self.outcome_tx.clone();

        in_flight.send_modify(|n| *n += 1);
        tracing::debug!("Spawned {} task for evaluation {}", kind, evaluation_id);

        tokio::spawn(async move {
            let error = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(format!("{:#}", e)),
                Err(_) => Some("task panicked".to_string()),
            };

            match &error {
                None => tracing::info!("{} task for evaluation {} finished", kind, evaluation_id),
                Some(e) => tracing::error!(
                    "{} task for evaluation {} failed: {}",
                    kind,
                    evaluation_id,
                    e
                ),
            }

            let outcome = TaskOutcome {
                kind,
                evaluation_id,
                succeeded: error.is_none(),
                error,
                finished_at: Utc::now(),
            };

            if let Ok(mut history) = history.lock() {
                if history.len() >= HISTORY_LIMIT {
                    history.pop_front();
                }
                history.push_back(outcome.clone());
            }
            let _ = outcome_tx.send(outcome);

            in_flight.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.borrow()
    }

    /// Resolves once no task is running, including tasks spawned by tasks
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn outcomes(&self) -> Vec<TaskOutcome> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskOutcome> {
        self.outcome_tx.subscribe()
    }
}
