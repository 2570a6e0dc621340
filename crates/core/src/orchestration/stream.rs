//! Bounded long-poll of one evaluation's status.
//!
//! Emits whenever the persisted status changes and ends after the first
//! terminal status, after `max_wait`, or after the first error.

use crate::state::{EvaluationManager, EvaluationStatus};
use futures::stream::{self, Stream};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

pub const EVALUATION_NOT_FOUND: &str = "Evaluation not found";
pub const UNEXPECTED_ERROR: &str = "Unexpected server error";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Status { status: EvaluationStatus },
    Error { message: String },
}

impl StreamEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Error { .. } => "error",
        }
    }

    /// SSE data line
    pub fn data(&self) -> String {
        match self {
            Self::Status { status } => status.as_str().to_string(),
            Self::Error { message } => message.clone(),
        }
    }
}

struct PollState {
    evaluations: EvaluationManager,
    evaluation_id: i64,
    poll_interval: Duration,
    deadline: Instant,
    last: Option<EvaluationStatus>,
    first_poll: bool,
    done: bool,
}

pub fn status_stream(
    evaluations: EvaluationManager,
    evaluation_id: i64,
    poll_interval: Duration,
    max_wait: Duration,
) -> impl Stream<Item = StreamEvent> + Send + 'static {
    let initial = PollState {
        evaluations,
        evaluation_id,
        poll_interval,
        deadline: Instant::now() + max_wait,
        last: None,
        first_poll: true,
        done: false,
    };

    stream::unfold(initial, |mut state| async move {
        if state.done {
            return None;
        }

        loop {
            if !state.first_poll {
                tokio::time::sleep(state.poll_interval).await;
                if Instant::now() >= state.deadline {
                    tracing::debug!(
                        "Status stream for evaluation {} timed out",
                        state.evaluation_id
                    );
                    return None;
                }
            }
            state.first_poll = false;

            let status = match state.evaluations.load(state.evaluation_id) {
                Ok(Some(evaluation)) => evaluation.status,
                Ok(None) => {
                    state.done = true;
                    let event = StreamEvent::Error {
                        message: EVALUATION_NOT_FOUND.to_string(),
                    };
                    return Some((event, state));
                }
                Err(e) => {
                    tracing::warn!(
                        "Status stream for evaluation {} failed: {:#}",
                        state.evaluation_id,
                        e
                    );
                    state.done = true;
                    let event = StreamEvent::Error {
                        message: UNEXPECTED_ERROR.to_string(),
                    };
                    return Some((event, state));
                }
            };

            if state.last == Some(status) {
                continue;
            }

            tracing::debug!(
                "Stream: evaluation {} status {:?} -> {}",
                state.evaluation_id,
                state.last,
                status
            );
            state.last = Some(status);
            state.done = status.is_terminal();
            return Some((StreamEvent::Status { status }, state));
        }
    })
}
