//! # Status Events
//!
//! Wire shape of lifecycle events pushed to live subscribers.

use crate::state::{Evaluation, EvaluationStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The only push channel the broadcaster serves
pub const CHANNEL_EVALUATION_STATUS: &str = "evaluation.status";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    Status,
    /// Sent once after a terminal status; nothing follows it
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: StatusEventKind,
    pub channel: String,
    pub evaluation_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<EvaluationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusEvent {
    pub fn status(
        evaluation_id: i64,
        status: EvaluationStatus,
        updated_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            kind: StatusEventKind::Status,
            channel: CHANNEL_EVALUATION_STATUS.to_string(),
            evaluation_id,
            status: Some(status),
            updated_at,
        }
    }

    pub fn close(evaluation_id: i64) -> Self {
        Self {
            kind: StatusEventKind::Close,
            channel: CHANNEL_EVALUATION_STATUS.to_string(),
            evaluation_id,
            status: None,
            updated_at: None,
        }
    }

    pub fn for_evaluation(evaluation: &Evaluation) -> Self {
        Self::status(
            evaluation.id,
            evaluation.status,
            Some(evaluation.updated_at),
        )
    }
}
