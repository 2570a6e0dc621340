//! Error types for the orchestrator's public entry points

/// Result type for orchestrator operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by [`crate::orchestration::Orchestrator`]
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Bad input; nothing was written
    #[error("{0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: i64 },

    /// The entity exists but is in the wrong status for the request
    #[error("{0}")]
    InvalidState(String),

    /// Plan generator or summarizer failure
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            OrchestratorError::not_found("Evaluation", 7).to_string(),
            "Evaluation not found: 7"
        );
        assert_eq!(
            OrchestratorError::validation("goal is required").to_string(),
            "goal is required"
        );

        let store: OrchestratorError = anyhow::anyhow!("disk full").into();
        assert!(matches!(store, OrchestratorError::Store(_)));
    }
}
