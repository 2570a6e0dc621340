//! # Proctor Core
//!
//! Business logic and state for the evaluation orchestrator: the lifecycle
//! state machine, the case dispatch queue, completion detection, startup
//! recovery and the live status broadcaster.
//!
//! ## Architecture
//!
//! - `state/` - SQLite persistence for evaluations, plans and cases
//! - `agents/` - LLM-backed plan generator and summarizer
//! - `orchestration/` - lifecycle coordination and the `Orchestrator` facade
//! - `config` - `.proctor/config.json` plus environment overrides
//!
//! ## Usage
//!
//! ```rust,ignore
//! use proctor_core::{NewEvaluation, Orchestrator, ProctorConfig, ProctorDb};
//!
//! let config = ProctorConfig::load(".proctor/config.json").await?;
//! let db = ProctorDb::open_at(&config.database_path)?;
//! let orchestrator = Orchestrator::with_llm(&db, &config)?;
//! orchestrator.recover().await?;
//! let evaluation = orchestrator
//!     .create_evaluation(NewEvaluation {
//!         goal: Some("verify login".into()),
//!         executor_ids: vec!["runner-1".into()],
//!         ..Default::default()
//!     })
//!     .await?;
//! ```

pub mod agents;
pub mod config;
pub mod error;
pub mod orchestration;
pub mod state;

#[cfg(test)]
mod test_support;

pub use config::{LateReportPolicy, ProctorConfig};
pub use error::{OrchestratorError, Result};
pub use orchestration::{NewEvaluation, Orchestrator, StatusSnapshot};
pub use state::ProctorDb;
