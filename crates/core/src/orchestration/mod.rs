//! # Orchestration
//!
//! Drives an evaluation through its lifecycle.
//!
//! ## Flow
//!
//! ```text
//! create → Coordinator (plan, cases) → READY
//!        → executors poll DispatchQueue → report
//!        → CompletionDetector (all cases done) → SUMMARIZING
//!        → SummaryRunner → COMPLETED
//! ```
//!
//! Every status write goes through [`EvaluationStateMachine`], which
//! publishes it on the [`StatusBroadcaster`] after commit.

pub mod broadcaster;
pub mod completion;
pub mod coordinator;
pub mod dispatch;
pub mod events;
pub mod recovery;
pub mod service;
pub mod state_machine;
pub mod stream;
pub mod summary;
pub mod supervisor;

pub use broadcaster::{next_sink_id, ChannelSink, EventSink, SinkId, StatusBroadcaster};
pub use completion::{CompletionDetector, FinalizeOutcome};
pub use coordinator::OrchestrationCoordinator;
pub use dispatch::{CaseReport, DispatchQueue};
pub use events::{StatusEvent, StatusEventKind, CHANNEL_EVALUATION_STATUS};
pub use recovery::{RecoveryReport, RecoveryScanner};
pub use service::{NewEvaluation, Orchestrator, StatusSnapshot};
pub use state_machine::EvaluationStateMachine;
pub use stream::{status_stream, StreamEvent};
pub use summary::SummaryRunner;
pub use supervisor::{TaskKind, TaskOutcome, TaskSupervisor};
