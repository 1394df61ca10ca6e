//! Orchestration state machine.
//!
//! The state is never stored. It is derived from the statuses of the
//! orchestration's commands every time it is asked for.

use message_store::OrchestrationSummary;
use serde::{Deserialize, Serialize};

/// The state of an orchestration in its lifecycle.
///
/// State transitions:
/// ```text
/// Created ──► Running ──┬──────────────────► Complete
///                       └──► Compensating ──► Complete (with error)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrchestrationState {
    /// Nothing has been dispatched yet.
    #[default]
    Created,

    /// Normal steps are being executed.
    Running,

    /// A command failed and the fallback step, or the cancellation of the
    /// remaining commands, is still in progress.
    Compensating,

    /// Every normal command is terminal and no compensation is pending.
    Complete,
}

impl OrchestrationState {
    /// Derives the state from per-status counts.
    ///
    /// Complete takes precedence over Running: once the last normal command
    /// finishes, the orchestration is Complete even while its unused fallback
    /// is still waiting to be canceled.
    pub fn from_summary(summary: &OrchestrationSummary) -> Self {
        if summary.has_error() && (summary.normal_pending > 0 || summary.fallback_pending > 0) {
            OrchestrationState::Compensating
        } else if summary.is_complete() {
            OrchestrationState::Complete
        } else if summary.created == summary.total {
            OrchestrationState::Created
        } else {
            OrchestrationState::Running
        }
    }

    /// Returns true if the orchestration can be started.
    pub fn can_run(&self) -> bool {
        matches!(self, OrchestrationState::Created)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrchestrationState::Complete)
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrchestrationState::Created => "Created",
            OrchestrationState::Running => "Running",
            OrchestrationState::Compensating => "Compensating",
            OrchestrationState::Complete => "Complete",
        }
    }
}

impl std::fmt::Display for OrchestrationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
