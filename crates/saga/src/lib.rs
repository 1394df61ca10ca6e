//! Saga orchestration over the command bus.
//!
//! An orchestration is an ordered list of steps, each a set of commands,
//! plus a fallback step of compensating commands. The engine persists it
//! and dispatches step 0; the runner listens to completion events and:
//! 1. dispatches the next step once every command of the current one is done
//! 2. on the first command completed with an error, dispatches the fallback
//!    and cancels everything not yet dispatched
//! 3. after the last step succeeds, cancels the unused fallback
//!
//! All state is derived from command statuses in the message store, so any
//! number of runner processes may share the work.

pub mod engine;
pub mod error;
pub mod orchestration;
pub mod runner;
pub mod state;

pub use engine::OrchestrationEngine;
pub use error::{Result, SagaError};
pub use orchestration::{MessageOrchestration, OrchestrationStep};
pub use runner::OrchestrationRunner;
pub use state::OrchestrationState;
