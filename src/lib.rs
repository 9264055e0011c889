//! Prism turns a free-text content request into independently generated
//! video shots.
//!
//! The [`orchestrator::JobOrchestrator`] sequences intent parsing, template
//! matching, validation, and per-shot generation, recording every step in a
//! job's state machine. Backends, stores, planners, and splitters are traits
//! so deployments can swap them without touching orchestration.

pub mod backend;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod matcher;
pub mod media;
pub mod orchestrator;
pub mod planner;
pub mod retry;
pub mod state_machine;
pub mod store;
pub mod ui;
pub mod validator;

#[cfg(test)]
mod testing;
