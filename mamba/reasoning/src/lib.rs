#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    rust_2018_idioms,
    missing_docs
)]

//! Rule-based reasoning: prioritized rules with feedback-adjusted weights, one decision
//! per call.

/// Perceptions, decisions, and rule data structures.
#[path = "../module.rs"]
pub mod module;

/// Rule registry and selection.
#[path = "../engine.rs"]
pub mod engine;

pub use engine::{default_decision, ReasoningEngine, ReasoningError};
pub use module::{
    Decision, EngineStatistics, FnRule, Perception, ReasoningContext, ReasoningRecord, Rule,
    RuleLogic, RuleStats,
};
