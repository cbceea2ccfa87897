#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Cognitive control loop: perceptions arrive over the event bus, each cycle consults
//! memory and the reasoning engine, and chosen actions go back out over the bus to
//! attached actuators.

/// Perceive, think, act state machine.
#[path = "../cognitive_core.rs"]
pub mod cognitive_core;

/// Sensor and actuator contracts and their bus drivers.
#[path = "../contracts.rs"]
pub mod contracts;

/// TOML runtime configuration.
#[path = "../config.rs"]
pub mod config;

/// Runtime wiring and lifecycle.
#[path = "../main.rs"]
pub mod runtime;

pub use cognitive_core::{CognitiveCore, CognitiveCoreBuilder, CoreError, CoreState, Thought};
pub use config::{
    BusSection, ConfigError, CoreSection, LoggingSection, MemorySection, RuntimeConfig,
};
pub use contracts::{attach_actuator, Actuator, Sensor, SensorDriver};
pub use runtime::CognitiveRuntime;
