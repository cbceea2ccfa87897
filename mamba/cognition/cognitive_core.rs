use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mamba_memory_data::{MemoryStore, RECENT_CONTEXT};
use mamba_reasoning::{Decision, Perception, ReasoningEngine};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::{Event, EventBus, EventHandler, HandlerRef, Telemetry};
use shared_logging::LogLevel;
use thiserror::Error;
use tokio::{sync::Notify, time::sleep};
use tracing::{debug, instrument, warn};

/// Source name stamped on every event the core emits.
pub const CORE_SOURCE: &str = "cognitive_core";
/// Event types the core turns into perceptions.
pub const PERCEPTION_EVENTS: [&str; 2] = ["perception", "sensor_data"];
/// The perception log is compacted once it grows past this...
pub const PERCEPTION_LIMIT: usize = 100;
/// ...down to this many of the most recent perceptions.
pub const PERCEPTION_RETAIN: usize = 50;
/// Perceptions copied into each thought.
pub const THOUGHT_WINDOW: usize = 5;
/// Action that never reaches the actuators.
pub const OBSERVE: &str = "observe";

/// Lifecycle of a [`CognitiveCore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    /// Constructed, loop not started.
    Idle,
    /// Loop active.
    Running,
    /// Loop exited. Terminal.
    Stopped,
}

/// Errors raised when starting the control loop.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CoreError {
    /// `run` was called while the loop was already active.
    #[error("cognitive core is already running")]
    AlreadyRunning,
    /// `run` was called after the loop exited.
    #[error("cognitive core has stopped")]
    AlreadyStopped,
}

/// Output of one think phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    /// Perceptions held when thinking started.
    pub perception_count: usize,
    /// The last few of them.
    pub recent_perceptions: Vec<Perception>,
    /// Recalled recent context, `{}` when nothing was recalled.
    pub context: Value,
    /// Chosen decision; `None` when the selected rule failed.
    pub decision: Option<Decision>,
    /// When the thought completed.
    pub timestamp: DateTime<Utc>,
}

/// Builder for [`CognitiveCore`].
#[derive(Debug)]
pub struct CognitiveCoreBuilder {
    bus: EventBus,
    memory: Option<MemoryStore>,
    reasoning: Option<Arc<ReasoningEngine>>,
    recall_limit: usize,
    telemetry: Option<Telemetry>,
}

impl CognitiveCoreBuilder {
    /// Attaches a memory store.
    #[must_use]
    pub fn memory(mut self, memory: MemoryStore) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Attaches a reasoning engine.
    #[must_use]
    pub fn reasoning(mut self, engine: Arc<ReasoningEngine>) -> Self {
        self.reasoning = Some(engine);
        self
    }

    /// Number of entries recalled as context per thought.
    #[must_use]
    pub const fn recall_limit(mut self, limit: usize) -> Self {
        self.recall_limit = limit;
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the core and subscribes it to the perception event types.
    #[must_use]
    pub fn build(self) -> Arc<CognitiveCore> {
        let core = Arc::new(CognitiveCore {
            bus: self.bus,
            memory: self.memory,
            reasoning: self.reasoning,
            recall_limit: self.recall_limit,
            telemetry: self.telemetry,
            perceptions: Mutex::new(Vec::new()),
            state: Mutex::new(CoreState::Idle),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
            subscriptions: Mutex::new(Vec::new()),
        });
        let handler: HandlerRef = Arc::new(PerceptionHandler {
            core: Arc::downgrade(&core),
        });
        let mut subscriptions = core.subscriptions.lock();
        for event_type in PERCEPTION_EVENTS {
            core.bus.subscribe(event_type, Arc::clone(&handler));
            subscriptions.push((event_type.to_owned(), Arc::clone(&handler)));
        }
        drop(subscriptions);
        core
    }
}

/// Perceive, think, act control loop.
///
/// Events of type `perception` or `sensor_data` delivered by the bus become perceptions.
/// Each cycle reasons over every held perception plus recalled context and emits the
/// resulting action unless it is `observe`. Dropping the core removes its subscriptions.
pub struct CognitiveCore {
    bus: EventBus,
    memory: Option<MemoryStore>,
    reasoning: Option<Arc<ReasoningEngine>>,
    recall_limit: usize,
    telemetry: Option<Telemetry>,
    perceptions: Mutex<Vec<Perception>>,
    state: Mutex<CoreState>,
    stop_requested: AtomicBool,
    wake: Notify,
    subscriptions: Mutex<Vec<(String, HandlerRef)>>,
}

impl fmt::Debug for CognitiveCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CognitiveCore")
            .field("state", &self.state())
            .field("perceptions", &self.perception_count())
            .field("recall_limit", &self.recall_limit)
            .field("has_memory", &self.memory.is_some())
            .field("has_reasoning", &self.reasoning.is_some())
            .finish_non_exhaustive()
    }
}

impl CognitiveCore {
    /// Starts building a core bound to `bus`.
    #[must_use]
    pub const fn builder(bus: EventBus) -> CognitiveCoreBuilder {
        CognitiveCoreBuilder {
            bus,
            memory: None,
            reasoning: None,
            recall_limit: 10,
            telemetry: None,
        }
    }

    /// Core with optional collaborators and default settings.
    #[must_use]
    pub fn new(
        bus: EventBus,
        memory: Option<MemoryStore>,
        reasoning: Option<Arc<ReasoningEngine>>,
    ) -> Arc<Self> {
        let mut builder = Self::builder(bus);
        builder.memory = memory;
        builder.reasoning = reasoning;
        builder.build()
    }

    /// Records a perception, stores it under `perception`, and emits
    /// `perception_received`.
    pub async fn perceive(&self, data: Value, source: impl Into<String>) {
        let perception = Perception::new(data, source);
        let record = serde_json::to_value(&perception).unwrap_or(Value::Null);
        self.perceptions.lock().push(perception);
        if let Some(memory) = &self.memory {
            memory.store("perception", record.clone());
        }
        self.emit("perception_received", record).await;
    }

    /// Reasons over the held perceptions. `None` when there are none.
    pub async fn think(&self) -> Option<Thought> {
        let perceptions = self.perceptions.lock().clone();
        if perceptions.is_empty() {
            return None;
        }

        let context = self
            .memory
            .as_ref()
            .and_then(|memory| memory.recall(RECENT_CONTEXT, self.recall_limit))
            .and_then(|entries| serde_json::to_value(entries).ok())
            .unwrap_or_else(|| json!({}));

        let decision = match &self.reasoning {
            Some(engine) => engine.reason(&perceptions, context.clone()),
            None => Some(Decision::new(OBSERVE, 0.5)),
        };

        let skip = perceptions.len().saturating_sub(THOUGHT_WINDOW);
        let thought = Thought {
            perception_count: perceptions.len(),
            recent_perceptions: perceptions[skip..].to_vec(),
            context,
            decision,
            timestamp: Utc::now(),
        };
        self.emit(
            "thought_completed",
            serde_json::to_value(&thought).unwrap_or(Value::Null),
        )
        .await;
        Some(thought)
    }

    /// Stores the action under `action` and emits `action_requested` with the decision.
    pub async fn act(&self, decision: &Decision) {
        let payload = decision.to_value();
        if let Some(memory) = &self.memory {
            memory.store(
                "action",
                json!({ "action": payload, "timestamp": Utc::now() }),
            );
        }
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "core.action_requested",
                json!({ "action": decision.action, "confidence": decision.confidence }),
            );
        }
        self.emit("action_requested", payload).await;
    }

    /// Runs think then act, then compacts the perception log.
    #[instrument(skip(self))]
    pub async fn cognitive_cycle(&self) -> Option<Thought> {
        let thought = self.think().await;
        if let Some(decision) = thought.as_ref().and_then(|t| t.decision.as_ref()) {
            if decision.action == OBSERVE {
                debug!(confidence = decision.confidence, "core.observing");
            } else {
                self.act(decision).await;
            }
        }

        let mut perceptions = self.perceptions.lock();
        if perceptions.len() > PERCEPTION_LIMIT {
            let excess = perceptions.len() - PERCEPTION_RETAIN;
            perceptions.drain(..excess);
        }
        thought
    }

    /// Runs cycles every `interval` until [`stop`](Self::stop) is called.
    ///
    /// Emits `cognitive_core_started` on entry and `cognitive_core_stopped` on exit.
    pub async fn run(&self, interval: Duration) -> Result<(), CoreError> {
        {
            let mut state = self.state.lock();
            match *state {
                CoreState::Running => return Err(CoreError::AlreadyRunning),
                CoreState::Stopped => return Err(CoreError::AlreadyStopped),
                CoreState::Idle => *state = CoreState::Running,
            }
        }
        self.emit("cognitive_core_started", json!({})).await;

        while !self.stop_requested.load(Ordering::SeqCst) {
            self.cognitive_cycle().await;
            tokio::select! {
                () = sleep(interval) => {}
                () = self.wake.notified() => {}
            }
        }

        *self.state.lock() = CoreState::Stopped;
        self.emit("cognitive_core_stopped", json!({})).await;
        Ok(())
    }

    /// Asks the loop to exit after the current cycle. A stop requested before `run`
    /// makes `run` exit without cycling.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> CoreState {
        *self.state.lock()
    }

    /// Number of held perceptions.
    #[must_use]
    pub fn perception_count(&self) -> usize {
        self.perceptions.lock().len()
    }

    /// Copy of the held perceptions, oldest first.
    #[must_use]
    pub fn perceptions(&self) -> Vec<Perception> {
        self.perceptions.lock().clone()
    }

    async fn emit(&self, event_type: &str, payload: Value) {
        if let Err(err) = self.bus.emit(event_type, payload, CORE_SOURCE).await {
            warn!(event_type, error = %err, "core.emit_failed");
        }
    }
}

impl Drop for CognitiveCore {
    fn drop(&mut self) {
        for (event_type, handler) in self.subscriptions.get_mut().drain(..) {
            self.bus.unsubscribe(&event_type, &handler);
        }
    }
}

struct PerceptionHandler {
    core: Weak<CognitiveCore>,
}

#[async_trait]
impl EventHandler for PerceptionHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        if let Some(core) = self.core.upgrade() {
            core.perceive(event.payload.clone(), event.source.clone())
                .await;
        }
        Ok(())
    }
}
