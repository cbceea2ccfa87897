//! Runtime wiring: one bus, one memory store, one engine, one core, plus attached
//! sensors and actuators.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use mamba_memory_data::MemoryStore;
use mamba_reasoning::ReasoningEngine;
use parking_lot::Mutex;
use serde_json::json;
use shared_event_bus::{EventBus, HandlerRef, Telemetry};
use shared_logging::{init_tracing, LogLevel};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{info, warn};

use crate::{
    cognitive_core::{CognitiveCore, CoreState},
    config::RuntimeConfig,
    contracts::{self, Actuator, Sensor, SensorDriver},
};

/// Fully wired runtime ready to be spawned.
#[derive(Debug)]
pub struct CognitiveRuntime {
    config: RuntimeConfig,
    bus: EventBus,
    memory: MemoryStore,
    engine: Arc<ReasoningEngine>,
    core: Arc<CognitiveCore>,
    telemetry: Option<Telemetry>,
    sensors: Mutex<Vec<Arc<SensorDriver>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl CognitiveRuntime {
    /// Builds every component from `config` around `engine`.
    pub fn bootstrap(config: RuntimeConfig, engine: ReasoningEngine) -> Result<Self> {
        config.validate()?;
        init_tracing(config.logging.level);

        let bus = EventBus::with_config(config.bus_config());
        let telemetry = match &config.logging.json_log {
            Some(path) => Some(
                Telemetry::builder("cognition.runtime")
                    .log_path(path)
                    .min_level(config.logging.level)
                    .event_bus(bus.clone())
                    .build()
                    .with_context(|| format!("opening telemetry log {}", path.display()))?,
            ),
            None => None,
        };

        let mut memory = MemoryStore::open(config.memory_config());
        let mut engine = engine;
        let mut core =
            CognitiveCore::builder(bus.clone()).recall_limit(config.memory.recall_limit);
        if let Some(tel) = &telemetry {
            memory = memory.with_telemetry(tel.scoped("memory"));
            engine = engine.with_telemetry(tel.scoped("reasoning"));
            core = core.telemetry(tel.scoped("cognition.core"));
        }
        let engine = Arc::new(engine);
        let core = core
            .memory(memory.clone())
            .reasoning(Arc::clone(&engine))
            .build();

        if let Some(tel) = &telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "runtime.bootstrapped",
                json!({
                    "memory_file": config.memory.path,
                    "rules": engine.rule_names(),
                }),
            );
        }
        info!(rules = engine.statistics().total_rules, "runtime.bootstrapped");

        Ok(Self {
            config,
            bus,
            memory,
            engine,
            core,
            telemetry,
            sensors: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            dispatcher: Mutex::new(None),
        })
    }

    /// Spawns the dispatch loop and the cognitive loop on the current tokio runtime.
    pub fn spawn(&self) -> Result<()> {
        let handle = Handle::try_current().context("spawning requires a tokio runtime")?;
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() || self.core.state() != CoreState::Idle {
            bail!("runtime already spawned");
        }

        let bus = self.bus.clone();
        *dispatcher = Some(handle.spawn(async move {
            if let Err(err) = bus.start().await {
                warn!(error = %err, "runtime.dispatcher_failed");
            }
        }));

        let core = Arc::clone(&self.core);
        let interval = self.config.cycle_interval();
        self.workers.lock().push(handle.spawn(async move {
            if let Err(err) = core.run(interval).await {
                warn!(error = %err, "runtime.core_failed");
            }
        }));
        info!("runtime.spawned");
        Ok(())
    }

    /// Starts polling `sensor` every `interval`.
    pub fn attach_sensor(
        &self,
        sensor: Arc<dyn Sensor>,
        interval: Duration,
    ) -> Result<Arc<SensorDriver>> {
        let handle = Handle::try_current().context("sensors require a tokio runtime")?;
        let driver = Arc::new(SensorDriver::new(sensor, self.bus.clone()));
        let runner = Arc::clone(&driver);
        self.workers
            .lock()
            .push(handle.spawn(async move { runner.start(interval).await }));
        self.sensors.lock().push(Arc::clone(&driver));
        Ok(driver)
    }

    /// Subscribes `actuator` to action events.
    pub fn attach_actuator(&self, actuator: Arc<dyn Actuator>) -> HandlerRef {
        contracts::attach_actuator(&self.bus, actuator)
    }

    /// Stops sensors and the core, waits for them, stops the dispatcher, delivers what
    /// is still queued, and persists memory.
    pub async fn shutdown(&self) -> Result<()> {
        for sensor in self.sensors.lock().drain(..) {
            sensor.stop();
        }
        self.core.stop();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.await.context("runtime worker panicked")?;
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(dispatcher) = dispatcher {
            self.bus.stop();
            dispatcher.await.context("dispatch loop panicked")?;
        }
        let drained = self.bus.dispatch_pending().await?;

        self.memory
            .persist()
            .await
            .context("persisting memory on shutdown")?;
        if let Some(tel) = &self.telemetry {
            let _ = tel.log(
                LogLevel::Info,
                "runtime.shutdown",
                json!({ "drained": drained, "bus": self.bus.stats() }),
            );
        }
        info!(drained, "runtime.shutdown");
        Ok(())
    }

    /// Effective configuration.
    #[must_use]
    pub const fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Shared bus.
    #[must_use]
    pub const fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Memory store.
    #[must_use]
    pub const fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Reasoning engine.
    #[must_use]
    pub const fn engine(&self) -> &Arc<ReasoningEngine> {
        &self.engine
    }

    /// Control loop.
    #[must_use]
    pub const fn core(&self) -> &Arc<CognitiveCore> {
        &self.core
    }
}
