use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use shared_event_bus::{Event, EventBus, EventHandler, HandlerRef};
use tokio::{sync::Notify, time::sleep};
use tracing::{debug, warn};

/// Event type carrying sensor readings.
pub const SENSOR_DATA: &str = "sensor_data";
/// Event type carrying actions for actuators.
pub const ACTION_REQUESTED: &str = "action_requested";

/// Producer of readings.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Name used as event source.
    fn name(&self) -> &str;
    /// Takes one reading; `None` when nothing is available right now.
    async fn read(&self) -> Result<Option<Value>>;
}

/// Consumer of `action_requested` events.
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Actuator name.
    fn name(&self) -> &str;

    /// Whether this actuator handles `action`. Handles everything by default.
    fn should_handle(&self, _action: &Value) -> bool {
        true
    }

    /// Performs the action.
    async fn act(&self, action: &Value) -> Result<()>;
}

/// Polls a [`Sensor`] and publishes its readings as `sensor_data` events
/// `{ sensor, value }`.
pub struct SensorDriver {
    sensor: Arc<dyn Sensor>,
    bus: EventBus,
    active: AtomicBool,
    stop_requested: AtomicBool,
    wake: Notify,
    emitted: AtomicU64,
    failures: AtomicU64,
}

impl std::fmt::Debug for SensorDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorDriver")
            .field("sensor", &self.sensor.name())
            .field("running", &self.is_running())
            .field("emitted", &self.emitted())
            .finish_non_exhaustive()
    }
}

impl SensorDriver {
    /// Binds `sensor` to `bus`.
    #[must_use]
    pub fn new(sensor: Arc<dyn Sensor>, bus: EventBus) -> Self {
        Self {
            sensor,
            bus,
            active: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            wake: Notify::new(),
            emitted: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Reads every `interval` until [`stop`](Self::stop). Read errors are logged and the
    /// loop continues. A stopped driver does not restart.
    pub async fn start(&self, interval: Duration) {
        self.active.store(true, Ordering::SeqCst);
        debug!(sensor = self.sensor.name(), "sensor.started");
        while !self.stop_requested.load(Ordering::SeqCst) {
            self.poll_once().await;
            tokio::select! {
                () = sleep(interval) => {}
                () = self.wake.notified() => {}
            }
        }
        self.active.store(false, Ordering::SeqCst);
        debug!(sensor = self.sensor.name(), "sensor.stopped");
    }

    /// Takes a single reading and publishes it. Returns whether an event was emitted.
    pub async fn poll_once(&self) -> bool {
        let name = self.sensor.name();
        match self.sensor.read().await {
            Ok(Some(value)) => {
                let payload = json!({ "sensor": name, "value": value });
                let event = Event::new(SENSOR_DATA, payload, name);
                match self.bus.publish(event).await {
                    Ok(()) => {
                        self.emitted.fetch_add(1, Ordering::Relaxed);
                        true
                    }
                    Err(err) => {
                        warn!(sensor = name, error = %err, "sensor.publish_failed");
                        false
                    }
                }
            }
            Ok(None) => false,
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(sensor = name, error = %err, "sensor.read_failed");
                false
            }
        }
    }

    /// Asks the loop to exit.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    /// Whether the loop is active.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Readings published so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Failed reads so far.
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

struct ActuatorHandler {
    actuator: Arc<dyn Actuator>,
}

#[async_trait]
impl EventHandler for ActuatorHandler {
    async fn handle(&self, event: &Event) -> Result<()> {
        if !self.actuator.should_handle(&event.payload) {
            return Ok(());
        }
        self.actuator.act(&event.payload).await
    }
}

/// Subscribes `actuator` to `action_requested`. Keep the returned handle to detach it
/// with [`EventBus::unsubscribe`].
pub fn attach_actuator(bus: &EventBus, actuator: Arc<dyn Actuator>) -> HandlerRef {
    debug!(actuator = actuator.name(), "actuator.attached");
    bus.subscribe(ACTION_REQUESTED, Arc::new(ActuatorHandler { actuator }))
}
