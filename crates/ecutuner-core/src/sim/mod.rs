//! Vehicle Simulator
//!
//! Owns one [`VehicleState`] behind a mutex and advances it on a fixed-cadence
//! tokio task. Control inputs and snapshots take the same lock as the tick, so
//! no reader ever observes a half-updated state.

mod state;
mod telemetry;

pub use state::{
    ControlInput, GearCommand, GearSelector, IgnitionCommand, VehicleState, IDLE_RPM,
};
pub use telemetry::Telemetry;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::vehicle::VehicleProfile;

/// Errors raised by the simulator handle
#[derive(Error, Debug)]
pub enum SimError {
    #[error("No Tokio runtime available to run the simulation loop")]
    NoRuntime,
}

/// Simulation loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Target tick interval in milliseconds
    pub tick_interval_ms: u64,
    /// Upper bound on a single step's dt, in milliseconds
    pub max_step_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 20,
            max_step_ms: 100,
        }
    }
}

struct SimCore {
    profile: Arc<VehicleProfile>,
    state: VehicleState,
    rng: StdRng,
}

impl SimCore {
    fn tick(&mut self, dt: f64) {
        self.state.step(&self.profile, dt, &mut self.rng);
    }
}

struct Inner {
    core: Arc<Mutex<SimCore>>,
    task: Mutex<Option<JoinHandle<()>>>,
    config: SimulatorConfig,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Shared handle to a running (or paused) vehicle simulation.
///
/// Cloning is cheap; the loop stops when the last clone is dropped.
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<Inner>,
}

impl Simulator {
    /// Create a simulator for `profile`. The loop is not running until
    /// [`Simulator::start`] is called.
    pub fn new(profile: Arc<VehicleProfile>, config: SimulatorConfig) -> Self {
        let core = SimCore {
            profile,
            state: VehicleState::default(),
            rng: StdRng::from_entropy(),
        };
        Self {
            inner: Arc::new(Inner {
                core: Arc::new(Mutex::new(core)),
                task: Mutex::new(None),
                config,
            }),
        }
    }

    /// Create a simulator and start its loop on the current runtime
    pub fn spawn(profile: Arc<VehicleProfile>, config: SimulatorConfig) -> Result<Self, SimError> {
        let sim = Self::new(profile, config);
        sim.start()?;
        Ok(sim)
    }

    /// Start the tick loop. Does nothing if it is already running.
    pub fn start(&self) -> Result<(), SimError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SimError::NoRuntime)?;

        let mut task = self.inner.task.lock();
        if task.as_ref().is_some_and(|h| !h.is_finished()) {
            return Ok(());
        }

        let core = Arc::clone(&self.inner.core);
        let interval = Duration::from_millis(self.inner.config.tick_interval_ms.max(1));
        let max_step = Duration::from_millis(self.inner.config.max_step_ms.max(1));

        tracing::info!(
            "Simulator loop starting ({}ms tick, {}ms max step)",
            interval.as_millis(),
            max_step.as_millis()
        );
        *task = Some(runtime.spawn(run_loop(core, interval, max_step)));
        Ok(())
    }

    /// Stop the tick loop. State is kept.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.task.lock().take() {
            handle.abort();
            tracing::info!("Simulator loop stopped");
        }
    }

    /// Whether the tick loop is running
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Reinitialise the state for a (possibly different) profile
    pub fn reset(&self, profile: Arc<VehicleProfile>) {
        let mut core = self.inner.core.lock();
        tracing::info!("Simulator reset to '{}'", profile.name);
        core.profile = profile;
        core.state = VehicleState::default();
    }

    /// Apply one set of driver inputs atomically
    pub fn apply_controls(&self, input: ControlInput) {
        let mut core = self.inner.core.lock();
        let profile = Arc::clone(&core.profile);
        core.state.apply(&input, &profile);
    }

    /// Advance the simulation by `dt` by hand, independent of the loop
    pub fn step(&self, dt: Duration) {
        self.inner.core.lock().tick(dt.as_secs_f64());
    }

    /// Dashboard telemetry
    pub fn snapshot(&self) -> Telemetry {
        let core = self.inner.core.lock();
        Telemetry::from_state(&core.state, &core.profile)
    }

    /// Copy of the raw vehicle state
    pub fn state(&self) -> VehicleState {
        self.inner.core.lock().state.clone()
    }

    /// The active vehicle profile
    pub fn profile(&self) -> Arc<VehicleProfile> {
        Arc::clone(&self.inner.core.lock().profile)
    }
}

async fn run_loop(core: Arc<Mutex<SimCore>>, interval: Duration, max_step: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();

    loop {
        ticker.tick().await;

        let now = Instant::now();
        let dt = now.duration_since(last).min(max_step);
        last = now;

        core.lock().tick(dt.as_secs_f64());
    }
}
