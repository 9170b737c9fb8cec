//! Wall-clock budget enforcement.
//!
//! Workers record what they are about to run in a per-worker slot; a
//! background thread scans the slots every `sleep_interval` and issues
//! a terminate on any engine whose script has been running longer than
//! `max_execution_time`. Terminate is an atomic flag store, so the
//! scan never touches a VM and is safe while the worker still holds
//! the engine lock.
//!
//! Slot updates and scans share one lock; the scan takes it
//! exclusively, so a worker can never observe a half-finished
//! iteration. Budget and interval live under the same lock and their
//! setters are therefore serialized with the scan.
//!
//! Worst-case termination latency is `sleep_interval` plus the
//! engine's safepoint granularity past the budget.

use crate::engines::EnginePool;
use parking_lot::{Mutex, RwLock};
use skald_types::{DEFAULT_MAX_EXECUTION_TIME_MS, DEFAULT_WATCHDOG_SLEEP_MS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Watchdog tuning.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// Per-script wall-clock budget.
    pub max_execution_time: Duration,
    /// Pause between slot scans.
    pub sleep_interval: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            max_execution_time: Duration::from_millis(DEFAULT_MAX_EXECUTION_TIME_MS),
            sleep_interval: Duration::from_millis(DEFAULT_WATCHDOG_SLEEP_MS),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RunningScript {
    engine: usize,
    started_at: Instant,
}

#[derive(Debug)]
struct WatchdogState {
    slots: Vec<Option<RunningScript>>,
    max_execution_time: Duration,
    sleep_interval: Duration,
}

/// Background monitor of per-worker execution slots.
pub struct Watchdog {
    state: Arc<RwLock<WatchdogState>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Starts the monitor thread over `slots` worker slots.
    ///
    /// # Errors
    ///
    /// Thread spawn failure; fatal to the service.
    pub fn spawn(
        engines: Arc<EnginePool>,
        slots: usize,
        config: WatchdogConfig,
    ) -> std::io::Result<Arc<Self>> {
        let state = Arc::new(RwLock::new(WatchdogState {
            slots: vec![None; slots],
            max_execution_time: config.max_execution_time,
            sleep_interval: config.sleep_interval,
        }));
        let running = Arc::new(AtomicBool::new(true));

        let handle = {
            let state = Arc::clone(&state);
            let running = Arc::clone(&running);
            std::thread::Builder::new()
                .name("skald-watchdog".into())
                .spawn(move || watch_loop(&state, &running, &engines))?
        };

        Ok(Arc::new(Self {
            state,
            running,
            handle: Mutex::new(Some(handle)),
        }))
    }

    /// Records that `worker` started a script on `engine` now.
    pub fn mark_running(&self, worker: usize, engine: usize) {
        let mut state = self.state.write();
        if let Some(slot) = state.slots.get_mut(worker) {
            *slot = Some(RunningScript {
                engine,
                started_at: Instant::now(),
            });
        }
    }

    /// Clears `worker`'s slot. Must happen before the worker releases
    /// the engine lock, so a late scan cannot terminate the engine's
    /// next script.
    pub fn mark_idle(&self, worker: usize) {
        let mut state = self.state.write();
        if let Some(slot) = state.slots.get_mut(worker) {
            *slot = None;
        }
    }

    /// Current per-script budget.
    #[must_use]
    pub fn max_execution_time(&self) -> Duration {
        self.state.read().max_execution_time
    }

    /// Replaces the per-script budget.
    pub fn set_max_execution_time(&self, budget: Duration) {
        self.state.write().max_execution_time = budget;
        tracing::info!(budget_ms = budget.as_millis() as u64, "execution budget updated");
    }

    /// Current scan interval.
    #[must_use]
    pub fn sleep_interval(&self) -> Duration {
        self.state.read().sleep_interval
    }

    /// Replaces the scan interval.
    pub fn set_sleep_interval(&self, interval: Duration) {
        self.state.write().sleep_interval = interval;
    }

    /// Stops and joins the monitor thread. Returns within one scan
    /// interval. Idempotent.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

fn watch_loop(state: &RwLock<WatchdogState>, running: &AtomicBool, engines: &EnginePool) {
    while running.load(Ordering::SeqCst) {
        let sleep_interval = {
            let state = state.write();
            let now = Instant::now();
            for slot in state.slots.iter().flatten() {
                if now.duration_since(slot.started_at) > state.max_execution_time {
                    tracing::warn!(engine = slot.engine, "script over budget, terminating");
                    engines.engine(slot.engine).terminate();
                }
            }
            state.sleep_interval
        };
        std::thread::sleep(sleep_interval);
    }
}
