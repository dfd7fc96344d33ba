use crate::error::ExiferError;
use crate::executors::stay_open::WorkerProcess;
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

type Slot = Arc<Mutex<Option<WorkerProcess>>>;

/// Registry of persistent worker processes, one per executable name.
///
/// Callers on the same executable serialize on that executable's mutex, so
/// request N completes before request N+1 starts; distinct executables are
/// independent. The registry lock only guards slot creation and is never held
/// across a round trip.
///
/// One instance is shared process-wide via [`Supervisor::global`]; tests
/// construct isolated instances with [`Supervisor::new`].
#[derive(Debug, Default)]
pub struct Supervisor {
    registry: Mutex<HashMap<String, Slot>>,
    spawns: AtomicU64,
}

static GLOBAL: OnceLock<Supervisor> = OnceLock::new();

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance.
    pub fn global() -> &'static Supervisor {
        GLOBAL.get_or_init(Supervisor::new)
    }

    /// Number of worker processes started over this supervisor's lifetime.
    pub fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::Relaxed)
    }

    /// Executes one request/response cycle against the named worker, starting
    /// or restarting the process as needed.
    ///
    /// A worker that timed out or died during the cycle is evicted from its
    /// slot, so the next call for the same executable transparently spawns a
    /// fresh process. There is no caller-visible reconnect step.
    pub fn execute(
        &self,
        executable: &str,
        args: &[String],
        timeout: Duration,
    ) -> Result<String, ExiferError> {
        let slot = self.slot(executable);
        let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);

        let mut worker = match guard.take() {
            Some(mut worker) => {
                if worker.is_alive() {
                    worker
                } else {
                    self.start_worker(executable)?
                }
            }
            None => self.start_worker(executable)?,
        };

        let result = worker.execute(args, timeout);

        // A timed-out worker was already killed and a desynced one died by
        // itself; only a healthy worker goes back into the slot for reuse.
        if !matches!(
            result,
            Err(ExiferError::Timeout { .. }) | Err(ExiferError::ProcessTerminated { .. })
        ) {
            *guard = Some(worker);
        }

        result
    }

    /// Asks every live worker to leave stay-open mode, force-killing any that
    /// linger. The registry is left empty but usable.
    pub fn shutdown(&self) {
        let slots: Vec<(String, Slot)> = {
            let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
            registry.drain().collect()
        };
        for (name, slot) in slots {
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(mut worker) = guard.take() {
                debug!("shutting down worker '{name}'");
                worker.stop();
            }
        }
    }

    /// Per-name slot, created lazily. Creation always happens under the
    /// registry lock; the per-name mutex it guards is acquired afterwards,
    /// never skipped.
    fn slot(&self, executable: &str) -> Slot {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        registry.entry(executable.to_string()).or_default().clone()
    }

    fn start_worker(&self, executable: &str) -> Result<WorkerProcess, ExiferError> {
        debug!("starting worker '{executable}'");
        let worker = WorkerProcess::spawn(executable)?;
        self.spawns.fetch_add(1, Ordering::Relaxed);
        Ok(worker)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Shuts down the process-wide supervisor's workers. Call once at application
/// exit; safe to call when nothing was ever started.
pub fn shutdown_global() {
    if let Some(supervisor) = GLOBAL.get() {
        supervisor.shutdown();
    }
}
