//! Maintenance Scheduler
//!
//! A cancellable periodic task owned by a cache instance. The cache hands
//! it a job closure; the scheduler runs it once per period until the job
//! asks to stop, `stop()` is called, or the scheduler is dropped.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const MIN_PERIOD: Duration = Duration::from_millis(1);

// == Maintenance Scheduler ==
/// Owns at most one recurring background task.
#[derive(Debug)]
pub struct MaintenanceScheduler {
    /// Name used in log lines
    name: String,
    /// Running task, if any
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: Mutex::new(None),
        }
    }

    // == Start ==
    /// Starts running `job` every `period`.
    ///
    /// The first run happens one period after the call. The job returns
    /// `false` to end the loop, typically because the cache it maintains
    /// has been dropped.
    ///
    /// Idempotent: if a task is already running this is a no-op.
    ///
    /// # Returns
    /// `true` if a new task was spawned, `false` if one was already running
    /// or no tokio runtime is available.
    pub fn start<F, Fut>(&self, period: Duration, job: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let mut slot = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            debug!(scheduler = %self.name, "maintenance task already running");
            return false;
        }

        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(scheduler = %self.name, "no tokio runtime, maintenance task not started");
                return false;
            }
        };

        let period = period.max(MIN_PERIOD);
        let name = self.name.clone();
        info!(
            scheduler = %name,
            "Starting maintenance task with period of {:?}", period
        );

        *slot = Some(runtime.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if !job().await {
                    debug!(scheduler = %name, "maintenance target gone, stopping");
                    break;
                }
            }
        }));
        true
    }

    // == Stop ==
    /// Aborts the running task, if any. Safe to call repeatedly.
    pub fn stop(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!(scheduler = %self.name, "maintenance task stopped");
        }
    }

    /// Returns true while a task is scheduled.
    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
