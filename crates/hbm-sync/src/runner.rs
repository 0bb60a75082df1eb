//! Generic cancellable periodic task runner used by every background loop.

use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Work performed on a fixed interval until cancelled.
///
/// `run_cycle` must absorb its own failures: one bad cycle never stops the loop.
#[async_trait]
pub trait PeriodicTask: Send + 'static {
    fn name(&self) -> &'static str;

    async fn run_cycle(&mut self);

    /// Called once after cancellation, before the task exits.
    async fn on_shutdown(&mut self) {}
}

#[derive(Debug)]
pub struct PeriodicHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

/// Spawns `task` on the runtime. The first cycle runs one `every` after spawn.
pub fn spawn_periodic<T: PeriodicTask>(
    mut task: T,
    every: Duration,
    shutdown: CancellationToken,
) -> PeriodicHandle {
    let name = task.name();
    let handle = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(task = name, every_ms = every.as_millis() as u64, "periodic task started");
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => task.run_cycle().await,
            }
        }
        task.on_shutdown().await;
        info!(task = name, "periodic task stopped");
    });
    PeriodicHandle { name, handle }
}

impl PeriodicHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Waits up to `timeout` for the task to finish. A task that overruns is aborted.
    pub async fn join(self, timeout: Duration) -> bool {
        let abort = self.handle.abort_handle();
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(task = self.name, error = %err, "periodic task failed");
                false
            }
            Err(_) => {
                warn!(task = self.name, timeout_ms = timeout.as_millis() as u64, "periodic task did not stop in time");
                abort.abort();
                false
            }
        }
    }
}
