use async_trait::async_trait;
use hbm_storage::SubscriptionWriter;
use tracing::{info, warn};

use crate::runner::PeriodicTask;

#[async_trait]
impl PeriodicTask for SubscriptionWriter {
    fn name(&self) -> &'static str {
        "subscription-writer"
    }

    async fn run_cycle(&mut self) {
        if let Err(err) = self.drain_and_commit().await {
            warn!(pending = self.pending(), error = %err, "subscription commit failed, will retry");
        }
    }

    /// Final flush, then release the database.
    async fn on_shutdown(&mut self) {
        match self.drain_and_commit().await {
            Ok(committed) => info!(committed, "final subscription flush"),
            Err(err) => warn!(pending = self.pending(), error = %err, "final subscription flush failed"),
        }
        self.store().close().await;
    }
}
