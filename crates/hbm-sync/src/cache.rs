//! Swap-based event snapshot and the loop that refreshes it.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hbm_adapters::{EventSource, NormalizedBatch};
use hbm_core::Event;
use hbm_storage::FetchError;
use tracing::{info, warn};

use crate::runner::PeriodicTask;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventSnapshot {
    pub events: Vec<Event>,
    /// Highest event id in `events`; `None` until a non-empty page was seen.
    pub max_id: Option<u64>,
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Single writer (the refresher), any number of lock-free readers.
#[derive(Debug)]
pub struct EventCache {
    inner: ArcSwap<EventSnapshot>,
}

impl Default for EventCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCache {
    pub fn new() -> Self {
        Self {
            inner: ArcSwap::from_pointee(EventSnapshot::default()),
        }
    }

    pub fn refresh(&self, batch: NormalizedBatch) {
        self.inner.store(Arc::new(EventSnapshot {
            events: batch.events,
            max_id: batch.max_id,
            refreshed_at: Some(Utc::now()),
        }));
    }

    /// A consistent view that stays valid even if a refresh swaps in new data.
    pub fn snapshot(&self) -> Arc<EventSnapshot> {
        self.inner.load_full()
    }

    pub fn latest_id(&self) -> Option<u64> {
        self.inner.load().max_id
    }
}

/// Fetches and normalizes once. On error the cache is left untouched.
pub async fn refresh_once(source: &dyn EventSource, cache: &EventCache) -> Result<usize, FetchError> {
    let rows = source.fetch_listing().await?;
    let batch = source.parse_listing(rows);
    let count = batch.events.len();
    info!(
        source = source.source_id(),
        events = count,
        dropped = batch.dropped,
        max_id = ?batch.max_id,
        "event cache refreshed"
    );
    cache.refresh(batch);
    Ok(count)
}

pub struct EventRefresher {
    source: Arc<dyn EventSource>,
    cache: Arc<EventCache>,
}

impl EventRefresher {
    pub fn new(source: Arc<dyn EventSource>, cache: Arc<EventCache>) -> Self {
        Self { source, cache }
    }
}

#[async_trait]
impl PeriodicTask for EventRefresher {
    fn name(&self) -> &'static str {
        "event-refresher"
    }

    async fn run_cycle(&mut self) {
        if let Err(err) = refresh_once(self.source.as_ref(), &self.cache).await {
            warn!(source = self.source.source_id(), error = %err, "listing fetch failed, keeping stale events");
        }
    }
}
