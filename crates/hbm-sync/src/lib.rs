//! Bot runtime: configuration, the background loops and their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hbm_adapters::{EventSource, HikingBuddiesSource, DEFAULT_EVENT_LIST_URL};
use hbm_core::{execute, parse_query, Event, DEFAULT_EVENT_LINK_BASE};
use hbm_storage::{
    subscription_queue, HttpClientConfig, HttpFetcher, SubscriptionMirror, SubscriptionStore,
    SubscriptionWriter,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod cache;
mod commands;
mod matcher;
mod runner;
mod writer;

#[cfg(test)]
mod testing;

pub use cache::{refresh_once, EventCache, EventRefresher, EventSnapshot};
pub use commands::{CommandContext, CommandError, Reply};
pub use matcher::{MatchReport, Notification, Notifier, SubscriptionMatcher};
pub use runner::{spawn_periodic, PeriodicHandle, PeriodicTask};

pub const CRATE_NAME: &str = "hbm-sync";

#[derive(Debug, Clone)]
pub struct BotConfig {
    pub database_url: String,
    pub event_list_url: String,
    pub event_link_base: String,
    pub page_length: usize,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fetch_interval_secs: u64,
    pub drain_interval_secs: u64,
    pub match_interval_secs: u64,
    pub shutdown_timeout_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl BotConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; missing or unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let secs = |key: &str, default: u64| {
            lookup(key)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "sqlite://hbm-bot.db".to_string()),
            event_list_url: lookup("HBM_EVENT_LIST_URL")
                .unwrap_or_else(|| DEFAULT_EVENT_LIST_URL.to_string()),
            event_link_base: lookup("HBM_EVENT_LINK_BASE")
                .unwrap_or_else(|| DEFAULT_EVENT_LINK_BASE.to_string()),
            page_length: lookup("HBM_PAGE_LENGTH")
                .and_then(|v| v.trim().parse().ok())
                .filter(|v| *v > 0)
                .unwrap_or(100),
            user_agent: lookup("HBM_USER_AGENT").unwrap_or_else(|| "hbm-bot/0.1".to_string()),
            http_timeout_secs: secs("HBM_HTTP_TIMEOUT_SECS", 20),
            fetch_interval_secs: secs("HBM_FETCH_INTERVAL_SECS", 30),
            drain_interval_secs: secs("HBM_DRAIN_INTERVAL_SECS", 10),
            match_interval_secs: secs("HBM_MATCH_INTERVAL_SECS", 15),
            shutdown_timeout_secs: secs("HBM_SHUTDOWN_TIMEOUT_SECS", 5),
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

pub fn build_source(config: &BotConfig) -> Result<HikingBuddiesSource> {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
    })?;
    Ok(HikingBuddiesSource::new(
        http,
        config.event_list_url.clone(),
        config.event_link_base.clone(),
        config.page_length,
    ))
}

/// One fetch, one query, no store. Arguments are validated before any network call.
pub async fn query_once(
    source: &dyn EventSource,
    command: &str,
    args: &[String],
) -> Result<Vec<Event>> {
    let query = parse_query(command, args)?;
    let cache = EventCache::new();
    refresh_once(source, &cache)
        .await
        .context("fetching event listing")?;
    Ok(execute(&query, &cache.snapshot().events))
}

/// A running bot: the three background loops plus the foreground command surface.
pub struct Bot {
    commands: CommandContext,
    cache: Arc<EventCache>,
    mirror: Arc<SubscriptionMirror>,
    loops: CancellationToken,
    writer_shutdown: CancellationToken,
    refresher: PeriodicHandle,
    matcher: PeriodicHandle,
    writer: PeriodicHandle,
    shutdown_timeout: Duration,
}

impl Bot {
    pub async fn start(
        config: &BotConfig,
        source: Arc<dyn EventSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let store = SubscriptionStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening subscription store {}", config.database_url))?;
        let loaded = store.load_all().await.context("loading subscriptions")?;
        info!(subscriptions = loaded.len(), "subscription store loaded");

        let mirror = Arc::new(SubscriptionMirror::new(loaded));
        let cache = Arc::new(EventCache::new());
        if let Err(err) = refresh_once(source.as_ref(), &cache).await {
            warn!(error = %err, "initial listing fetch failed, starting with an empty cache");
        }

        let (sender, rx) = subscription_queue();
        let loops = CancellationToken::new();
        // The writer stops last so the final flush sees the matcher's last watermarks.
        let writer_shutdown = CancellationToken::new();

        let writer = spawn_periodic(
            SubscriptionWriter::new(store, Arc::clone(&mirror), rx),
            Duration::from_secs(config.drain_interval_secs),
            writer_shutdown.clone(),
        );
        let refresher = spawn_periodic(
            EventRefresher::new(source, Arc::clone(&cache)),
            Duration::from_secs(config.fetch_interval_secs),
            loops.clone(),
        );
        let matcher = spawn_periodic(
            SubscriptionMatcher::new(
                Arc::clone(&cache),
                Arc::clone(&mirror),
                sender.clone(),
                notifier,
            ),
            Duration::from_secs(config.match_interval_secs),
            loops.clone(),
        );

        Ok(Self {
            commands: CommandContext::new(Arc::clone(&cache), Arc::clone(&mirror), sender),
            cache,
            mirror,
            loops,
            writer_shutdown,
            refresher,
            matcher,
            writer,
            shutdown_timeout: config.shutdown_timeout(),
        })
    }

    pub fn handle_command<S: AsRef<str>>(
        &self,
        chat_id: i64,
        command: &str,
        args: &[S],
    ) -> Result<Reply, CommandError> {
        self.commands.handle(chat_id, command, args)
    }

    pub fn commands(&self) -> &CommandContext {
        &self.commands
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    pub fn mirror(&self) -> &SubscriptionMirror {
        &self.mirror
    }

    /// Cooperative stop with bounded joins. Returns `false` if any loop had to be abandoned.
    pub async fn shutdown(self) -> bool {
        info!("shutting down background loops");
        self.loops.cancel();
        let mut clean = true;
        for handle in [self.refresher, self.matcher] {
            clean &= handle.join(self.shutdown_timeout).await;
        }
        self.writer_shutdown.cancel();
        clean &= self.writer.join(self.shutdown_timeout).await;
        clean
    }
}
