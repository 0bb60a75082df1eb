//! Runs every subscription against the latest snapshot and delivers only unseen events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use hbm_core::{execute_at, render_notification, Event};
use hbm_storage::{StoreOp, SubscriptionMirror, SubscriptionSender};
use tracing::{debug, info, warn};

use crate::cache::EventCache;
use crate::runner::PeriodicTask;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub chat_id: i64,
    pub subscription_name: String,
    pub events: Vec<Event>,
}

impl Notification {
    pub fn render(&self) -> String {
        render_notification(&self.subscription_name, &self.events)
    }
}

/// Delivery channel to a chat. An error means the chat did not get the message.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchReport {
    pub notified: usize,
    pub failed: usize,
    pub advanced: usize,
}

pub struct SubscriptionMatcher {
    cache: Arc<EventCache>,
    mirror: Arc<SubscriptionMirror>,
    sender: SubscriptionSender,
    notifier: Arc<dyn Notifier>,
    /// Watermarks sent to the writer but possibly not yet visible in the mirror.
    enqueued: HashMap<String, u64>,
}

impl SubscriptionMatcher {
    pub fn new(
        cache: Arc<EventCache>,
        mirror: Arc<SubscriptionMirror>,
        sender: SubscriptionSender,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cache,
            mirror,
            sender,
            notifier,
            enqueued: HashMap::new(),
        }
    }

    pub async fn run_cycle_at(&mut self, today: NaiveDate) -> MatchReport {
        let mut report = MatchReport::default();
        let snapshot = self.cache.snapshot();
        let Some(latest) = snapshot.max_id else {
            debug!("no events cached yet, skipping match cycle");
            return report;
        };

        let subscriptions = self.mirror.list();
        self.enqueued.retain(|id, pending| {
            subscriptions
                .iter()
                .any(|s| &s.id == id && s.watermark < *pending)
        });

        for sub in subscriptions {
            let seen = self
                .enqueued
                .get(&sub.id)
                .map_or(sub.watermark, |pending| sub.watermark.max(*pending));

            let fresh = execute_at(&sub.query, &snapshot.events, today)
                .into_iter()
                .filter(|e| e.id > seen)
                .collect::<Vec<_>>();

            if !fresh.is_empty() {
                let notification = Notification {
                    chat_id: sub.chat_id,
                    subscription_name: sub.name.clone(),
                    events: fresh,
                };
                if let Err(err) = self.notifier.notify(&notification).await {
                    warn!(subscription = %sub.id, error = %err, "notification failed, watermark kept");
                    report.failed += 1;
                    continue;
                }
                report.notified += 1;
            }

            let next = seen.max(latest);
            if next > seen {
                self.sender.enqueue(StoreOp::SetWatermark {
                    id: sub.id.clone(),
                    watermark: next,
                });
                self.enqueued.insert(sub.id, next);
                report.advanced += 1;
            }
        }
        report
    }
}

#[async_trait]
impl PeriodicTask for SubscriptionMatcher {
    fn name(&self) -> &'static str {
        "subscription-matcher"
    }

    async fn run_cycle(&mut self) {
        let report = self.run_cycle_at(Local::now().date_naive()).await;
        if report.notified > 0 || report.failed > 0 {
            info!(
                notified = report.notified,
                failed = report.failed,
                advanced = report.advanced,
                "match cycle finished"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{organised_row, row, RecordingNotifier};
    use hbm_adapters::normalize_rows;
    use hbm_core::{Difficulty, Query, Subscription, DEFAULT_EVENT_LINK_BASE};
    use hbm_storage::{subscription_queue, SubscriptionStore, SubscriptionWriter};

    struct Harness {
        cache: Arc<EventCache>,
        mirror: Arc<SubscriptionMirror>,
        writer: SubscriptionWriter,
        notifier: Arc<RecordingNotifier>,
        matcher: SubscriptionMatcher,
    }

    async fn harness(subs: Vec<Subscription>, notifier: RecordingNotifier) -> Harness {
        let store = SubscriptionStore::connect("sqlite::memory:").await.unwrap();
        let mirror = Arc::new(SubscriptionMirror::new(Vec::new()));
        let (sender, rx) = subscription_queue();
        let mut writer = SubscriptionWriter::new(store, Arc::clone(&mirror), rx);
        for sub in subs {
            sender.enqueue(StoreOp::Upsert(sub));
        }
        writer.drain_and_commit().await.unwrap();

        let cache = Arc::new(EventCache::new());
        let notifier = Arc::new(notifier);
        let matcher = SubscriptionMatcher::new(
            Arc::clone(&cache),
            Arc::clone(&mirror),
            sender,
            notifier.clone(),
        );
        Harness {
            cache,
            mirror,
            writer,
            notifier,
            matcher,
        }
    }

    fn load(cache: &EventCache, rows: Vec<hbm_adapters::RawRow>) {
        cache.refresh(normalize_rows(rows, DEFAULT_EVENT_LINK_BASE));
    }

    fn today() -> NaiveDate {
        // A Monday; the week runs until midnight of 2026-10-26.
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn watermark(h: &Harness, id: &str) -> Option<u64> {
        h.mirror.get(id).map(|s| s.watermark)
    }

    #[tokio::test]
    async fn delivers_only_events_above_watermark() {
        let mut h = harness(
            vec![Subscription::new(1, "all", Query::AllEvents, 5)],
            RecordingNotifier::default(),
        )
        .await;
        load(
            &h.cache,
            vec![row(5, "T2", "3,21,10,2026,8,0"), row(7, "T3", "6,24,10,2026,7,30")],
        );

        let report = h.matcher.run_cycle_at(today()).await;
        assert_eq!(report, MatchReport { notified: 1, failed: 0, advanced: 1 });

        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].chat_id, 1);
        assert_eq!(sent[0].events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![7]);
        assert!(sent[0].render().starts_with("*all*: 1 new event(s)\n"));

        h.writer.drain_and_commit().await.unwrap();
        assert_eq!(watermark(&h, "1_all"), Some(7));
    }

    #[tokio::test]
    async fn watermark_advances_even_without_matches() {
        let mut h = harness(
            vec![Subscription::new(
                1,
                "lena",
                Query::ByOrganiser { name: "lena".into() },
                0,
            )],
            RecordingNotifier::default(),
        )
        .await;
        load(&h.cache, vec![organised_row(9, "T2", "Amit", "3,21,10,2026,8,0")]);

        let report = h.matcher.run_cycle_at(today()).await;
        assert_eq!(report.notified, 0);
        assert_eq!(report.advanced, 1);
        h.writer.drain_and_commit().await.unwrap();
        assert_eq!(watermark(&h, "1_lena"), Some(9));

        // A later event by Lena below the new watermark is never delivered.
        load(
            &h.cache,
            vec![
                organised_row(8, "T2", "Lena", "3,21,10,2026,8,0"),
                organised_row(9, "T2", "Amit", "3,21,10,2026,8,0"),
            ],
        );
        h.matcher.run_cycle_at(today()).await;
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_keeps_watermark_for_retry() {
        let mut h = harness(
            vec![Subscription::new(1, "all", Query::AllEvents, 0)],
            RecordingNotifier::failing(),
        )
        .await;
        load(&h.cache, vec![row(3, "T2", "3,21,10,2026,8,0")]);

        let report = h.matcher.run_cycle_at(today()).await;
        assert_eq!(report, MatchReport { notified: 0, failed: 1, advanced: 0 });
        h.writer.drain_and_commit().await.unwrap();
        assert_eq!(watermark(&h, "1_all"), Some(0));

        h.notifier.set_failing(false);
        h.matcher.run_cycle_at(today()).await;
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn no_duplicate_before_watermark_is_committed() {
        let mut h = harness(
            vec![Subscription::new(1, "all", Query::AllEvents, 0)],
            RecordingNotifier::default(),
        )
        .await;
        load(&h.cache, vec![row(4, "T2", "3,21,10,2026,8,0")]);

        h.matcher.run_cycle_at(today()).await;
        // Writer has not run yet: the mirror still shows the old watermark.
        assert_eq!(watermark(&h, "1_all"), Some(0));
        let second = h.matcher.run_cycle_at(today()).await;
        assert_eq!(second, MatchReport::default());
        assert_eq!(h.notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn week_range_limits_notifications() {
        let mut h = harness(
            vec![Subscription::new(
                2,
                "hard",
                Query::WeekRange {
                    low: Difficulty::T4,
                    high: Difficulty::T6,
                },
                0,
            )],
            RecordingNotifier::default(),
        )
        .await;
        load(
            &h.cache,
            vec![
                row(10, "T5", "3,21,10,2026,8,0"),
                row(11, "T2", "3,21,10,2026,8,0"),
                // Next week, outside the window.
                row(12, "T5", "1,26,10,2026,8,0"),
            ],
        );

        h.matcher.run_cycle_at(today()).await;
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![10]);
        h.writer.drain_and_commit().await.unwrap();
        assert_eq!(watermark(&h, "2_hard"), Some(12));
    }

    #[tokio::test]
    async fn empty_cache_skips_cycle() {
        let mut h = harness(
            vec![Subscription::new(1, "all", Query::AllEvents, 0)],
            RecordingNotifier::default(),
        )
        .await;
        assert_eq!(h.matcher.run_cycle_at(today()).await, MatchReport::default());
        assert_eq!(h.writer.drain_and_commit().await.unwrap(), 0);
    }
}
