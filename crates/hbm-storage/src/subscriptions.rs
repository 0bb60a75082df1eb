//! SQLite-backed subscription persistence, its in-memory mirror and the serial write queue.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hbm_core::{Query, Subscription};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("subscription store unavailable: {0}")]
    Database(#[from] sqlx::Error),
    #[error("encoding subscription query: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A single mutation, applied in queue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Insert or fully replace by id.
    Upsert(Subscription),
    Remove { id: String },
    /// Only touches rows that still exist; never resurrects a removed subscription.
    SetWatermark { id: String, watermark: u64 },
}

#[derive(Debug, Clone)]
pub struct SubscriptionStore {
    pool: SqlitePool,
}

impl SubscriptionStore {
    /// Opens (creating if missing) the database at `database_url` and ensures the schema.
    pub async fn connect(database_url: &str) -> Result<Self, PersistenceError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A single long-lived connection: one writer, and `sqlite::memory:` stays alive.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub async fn ensure_schema(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS subscriptions (
                id      TEXT PRIMARY KEY,
                chat_id INTEGER NOT NULL,
                name    TEXT NOT NULL,
                query   TEXT NOT NULL,
                last_id INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn load_all(&self) -> Result<Vec<Subscription>, PersistenceError> {
        let rows = sqlx::query(
            "SELECT id, chat_id, name, query, last_id FROM subscriptions ORDER BY chat_id, name",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let raw_query: String = row.try_get("query")?;
            let query: Query = match serde_json::from_str(&raw_query) {
                Ok(query) => query,
                Err(err) => {
                    warn!(%id, error = %err, "skipping subscription with unreadable query");
                    continue;
                }
            };
            let last_id: i64 = row.try_get("last_id")?;
            out.push(Subscription {
                id,
                chat_id: row.try_get("chat_id")?,
                name: row.try_get("name")?,
                query,
                watermark: u64::try_from(last_id).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Applies `ops` in order inside one transaction. Nothing is committed on error.
    pub async fn apply(&self, ops: &[StoreOp]) -> Result<(), PersistenceError> {
        let mut tx = self.pool.begin().await?;
        for op in ops {
            match op {
                StoreOp::Upsert(sub) => {
                    let query = serde_json::to_string(&sub.query)?;
                    sqlx::query(
                        r#"
                        INSERT INTO subscriptions (id, chat_id, name, query, last_id)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(id) DO UPDATE SET
                            chat_id = excluded.chat_id,
                            name    = excluded.name,
                            query   = excluded.query,
                            last_id = excluded.last_id
                        "#,
                    )
                    .bind(&sub.id)
                    .bind(sub.chat_id)
                    .bind(&sub.name)
                    .bind(query)
                    .bind(to_db_id(sub.watermark))
                    .execute(&mut *tx)
                    .await?;
                }
                StoreOp::Remove { id } => {
                    sqlx::query("DELETE FROM subscriptions WHERE id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                StoreOp::SetWatermark { id, watermark } => {
                    sqlx::query("UPDATE subscriptions SET last_id = ? WHERE id = ?")
                        .bind(to_db_id(*watermark))
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_db_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

/// Read-mostly copy of the persisted subscriptions, swapped after each commit.
#[derive(Debug)]
pub struct SubscriptionMirror {
    inner: ArcSwap<BTreeMap<String, Subscription>>,
}

impl SubscriptionMirror {
    pub fn new(subscriptions: Vec<Subscription>) -> Self {
        let map = subscriptions
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect::<BTreeMap<_, _>>();
        Self {
            inner: ArcSwap::from_pointee(map),
        }
    }

    pub fn list(&self) -> Vec<Subscription> {
        self.inner.load().values().cloned().collect()
    }

    pub fn list_for_chat(&self, chat_id: i64) -> Vec<Subscription> {
        self.inner
            .load()
            .values()
            .filter(|s| s.chat_id == chat_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.inner.load().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mirrors a committed batch. Only the writer calls this, so read-modify-swap is safe.
    pub fn apply(&self, ops: &[StoreOp]) {
        let mut next = BTreeMap::clone(&self.inner.load());
        for op in ops {
            match op {
                StoreOp::Upsert(sub) => {
                    next.insert(sub.id.clone(), sub.clone());
                }
                StoreOp::Remove { id } => {
                    next.remove(id);
                }
                StoreOp::SetWatermark { id, watermark } => {
                    if let Some(sub) = next.get_mut(id) {
                        sub.watermark = *watermark;
                    }
                }
            }
        }
        self.inner.store(Arc::new(next));
    }
}

/// Cheap, cloneable producer side of the write queue. Never blocks.
#[derive(Debug, Clone)]
pub struct SubscriptionSender {
    tx: mpsc::UnboundedSender<StoreOp>,
}

impl SubscriptionSender {
    /// Returns `false` once the writer is gone.
    pub fn enqueue(&self, op: StoreOp) -> bool {
        match self.tx.send(op) {
            Ok(()) => true,
            Err(err) => {
                warn!(op = ?err.0, "subscription writer stopped, dropping mutation");
                false
            }
        }
    }
}

pub fn subscription_queue() -> (SubscriptionSender, mpsc::UnboundedReceiver<StoreOp>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SubscriptionSender { tx }, rx)
}

/// The only component that writes to the store.
pub struct SubscriptionWriter {
    store: SubscriptionStore,
    mirror: Arc<SubscriptionMirror>,
    rx: mpsc::UnboundedReceiver<StoreOp>,
    pending: Vec<StoreOp>,
}

impl SubscriptionWriter {
    pub fn new(
        store: SubscriptionStore,
        mirror: Arc<SubscriptionMirror>,
        rx: mpsc::UnboundedReceiver<StoreOp>,
    ) -> Self {
        Self {
            store,
            mirror,
            rx,
            pending: Vec::new(),
        }
    }

    /// Operations dequeued but not yet committed.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn store(&self) -> &SubscriptionStore {
        &self.store
    }

    /// Drains the queue until empty and commits everything once.
    ///
    /// On failure the batch stays pending and is retried on the next call.
    pub async fn drain_and_commit(&mut self) -> Result<usize, PersistenceError> {
        while let Ok(op) = self.rx.try_recv() {
            self.pending.push(op);
        }
        if self.pending.is_empty() {
            return Ok(0);
        }

        self.store.apply(&self.pending).await?;
        self.mirror.apply(&self.pending);
        let committed = self.pending.len();
        self.pending.clear();
        debug!(committed, "subscription batch committed");
        Ok(committed)
    }
}
