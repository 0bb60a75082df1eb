//! Scripted collaborators shared by the unit tests of this crate.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use hbm_adapters::{EventSource, RawRow};
use hbm_storage::FetchError;
use serde_json::json;

use crate::matcher::{Notification, Notifier};

/// Replays queued fetch outcomes in order, then keeps failing.
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<Vec<RawRow>, FetchError>>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<Vec<RawRow>, FetchError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
        }
    }

    pub fn unavailable() -> FetchError {
        FetchError::HttpStatus {
            status: 503,
            url: "http://listing.test/".into(),
        }
    }
}

#[async_trait]
impl EventSource for ScriptedSource {
    fn source_id(&self) -> &'static str {
        "scripted"
    }

    async fn fetch_listing(&self) -> Result<Vec<RawRow>, FetchError> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(Self::unavailable()))
    }
}

pub fn row(id: u64, difficulty: &str, date: &str) -> RawRow {
    RawRow(vec![
        json!(""),
        json!(format!("Hike {id}")),
        json!(difficulty),
        json!("Amit"),
        json!(date),
        json!(id),
    ])
}

pub fn organised_row(id: u64, difficulty: &str, organiser: &str, date: &str) -> RawRow {
    let mut raw = row(id, difficulty, date);
    raw.0[3] = json!(organiser);
    raw
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<Notification>>,
    pub fail: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail: Mutex::new(true),
        }
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        if *self.fail.lock().unwrap() {
            anyhow::bail!("chat {} unreachable", notification.chat_id);
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}
