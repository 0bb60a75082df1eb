//! Core domain model for the Hiking Buddies bot: events, queries and subscriptions.

use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod query;
mod render;

pub use query::{command_name, execute, execute_at, next_monday, parse_query};
pub use render::{
    render_event_line, render_events, render_notification, render_subscriptions, HELP_TEXT,
};

pub const CRATE_NAME: &str = "hbm-core";

pub const DEFAULT_EVENT_LINK_BASE: &str = "https://www.hiking-buddies.com/routes/events/";

/// Hike difficulty on the T0 (easiest) to T6 (hardest) scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Difficulty {
    T0,
    T1,
    T2,
    T3,
    T4,
    T5,
    T6,
}

impl Difficulty {
    pub const ALL: [Difficulty; 7] = [
        Difficulty::T0,
        Difficulty::T1,
        Difficulty::T2,
        Difficulty::T3,
        Difficulty::T4,
        Difficulty::T5,
        Difficulty::T6,
    ];

    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// Parses a `T0`..`T6` token, ignoring case. Anything else is rejected.
    pub fn parse_token(token: &str) -> Option<Self> {
        let token = token.trim();
        let mut chars = token.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some('T' | 't'), Some(digit), None) => digit
                .to_digit(10)
                .and_then(|d| Self::ALL.get(d as usize).copied()),
            _ => None,
        }
    }

    /// Listing codes are trusted loosely: unknown codes fall back to T0.
    pub fn from_listing_code(code: &str) -> Self {
        Self::parse_token(code).unwrap_or(Difficulty::T0)
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.ordinal())
    }
}

/// A normalized listing entry. Snapshots are replaced wholesale, events are never edited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub name: String,
    pub difficulty: Difficulty,
    pub organiser: String,
    pub date: NaiveDateTime,
    pub link: String,
}

impl Event {
    /// Short display form, e.g. `Sat, 24.10, 07:30`.
    pub fn display_date(&self) -> String {
        self.date.format("%a, %d.%m, %H:%M").to_string()
    }
}

pub fn event_link(link_base: &str, id: u64) -> String {
    format!("{}/{id}/", link_base.trim_end_matches('/'))
}

/// A validated event query. Persisted as internally tagged JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Query {
    AllEvents,
    WeekRange { low: Difficulty, high: Difficulty },
    ByOrganiser { name: String },
}

impl Query {
    /// The command line that would produce this query.
    pub fn command_line(&self) -> String {
        match self {
            Query::AllEvents => "eventsall".to_string(),
            Query::WeekRange { low, high } => format!("eventsweek {low} {high}"),
            Query::ByOrganiser { name } => format!("eventsorganiser {name}"),
        }
    }
}

/// A named, per-chat saved query plus the highest event id already delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub chat_id: i64,
    pub name: String,
    pub query: Query,
    pub watermark: u64,
}

impl Subscription {
    pub fn new(chat_id: i64, name: impl Into<String>, query: Query, watermark: u64) -> Self {
        let name = name.into();
        Self {
            id: subscription_id(chat_id, &name),
            chat_id,
            name,
            query,
            watermark,
        }
    }
}

/// Chat ids never contain `_`, so the first separator splits the id unambiguously.
pub fn subscription_id(chat_id: i64, name: &str) -> String {
    format!("{chat_id}_{name}")
}

/// Rejected user input. The message is shown to the user as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unknown command '{0}'. Send /help for the list of commands.")]
    UnknownCommand(String),
    #[error("'{0}' is not a difficulty. Use T0 to T6, e.g. /eventsweek T2 T4")]
    InvalidDifficulty(String),
    #[error("/{command} takes at most {max} argument(s)")]
    TooManyArguments { command: String, max: usize },
    #[error("Please specify the organiser name")]
    MissingOrganiser,
    #[error("Please specify a subscription name, e.g. /subscribe weekend eventsweek T3")]
    MissingSubscriptionName,
    #[error("Please specify what '{0}' should watch, e.g. /subscribe {0} eventsall")]
    MissingSubscriptionQuery(String),
    #[error("Date range queries are not supported yet")]
    DateRangeUnsupported,
}
