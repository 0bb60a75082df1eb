//! Foreground command dispatch. Never waits on the background loops.

use std::sync::Arc;

use chrono::{Local, NaiveDate};
use hbm_core::{
    command_name, execute_at, parse_query, render_events, render_subscriptions, Event, Query,
    Subscription, ValidationError, HELP_TEXT,
};
use hbm_storage::{StoreOp, SubscriptionMirror, SubscriptionSender};
use thiserror::Error;
use tracing::debug;

use crate::cache::EventCache;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Help,
    Events(Vec<Event>),
    Subscriptions(Vec<Subscription>),
    /// Accepted for writing; durability follows on the next drain.
    Subscribed { name: String, query: Query },
    Unsubscribed { name: String },
}

impl Reply {
    pub fn render(&self) -> String {
        match self {
            Reply::Help => HELP_TEXT.to_string(),
            Reply::Events(events) => render_events(events),
            Reply::Subscriptions(subs) => render_subscriptions(subs),
            Reply::Subscribed { name, query } => {
                format!("Subscribed *{name}* to /{}", query.command_line())
            }
            Reply::Unsubscribed { name } => format!("Removed subscription *{name}*"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("Subscriptions are temporarily unavailable, please try again later")]
    WriterStopped,
}

#[derive(Clone)]
pub struct CommandContext {
    cache: Arc<EventCache>,
    mirror: Arc<SubscriptionMirror>,
    sender: SubscriptionSender,
}

impl CommandContext {
    pub fn new(
        cache: Arc<EventCache>,
        mirror: Arc<SubscriptionMirror>,
        sender: SubscriptionSender,
    ) -> Self {
        Self {
            cache,
            mirror,
            sender,
        }
    }

    pub fn handle<S: AsRef<str>>(
        &self,
        chat_id: i64,
        command: &str,
        args: &[S],
    ) -> Result<Reply, CommandError> {
        self.handle_at(chat_id, command, args, Local::now().date_naive())
    }

    pub fn handle_at<S: AsRef<str>>(
        &self,
        chat_id: i64,
        command: &str,
        args: &[S],
        today: NaiveDate,
    ) -> Result<Reply, CommandError> {
        let command = command_name(command);
        debug!(chat_id, %command, args = args.len(), "handling command");
        match command.as_str() {
            "start" | "help" => Ok(Reply::Help),
            "subscribe" => self.subscribe(chat_id, args),
            _ => {
                let query = parse_query(&command, args)?;
                let snapshot = self.cache.snapshot();
                Ok(Reply::Events(execute_at(&query, &snapshot.events, today)))
            }
        }
    }

    fn subscribe<S: AsRef<str>>(&self, chat_id: i64, args: &[S]) -> Result<Reply, CommandError> {
        let args = args.iter().map(|a| a.as_ref().trim()).collect::<Vec<_>>();
        match args.as_slice() {
            [] => Err(ValidationError::MissingSubscriptionName.into()),
            [verb] if verb.eq_ignore_ascii_case("list") => {
                Ok(Reply::Subscriptions(self.mirror.list_for_chat(chat_id)))
            }
            [name] => Err(ValidationError::MissingSubscriptionQuery(name.to_string()).into()),
            [name, verb] if verb.eq_ignore_ascii_case("remove") => {
                let id = hbm_core::subscription_id(chat_id, name);
                self.submit(StoreOp::Remove { id })?;
                Ok(Reply::Unsubscribed {
                    name: name.to_string(),
                })
            }
            [name, command, rest @ ..] => {
                let query = parse_query(command, rest)?;
                // Start from the newest id so existing events are not replayed.
                let watermark = self.cache.latest_id().unwrap_or(0);
                let sub = Subscription::new(chat_id, *name, query.clone(), watermark);
                self.submit(StoreOp::Upsert(sub))?;
                Ok(Reply::Subscribed {
                    name: name.to_string(),
                    query,
                })
            }
        }
    }

    fn submit(&self, op: StoreOp) -> Result<(), CommandError> {
        if self.sender.enqueue(op) {
            Ok(())
        } else {
            Err(CommandError::WriterStopped)
        }
    }
}
