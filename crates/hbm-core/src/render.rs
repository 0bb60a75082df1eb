use crate::{Event, Subscription};

pub const HELP_TEXT: &str = "\
Hello, I am the unofficial Hiking Buddies Munich bot.
I can look up events by organiser, date and difficulty, and watch for new ones.
Commands:
  /eventsall : list all upcoming events
  /eventsweek : events until the coming Sunday
  /eventsweek <low> : this week's events from difficulty <low> up, e.g. /eventsweek T4
  /eventsweek <low> <high> : this week's events within a difficulty range (T0-T6)
  /eventsorganiser <name> : events by organiser, e.g. /eventsorganiser Amit
  /subscribe list : show your subscriptions
  /subscribe <name> <command> [args] : get notified about new events, e.g. /subscribe hard eventsweek T5
  /subscribe <name> remove : stop a subscription";

const NO_EVENTS: &str = "No events found.";

/// One Markdown line per event. Square brackets in names would break the link syntax.
pub fn render_event_line(event: &Event) -> String {
    format!(
        "*{:>4}.*  [{}]({})  {}  __{}__  {}",
        event.id,
        event.name.replace('[', "<").replace(']', ">"),
        event.link,
        event.difficulty,
        event.organiser,
        event.display_date()
    )
}

pub fn render_events(events: &[Event]) -> String {
    if events.is_empty() {
        return NO_EVENTS.to_string();
    }
    events
        .iter()
        .map(render_event_line)
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_notification(subscription_name: &str, events: &[Event]) -> String {
    format!(
        "*{}*: {} new event(s)\n{}",
        subscription_name,
        events.len(),
        render_events(events)
    )
}

pub fn render_subscriptions(subscriptions: &[Subscription]) -> String {
    if subscriptions.is_empty() {
        return "You have no subscriptions.".to_string();
    }
    subscriptions
        .iter()
        .map(|s| {
            format!(
                "*{}*: /{} (last seen #{})",
                s.name,
                s.query.command_line(),
                s.watermark
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}
