use chrono::{Datelike, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime};

use crate::{Difficulty, Event, Query, ValidationError};

/// Normalizes `/eventsall@SomeBot` style names down to `eventsall`.
pub fn command_name(raw: &str) -> String {
    let name = raw.trim().trim_start_matches('/');
    let name = name.split('@').next().unwrap_or(name);
    name.to_ascii_lowercase()
}

/// Turns a command name and its free-form arguments into a validated [`Query`].
pub fn parse_query<S: AsRef<str>>(command: &str, args: &[S]) -> Result<Query, ValidationError> {
    let command = command_name(command);
    match command.as_str() {
        "eventsall" => {
            if !args.is_empty() {
                return Err(ValidationError::TooManyArguments { command, max: 0 });
            }
            Ok(Query::AllEvents)
        }
        "eventsweek" => {
            if args.len() > 2 {
                return Err(ValidationError::TooManyArguments { command, max: 2 });
            }
            let low = difficulty_arg(args.first(), Difficulty::T1)?;
            let high = difficulty_arg(args.get(1), Difficulty::T6)?;
            Ok(Query::WeekRange { low, high })
        }
        "eventsorganiser" => {
            let name = args
                .iter()
                .map(|a| a.as_ref().trim())
                .filter(|a| !a.is_empty())
                .collect::<Vec<_>>()
                .join(" ");
            if name.is_empty() {
                return Err(ValidationError::MissingOrganiser);
            }
            Ok(Query::ByOrganiser { name })
        }
        "eventsdate" => Err(ValidationError::DateRangeUnsupported),
        _ => Err(ValidationError::UnknownCommand(command)),
    }
}

fn difficulty_arg<S: AsRef<str>>(
    arg: Option<&S>,
    default: Difficulty,
) -> Result<Difficulty, ValidationError> {
    match arg {
        None => Ok(default),
        Some(token) => Difficulty::parse_token(token.as_ref())
            .ok_or_else(|| ValidationError::InvalidDifficulty(token.as_ref().to_string())),
    }
}

/// Midnight of the next Monday strictly after `today`.
pub fn next_monday(today: NaiveDate) -> NaiveDateTime {
    let days_ahead = 7 - i64::from(today.weekday().num_days_from_monday());
    (today + Duration::days(days_ahead)).and_time(NaiveTime::MIN)
}

/// Evaluates `query` against `events` using the local calendar date.
pub fn execute(query: &Query, events: &[Event]) -> Vec<Event> {
    execute_at(query, events, Local::now().date_naive())
}

/// Order-preserving filter of `events`; the snapshot order is never changed.
pub fn execute_at(query: &Query, events: &[Event], today: NaiveDate) -> Vec<Event> {
    match query {
        Query::AllEvents => events.to_vec(),
        Query::WeekRange { low, high } => {
            let cutoff = next_monday(today);
            events
                .iter()
                .filter(|e| e.date < cutoff && *low <= e.difficulty && e.difficulty <= *high)
                .cloned()
                .collect()
        }
        Query::ByOrganiser { name } => {
            let needle = name.to_lowercase();
            events
                .iter()
                .filter(|e| e.organiser.to_lowercase().contains(&needle))
                .cloned()
                .collect()
        }
    }
}
