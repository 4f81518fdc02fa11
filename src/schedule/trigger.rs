//! Trigger expressions: when a schedule should fire.
//!
//! Three forms are accepted from user input:
//! - `in:<n><unit>` with unit `s`, `m`, or `h` (relative offset)
//! - an RFC 3339 timestamp (absolute, one-shot)
//! - a cron expression, evaluated in the schedule's timezone

use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ScheduleError;

static RELATIVE_TRIGGER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^in:(\d+)([smh])$").unwrap());

/// When a schedule should fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire on a cron expression, evaluated in the schedule's timezone.
    Cron { expr: String },
    /// Fire once at an absolute timestamp.
    At { timestamp: DateTime<Utc> },
    /// Fire after a relative offset from creation (or from the previous
    /// fire, when recurring).
    In { offset: Duration },
}

impl Trigger {
    /// The string tag stored in the DB trigger_type column.
    pub fn type_tag(&self) -> &'static str {
        match self {
            Trigger::Cron { .. } => "cron",
            Trigger::At { .. } => "at",
            Trigger::In { .. } => "in",
        }
    }

    /// Parse a trigger from user input.
    ///
    /// Tries the relative `in:` form first, then an RFC 3339 timestamp,
    /// then a cron expression.
    pub fn parse(input: &str) -> Result<Self, ScheduleError> {
        let input = input.trim();

        if let Some(caps) = RELATIVE_TRIGGER.captures(input) {
            let amount: u64 = caps[1].parse().map_err(|_| {
                ScheduleError::InvalidTrigger(format!("offset out of range: {input}"))
            })?;
            let secs = match &caps[2] {
                "s" => amount,
                "m" => amount * 60,
                "h" => amount * 3600,
                _ => unreachable!(),
            };
            return Ok(Trigger::In {
                offset: Duration::from_secs(secs),
            });
        }
        if input.starts_with("in:") {
            return Err(ScheduleError::InvalidTrigger(format!(
                "relative trigger must be in:<n><s|m|h>, got '{input}'"
            )));
        }

        if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
            return Ok(Trigger::At {
                timestamp: ts.with_timezone(&Utc),
            });
        }

        match cron::Schedule::from_str(input) {
            Ok(_) => Ok(Trigger::Cron {
                expr: input.to_string(),
            }),
            Err(e) => Err(ScheduleError::InvalidTrigger(format!(
                "'{input}' is not a relative offset, RFC 3339 timestamp, or cron expression: {e}"
            ))),
        }
    }

    /// Parse a trigger from its DB representation.
    pub fn from_db(trigger_type: &str, config: serde_json::Value) -> Result<Self, String> {
        match trigger_type {
            "cron" => {
                let expr = config
                    .get("expr")
                    .and_then(|v| v.as_str())
                    .ok_or("cron trigger missing 'expr'")?
                    .to_string();
                Ok(Trigger::Cron { expr })
            }
            "at" => {
                let raw = config
                    .get("timestamp")
                    .and_then(|v| v.as_str())
                    .ok_or("at trigger missing 'timestamp'")?;
                let timestamp = DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| format!("at trigger has invalid timestamp: {e}"))?
                    .with_timezone(&Utc);
                Ok(Trigger::At { timestamp })
            }
            "in" => {
                let secs = config
                    .get("offset_secs")
                    .and_then(|v| v.as_u64())
                    .ok_or("in trigger missing 'offset_secs'")?;
                Ok(Trigger::In {
                    offset: Duration::from_secs(secs),
                })
            }
            other => Err(format!("unknown trigger type: {other}")),
        }
    }

    /// Serialize trigger-specific config to JSON for DB storage.
    pub fn to_config_json(&self) -> serde_json::Value {
        match self {
            Trigger::Cron { expr } => serde_json::json!({ "expr": expr }),
            Trigger::At { timestamp } => {
                serde_json::json!({ "timestamp": timestamp.to_rfc3339() })
            }
            Trigger::In { offset } => serde_json::json!({ "offset_secs": offset.as_secs() }),
        }
    }

    /// First fire time for a schedule created at `from`.
    ///
    /// An absolute timestamp already in the past is returned as-is; the
    /// scheduler fires it on its next tick rather than dropping it.
    pub fn initial_fire(
        &self,
        from: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Trigger::Cron { .. } => self.next_fire_after(from, tz),
            Trigger::At { timestamp } => Ok(Some(*timestamp)),
            Trigger::In { offset } => Ok(Some(from + chrono_offset(*offset)?)),
        }
    }

    /// Next fire time strictly after `after`, used once a firing happened.
    ///
    /// Absolute triggers are one-shot and return `None`. Relative triggers
    /// measure their offset from the previous fire.
    pub fn next_fire_after(
        &self,
        after: DateTime<Utc>,
        tz: Tz,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match self {
            Trigger::Cron { expr } => {
                let schedule = cron::Schedule::from_str(expr)
                    .map_err(|e| ScheduleError::InvalidTrigger(format!("invalid cron '{expr}': {e}")))?;
                Ok(schedule
                    .after(&after.with_timezone(&tz))
                    .next()
                    .map(|t| t.with_timezone(&Utc)))
            }
            Trigger::At { .. } => Ok(None),
            Trigger::In { offset } => Ok(Some(after + chrono_offset(*offset)?)),
        }
    }
}

/// Parse and validate a timezone name.
pub fn parse_timezone(name: &str) -> Result<Tz, ScheduleError> {
    name.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(name.to_string()))
}

fn chrono_offset(offset: Duration) -> Result<chrono::Duration, ScheduleError> {
    chrono::Duration::from_std(offset)
        .map_err(|_| ScheduleError::InvalidTrigger(format!("offset out of range: {offset:?}")))
}
