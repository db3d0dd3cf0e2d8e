//! Cron Clock (C1): parses schedule strings into fire-time iterators.
//!
//! Grounded on the teacher's `JobSchedule` (`Every`/`Cron`), extended with
//! the macro descriptors and non-triggering sentinels spec.md §4.1 names.

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use cron::Schedule;
use regex::Regex;

const EVERY_PREFIX: &str = "@every ";

/// A parsed, validated schedule.
#[derive(Debug, Clone)]
pub enum ScheduleSpec {
    /// Fixed interval, ticking every `Duration`.
    Every(Duration),
    /// A 5-field cron expression (stored internally in the underlying cron
    /// crate's 6-field seconds-first form).
    Cron(Box<Schedule>),
    /// `@triggered` / `@manual` / `@none`: registered, never fires on a
    /// timer. Invokable only via `RunJob` or a success/failure trigger
    /// (spec.md §9, open question, resolved that way here).
    Triggered,
}

impl ScheduleSpec {
    /// Whether this schedule ever fires on its own timer.
    pub fn is_timed(&self) -> bool {
        !matches!(self, ScheduleSpec::Triggered)
    }

    /// Compute the next fire instant relative to `now`, or `None` for a
    /// non-timed schedule.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            ScheduleSpec::Every(d) => Some(now + chrono::Duration::from_std(*d).ok()?),
            ScheduleSpec::Cron(s) => s.after(&now).next(),
            ScheduleSpec::Triggered => None,
        }
    }
}

impl Display for ScheduleSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ScheduleSpec::Every(d) => {
                write!(f, "{}{}", EVERY_PREFIX, humantime::format_duration(*d))
            }
            ScheduleSpec::Cron(s) => write!(f, "{}", s),
            ScheduleSpec::Triggered => write!(f, "@triggered"),
        }
    }
}

impl FromStr for ScheduleSpec {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let s = raw.trim();

        match s {
            "@triggered" | "@manual" | "@none" => return Ok(ScheduleSpec::Triggered),
            "@yearly" | "@annually" => return cron_expr("0 0 0 1 1 *"),
            "@monthly" => return cron_expr("0 0 0 1 * *"),
            "@weekly" => return cron_expr("0 0 0 * * 0"),
            "@daily" | "@midnight" => return cron_expr("0 0 0 * * *"),
            "@hourly" => return cron_expr("0 0 * * * *"),
            _ => {}
        }

        if let Some(rest) = s.strip_prefix(EVERY_PREFIX) {
            let dur = humantime::parse_duration(rest).with_context(|| {
                format!("invalid duration in '@every' schedule: '{}'", rest)
            })?;
            if dur.is_zero() {
                bail!("'@every 0s' is invalid: a zero interval never fires");
            }
            return Ok(ScheduleSpec::Every(dur));
        }

        parse_raw_cron(s)
    }
}

/// Validate and parse a raw (non-macro) cron string per spec.md §4.1: field
/// characters restricted to digits, `*`, `,`, `-`, `/`, `?`; exactly 5
/// fields for the standard form, with an optional 6th (leading seconds)
/// field accepted for compatibility with the underlying cron engine.
fn parse_raw_cron(s: &str) -> Result<ScheduleSpec> {
    let fields: Vec<&str> = s.split_whitespace().collect();
    if fields.len() != 5 && fields.len() != 6 {
        bail!(
            "cron schedule '{}' must have 5 fields (minute hour dom month dow), \
             or 6 with a leading seconds field; got {}",
            s,
            fields.len()
        );
    }

    let field_re = Regex::new(r"^[0-9*,/?-]+$").expect("valid regex");
    for field in &fields {
        if !field_re.is_match(field) {
            bail!("invalid character in cron field '{}'", field);
        }
    }

    let normalized = if fields.len() == 5 {
        format!("0 {}", s)
    } else {
        s.to_string()
    };

    cron_expr(&normalized)
}

fn cron_expr(s: &str) -> Result<ScheduleSpec> {
    let schedule = Schedule::from_str(s)
        .map_err(|e| anyhow!("could not parse cron schedule '{}': {}", s, e))?;
    Ok(ScheduleSpec::Cron(Box::new(schedule)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_zero_is_invalid() {
        assert!(ScheduleSpec::from_str("@every 0s").is_err());
    }

    #[test]
    fn every_one_second_is_valid() {
        assert!(ScheduleSpec::from_str("@every 1s").is_ok());
    }

    #[test]
    fn triggered_sentinels_never_fire() {
        for s in ["@triggered", "@manual", "@none"] {
            let spec = ScheduleSpec::from_str(s).unwrap();
            assert!(!spec.is_timed());
            assert!(spec.next_after(Utc::now()).is_none());
        }
    }

    #[test]
    fn macros_parse() {
        for s in [
            "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
        ] {
            assert!(ScheduleSpec::from_str(s).is_ok(), "{} should parse", s);
        }
    }

    #[test]
    fn five_field_cron_parses() {
        assert!(ScheduleSpec::from_str("*/5 * * * *").is_ok());
    }

    #[test]
    fn six_field_cron_parses() {
        assert!(ScheduleSpec::from_str("0 */5 * * * *").is_ok());
    }

    #[test]
    fn bad_field_count_rejected() {
        assert!(ScheduleSpec::from_str("* * *").is_err());
    }

    #[test]
    fn bad_characters_rejected() {
        assert!(ScheduleSpec::from_str("a * * * *").is_err());
    }
}
