//! Schedule adapter: turns a schedule expression into concrete instants.
//!
//! Two expression forms are accepted:
//!
//! - cron, via the `cron` crate. Five fields (`min hour dom mon dow`) run at
//!   second zero; six fields add seconds; seven add a year.
//! - `every <N> <unit>`, e.g. `every 5 seconds` or `every hour`. Occurrences
//!   are the multiples of the period counted from the Unix epoch.
//!
//! Everything here is pure: no clock is read.

use chrono::{DateTime, TimeZone, Utc};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound on a derived polling interval, so sparse schedules are still
/// re-scanned at least hourly.
pub const MAX_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct Schedule {
    expr: String,
    kind: Kind,
}

#[derive(Debug, Clone)]
enum Kind {
    Cron(Box<cron::Schedule>),
    Every { period_ms: i64 },
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let invalid = |reason: String| Error::Schedule {
            expr: expr.to_string(),
            reason,
        };

        let kind = if let Some(rest) = strip_prefix_ignore_case(trimmed, "every") {
            Kind::Every {
                period_ms: parse_every(rest).map_err(invalid)?,
            }
        } else {
            let normalized = match trimmed.split_whitespace().count() {
                _ if trimmed.starts_with('@') => trimmed.to_string(),
                5 => format!("0 {trimmed}"),
                6 | 7 => trimmed.to_string(),
                n => return Err(invalid(format!("expected 5 to 7 cron fields, got {n}"))),
            };
            let schedule =
                cron::Schedule::from_str(&normalized).map_err(|e| invalid(e.to_string()))?;
            Kind::Cron(Box::new(schedule))
        };

        Ok(Self {
            expr: trimmed.to_string(),
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// First occurrence strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(schedule) => schedule.after(&after).next(),
            Kind::Every { period_ms } => {
                let next = after
                    .timestamp_millis()
                    .div_euclid(*period_ms)
                    .checked_add(1)?
                    .checked_mul(*period_ms)?;
                Utc.timestamp_millis_opt(next).single()
            }
        }
    }

    /// Up to `n` consecutive occurrences strictly after `after`. Fewer are
    /// returned when the schedule runs out.
    pub fn next_occurrences(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        match &self.kind {
            Kind::Cron(schedule) => schedule.after(&after).take(n).collect(),
            Kind::Every { .. } => {
                let mut out = Vec::with_capacity(n);
                let mut cursor = after;
                while out.len() < n {
                    match self.next_after(cursor) {
                        Some(next) => {
                            out.push(next);
                            cursor = next;
                        }
                        None => break,
                    }
                }
                out
            }
        }
    }
}

impl FromStr for Schedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Schedule::parse(s)
    }
}

impl std::fmt::Display for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.expr)
    }
}

/// Fixed instant interval derivation measures from, so the result does not
/// depend on when the process starts.
pub fn reference_instant() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Polling period for a schedule: the gap between its first two occurrences
/// after [`reference_instant`], capped at [`MAX_INTERVAL`].
pub fn schedule_to_interval(schedule: &Schedule) -> Result<Duration> {
    let occurrences = schedule.next_occurrences(reference_instant(), 2);
    let [first, second] = occurrences.as_slice() else {
        return Err(Error::Schedule {
            expr: schedule.to_string(),
            reason: format!(
                "needs two occurrences after {} to derive an interval, found {}",
                reference_instant(),
                occurrences.len()
            ),
        });
    };

    let gap = (*second - *first).to_std().map_err(|_| Error::Schedule {
        expr: schedule.to_string(),
        reason: "occurrences are not increasing".to_string(),
    })?;
    if gap.is_zero() {
        return Err(Error::Schedule {
            expr: schedule.to_string(),
            reason: "consecutive occurrences coincide".to_string(),
        });
    }
    Ok(gap.min(MAX_INTERVAL))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    let rest = &s[prefix.len()..];
    (head.eq_ignore_ascii_case(prefix) && (rest.is_empty() || rest.starts_with(' ')))
        .then_some(rest.trim())
}

/// `"5 seconds"`, `"minute"`, `"2 h"` → period in milliseconds.
fn parse_every(rest: &str) -> std::result::Result<i64, String> {
    let mut parts = rest.split_whitespace();
    let (count, unit) = match (parts.next(), parts.next(), parts.next()) {
        (Some(n), Some(unit), None) => (
            n.parse::<i64>()
                .map_err(|_| format!("'{n}' is not a whole number"))?,
            unit,
        ),
        (Some(unit), None, None) => (1, unit),
        _ => return Err("expected 'every <N> <unit>'".to_string()),
    };
    if count <= 0 {
        return Err("period must be positive".to_string());
    }

    let unit_ms: i64 = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600_000,
        "d" | "day" | "days" => 86_400_000,
        _ => return Err(format!("unknown unit '{unit}'")),
    };
    count
        .checked_mul(unit_ms)
        .ok_or_else(|| format!("period of {count} {unit} is too large"))
}
