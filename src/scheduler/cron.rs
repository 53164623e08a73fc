// backupscheduler/src/scheduler/cron.rs
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::errors::{AppError, Result};

/// A parsed trigger expression, evaluated in UTC.
///
/// Accepts standard 5-field cron (`min hour dom month dow`, Sunday = 0 or 7);
/// seconds are prepended as `0`. 6- and 7-field forms (with seconds, optional year) are
/// passed through unchanged.
#[derive(Debug, Clone)]
pub struct TriggerExpression {
    source: String,
    schedule: cron::Schedule,
}

fn invalid(expression: &str, reason: impl Into<String>) -> AppError {
    AppError::InvalidTrigger {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn normalize(expression: &str) -> Result<String> {
    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => {
            fields[4] = day_of_week(expression, &fields[4])?;
            Ok(format!("0 {}", fields.join(" ")))
        }
        6 | 7 => Ok(fields.join(" ")),
        n => Err(invalid(expression, format!("expected 5 fields, found {}", n))),
    }
}

/// Rewrites a 5-field day-of-week (0-7, Sunday = 0 or 7) into the `cron`
/// crate's numbering (1-7, Sunday = 1). Names and `*` pass through.
fn day_of_week(expression: &str, field: &str) -> Result<String> {
    let mut items = Vec::new();
    for item in field.split(',') {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => (base, Some(step)),
            None => (item, None),
        };
        let mapped = match base.split_once('-') {
            Some((start, end)) => match (
                weekday_number(expression, start)?,
                weekday_number(expression, end)?,
            ) {
                (Some(start), Some(end)) if start > end => {
                    return Err(invalid(
                        expression,
                        format!("day-of-week range {} is reversed", base),
                    ));
                }
                (Some(0), Some(7)) => "1-7".to_string(),
                (Some(7), Some(7)) => "1".to_string(),
                // Saturday through Sunday wraps in the crate's numbering.
                (Some(start), Some(7)) => {
                    if step.is_some() {
                        return Err(invalid(
                            expression,
                            format!("day-of-week range {} cannot take a step", base),
                        ));
                    }
                    items.push("1".to_string());
                    format!("{}-7", start + 1)
                }
                (Some(start), Some(end)) => format!("{}-{}", start + 1, end + 1),
                _ => base.to_string(),
            },
            None => match weekday_number(expression, base)? {
                Some(0) | Some(7) => "1".to_string(),
                Some(day) => (day + 1).to_string(),
                None => base.to_string(),
            },
        };
        items.push(match step {
            Some(step) => format!("{}/{}", mapped, step),
            None => mapped,
        });
    }
    Ok(items.join(","))
}

/// `Some(n)` for a numeric weekday, `None` for names and wildcards.
fn weekday_number(expression: &str, value: &str) -> Result<Option<u8>> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(None);
    }
    match value.parse::<u8>() {
        Ok(day) if day <= 7 => Ok(Some(day)),
        _ => Err(invalid(expression, format!("day-of-week {} is out of range 0-7", value))),
    }
}

impl TriggerExpression {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = normalize(expression)?;
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| invalid(expression, e.to_string()))?;
        Ok(Self {
            source: expression.trim().to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First fire strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        self.schedule
            .after(&now)
            .next()
            .ok_or_else(|| invalid(&self.source, "expression never fires again"))
    }
}
