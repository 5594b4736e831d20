//! Cron expression evaluation
//!
//! Accepts the standard 5-field form (minute, hour, day-of-month, month,
//! day-of-week) and the 6-field form with a leading seconds column. The
//! underlying `cron` crate is seconds-first, so 5-field input gains a
//! zero seconds column before parsing.

use std::str::FromStr;

use chrono::{DateTime, Utc};

/// Error type for schedule operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum ScheduleError {
    /// Expression failed to parse or has the wrong number of fields
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidExpression { expr: String, reason: String },

    /// Expression parses but never fires after the given time
    #[error("cron expression {0:?} has no upcoming fire time")]
    NoUpcomingFire(String),
}

/// A parsed, reusable cron schedule
///
/// # Example
///
/// ```
/// use taskforge::CronSchedule;
///
/// let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
/// let next = schedule.next_after(0).unwrap();
/// assert_eq!(next, 300);
/// ```
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
}

impl CronSchedule {
    /// Parse a 5- or 6-field cron expression.
    pub fn parse(expr: &str) -> Result<Self, ScheduleError> {
        let fields = expr.split_whitespace().count();
        let seconds_first = match fields {
            5 => format!("0 {expr}"),
            6 => expr.to_string(),
            n => {
                return Err(ScheduleError::InvalidExpression {
                    expr: expr.to_string(),
                    reason: format!("expected 5 or 6 fields, got {n}"),
                })
            }
        };

        let schedule =
            cron::Schedule::from_str(&seconds_first).map_err(|e| {
                ScheduleError::InvalidExpression {
                    expr: expr.to_string(),
                    reason: e.to_string(),
                }
            })?;

        Ok(Self {
            expr: expr.to_string(),
            schedule,
        })
    }

    /// The expression as submitted (without the injected seconds column).
    pub fn expression(&self) -> &str {
        &self.expr
    }

    /// Next fire time strictly after `from` (whole epoch seconds).
    pub fn next_after(&self, from: i64) -> Result<i64, ScheduleError> {
        let from = DateTime::<Utc>::from_timestamp(from, 0).ok_or_else(|| {
            ScheduleError::InvalidExpression {
                expr: self.expr.clone(),
                reason: format!("time {from} is out of range"),
            }
        })?;

        self.schedule
            .after(&from)
            .next()
            .map(|t| t.timestamp())
            .ok_or_else(|| ScheduleError::NoUpcomingFire(self.expr.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_five_field_every_minute() {
        let schedule = CronSchedule::parse("* * * * *").unwrap();
        // From :30 of some minute, the next fire is the next full minute
        let next = schedule.next_after(90).unwrap();
        assert_eq!(next, 120);
    }

    #[test]
    fn test_six_field_every_second() {
        let schedule = CronSchedule::parse("* * * * * *").unwrap();
        assert_eq!(schedule.next_after(1_000).unwrap(), 1_001);
    }

    #[test]
    fn test_strictly_after() {
        // Exactly on a fire time, the next fire is the following one
        let schedule = CronSchedule::parse("*/5 * * * *").unwrap();
        assert_eq!(schedule.next_after(300).unwrap(), 600);
    }

    #[test]
    fn test_hourly() {
        let schedule = CronSchedule::parse("0 * * * *").unwrap();
        assert_eq!(schedule.next_after(3_599).unwrap(), 3_600);
        assert_eq!(schedule.next_after(3_600).unwrap(), 7_200);
    }

    #[test]
    fn test_field_count_rejected() {
        for expr in ["* * * *", "* * * * * * *", ""] {
            assert!(matches!(
                CronSchedule::parse(expr),
                Err(ScheduleError::InvalidExpression { .. })
            ));
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            CronSchedule::parse("not a cron at all"),
            Err(ScheduleError::InvalidExpression { .. })
        ));
        assert!(matches!(
            CronSchedule::parse("99 * * * *"),
            Err(ScheduleError::InvalidExpression { .. })
        ));
    }

    #[test]
    fn test_expression_preserved() {
        let schedule = CronSchedule::parse("*/10 * * * *").unwrap();
        assert_eq!(schedule.expression(), "*/10 * * * *");
    }
}
