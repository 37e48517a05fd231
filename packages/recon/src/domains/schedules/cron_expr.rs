//! Cron expression parsing for schedules.
//!
//! Accepts the standard 5-field form (`min hour dom month dow`, seconds
//! pinned to 0) as well as the 6/7-field form with a leading seconds field.
//! Day-of-week numbers run 1-7 starting at Sunday; names (`MON-FRI`) are
//! unambiguous and preferred.

use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::common::ValidationError;

#[derive(Debug, Clone)]
pub struct CronExpression {
    raw: String,
    normalized: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    pub fn parse(expr: &str) -> Result<Self, ValidationError> {
        let raw = expr.split_whitespace().collect::<Vec<_>>().join(" ");
        let normalized = match raw.split(' ').count() {
            5 => format!("0 {}", raw),
            6 | 7 => raw.clone(),
            n => {
                return Err(ValidationError::new(format!(
                    "cron expression '{}' has {} fields, expected 5, 6, or 7",
                    expr, n
                )))
            }
        };
        let schedule = cron::Schedule::from_str(&normalized).map_err(|e| {
            ValidationError::new(format!("invalid cron expression '{}': {}", expr, e))
        })?;
        Ok(Self {
            raw,
            normalized,
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The expression with an explicit seconds field, the form
    /// tokio-cron-scheduler requires.
    pub fn with_seconds(&self) -> &str {
        &self.normalized
    }

    /// First firing strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn five_field_expressions_fire_on_the_minute() {
        let cron = CronExpression::parse("*/5 * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 2, 30).unwrap();
        let next = cron.next_after(base).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 10, 5, 0).unwrap());
        assert_eq!(next.second(), 0);
    }

    #[test]
    fn six_field_expressions_keep_seconds() {
        let cron = CronExpression::parse("*/15 * * * * *").unwrap();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 1).unwrap();
        assert_eq!(
            cron.next_after(base).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 15).unwrap()
        );
    }

    #[test]
    fn next_is_strictly_after() {
        let cron = CronExpression::parse("0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(
            cron.next_after(on_the_hour).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap()
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        for expr in ["", "* * *", "61 * * * *", "not a cron at all", "* * * * * * * *"] {
            assert!(CronExpression::parse(expr).is_err(), "{expr:?}");
        }
    }

    #[test]
    fn five_field_expressions_gain_a_seconds_field() {
        let cron = CronExpression::parse("*/5 * * * *").unwrap();
        assert_eq!(cron.as_str(), "*/5 * * * *");
        assert_eq!(cron.with_seconds(), "0 */5 * * * *");

        let cron = CronExpression::parse("*/15 * * * * *").unwrap();
        assert_eq!(cron.with_seconds(), "*/15 * * * * *");
    }

    #[test]
    fn collapses_whitespace() {
        let cron = CronExpression::parse("  0   2 * *   MON ").unwrap();
        assert_eq!(cron.as_str(), "0 2 * * MON");
    }
}
