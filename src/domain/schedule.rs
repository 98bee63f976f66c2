use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::pipeline::{PipelineId, ProjectId, UserId};
use crate::error::{AutoCancelError, Result};

pub type ScheduleId = u64;

/// A cron-driven pipeline trigger owned by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSchedule {
    pub id: ScheduleId,
    pub project_id: ProjectId,
    #[serde(rename = "ref")]
    pub ref_: String,
    /// Standard 5-field cron expression evaluated in UTC
    pub cron: String,
    pub owner_id: UserId,
    #[serde(default = "default_active")]
    pub active: bool,
    pub next_run_at: DateTime<Utc>,
    #[serde(default)]
    pub last_pipeline_id: Option<PipelineId>,
    #[serde(default)]
    pub description: String,
}

fn default_active() -> bool {
    true
}

impl PipelineSchedule {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.active && self.next_run_at <= now
    }

    /// First cron occurrence strictly after `now`.
    pub fn calculate_next_run_at(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        parse_cron(&self.cron)?
            .after(&now)
            .next()
            .ok_or_else(|| AutoCancelError::NoUpcomingRun(self.cron.clone()))
    }
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Parses a cron expression.
///
/// Five-field expressions are standard cron: day-of-week runs 0-6 from
/// Sunday, with 7 also meaning Sunday. They are rewritten for the `cron`
/// crate, which takes a leading seconds field and numbers weekdays 1-7 from
/// Sunday. Six and seven field expressions are passed through in the crate's
/// own syntax.
fn parse_cron(expression: &str) -> Result<cron::Schedule> {
    let expression = expression.trim();
    let fields: Vec<&str> = expression.split_whitespace().collect();
    let invalid = |reason: String| AutoCancelError::InvalidCron {
        expression: expression.to_string(),
        reason,
    };

    let normalized = match fields.len() {
        5 => {
            let (head, weekdays) = fields.split_at(4);
            let weekdays = weekday_field(weekdays[0]).map_err(invalid)?;
            format!("0 {} {weekdays}", head.join(" "))
        }
        6 | 7 => expression.to_string(),
        count => return Err(invalid(format!("expected 5 fields, got {count}"))),
    };

    cron::Schedule::from_str(&normalized).map_err(|e| AutoCancelError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

/// Expands a standard day-of-week field into the `cron` crate's numbering.
fn weekday_field(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let mut days = BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, Some(step)),
                _ => return Err(format!("invalid day-of-week step in '{item}'")),
            },
            None => (item, None),
        };

        let (first, last) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((first, last))) => (weekday(first)?, weekday(last)?),
            (day, None) => {
                let day = weekday(day)?;
                (day, if step.is_some() { 6 } else { day })
            }
        };
        if first > last {
            return Err(format!("invalid day-of-week range '{range}'"));
        }

        days.extend((first..=last).step_by(step.unwrap_or(1)).map(|day| day % 7));
    }

    Ok(days
        .iter()
        .map(|day| (day + 1).to_string())
        .collect::<Vec<_>>()
        .join(","))
}

/// Day number 0-7 from Sunday, or a three-letter day name.
fn weekday(token: &str) -> std::result::Result<u32, String> {
    if let Ok(day) = token.parse::<u32>() {
        return if day <= 7 {
            Ok(day)
        } else {
            Err(format!("day-of-week {day} is out of range 0-7"))
        };
    }

    WEEKDAYS
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
        .map(|day| day as u32)
        .ok_or_else(|| format!("invalid day-of-week '{token}'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_schedule(cron: &str, next_run_at: DateTime<Utc>) -> PipelineSchedule {
        PipelineSchedule {
            id: 1,
            project_id: 1,
            ref_: "main".to_string(),
            cron: cron.to_string(),
            owner_id: 1,
            active: true,
            next_run_at,
            last_pipeline_id: None,
            description: "nightly".to_string(),
        }
    }

    #[test]
    fn test_next_run_at_for_hourly_cron() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        let schedule = create_schedule("0 * * * *", now);

        let next = schedule.calculate_next_run_at(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap());
    }

    #[test]
    fn test_next_run_at_is_strictly_after_now() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 11, 0, 0).unwrap();
        let schedule = create_schedule("0 * * * *", now);

        let next = schedule.calculate_next_run_at(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_weekday_range_skips_weekend() {
        // Friday after the 09:00 run
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let schedule = create_schedule("0 9 * * 1-5", now);

        let next = schedule.calculate_next_run_at(now).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap());

        let monday = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let next = schedule.calculate_next_run_at(monday).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_zero_and_seven_are_sunday() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let sunday = Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap();

        for cron in ["0 9 * * 0", "0 9 * * 7", "0 9 * * sun"] {
            let next = create_schedule(cron, now).calculate_next_run_at(now).unwrap();
            assert_eq!(next, sunday, "{cron}");
        }
    }

    #[test]
    fn test_weekday_field_translation() {
        assert_eq!(weekday_field("*").unwrap(), "*");
        assert_eq!(weekday_field("1-5").unwrap(), "2,3,4,5,6");
        assert_eq!(weekday_field("5-7").unwrap(), "1,6,7");
        assert_eq!(weekday_field("0,6").unwrap(), "1,7");
        assert_eq!(weekday_field("*/2").unwrap(), "1,3,5,7");
        assert_eq!(weekday_field("MON-FRI").unwrap(), "2,3,4,5,6");
        assert_eq!(weekday_field("3/2").unwrap(), "4,6");
    }

    #[test]
    fn test_invalid_weekdays_are_rejected() {
        for cron in ["0 9 * * 8", "0 9 * * 5-1", "0 9 * * */0", "0 9 * * funday"] {
            let err = parse_cron(cron).unwrap_err();
            assert!(matches!(err, AutoCancelError::InvalidCron { .. }), "{cron}");
        }
    }

    #[test]
    fn test_six_field_expression_passes_through() {
        assert!(parse_cron("30 0 4 * * *").is_ok());
    }

    #[test]
    fn test_invalid_cron_is_rejected() {
        let err = parse_cron("every day").unwrap_err();
        assert!(matches!(err, AutoCancelError::InvalidCron { .. }));

        let err = parse_cron("61 * * * *").unwrap_err();
        assert!(err.to_string().contains("61 * * * *"));
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut schedule = create_schedule("0 * * * *", now - chrono::Duration::minutes(1));
        assert!(schedule.is_due(now));

        schedule.active = false;
        assert!(!schedule.is_due(now), "inactive schedules are never due");

        schedule.active = true;
        schedule.next_run_at = now + chrono::Duration::minutes(1);
        assert!(!schedule.is_due(now));
    }
}
