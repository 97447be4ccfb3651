//! Five-field cron expressions: minute, hour, day-of-month, month, day-of-week.
//!
//! All five fields must match at once. Unlike classic BSD cron, a restricted
//! day-of-month and day-of-week are ANDed, not ORed.

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};

/// Upper bound for the forward search, in minutes (two years).
const SEARCH_LIMIT_MINUTES: i64 = 2 * 366 * 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("expected 5 fields, found {0}")]
    FieldCount(usize),
    #[error("invalid {field} value `{value}`")]
    InvalidValue { field: &'static str, value: String },
    #[error("{field} value {value} outside {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("invalid {field} step `{step}`")]
    InvalidStep { field: &'static str, step: String },
    #[error("no matching time within two years after {0}")]
    NoUpcomingRun(DateTime<Utc>),
}

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ],
};
// 7 is accepted as Sunday and folded to 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["sun", "mon", "tue", "wed", "thu", "fri", "sat"],
};

/// Allowed values of one field as a bitmask (bit n set means value n matches).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    fn insert(&mut self, value: u32) {
        self.0 |= 1u64 << value;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        let mut days_of_week = parse_field(fields[4], DAY_OF_WEEK)?;
        if days_of_week.contains(7) {
            days_of_week.0 &= !(1u64 << 7);
            days_of_week.insert(0);
        }
        Ok(Self {
            source: fields.join(" "),
            minutes: parse_field(fields[0], MINUTE)?,
            hours: parse_field(fields[1], HOUR)?,
            days_of_month: parse_field(fields[2], DAY_OF_MONTH)?,
            months: parse_field(fields[3], MONTH)?,
            days_of_week,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.minutes.contains(at.minute())
            && self.hours.contains(at.hour())
            && self.days_of_month.contains(at.day())
            && self.months.contains(at.month())
            && self.days_of_week.contains(at.weekday().num_days_from_sunday())
    }

    /// First matching minute strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let start = after
            .duration_trunc(Duration::minutes(1))
            .map_err(|_| CronError::NoUpcomingRun(after))?
            + Duration::minutes(1);
        let mut candidate = start;
        for _ in 0..SEARCH_LIMIT_MINUTES {
            if self.matches(candidate) {
                return Ok(candidate);
            }
            candidate += Duration::minutes(1);
        }
        Err(CronError::NoUpcomingRun(after))
    }
}

fn parse_value(raw: &str, spec: FieldSpec) -> Result<u32, CronError> {
    let lower = raw.to_ascii_lowercase();
    let value = if let Some(pos) = spec.names.iter().position(|n| *n == lower) {
        pos as u32 + if spec.min == 1 { 1 } else { 0 }
    } else {
        lower.parse::<u32>().map_err(|_| CronError::InvalidValue {
            field: spec.name,
            value: raw.to_string(),
        })?
    };
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

fn parse_field(field: &str, spec: FieldSpec) -> Result<FieldSet, CronError> {
    let mut set = FieldSet(0);
    for part in field.split(',') {
        if part.is_empty() {
            return Err(CronError::InvalidValue {
                field: spec.name,
                value: field.to_string(),
            });
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<u32>()
                    .ok()
                    .filter(|s| *s > 0)
                    .ok_or_else(|| CronError::InvalidStep {
                        field: spec.name,
                        step: step.to_string(),
                    })?;
                (range, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (a, b) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if a > b {
                return Err(CronError::InvalidValue {
                    field: spec.name,
                    value: range.to_string(),
                });
            }
            (a, b)
        } else {
            let v = parse_value(range, spec)?;
            // `5/15` means every 15 starting at 5.
            if step > 1 { (v, spec.max) } else { (v, v) }
        };
        let mut v = start;
        while v <= end {
            set.insert(v);
            v += step;
        }
    }
    Ok(set)
}
