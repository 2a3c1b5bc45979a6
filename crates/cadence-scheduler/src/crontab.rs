//! Crontab field parsing and calendar matching.
//!
//! Each of the five fields is parsed into a [`CronField`]; a [`Crontab`]
//! combines them and answers "does this minute match" and "what is the next
//! matching minute after T". All arithmetic is in UTC at minute resolution.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

use crate::types::CrontabFields;

/// How far `next_after` searches before declaring a rule unsatisfiable.
/// Nine years covers the longest gap between two Feb 29ths (2096 → 2104).
const SEARCH_HORIZON_DAYS: i64 = 366 * 9;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrontabError {
    #[error("{field} field is empty")]
    Empty { field: &'static str },

    #[error("{field} field '{text}': {reason}")]
    Invalid {
        field: &'static str,
        text: String,
        reason: String,
    },

    #[error("expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("'{0}' never matches any date")]
    Unsatisfiable(String),
}

/// Position of a field inside the five-field crontab line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    pub fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day_of_month",
            FieldKind::Month => "month_of_year",
            FieldKind::DayOfWeek => "day_of_week",
        }
    }

    /// Inclusive value bounds. Day-of-week admits 7 as a second Sunday.
    pub fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 7),
        }
    }

    fn alias(self, text: &str) -> Option<u32> {
        let lower = text.to_ascii_lowercase();
        let names: &[&str] = match self {
            FieldKind::Month => &MONTH_NAMES,
            FieldKind::DayOfWeek => &DAY_NAMES,
            _ => return None,
        };
        let index = names.iter().position(|n| *n == lower)? as u32;
        Some(if self == FieldKind::Month { index + 1 } else { index })
    }

    fn value(self, text: &str) -> Option<u32> {
        let (min, max) = self.bounds();
        text.parse::<u32>()
            .ok()
            .or_else(|| self.alias(text))
            .filter(|v| (min..=max).contains(v))
    }
}

/// One parsed crontab field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CronField {
    /// `*` (and the equivalent `*/1`): every value.
    Wildcard,
    /// `5`
    Single(u32),
    /// `1-5`
    Range { start: u32, end: u32 },
    /// `*/15`, `10-40/10` or `5/20` (from 5 to the end of the field).
    Step { start: u32, end: u32, step: u32 },
    /// `1,15,30-35`; never nested.
    List(Vec<CronField>),
}

impl CronField {
    pub fn parse(kind: FieldKind, text: &str) -> Result<Self, CrontabError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(CrontabError::Empty { field: kind.name() });
        }

        let mut items = text
            .split(',')
            .map(|item| parse_item(kind, item.trim(), text))
            .collect::<Result<Vec<_>, _>>()?;

        if items.len() == 1 {
            return Ok(items.remove(0));
        }
        if items.iter().any(CronField::is_wildcard) {
            return Ok(CronField::Wildcard);
        }
        Ok(CronField::List(items))
    }

    pub fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Wildcard => true,
            CronField::Single(v) => *v == value,
            CronField::Range { start, end } => (*start..=*end).contains(&value),
            CronField::Step { start, end, step } => {
                (*start..=*end).contains(&value) && (value - start) % step == 0
            }
            CronField::List(items) => items.iter().any(|item| item.matches(value)),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, CronField::Wildcard)
    }
}

fn parse_item(kind: FieldKind, item: &str, whole: &str) -> Result<CronField, CrontabError> {
    let invalid = |reason: &str| CrontabError::Invalid {
        field: kind.name(),
        text: whole.to_string(),
        reason: reason.to_string(),
    };
    if item.is_empty() {
        return Err(invalid("empty list item"));
    }

    let (min, max) = kind.bounds();
    let (base, step) = match item.split_once('/') {
        Some((base, step)) => {
            let step: u32 = step.parse().map_err(|_| invalid("step is not a number"))?;
            if step == 0 {
                return Err(invalid("step must be positive"));
            }
            (base, Some(step))
        }
        None => (item, None),
    };

    if base == "*" {
        return Ok(match step {
            None | Some(1) => CronField::Wildcard,
            Some(step) => CronField::Step {
                start: min,
                end: max,
                step,
            },
        });
    }

    let (start, end) = match base.split_once('-') {
        Some((a, b)) => {
            let a = kind.value(a).ok_or_else(|| invalid("range start out of bounds"))?;
            let b = kind.value(b).ok_or_else(|| invalid("range end out of bounds"))?;
            if a > b {
                return Err(invalid("range start is after its end"));
            }
            (a, b)
        }
        None => {
            let v = kind.value(base).ok_or_else(|| invalid("value out of bounds"))?;
            (v, if step.is_some() { max } else { v })
        }
    };

    Ok(match step {
        Some(step) => CronField::Step { start, end, step },
        None if start == end => CronField::Single(start),
        None => CronField::Range { start, end },
    })
}

/// A parsed five-field calendar rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Crontab {
    pub minute: CronField,
    pub hour: CronField,
    pub day_of_month: CronField,
    pub month: CronField,
    pub day_of_week: CronField,
}

impl Crontab {
    /// Parse all five fields; a rule that can never fire is rejected.
    pub fn parse(fields: &CrontabFields) -> Result<Self, CrontabError> {
        let tab = Self {
            minute: CronField::parse(FieldKind::Minute, &fields.minute)?,
            hour: CronField::parse(FieldKind::Hour, &fields.hour)?,
            day_of_month: CronField::parse(FieldKind::DayOfMonth, &fields.day_of_month)?,
            month: CronField::parse(FieldKind::Month, &fields.month_of_year)?,
            day_of_week: CronField::parse(FieldKind::DayOfWeek, &fields.day_of_week)?,
        };

        let epoch = DateTime::<Utc>::from_timestamp(0, 0);
        if epoch.and_then(|e| tab.next_after(e)).is_none() {
            return Err(CrontabError::Unsatisfiable(fields.to_string()));
        }
        Ok(tab)
    }

    /// Whether the minute containing `at` matches. Seconds are ignored.
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.month.matches(at.month())
            && self.day_matches(at)
            && self.hour.matches(at.hour())
            && self.minute.matches(at.minute())
    }

    /// Day-of-month and day-of-week follow the classic cron rule: when both
    /// are restricted a day matches if EITHER matches (`0 0 13 * fri` fires on
    /// every 13th and on every Friday). When one of them is `*` (or `*/1`)
    /// only the other one decides. A stepped wildcard such as `*/2` counts as
    /// restricted, so `0 0 */2 * mon` fires on odd days and on Mondays.
    fn day_matches(&self, at: DateTime<Utc>) -> bool {
        let dom = self.day_of_month.matches(at.day());
        let weekday = at.weekday().num_days_from_sunday();
        let dow = self.day_of_week.matches(weekday)
            || (weekday == 0 && self.day_of_week.matches(7));

        if !self.day_of_month.is_wildcard() && !self.day_of_week.is_wildcard() {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The first matching minute strictly after `reference`.
    ///
    /// Returns `None` only for rules with no match inside the search horizon,
    /// which `parse` already rejects.
    pub fn next_after(&self, reference: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let first = reference.timestamp().div_euclid(60) * 60 + 60;
        let mut t = DateTime::<Utc>::from_timestamp(first, 0)?;
        let horizon = reference + Duration::days(SEARCH_HORIZON_DAYS);

        while t <= horizon {
            if !self.month.matches(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_next_day(t)?;
                continue;
            }
            if !self.hour.matches(t.hour()) {
                t = t - Duration::minutes(i64::from(t.minute())) + Duration::hours(1);
                continue;
            }
            if !self.minute.matches(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }
}

impl std::str::FromStr for Crontab {
    type Err = CrontabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields = CrontabFields::from_line(s)
            .ok_or_else(|| CrontabError::FieldCount(s.split_whitespace().count()))?;
        Crontab::parse(&fields)
    }
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()
}

fn start_of_next_day(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    t.date_naive()
        .succ_opt()?
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
}
