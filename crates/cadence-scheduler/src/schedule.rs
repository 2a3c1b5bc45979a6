use chrono::{DateTime, Duration, Utc};

use crate::crontab::Crontab;
use crate::error::{Result, SchedulerError};
use crate::types::{ScheduleDefinition, ScheduleKind};

/// A definition's recurrence rule in ready-to-evaluate form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    /// Fire every `every`, measured from the last run.
    Interval { every: Duration },
    /// Fire on crontab matches.
    Crontab(Crontab),
}

impl Schedule {
    /// Validate `definition` and compile its rule.
    ///
    /// Fails when the populated columns do not match `kind`, the interval is
    /// zero, or the crontab fields do not parse.
    pub fn from_definition(definition: &ScheduleDefinition) -> Result<Self> {
        let name = definition.name.as_str();
        match definition.kind {
            ScheduleKind::Interval => {
                if definition.crontab.is_some() {
                    return Err(SchedulerError::invalid(name, "interval schedule carries crontab fields"));
                }
                let secs = definition
                    .interval_seconds
                    .ok_or_else(|| SchedulerError::invalid(name, "interval_seconds is required"))?;
                if secs == 0 {
                    return Err(SchedulerError::invalid(name, "interval_seconds must be positive"));
                }
                let secs = i64::try_from(secs)
                    .map_err(|_| SchedulerError::invalid(name, "interval_seconds is too large"))?;
                let every = Duration::try_seconds(secs)
                    .ok_or_else(|| SchedulerError::invalid(name, "interval_seconds is too large"))?;
                Ok(Schedule::Interval { every })
            }
            ScheduleKind::Crontab => {
                if definition.interval_seconds.is_some() {
                    return Err(SchedulerError::invalid(name, "crontab schedule carries interval_seconds"));
                }
                let fields = definition
                    .crontab
                    .as_ref()
                    .ok_or_else(|| SchedulerError::invalid(name, "crontab fields are required"))?;
                let tab = Crontab::parse(fields)
                    .map_err(|e| SchedulerError::invalid(name, e.to_string()))?;
                Ok(Schedule::Crontab(tab))
            }
        }
    }

    /// Next due time given the last run and a reference instant.
    ///
    /// * Interval: `last_run_at + every`, or `reference` for a task that never
    ///   ran. The result may already be in the past; however many intervals
    ///   were missed, that is a single due occurrence, never a backlog.
    /// * Crontab: the first match strictly after `last_run_at`, or after
    ///   `reference` for a task that never ran. A run missed during downtime
    ///   therefore also collapses into one immediate occurrence.
    pub fn next_due(
        &self,
        last_run_at: Option<DateTime<Utc>>,
        reference: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Interval { every } => match last_run_at {
                Some(last) => last.checked_add_signed(*every),
                None => Some(reference),
            },
            Schedule::Crontab(tab) => tab.next_after(last_run_at.unwrap_or(reference)),
        }
    }
}

/// Compute when `definition` is next due, relative to `reference`.
///
/// Pure: the same inputs always give the same answer.
pub fn compute_next_due(
    definition: &ScheduleDefinition,
    reference: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let schedule = Schedule::from_definition(definition)?;
    schedule
        .next_due(definition.last_run_at, reference)
        .ok_or_else(|| SchedulerError::invalid(&definition.name, "no future due time"))
}
