use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Which recurrence rule a schedule row carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire every `interval_seconds`, measured from the last run.
    Interval,
    /// Fire on calendar matches of the five crontab fields.
    Crontab,
}

impl ScheduleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleKind::Interval => "interval",
            ScheduleKind::Crontab => "crontab",
        }
    }
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ScheduleKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "interval" => Ok(ScheduleKind::Interval),
            "crontab" => Ok(ScheduleKind::Crontab),
            other => Err(format!("unknown schedule kind: {other}")),
        }
    }
}

/// The five raw crontab fields as stored, before parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrontabFields {
    pub minute: String,
    pub hour: String,
    pub day_of_month: String,
    pub month_of_year: String,
    pub day_of_week: String,
}

impl CrontabFields {
    pub fn new(
        minute: &str,
        hour: &str,
        day_of_month: &str,
        month_of_year: &str,
        day_of_week: &str,
    ) -> Self {
        Self {
            minute: minute.to_string(),
            hour: hour.to_string(),
            day_of_month: day_of_month.to_string(),
            month_of_year: month_of_year.to_string(),
            day_of_week: day_of_week.to_string(),
        }
    }

    /// Split a classic `"m h dom mon dow"` line into its fields.
    pub fn from_line(line: &str) -> Option<Self> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        match parts.as_slice() {
            [m, h, dom, mon, dow] => Some(Self::new(m, h, dom, mon, dow)),
            _ => None,
        }
    }
}

impl Default for CrontabFields {
    fn default() -> Self {
        Self::new("*", "*", "*", "*", "*")
    }
}

impl std::fmt::Display for CrontabFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {} {}",
            self.minute, self.hour, self.day_of_month, self.month_of_year, self.day_of_week
        )
    }
}

/// One periodic task as persisted in the schedule store.
///
/// Exactly one of `interval_seconds` / `crontab` should be populated, matching
/// `kind`; rows that break this are rejected when the cache is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDefinition {
    /// Unique, immutable identifier.
    pub name: String,
    pub kind: ScheduleKind,
    pub interval_seconds: Option<u64>,
    pub crontab: Option<CrontabFields>,
    /// Routing key understood by the execution layer.
    pub task: String,
    /// Positional payload forwarded to the job (JSON array).
    pub args: Value,
    /// Keyword payload forwarded to the job (JSON object).
    pub kwargs: Value,
    pub enabled: bool,
    /// Last successful hand-off, if any.
    pub last_run_at: Option<DateTime<Utc>>,
    /// Number of successful hand-offs so far.
    pub total_run_count: u64,
}

impl ScheduleDefinition {
    /// An enabled, never-run interval schedule with empty payloads.
    pub fn interval(name: &str, task: &str, every_secs: u64) -> Self {
        Self {
            name: name.to_string(),
            kind: ScheduleKind::Interval,
            interval_seconds: Some(every_secs),
            crontab: None,
            task: task.to_string(),
            args: Value::Array(Vec::new()),
            kwargs: Value::Object(serde_json::Map::new()),
            enabled: true,
            last_run_at: None,
            total_run_count: 0,
        }
    }

    /// An enabled, never-run crontab schedule with empty payloads.
    pub fn crontab(name: &str, task: &str, fields: CrontabFields) -> Self {
        Self {
            kind: ScheduleKind::Crontab,
            interval_seconds: None,
            crontab: Some(fields),
            ..Self::interval(name, task, 0)
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: Value) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_last_run(mut self, at: DateTime<Utc>) -> Self {
        self.last_run_at = Some(at);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Human-readable recurrence: `"every 30s"` or the five crontab fields.
    pub fn rule(&self) -> String {
        match (&self.kind, &self.crontab, self.interval_seconds) {
            (ScheduleKind::Crontab, Some(fields), _) => fields.to_string(),
            (ScheduleKind::Interval, _, Some(secs)) => format!("every {secs}s"),
            _ => "invalid".to_string(),
        }
    }

    /// True when both definitions describe the same recurrence and payload,
    /// ignoring run bookkeeping and the enabled flag.
    pub fn same_schedule(&self, other: &ScheduleDefinition) -> bool {
        self.kind == other.kind
            && self.interval_seconds == other.interval_seconds
            && self.crontab == other.crontab
            && self.task == other.task
            && self.args == other.args
            && self.kwargs == other.kwargs
    }
}

/// The message handed to the execution layer for one due occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    /// Fresh correlation id, unique per hand-off attempt.
    pub id: Uuid,
    pub task: String,
    pub args: Value,
    pub kwargs: Value,
    /// Name of the schedule that produced this job.
    pub schedule: String,
    /// The due time this job fulfils.
    pub scheduled_for: DateTime<Utc>,
    /// When the scheduler handed it off.
    pub sent_at: DateTime<Utc>,
}
