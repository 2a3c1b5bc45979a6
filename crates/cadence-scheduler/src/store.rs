use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{info, warn};

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    types::{CrontabFields, ScheduleDefinition, ScheduleKind},
};

/// Durable home of schedule definitions and their run bookkeeping.
///
/// The scheduler only reads definitions and records runs; creating, editing
/// and disabling rows happens elsewhere against the same store.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Every definition with `enabled = true`.
    async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleDefinition>>;

    /// A single definition by name, enabled or not.
    async fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>>;

    /// Atomically bump `total_run_count` and set `last_run_at` for `name`.
    async fn record_run(&self, name: &str, run_at: DateTime<Utc>) -> Result<()>;

    /// Cheap connectivity probe used by readiness checks.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

const SELECT_COLUMNS: &str = "SELECT name, kind, interval_seconds,
        cron_minute, cron_hour, cron_day_of_month, cron_month_of_year, cron_day_of_week,
        task, args, kwargs, enabled, last_run_at, total_run_count
     FROM periodic_schedules";

/// SQLite-backed [`ScheduleStore`].
///
/// Cloning shares the underlying connection. Trait methods run the blocking
/// SQLite calls on Tokio's blocking pool; the inherent management helpers are
/// synchronous, like any other rusqlite call.
#[derive(Clone)]
pub struct SqliteScheduleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteScheduleStore {
    /// Wrap `conn`, creating the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// A throwaway in-memory store (tests, `check` dry runs).
    pub fn open_in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    /// Insert or replace a definition, keyed by `name`.
    ///
    /// Bookkeeping columns are taken from `def` on insert and left untouched
    /// on update, so an edit never rewinds `total_run_count`.
    pub fn upsert_schedule(&self, def: &ScheduleDefinition) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let interval = def
            .interval_seconds
            .map(|s| {
                i64::try_from(s)
                    .map_err(|_| SchedulerError::invalid(&def.name, "interval_seconds is too large"))
            })
            .transpose()?;
        let cron = def.crontab.as_ref();
        let total = i64::try_from(def.total_run_count)
            .map_err(|_| SchedulerError::invalid(&def.name, "total_run_count is too large"))?;

        conn.execute(
            "INSERT INTO periodic_schedules
             (name, kind, interval_seconds, cron_minute, cron_hour, cron_day_of_month,
              cron_month_of_year, cron_day_of_week, task, args, kwargs, enabled,
              last_run_at, total_run_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?15)
             ON CONFLICT (name) DO UPDATE SET
                kind = excluded.kind,
                interval_seconds = excluded.interval_seconds,
                cron_minute = excluded.cron_minute,
                cron_hour = excluded.cron_hour,
                cron_day_of_month = excluded.cron_day_of_month,
                cron_month_of_year = excluded.cron_month_of_year,
                cron_day_of_week = excluded.cron_day_of_week,
                task = excluded.task,
                args = excluded.args,
                kwargs = excluded.kwargs,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at",
            rusqlite::params![
                def.name,
                def.kind.as_str(),
                interval,
                cron.map(|c| c.minute.as_str()),
                cron.map(|c| c.hour.as_str()),
                cron.map(|c| c.day_of_month.as_str()),
                cron.map(|c| c.month_of_year.as_str()),
                cron.map(|c| c.day_of_week.as_str()),
                def.task,
                serde_json::to_string(&def.args)?,
                serde_json::to_string(&def.kwargs)?,
                def.enabled,
                def.last_run_at.map(|t| t.to_rfc3339()),
                total,
                now,
            ],
        )?;
        info!(schedule = %def.name, kind = %def.kind, "schedule upserted");
        Ok(())
    }

    /// Flip the `enabled` flag. Returns `ScheduleNotFound` if no row matches.
    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE periodic_schedules SET enabled = ?1, updated_at = ?2 WHERE name = ?3",
            rusqlite::params![enabled, Utc::now().to_rfc3339(), name],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound {
                name: name.to_string(),
            });
        }
        info!(schedule = %name, enabled, "schedule toggled");
        Ok(())
    }

    /// Every decodable row, enabled or not, ordered by name.
    pub fn list_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        let conn = self.lock()?;
        query_definitions(&conn, &format!("{SELECT_COLUMNS} ORDER BY name"))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SchedulerError::Store("connection mutex poisoned".to_string()))
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| SchedulerError::Store("connection mutex poisoned".to_string()))?;
            f(&guard)
        })
        .await
        .map_err(|e| SchedulerError::Store(format!("store worker failed: {e}")))?
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        self.blocking(|conn| {
            query_definitions(conn, &format!("{SELECT_COLUMNS} WHERE enabled = 1 ORDER BY name"))
        })
        .await
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let raw = conn
                .query_row(
                    &format!("{SELECT_COLUMNS} WHERE name = ?1"),
                    [&name],
                    RawRow::from_row,
                )
                .optional()?;
            raw.map(RawRow::into_definition).transpose()
        })
        .await
    }

    async fn record_run(&self, name: &str, run_at: DateTime<Utc>) -> Result<()> {
        let name = name.to_string();
        self.blocking(move |conn| {
            // Single-statement increment: concurrent writers never lose a count.
            let n = conn.execute(
                "UPDATE periodic_schedules
                 SET total_run_count = total_run_count + 1,
                     last_run_at = ?2,
                     updated_at = ?2
                 WHERE name = ?1",
                rusqlite::params![name, run_at.to_rfc3339()],
            )?;
            if n == 0 {
                return Err(SchedulerError::ScheduleNotFound { name });
            }
            Ok(())
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.blocking(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

/// Decode every row of `sql`, skipping (and logging) rows that do not decode
/// so one bad row never hides the others.
fn query_definitions(conn: &Connection, sql: &str) -> Result<Vec<ScheduleDefinition>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map([], RawRow::from_row)?;

    let mut out = Vec::new();
    for row in rows {
        let raw = match row {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "skipping unreadable schedule row");
                continue;
            }
        };
        let name = raw.name.clone();
        match raw.into_definition() {
            Ok(def) => out.push(def),
            Err(e) => warn!(schedule = %name, error = %e, "skipping undecodable schedule row"),
        }
    }
    Ok(out)
}

/// Column values exactly as stored, before validation.
struct RawRow {
    name: String,
    kind: String,
    interval_seconds: Option<i64>,
    cron: [Option<String>; 5],
    task: String,
    args: String,
    kwargs: String,
    enabled: bool,
    last_run_at: Option<String>,
    total_run_count: i64,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            kind: row.get(1)?,
            interval_seconds: row.get(2)?,
            cron: [row.get(3)?, row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?],
            task: row.get(8)?,
            args: row.get(9)?,
            kwargs: row.get(10)?,
            enabled: row.get(11)?,
            last_run_at: row.get(12)?,
            total_run_count: row.get(13)?,
        })
    }

    fn into_definition(self) -> Result<ScheduleDefinition> {
        let name = self.name;
        let kind: ScheduleKind = self
            .kind
            .parse()
            .map_err(|e: String| SchedulerError::invalid(&name, e))?;

        let interval_seconds = self
            .interval_seconds
            .map(|s| {
                u64::try_from(s)
                    .map_err(|_| SchedulerError::invalid(&name, "interval_seconds is negative"))
            })
            .transpose()?;

        let crontab = match self.cron {
            [Some(minute), Some(hour), Some(dom), Some(month), Some(dow)] => Some(CrontabFields {
                minute,
                hour,
                day_of_month: dom,
                month_of_year: month,
                day_of_week: dow,
            }),
            [None, None, None, None, None] => None,
            _ => return Err(SchedulerError::invalid(&name, "crontab columns partially populated")),
        };

        let last_run_at = self
            .last_run_at
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| SchedulerError::invalid(&name, format!("bad last_run_at: {e}")))
            })
            .transpose()?;

        let total_run_count = u64::try_from(self.total_run_count)
            .map_err(|_| SchedulerError::invalid(&name, "total_run_count is negative"))?;

        Ok(ScheduleDefinition {
            args: serde_json::from_str(&self.args)?,
            kwargs: serde_json::from_str(&self.kwargs)?,
            name,
            kind,
            interval_seconds,
            crontab,
            task: self.task,
            enabled: self.enabled,
            last_run_at,
            total_run_count,
        })
    }
}
