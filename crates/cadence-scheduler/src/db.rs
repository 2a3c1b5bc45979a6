use rusqlite::Connection;

use crate::error::Result;

/// Initialise the schedule store schema in `conn`.
///
/// Creates the `periodic_schedules` table (idempotent). The CHECK constraint
/// keeps interval rows and crontab rows from carrying each other's columns,
/// and the index on `enabled` serves the sync query.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS periodic_schedules (
            name                TEXT    NOT NULL PRIMARY KEY,
            kind                TEXT    NOT NULL,   -- 'interval' | 'crontab'
            interval_seconds    INTEGER,
            cron_minute         TEXT,
            cron_hour           TEXT,
            cron_day_of_month   TEXT,
            cron_month_of_year  TEXT,
            cron_day_of_week    TEXT,
            task                TEXT    NOT NULL,
            args                TEXT    NOT NULL DEFAULT '[]',  -- JSON array
            kwargs              TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            enabled             INTEGER NOT NULL DEFAULT 1,
            last_run_at         TEXT,               -- RFC 3339 UTC or NULL
            total_run_count     INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL,
            CHECK (
                (kind = 'interval' AND interval_seconds IS NOT NULL AND cron_minute IS NULL)
             OR (kind = 'crontab' AND interval_seconds IS NULL AND cron_minute IS NOT NULL)
            )
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_periodic_schedules_enabled
            ON periodic_schedules (enabled);
        ",
    )?;
    Ok(())
}
