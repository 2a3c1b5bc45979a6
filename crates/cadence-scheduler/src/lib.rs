//! `cadence-scheduler`: periodic task scheduler over a durable schedule store.
//!
//! # Overview
//!
//! Schedule definitions live in a SQLite `periodic_schedules` table. The
//! [`engine::Scheduler`] keeps an in-memory [`cache::CacheSnapshot`] of the
//! enabled ones, rebuilt every `sync_every_seconds`, sleeps until the earliest
//! due entry and hands due entries to a [`queue::JobQueue`]. Confirmed runs
//! are written back to the store by a background bookkeeping task.
//!
//! # Schedule kinds
//!
//! | Kind       | Next due                                                 |
//! |------------|----------------------------------------------------------|
//! | `Interval` | `last_run_at + interval_seconds`, or now if never run    |
//! | `Crontab`  | First minute after the last run matching all five fields |

pub mod cache;
pub mod clock;
pub mod crontab;
pub mod db;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod queue;
pub mod schedule;
pub mod stats;
pub mod store;
pub mod types;

#[cfg(test)]
mod testutil;

pub use cache::{CacheSnapshot, EntrySummary, ScheduleEntry};
pub use clock::{Clock, SystemClock};
pub use crontab::{Crontab, CrontabError};
pub use engine::{Scheduler, TickReport};
pub use error::{Result, SchedulerError};
pub use queue::{ChannelQueue, JobQueue, QueueError};
pub use schedule::{compute_next_due, Schedule};
pub use stats::{SchedulerStats, StatsSnapshot};
pub use store::{ScheduleStore, SqliteScheduleStore};
pub use types::{CrontabFields, JobMessage, ScheduleDefinition, ScheduleKind};
