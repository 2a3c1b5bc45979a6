use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    cache::ScheduleEntry,
    error::SchedulerError,
    queue::{JobQueue, QueueError},
    stats::SchedulerStats,
    store::ScheduleStore,
    types::JobMessage,
};

/// Base backoff between bookkeeping attempts; multiplied by the attempt number.
const BOOKKEEPING_BACKOFF: StdDuration = StdDuration::from_millis(200);

/// Outcome of handing one due entry to the queue.
#[derive(Debug)]
pub enum DispatchResult {
    /// Acknowledged by the queue; bookkeeping has been queued.
    Sent { correlation_id: Uuid },
    /// Not acknowledged; the entry stays due.
    Failed { error: QueueError },
}

impl DispatchResult {
    pub fn is_sent(&self) -> bool {
        matches!(self, DispatchResult::Sent { .. })
    }
}

/// Hands due entries to a [`JobQueue`] and queues their bookkeeping.
///
/// Dispatch itself never touches the store: a confirmed hand-off is reported
/// to the [`BookkeepingWriter`], which persists it in the background.
pub struct Dispatcher {
    queue: Arc<dyn JobQueue>,
    bookkeeping: BookkeepingSender,
    stats: Arc<SchedulerStats>,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        bookkeeping: BookkeepingSender,
        stats: Arc<SchedulerStats>,
    ) -> Self {
        Self {
            queue,
            bookkeeping,
            stats,
        }
    }

    /// Build the job for `entry` fired at `now`, with a fresh correlation id.
    pub fn build_message(entry: &ScheduleEntry, now: DateTime<Utc>) -> JobMessage {
        let def = &entry.definition;
        JobMessage {
            id: Uuid::new_v4(),
            task: def.task.clone(),
            args: def.args.clone(),
            kwargs: def.kwargs.clone(),
            schedule: def.name.clone(),
            scheduled_for: entry.next_due_at,
            sent_at: now,
        }
    }

    /// Hand `entry` off. Never panics and never touches the cache.
    pub async fn dispatch(&self, entry: &ScheduleEntry, now: DateTime<Utc>) -> DispatchResult {
        let job = Self::build_message(entry, now);
        match self.queue.enqueue(&job).await {
            Ok(()) => {
                self.stats.record_dispatch();
                info!(
                    schedule = %entry.name(),
                    task = %job.task,
                    correlation_id = %job.id,
                    queue = self.queue.name(),
                    scheduled_for = %job.scheduled_for,
                    "job dispatched"
                );
                self.bookkeeping.record(entry.name(), now);
                DispatchResult::Sent {
                    correlation_id: job.id,
                }
            }
            Err(error) => {
                self.stats.record_dispatch_failure();
                warn!(
                    schedule = %entry.name(),
                    task = %job.task,
                    correlation_id = %job.id,
                    queue = self.queue.name(),
                    error = %error,
                    "job hand-off failed, will retry"
                );
                DispatchResult::Failed { error }
            }
        }
    }
}

enum Command {
    Record { name: String, run_at: DateTime<Utc> },
    Flush(oneshot::Sender<()>),
}

/// Cheap handle used to queue bookkeeping writes.
#[derive(Clone)]
pub struct BookkeepingSender {
    tx: mpsc::UnboundedSender<Command>,
}

impl BookkeepingSender {
    /// Queue a `record_run` for `name`. Never blocks.
    pub fn record(&self, name: &str, run_at: DateTime<Utc>) {
        let cmd = Command::Record {
            name: name.to_string(),
            run_at,
        };
        if self.tx.send(cmd).is_err() {
            warn!(schedule = %name, "bookkeeping writer stopped, run not recorded");
        }
    }

    /// Wait until every write queued before this call has been attempted.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Background task that persists confirmed runs, one at a time, in order.
pub struct BookkeepingWriter {
    handle: JoinHandle<()>,
}

impl BookkeepingWriter {
    /// Spawn the writer on the current runtime.
    pub fn spawn(
        store: Arc<dyn ScheduleStore>,
        retries: u32,
        stats: Arc<SchedulerStats>,
    ) -> (BookkeepingSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(write_loop(store, rx, retries.max(1), stats));
        (BookkeepingSender { tx }, Self { handle })
    }

    /// Wait for the writer to drain. Returns once every sender is dropped and
    /// the queued writes have been attempted.
    pub async fn finish(self) {
        if let Err(e) = self.handle.await {
            error!(error = %e, "bookkeeping writer task failed");
        }
    }
}

async fn write_loop(
    store: Arc<dyn ScheduleStore>,
    mut rx: mpsc::UnboundedReceiver<Command>,
    retries: u32,
    stats: Arc<SchedulerStats>,
) {
    // Runs whose write gave up, replayed in order before the next run of the
    // same schedule so `total_run_count` catches up.
    let mut backlog: HashMap<String, Vec<DateTime<Utc>>> = HashMap::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Record { name, run_at } => {
                let mut runs = backlog.remove(&name).unwrap_or_default();
                if !runs.is_empty() {
                    info!(schedule = %name, pending = runs.len(), "replaying unrecorded runs");
                }
                runs.push(run_at);

                for (i, at) in runs.iter().enumerate() {
                    match write_with_retry(store.as_ref(), &name, *at, retries, &stats).await {
                        WriteOutcome::Recorded => {}
                        WriteOutcome::Dropped => break,
                        WriteOutcome::Exhausted => {
                            backlog.insert(name.clone(), runs[i..].to_vec());
                            break;
                        }
                    }
                }
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    for (name, runs) in &backlog {
        error!(schedule = %name, lost = runs.len(), "runs never recorded before shutdown");
    }
    debug!("bookkeeping writer drained");
}

enum WriteOutcome {
    Recorded,
    /// The schedule no longer exists; nothing left to record.
    Dropped,
    Exhausted,
}

async fn write_with_retry(
    store: &dyn ScheduleStore,
    name: &str,
    run_at: DateTime<Utc>,
    retries: u32,
    stats: &SchedulerStats,
) -> WriteOutcome {
    for attempt in 1..=retries {
        match store.record_run(name, run_at).await {
            Ok(()) => {
                debug!(schedule = %name, run_at = %run_at, "run recorded");
                return WriteOutcome::Recorded;
            }
            Err(SchedulerError::ScheduleNotFound { .. }) => {
                warn!(schedule = %name, "schedule removed before its run was recorded");
                stats.record_bookkeeping_failure();
                return WriteOutcome::Dropped;
            }
            Err(e) => {
                warn!(schedule = %name, attempt, error = %e, "bookkeeping write failed");
                if attempt < retries {
                    tokio::time::sleep(BOOKKEEPING_BACKOFF * attempt).await;
                }
            }
        }
    }
    error!(
        schedule = %name,
        run_at = %run_at,
        attempts = retries,
        "giving up on bookkeeping write until the next run of this schedule"
    );
    stats.record_bookkeeping_failure();
    WriteOutcome::Exhausted
}
