use std::sync::Arc;
use std::time::Duration as StdDuration;

use cadence_core::config::SchedulerConfig;
use chrono::{DateTime, Duration, Utc};
use futures_util::{stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::{
    cache::{self, CacheSnapshot, ScheduleEntry, SyncOutcome},
    clock::Clock,
    dispatcher::{BookkeepingSender, BookkeepingWriter, DispatchResult, Dispatcher},
    error::{Result, SchedulerError},
    queue::JobQueue,
    stats::SchedulerStats,
    store::ScheduleStore,
};

/// What one pass of the loop did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// A sync ran and replaced the snapshot.
    pub synced: bool,
    pub dispatched: usize,
    pub failed: usize,
    /// How long the loop should sleep before the next pass.
    pub sleep: StdDuration,
}

/// The periodic-task scheduler: owns the cache, the dispatcher and the
/// bookkeeping writer, and drives them from a single control loop.
///
/// Construct once with [`Scheduler::new`], call [`Scheduler::start`] for the
/// initial sync, then hand it to [`Scheduler::run`].
pub struct Scheduler {
    store: Arc<dyn ScheduleStore>,
    dispatcher: Dispatcher,
    bookkeeping: BookkeepingSender,
    writer: BookkeepingWriter,
    clock: Arc<dyn Clock>,
    cache: CacheSnapshot,
    last_sync_at: Option<DateTime<Utc>>,
    published: watch::Sender<Arc<CacheSnapshot>>,
    stats: Arc<SchedulerStats>,
    sync_every: Duration,
    max_sleep: StdDuration,
    retry_delay: Duration,
    dispatch_concurrency: usize,
}

impl Scheduler {
    /// Build a scheduler. Spawns the bookkeeping writer, so this must be
    /// called from within a Tokio runtime.
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn ScheduleStore>,
        queue: Arc<dyn JobQueue>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SchedulerError::Config(e.to_string()))?;

        let stats = Arc::new(SchedulerStats::default());
        let (bookkeeping, writer) = BookkeepingWriter::spawn(
            Arc::clone(&store),
            config.bookkeeping_retries,
            Arc::clone(&stats),
        );
        let dispatcher = Dispatcher::new(queue, bookkeeping.clone(), Arc::clone(&stats));
        let (published, _) = watch::channel(Arc::new(CacheSnapshot::empty()));

        Ok(Self {
            store,
            dispatcher,
            bookkeeping,
            writer,
            clock,
            cache: CacheSnapshot::empty(),
            last_sync_at: None,
            published,
            stats,
            sync_every: seconds("sync_every_seconds", config.sync_every_seconds)?,
            max_sleep: StdDuration::from_secs(config.max_interval_seconds),
            retry_delay: seconds("retry_delay_seconds", config.retry_delay_seconds)?,
            dispatch_concurrency: config.dispatch_concurrency,
        })
    }

    /// Receive every snapshot the loop publishes.
    pub fn subscribe(&self) -> watch::Receiver<Arc<CacheSnapshot>> {
        self.published.subscribe()
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    pub fn snapshot(&self) -> &CacheSnapshot {
        &self.cache
    }

    /// Initial sync. Unlike later syncs, a failure here is returned to the
    /// caller: a scheduler that has never seen the store should not run.
    pub async fn start(&mut self) -> Result<()> {
        let now = self.clock.now();
        self.last_sync_at = Some(now);
        let outcome = cache::sync(self.store.as_ref(), None, now).await?;
        self.apply_sync(outcome);
        self.publish();
        info!(
            schedules = self.cache.len(),
            next_wake = ?self.cache.next_wake(),
            "scheduler started"
        );
        Ok(())
    }

    /// One Dispatching pass at `now`: sync if due, hand off every due entry,
    /// then compute the next sleep.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let synced = if self.sync_due(now) {
            self.resync(now).await
        } else {
            false
        };

        // Owned copies: the cache is only touched again after every
        // hand-off of this wake has returned.
        let due: Vec<ScheduleEntry> = self.cache.due(now).into_iter().cloned().collect();
        let (mut dispatched, mut failed) = (0, 0);

        if !due.is_empty() {
            // Futures are built up front: a closure over `&ScheduleEntry` held
            // inside the stream would make this future non-`Send`.
            let hand_offs: Vec<_> = due
                .iter()
                .map(|entry| {
                    let name = entry.name().to_string();
                    let sent = self.dispatcher.dispatch(entry, now);
                    async move { (name, sent.await) }
                })
                .collect();
            let results: Vec<(String, DispatchResult)> = stream::iter(hand_offs)
                .buffered(self.dispatch_concurrency)
                .collect()
                .await;

            for (name, result) in results {
                let Some(entry) = self.cache.get_mut(&name) else {
                    continue;
                };
                match result {
                    DispatchResult::Sent { .. } => {
                        entry.mark_dispatched(now);
                        dispatched += 1;
                    }
                    DispatchResult::Failed { .. } => {
                        entry.mark_failed(now, self.retry_delay);
                        failed += 1;
                    }
                }
            }
        }

        if synced || !due.is_empty() {
            self.publish();
        }

        TickReport {
            synced,
            dispatched,
            failed,
            sleep: self.sleep_duration(now),
        }
    }

    /// Sleep until the earliest of the next due entry and the next sync,
    /// capped at `max_interval_seconds`.
    pub fn sleep_duration(&self, now: DateTime<Utc>) -> StdDuration {
        let next_sync = self.last_sync_at.map(|t| t + self.sync_every);
        let target = match (self.cache.next_wake(), next_sync) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        compute_sleep(now, target, self.max_sleep)
    }

    /// Wait until every bookkeeping write queued so far has been attempted.
    pub async fn flush_bookkeeping(&self) {
        self.bookkeeping.flush().await;
    }

    /// Run until `shutdown` turns `true` (or its sender goes away).
    ///
    /// Shutdown is checked between passes, never mid-dispatch. On exit the
    /// bookkeeping queue is drained before this returns.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler loop running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let report = self.tick(self.clock.now()).await;
            debug!(
                synced = report.synced,
                dispatched = report.dispatched,
                failed = report.failed,
                sleep_ms = report.sleep.as_millis() as u64,
                "tick complete"
            );
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(report.sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("scheduler loop stopping, draining bookkeeping");
        let Scheduler {
            dispatcher,
            bookkeeping,
            writer,
            ..
        } = self;
        drop(dispatcher);
        drop(bookkeeping);
        writer.finish().await;
        info!("scheduler stopped");
    }

    fn sync_due(&self, now: DateTime<Utc>) -> bool {
        self.last_sync_at
            .map_or(true, |last| now - last >= self.sync_every)
    }

    /// Periodic sync. A failed read keeps the current snapshot.
    async fn resync(&mut self, now: DateTime<Utc>) -> bool {
        self.last_sync_at = Some(now);
        match cache::sync(self.store.as_ref(), Some(&self.cache), now).await {
            Ok(outcome) => {
                self.apply_sync(outcome);
                true
            }
            Err(e) => {
                self.stats.record_sync_failure();
                warn!(
                    error = %e,
                    schedules = self.cache.len(),
                    "schedule sync failed, keeping previous snapshot"
                );
                false
            }
        }
    }

    fn apply_sync(&mut self, outcome: SyncOutcome) {
        self.stats.record_sync(outcome.skipped.len());
        debug!(
            schedules = outcome.snapshot.len(),
            skipped = outcome.skipped.len(),
            "schedule cache synced"
        );
        self.cache = outcome.snapshot;
    }

    fn publish(&self) {
        self.published.send_replace(Arc::new(self.cache.clone()));
    }
}

/// `max(0, min(max, target - now))`; `max` when there is nothing to wait for.
pub fn compute_sleep(
    now: DateTime<Utc>,
    target: Option<DateTime<Utc>>,
    max: StdDuration,
) -> StdDuration {
    match target {
        Some(t) => (t - now).to_std().unwrap_or(StdDuration::ZERO).min(max),
        None => max,
    }
}

fn seconds(field: &str, secs: u64) -> Result<Duration> {
    Duration::from_std(StdDuration::from_secs(secs))
        .map_err(|_| SchedulerError::Config(format!("{field} is out of range")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, FixedClock, MemoryStore, RecordingQueue};
    use crate::types::{CrontabFields, ScheduleDefinition};
    use proptest::prelude::*;

    struct Harness {
        scheduler: Scheduler,
        store: Arc<MemoryStore>,
        queue: Arc<RecordingQueue>,
    }

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            sync_every_seconds: 60,
            max_interval_seconds: 300,
            dispatch_concurrency: 4,
            retry_delay_seconds: 5,
            bookkeeping_retries: 1,
        }
    }

    async fn harness(defs: Vec<ScheduleDefinition>, start: DateTime<Utc>) -> Harness {
        harness_with(config(), defs, start).await
    }

    async fn harness_with(
        cfg: SchedulerConfig,
        defs: Vec<ScheduleDefinition>,
        start: DateTime<Utc>,
    ) -> Harness {
        let store = Arc::new(MemoryStore::with(defs));
        let queue = Arc::new(RecordingQueue::default());
        let mut scheduler = Scheduler::new(
            &cfg,
            Arc::clone(&store) as Arc<dyn ScheduleStore>,
            Arc::clone(&queue) as Arc<dyn JobQueue>,
            Arc::new(FixedClock(start)),
        )
        .unwrap();
        scheduler.start().await.unwrap();
        Harness {
            scheduler,
            store,
            queue,
        }
    }

    #[test]
    fn sleep_is_clamped_to_zero_and_max() {
        let now = at("2024-01-01T00:00:00Z");
        let max = StdDuration::from_secs(300);
        assert_eq!(compute_sleep(now, Some(at("2023-12-31T23:59:00Z")), max), StdDuration::ZERO);
        assert_eq!(compute_sleep(now, Some(at("2024-01-01T00:00:10Z")), max), StdDuration::from_secs(10));
        assert_eq!(compute_sleep(now, Some(at("2024-01-02T00:00:00Z")), max), max);
        assert_eq!(compute_sleep(now, None, max), max);
    }

    proptest! {
        #[test]
        fn compute_sleep_stays_within_bounds(
            now_secs in 0i64..4_000_000_000,
            offset in -1_000_000i64..1_000_000,
            max_secs in 1u64..86_400,
        ) {
            let now = DateTime::<Utc>::from_timestamp(now_secs, 0).unwrap();
            let max = StdDuration::from_secs(max_secs);
            let sleep = compute_sleep(now, Some(now + Duration::seconds(offset)), max);
            prop_assert!(sleep <= max);
            if offset <= 0 {
                prop_assert_eq!(sleep, StdDuration::ZERO);
            } else if (offset as u64) < max_secs {
                prop_assert_eq!(sleep, StdDuration::from_secs(offset as u64));
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn scheduler_sleep_stays_within_max_interval(
            every in 1u64..3_600,
            last_run_ago in 0i64..10_000,
            elapsed in 0i64..10_000,
            fail in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let t0 = at("2024-01-01T00:00:00Z");
            let (first, later) = rt.block_on(async {
                let mut h = harness(
                    vec![ScheduleDefinition::interval("job", "noop", every)
                        .with_last_run(t0 - Duration::seconds(last_run_ago))],
                    t0,
                )
                .await;
                if fail {
                    h.queue.fail_schedule("job");
                }
                let report = h.scheduler.tick(t0).await;
                (report.sleep, h.scheduler.sleep_duration(t0 + Duration::seconds(elapsed)))
            });
            let max = StdDuration::from_secs(config().max_interval_seconds);
            prop_assert!(first <= max);
            prop_assert!(later <= max);
        }
    }

    #[tokio::test]
    async fn rejects_zero_config_values() {
        let mut cfg = config();
        cfg.dispatch_concurrency = 0;
        let result = Scheduler::new(
            &cfg,
            Arc::new(MemoryStore::default()),
            Arc::new(RecordingQueue::default()),
            Arc::new(FixedClock(Utc::now())),
        );
        assert!(matches!(result, Err(SchedulerError::Config(_))));
    }

    #[tokio::test]
    async fn start_fails_when_store_is_unreachable() {
        let store = Arc::new(MemoryStore::default());
        store.fail_reads(true);
        let mut scheduler = Scheduler::new(
            &config(),
            store,
            Arc::new(RecordingQueue::default()),
            Arc::new(FixedClock(Utc::now())),
        )
        .unwrap();
        assert!(scheduler.start().await.is_err());
    }

    #[tokio::test]
    async fn heartbeat_fires_once_per_interval() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(vec![ScheduleDefinition::interval("heartbeat", "ping", 30)], t0).await;

        let report = h.scheduler.tick(t0).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.sleep, StdDuration::from_secs(30));

        // Same wake again: nothing is due, no duplicate fire.
        let again = h.scheduler.tick(t0).await;
        assert_eq!(again.dispatched, 0);

        // Processing took a while; next due is still run time + interval.
        let report = h.scheduler.tick(at("2024-01-01T00:00:31Z")).await;
        assert_eq!(report.dispatched, 1);
        let entry = h.scheduler.snapshot().get("heartbeat").unwrap();
        assert_eq!(entry.next_due_at, at("2024-01-01T00:01:01Z"));

        h.scheduler.flush_bookkeeping().await;
        assert_eq!(h.store.definition("heartbeat").unwrap().total_run_count, 2);
        assert_eq!(h.queue.tasks(), vec!["ping", "ping"]);
    }

    #[tokio::test]
    async fn failed_hand_off_is_retried_and_isolated() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(
            vec![
                ScheduleDefinition::interval("heartbeat", "ping", 30),
                ScheduleDefinition::interval("metrics", "metrics.flush", 30),
            ],
            t0,
        )
        .await;
        h.queue.fail_schedule("heartbeat");

        let report = h.scheduler.tick(t0).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.sleep, StdDuration::from_secs(5));

        let entry = h.scheduler.snapshot().get("heartbeat").unwrap();
        assert_eq!(entry.definition.last_run_at, None);
        assert!(entry.next_due_at <= t0);

        h.scheduler.flush_bookkeeping().await;
        assert_eq!(h.store.definition("heartbeat").unwrap().total_run_count, 0);
        assert_eq!(h.store.definition("metrics").unwrap().total_run_count, 1);
        assert_eq!(h.scheduler.stats().snapshot().dispatch_failures, 1);
    }

    #[tokio::test]
    async fn failed_hand_off_is_retried_on_a_wake_driven_by_another_entry() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(
            vec![
                ScheduleDefinition::interval("fast", "tick", 1),
                ScheduleDefinition::interval("heartbeat", "ping", 30),
            ],
            t0,
        )
        .await;
        h.queue.fail_schedule("heartbeat");

        let report = h.scheduler.tick(t0).await;
        assert_eq!((report.dispatched, report.failed), (1, 1));
        assert_eq!(report.sleep, StdDuration::from_secs(1));

        // "fast" wakes the loop well before the retry delay; heartbeat is
        // attempted again anyway.
        let report = h.scheduler.tick(at("2024-01-01T00:00:01Z")).await;
        assert_eq!((report.dispatched, report.failed), (1, 1));
        assert_eq!(report.sleep, StdDuration::from_secs(1));

        let entry = h.scheduler.snapshot().get("heartbeat").unwrap();
        assert_eq!(entry.consecutive_failures, 2);
        assert_eq!(entry.wake_at(), at("2024-01-01T00:00:06Z"));
        assert_eq!(h.scheduler.stats().snapshot().dispatch_failures, 2);
    }

    #[tokio::test]
    async fn late_wake_fires_once_and_reschedules_from_the_run() {
        let t0 = at("2024-01-01T00:00:00Z");
        let woke = at("2024-01-01T00:00:45Z");
        let mut h = harness(
            vec![ScheduleDefinition::interval("heartbeat", "ping", 30).with_last_run(t0)],
            woke,
        )
        .await;
        assert_eq!(
            h.scheduler.snapshot().get("heartbeat").unwrap().next_due_at,
            at("2024-01-01T00:00:30Z")
        );

        let report = h.scheduler.tick(woke).await;
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.scheduler.tick(woke).await.dispatched, 0);

        let entry = h.scheduler.snapshot().get("heartbeat").unwrap();
        assert_eq!(entry.next_due_at, at("2024-01-01T00:01:15Z"));
        assert_eq!(h.queue.tasks(), vec!["ping"]);
    }

    #[tokio::test]
    async fn due_entries_dispatch_in_name_order() {
        let t0 = at("2024-01-01T00:00:00Z");
        let cfg = SchedulerConfig {
            dispatch_concurrency: 1,
            ..config()
        };
        let mut h = harness_with(
            cfg,
            vec![
                ScheduleDefinition::interval("c", "task-c", 30),
                ScheduleDefinition::interval("a", "task-a", 30),
                ScheduleDefinition::interval("b", "task-b", 30),
            ],
            t0,
        )
        .await;
        h.scheduler.tick(t0).await;
        let schedules: Vec<String> = h.queue.jobs().into_iter().map(|j| j.schedule).collect();
        assert_eq!(schedules, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn disabled_mid_run_disappears_after_next_sync() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(vec![ScheduleDefinition::interval("heartbeat", "ping", 30)], t0).await;
        h.scheduler.tick(t0).await;
        h.scheduler.flush_bookkeeping().await;

        let mut def = h.store.definition("heartbeat").unwrap();
        def.enabled = false;
        h.store.put(def);

        let report = h.scheduler.tick(at("2024-01-01T00:01:00Z")).await;
        assert!(report.synced);
        assert_eq!(report.dispatched, 0);
        assert!(h.scheduler.snapshot().is_empty());
    }

    #[tokio::test]
    async fn failed_sync_keeps_the_previous_snapshot() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(vec![ScheduleDefinition::interval("heartbeat", "ping", 30)], t0).await;
        h.scheduler.tick(t0).await;
        h.store.fail_reads(true);

        let report = h.scheduler.tick(at("2024-01-01T00:01:00Z")).await;
        assert!(!report.synced);
        assert_eq!(report.dispatched, 1);
        assert_eq!(h.scheduler.snapshot().len(), 1);
        assert_eq!(h.scheduler.stats().snapshot().sync_failures, 1);
    }

    #[tokio::test]
    async fn sleep_never_overshoots_the_next_sync() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(
            vec![ScheduleDefinition::crontab(
                "daily-report",
                "reports.daily",
                CrontabFields::new("0", "9", "*", "*", "*"),
            )],
            t0,
        )
        .await;
        let report = h.scheduler.tick(t0).await;
        assert_eq!(report.sleep, StdDuration::from_secs(60));
    }

    #[tokio::test]
    async fn new_schedule_is_picked_up_by_sync() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(Vec::new(), t0).await;
        assert_eq!(h.scheduler.tick(t0).await.sleep, StdDuration::from_secs(60));

        h.store.put(ScheduleDefinition::interval("late", "noop", 10));
        let report = h.scheduler.tick(at("2024-01-01T00:01:00Z")).await;
        assert!(report.synced);
        assert_eq!(report.dispatched, 1);
    }

    #[tokio::test]
    async fn published_snapshot_follows_dispatch() {
        let t0 = at("2024-01-01T00:00:00Z");
        let mut h = harness(vec![ScheduleDefinition::interval("heartbeat", "ping", 30)], t0).await;
        let rx = h.scheduler.subscribe();
        h.scheduler.tick(t0).await;
        let published = rx.borrow().clone();
        let entry = published.get("heartbeat").unwrap();
        assert_eq!(entry.definition.last_run_at, Some(t0));
        assert_eq!(entry.definition.total_run_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown_and_drains_bookkeeping() {
        let t0 = at("2024-01-01T00:00:00Z");
        let h = harness(vec![ScheduleDefinition::interval("heartbeat", "ping", 30)], t0).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.scheduler.run(rx));

        tokio::time::sleep(StdDuration::from_millis(10)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(h.queue.tasks(), vec!["ping"]);
        assert_eq!(h.store.definition("heartbeat").unwrap().total_run_count, 1);
    }
}
