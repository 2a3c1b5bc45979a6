//! In-memory doubles shared by the unit tests.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    clock::Clock,
    error::{Result, SchedulerError},
    queue::{JobQueue, QueueError},
    store::ScheduleStore,
    types::{JobMessage, ScheduleDefinition},
};

pub fn at(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, ScheduleDefinition>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    write_attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn with(defs: Vec<ScheduleDefinition>) -> Self {
        let store = Self::default();
        for def in defs {
            store.put(def);
        }
        store
    }

    pub fn put(&self, def: ScheduleDefinition) {
        self.rows.lock().unwrap().insert(def.name.clone(), def);
    }

    pub fn definition(&self, name: &str) -> Option<ScheduleDefinition> {
        self.rows.lock().unwrap().get(name).cloned()
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScheduleStore for MemoryStore {
    async fn list_enabled_schedules(&self) -> Result<Vec<ScheduleDefinition>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SchedulerError::Store("store offline".to_string()));
        }
        let rows = self.rows.lock().unwrap();
        Ok(rows.values().filter(|d| d.enabled).cloned().collect())
    }

    async fn get_schedule(&self, name: &str) -> Result<Option<ScheduleDefinition>> {
        Ok(self.definition(name))
    }

    async fn record_run(&self, name: &str, run_at: DateTime<Utc>) -> Result<()> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SchedulerError::Store("store offline".to_string()));
        }
        let mut rows = self.rows.lock().unwrap();
        let def = rows.get_mut(name).ok_or_else(|| SchedulerError::ScheduleNotFound {
            name: name.to_string(),
        })?;
        def.last_run_at = Some(run_at);
        def.total_run_count += 1;
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<JobMessage>>,
    fail_all: AtomicBool,
    failing_schedules: Mutex<HashSet<String>>,
}

impl RecordingQueue {
    pub fn fail_all(&self, on: bool) {
        self.fail_all.store(on, Ordering::SeqCst);
    }

    pub fn fail_schedule(&self, name: &str) {
        self.failing_schedules.lock().unwrap().insert(name.to_string());
    }

    pub fn jobs(&self) -> Vec<JobMessage> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn tasks(&self) -> Vec<String> {
        self.jobs().into_iter().map(|j| j.task).collect()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    fn name(&self) -> &str {
        "recording"
    }

    async fn enqueue(&self, job: &JobMessage) -> std::result::Result<(), QueueError> {
        if self.fail_all.load(Ordering::SeqCst)
            || self.failing_schedules.lock().unwrap().contains(&job.schedule)
        {
            return Err(QueueError::Unavailable("broker down".to_string()));
        }
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
