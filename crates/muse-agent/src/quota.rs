//! Process-wide daily quota gate.
//!
//! One mutex guards the `(count, day)` pair. The day rollover check, the
//! optional store read, the comparison against the limit, the increment and
//! the store write all happen inside that one critical section.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Days, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Source of "today" for rollover
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local wall-clock date
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        chrono::Local::now().date_naive()
    }
}

/// A clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock() = today;
    }

    pub fn advance_days(&self, days: u64) {
        let mut today = self.today.lock();
        if let Some(next) = today.checked_add_days(Days::new(days)) {
            *today = next;
        }
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock()
    }
}

/// Usage snapshot reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub current: u32,
    pub limit: u32,
    pub remaining: u32,
}

/// The persisted counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub count: u32,
    pub day: NaiveDate,
}

/// Persistence for the counter
pub trait QuotaStore: Send + Sync {
    fn load(&self) -> Result<Option<QuotaRecord>>;
    fn save(&self, record: &QuotaRecord) -> Result<()>;
}

/// Stores the counter as a small JSON file
#[derive(Debug, Clone)]
pub struct JsonFileQuotaStore {
    path: PathBuf,
}

impl JsonFileQuotaStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl QuotaStore for JsonFileQuotaStore {
    fn load(&self) -> Result<Option<QuotaRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        let record = serde_json::from_str(&text).map_err(|e| Error::QuotaStore(e.to_string()))?;
        Ok(Some(record))
    }

    fn save(&self, record: &QuotaRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(record).map_err(|e| Error::QuotaStore(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Daily admission control shared by every request
pub struct QuotaGate {
    limit: u32,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn QuotaStore>>,
    state: Mutex<QuotaRecord>,
}

impl QuotaGate {
    pub fn new(limit: u32, clock: Arc<dyn Clock>) -> Self {
        let day = clock.today();
        Self {
            limit,
            clock,
            store: None,
            state: Mutex::new(QuotaRecord { count: 0, day }),
        }
    }

    /// Gate using the system clock
    pub fn daily(limit: u32) -> Self {
        Self::new(limit, Arc::new(SystemClock))
    }

    /// Persist the counter through `store`
    pub fn with_store(mut self, store: Arc<dyn QuotaStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Bring the in-memory record up to date. Runs under the lock.
    fn refresh(&self, record: &mut QuotaRecord) {
        let today = self.clock.today();
        if record.day != today {
            tracing::info!(previous = %record.day, %today, "quota day rolled over");
            record.day = today;
            record.count = 0;
        }
        if let Some(store) = &self.store {
            match store.load() {
                Ok(Some(saved)) if saved.day == today => record.count = saved.count,
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "failed to read quota store"),
            }
        }
    }

    fn persist(&self, record: &QuotaRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(record) {
                tracing::warn!(error = %e, "failed to persist quota");
            }
        }
    }

    fn snapshot(&self, record: &QuotaRecord) -> QuotaStatus {
        QuotaStatus {
            current: record.count,
            limit: self.limit,
            remaining: self.limit.saturating_sub(record.count),
        }
    }

    /// Consume one request from today's quota. Returns `false`, consuming
    /// nothing, when the quota is exhausted.
    pub fn check_and_consume(&self) -> bool {
        let mut record = self.state.lock();
        self.refresh(&mut record);
        if record.count >= self.limit {
            tracing::warn!(limit = self.limit, "daily quota exhausted");
            return false;
        }
        record.count += 1;
        self.persist(&record);
        true
    }

    /// Current usage, without consuming anything
    pub fn status(&self) -> QuotaStatus {
        let mut record = self.state.lock();
        self.refresh(&mut record);
        self.snapshot(&record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, d).unwrap()
    }

    #[test]
    fn test_consume_until_limit() {
        let gate = QuotaGate::new(2, Arc::new(ManualClock::new(day(1))));
        assert!(gate.check_and_consume());
        assert!(gate.check_and_consume());
        assert!(!gate.check_and_consume());
        assert_eq!(
            gate.status(),
            QuotaStatus {
                current: 2,
                limit: 2,
                remaining: 0
            }
        );
    }

    #[test]
    fn test_status_does_not_consume() {
        let gate = QuotaGate::new(5, Arc::new(ManualClock::new(day(1))));
        gate.status();
        gate.status();
        assert_eq!(gate.status().current, 0);
        assert_eq!(gate.status().remaining, 5);
    }

    #[test]
    fn test_day_rollover_resets_count() {
        let clock = Arc::new(ManualClock::new(day(1)));
        let gate = QuotaGate::new(1, clock.clone());
        assert!(gate.check_and_consume());
        assert!(!gate.check_and_consume());

        clock.advance_days(1);
        assert_eq!(gate.status().current, 0);
        assert!(gate.check_and_consume());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_consumers_never_exceed_limit() {
        let limit = 25;
        let callers = 200;
        let gate = Arc::new(QuotaGate::new(limit, Arc::new(ManualClock::new(day(1)))));
        let barrier = Arc::new(tokio::sync::Barrier::new(callers));

        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    gate.check_and_consume()
                })
            })
            .collect();

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, limit);
        assert_eq!(gate.status().current, limit);
    }

    #[test]
    fn test_file_store_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/quota.json");
        let clock = Arc::new(ManualClock::new(day(4)));

        let gate = QuotaGate::new(3, clock.clone())
            .with_store(Arc::new(JsonFileQuotaStore::new(&path)));
        assert!(gate.check_and_consume());
        assert!(gate.check_and_consume());

        let restarted = QuotaGate::new(3, clock.clone())
            .with_store(Arc::new(JsonFileQuotaStore::new(&path)));
        assert_eq!(restarted.status().current, 2);
        assert!(restarted.check_and_consume());
        assert!(!restarted.check_and_consume());
    }

    #[test]
    fn test_gates_sharing_a_store_keep_one_count_across_days() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        let clock = Arc::new(ManualClock::new(day(1)));
        let first = QuotaGate::new(3, clock.clone())
            .with_store(Arc::new(JsonFileQuotaStore::new(&path)));
        let second = QuotaGate::new(3, clock.clone())
            .with_store(Arc::new(JsonFileQuotaStore::new(&path)));

        clock.advance_days(1);
        assert!(first.check_and_consume());
        assert!(first.check_and_consume());
        assert!(first.check_and_consume());
        assert_eq!(second.status().current, 3);

        let successes = (0..3)
            .filter(|_| second.check_and_consume() || first.check_and_consume())
            .count();
        assert_eq!(successes, 0);

        clock.advance_days(1);
        assert_eq!(first.status().current, 0);
        assert!(second.check_and_consume());
        assert_eq!(first.status().current, 1);
    }

    #[test]
    fn test_stale_stored_day_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileQuotaStore::new(dir.path().join("quota.json"));
        store.save(&QuotaRecord { count: 9, day: day(1) }).unwrap();

        let gate = QuotaGate::new(10, Arc::new(ManualClock::new(day(2))))
            .with_store(Arc::new(store));
        assert_eq!(gate.status().current, 0);
    }

    #[test]
    fn test_corrupt_store_falls_back_to_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quota.json");
        std::fs::write(&path, "not json").unwrap();
        let gate = QuotaGate::new(1, Arc::new(ManualClock::new(day(1))))
            .with_store(Arc::new(JsonFileQuotaStore::new(&path)));
        assert!(gate.check_and_consume());
        assert!(!gate.check_and_consume());
    }
}
