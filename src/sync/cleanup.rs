//! Retention sweep for old chunks and expired named data.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::chunk::{ChunkStatus, ChunkStore};
use crate::clock;
use crate::config::SyncConfig;
use crate::data::DataStore;

/// Outcome of one sweep. Failures are recorded, never raised.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SweepReport {
    pub chunks_removed: u64,
    pub records_purged: u64,
    pub errors: Vec<String>,
}

pub struct CleanupSweeper {
    chunks: Arc<dyn ChunkStore>,
    data: Option<Arc<dyn DataStore>>,
    retention: Duration,
    status: Option<ChunkStatus>,
    interval: Duration,
}

impl CleanupSweeper {
    pub fn new(chunks: Arc<dyn ChunkStore>, config: &SyncConfig) -> Self {
        Self {
            chunks,
            data: None,
            retention: config.retention(),
            status: config.cleanup_status,
            interval: config.cleanup_interval(),
        }
    }

    /// Also purge expired records from `data` on each tick.
    pub fn with_data_store(mut self, data: Arc<dyn DataStore>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn tick(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        match self.chunks.cleanup(self.retention, self.status, now) {
            Ok(removed) => report.chunks_removed = removed,
            Err(err) => {
                warn!("chunk cleanup failed: {}", err);
                report.errors.push(err.to_string());
            }
        }
        if let Some(data) = &self.data {
            match data.purge_expired(now) {
                Ok(purged) => report.records_purged = purged,
                Err(err) => {
                    warn!("named data purge failed: {}", err);
                    report.errors.push(err.to_string());
                }
            }
        }
        if report.chunks_removed > 0 || report.records_purged > 0 {
            info!(
                "cleanup removed {} chunk(s), purged {} record(s)",
                report.chunks_removed, report.records_purged
            );
        }
        report
    }

    /// Runs [`CleanupSweeper::tick`] every configured interval on the current
    /// tokio runtime. Store calls block, so each tick runs on the blocking pool.
    pub fn spawn_periodic(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let sweeper = self.clone();
                if let Err(err) =
                    tokio::task::spawn_blocking(move || sweeper.tick(clock::now())).await
                {
                    warn!("cleanup task panicked: {}", err);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    use crate::chunk::{Chunk, InMemoryChunkStore};
    use crate::data::InMemoryDataStore;
    use crate::error::{Result, SyncError};
    use crate::queue::ActionId;

    use super::*;

    struct BrokenStore;

    impl ChunkStore for BrokenStore {
        fn save(&self, _chunk: &Chunk) -> Result<i64> {
            Err(SyncError::Persistence("down".into()))
        }
        fn get(&self, _id: i64) -> Result<Option<Chunk>> {
            Ok(None)
        }
        fn find_by_action(&self, _action_id: ActionId) -> Result<Option<Chunk>> {
            Ok(None)
        }
        fn list_by_group_and_status(&self, _g: &str, _s: &[ChunkStatus]) -> Result<Vec<Chunk>> {
            Ok(Vec::new())
        }
        fn count_by_group_and_status(&self, _g: &str, _s: &[ChunkStatus]) -> Result<usize> {
            Ok(0)
        }
        fn transition(&self, _id: i64, _to: ChunkStatus, _at: DateTime<Utc>) -> Result<bool> {
            Ok(false)
        }
        fn cleanup(
            &self,
            _older_than: Duration,
            _status: Option<ChunkStatus>,
            _now: DateTime<Utc>,
        ) -> Result<u64> {
            Err(SyncError::Persistence("cleanup: disk full".into()))
        }
    }

    #[test]
    fn tick_removes_old_chunks_and_expired_records() {
        let chunks = Arc::new(InMemoryChunkStore::new());
        let data = Arc::new(InMemoryDataStore::new());
        let now = clock::now();

        let mut old = Chunk::new("g", "x");
        old.created_at = now - ChronoDuration::days(8);
        chunks.save(&old).expect("save old");
        chunks.save(&Chunk::new("g", "y")).expect("save fresh");
        data.set("stale", &json!(1), Some(Duration::ZERO))
            .expect("set stale");

        let sweeper = CleanupSweeper::new(chunks.clone(), &SyncConfig::default())
            .with_data_store(data.clone());
        let report = sweeper.tick(clock::now());
        assert_eq!(report.chunks_removed, 1);
        assert_eq!(report.records_purged, 1);
        assert!(report.errors.is_empty());
        assert_eq!(chunks.count_by_group("g").expect("count"), 1);
    }

    #[test]
    fn tick_reports_failures_instead_of_raising() {
        let sweeper = CleanupSweeper::new(Arc::new(BrokenStore), &SyncConfig::default());
        let report = sweeper.tick(clock::now());
        assert_eq!(report.chunks_removed, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("disk full"));
    }

    #[tokio::test]
    async fn periodic_sweep_runs_on_the_interval() {
        let chunks = Arc::new(InMemoryChunkStore::new());
        let mut old = Chunk::new("g", "x");
        old.created_at = clock::now() - ChronoDuration::days(30);
        chunks.save(&old).expect("save old");

        let config = SyncConfig {
            cleanup_interval_secs: 60,
            ..Default::default()
        };
        let handle = Arc::new(CleanupSweeper::new(chunks.clone(), &config)).spawn_periodic();
        for _ in 0..50 {
            if chunks.count_by_group("g").expect("count") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert_eq!(chunks.count_by_group("g").expect("count"), 0);
    }
}
