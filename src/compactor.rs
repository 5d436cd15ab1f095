use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;
use crate::observability;

/// Compact once if at least `threshold` appends landed since the last run.
/// Returns whether a compaction happened.
pub async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        if !compact_if_due(&engine, threshold).await {
            debug!("compactor: nothing to do");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::notify::NotifyHub;
    use chrono_tz::Tz;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotwise_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let engine = Engine::new(path, Arc::new(NotifyHub::new()), Arc::new(SystemClock)).unwrap();

        for _ in 0..3 {
            engine.create_host(Ulid::new(), None, Tz::UTC).await.unwrap();
        }
        assert!(!compact_if_due(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 3);

        assert!(compact_if_due(&engine, 3).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert_eq!(engine.list_hosts().await.len(), 3);
    }

    #[tokio::test]
    async fn background_task_compacts() {
        let path = test_wal_path("background.wal");
        let engine =
            Arc::new(Engine::new(path, Arc::new(NotifyHub::new()), Arc::new(SystemClock)).unwrap());
        engine.create_host(Ulid::new(), None, Tz::UTC).await.unwrap();

        let task = tokio::spawn(run_compactor(engine.clone(), 1, Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        task.abort();
    }
}
