//! Process metrics for the sync loop.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counters updated by the sync loop and served by the status endpoints.
pub struct IndexerMetrics {
    /// Highest level written to the store.
    pub last_synced_level: AtomicI64,
    /// Total blocks written.
    pub total_blocks_indexed: AtomicU64,
    /// Total operation groups written.
    pub total_operation_groups: AtomicU64,
    /// Total account references extracted.
    pub total_accounts_touched: AtomicU64,
    /// Fork repairs performed.
    pub total_forks_followed: AtomicU64,
    /// Whether a sync cycle is in progress.
    pub is_syncing: AtomicBool,
    start_time: Instant,
}

impl Default for IndexerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexerMetrics {
    pub fn new() -> Self {
        Self {
            last_synced_level: AtomicI64::new(-1),
            total_blocks_indexed: AtomicU64::new(0),
            total_operation_groups: AtomicU64::new(0),
            total_accounts_touched: AtomicU64::new(0),
            total_forks_followed: AtomicU64::new(0),
            is_syncing: AtomicBool::new(false),
            start_time: Instant::now(),
        }
    }

    /// Record one persisted page of results.
    pub fn record_page(&self, results: &crate::models::BlockFetchingResults) {
        let mut forks = 0u64;
        for (action, ids) in results {
            match action {
                crate::models::BlockAction::WriteBlock(_) => {}
                crate::models::BlockAction::WriteAndMakeValidBlock(_)
                | crate::models::BlockAction::RevalidateBlock(_) => forks = 1,
            }
            self.last_synced_level
                .fetch_max(action.level(), Ordering::Relaxed);
            self.total_blocks_indexed.fetch_add(1, Ordering::Relaxed);
            self.total_operation_groups
                .fetch_add(action.block().operations.len() as u64, Ordering::Relaxed);
            self.total_accounts_touched
                .fetch_add(ids.len() as u64, Ordering::Relaxed);
        }
        self.total_forks_followed.fetch_add(forks, Ordering::Relaxed);
    }

    pub fn set_syncing(&self, syncing: bool) {
        self.is_syncing.store(syncing, Ordering::Relaxed);
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "lastSyncedLevel": self.last_synced_level.load(Ordering::Relaxed),
            "totalBlocksIndexed": self.total_blocks_indexed.load(Ordering::Relaxed),
            "totalOperationGroups": self.total_operation_groups.load(Ordering::Relaxed),
            "totalAccountsTouched": self.total_accounts_touched.load(Ordering::Relaxed),
            "totalForksFollowed": self.total_forks_followed.load(Ordering::Relaxed),
            "isSyncing": self.is_syncing.load(Ordering::Relaxed),
            "uptimeSecs": self.uptime_secs(),
        })
    }

    /// Prometheus exposition format.
    pub fn export(&self) -> String {
        format!(
            r#"# HELP indexer_last_synced_level Highest level written to the store
# TYPE indexer_last_synced_level gauge
indexer_last_synced_level {}

# HELP indexer_blocks_total Total blocks indexed
# TYPE indexer_blocks_total counter
indexer_blocks_total {}

# HELP indexer_operation_groups_total Total operation groups indexed
# TYPE indexer_operation_groups_total counter
indexer_operation_groups_total {}

# HELP indexer_accounts_touched_total Total account references extracted
# TYPE indexer_accounts_touched_total counter
indexer_accounts_touched_total {}

# HELP indexer_forks_followed_total Fork repairs performed
# TYPE indexer_forks_followed_total counter
indexer_forks_followed_total {}

# HELP indexer_syncing Is a sync cycle in progress
# TYPE indexer_syncing gauge
indexer_syncing {}

# HELP indexer_uptime_seconds Indexer uptime in seconds
# TYPE indexer_uptime_seconds counter
indexer_uptime_seconds {}
"#,
            self.last_synced_level.load(Ordering::Relaxed),
            self.total_blocks_indexed.load(Ordering::Relaxed),
            self.total_operation_groups.load(Ordering::Relaxed),
            self.total_accounts_touched.load(Ordering::Relaxed),
            self.total_forks_followed.load(Ordering::Relaxed),
            if self.is_syncing.load(Ordering::Relaxed) {
                1
            } else {
                0
            },
            self.uptime_secs(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, BlockAction};
    use crate::test_support::block_at;

    #[test]
    fn test_metrics_creation() {
        let metrics = IndexerMetrics::new();
        assert_eq!(metrics.last_synced_level.load(Ordering::Relaxed), -1);
        assert!(!metrics.is_syncing.load(Ordering::Relaxed));
    }

    #[test]
    fn test_record_page() {
        let metrics = IndexerMetrics::new();
        let results = vec![
            (
                BlockAction::WriteBlock(block_at(10, "BL10", "BL9")),
                vec![AccountId("tz1a".into()), AccountId("tz1b".into())],
            ),
            (
                BlockAction::RevalidateBlock(block_at(9, "BL9", "BL8")),
                vec![],
            ),
        ];
        metrics.record_page(&results);

        assert_eq!(metrics.last_synced_level.load(Ordering::Relaxed), 10);
        assert_eq!(metrics.total_blocks_indexed.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_accounts_touched.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_forks_followed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_to_json() {
        let metrics = IndexerMetrics::new();
        metrics.set_syncing(true);
        let json = metrics.to_json();
        assert_eq!(json["isSyncing"], true);
        assert_eq!(json["lastSyncedLevel"], -1);
    }

    #[test]
    fn test_export_contains_gauges() {
        let metrics = IndexerMetrics::new();
        let exported = metrics.export();
        assert!(exported.contains("indexer_last_synced_level -1"));
        assert!(exported.contains("indexer_syncing 0"));
    }
}
