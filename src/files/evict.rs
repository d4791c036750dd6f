//! Cache eviction.
//!
//! A background sweep keeps aggregate resident bytes under the configured
//! soft budget: first cold clean chunks come off each file's LRU, then whole
//! closed files go. Pinned files are exempt at both levels.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::files::open_file::OpenFile;
use crate::files::table::OpenFileTable;
use crate::types::StopToken;

/// Two-level eviction sweep over the open-file table.
pub struct EvictionEngine {
    table: Arc<OpenFileTable>,
    budget_bytes: u64,
    interval: Duration,
    stop: StopToken,
}

impl EvictionEngine {
    pub fn new(
        table: Arc<OpenFileTable>,
        budget_bytes: u64,
        interval: Duration,
        stop: StopToken,
    ) -> Self {
        Self { table, budget_bytes, interval, stop }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if self.stop.is_stopped() {
                    break;
                }
                self.sweep().await;
            }
        })
    }

    /// One full sweep; public so tests and the unmount path can force it.
    pub async fn sweep(&self) {
        let files = self.sorted_by_idle().await;

        let mut resident = 0u64;
        for (_, file) in &files {
            if let Some(cache) = file.cache() {
                resident += cache.resident_bytes().await;
            }
        }
        if resident <= self.budget_bytes {
            return;
        }
        debug!(resident, budget = self.budget_bytes, "eviction sweep engaged");

        // chunk level: trim cold clean chunks, coldest files first
        for (_, file) in &files {
            if resident <= self.budget_bytes {
                return;
            }
            if file.is_pinned().await {
                continue;
            }
            if let Some(cache) = file.cache() {
                let freed = cache.evict_cold(resident - self.budget_bytes).await;
                resident = resident.saturating_sub(freed);
            }
        }

        // file level: drop whole closed, clean, unpinned entries
        for (_, file) in &files {
            if resident <= self.budget_bytes {
                return;
            }
            let Some(cache) = file.cache() else {
                continue;
            };
            let bytes = cache.resident_bytes().await;
            if self.table.evict_entry(file).await {
                resident = resident.saturating_sub(bytes);
            }
        }
    }

    async fn sorted_by_idle(&self) -> Vec<(Duration, Arc<OpenFile>)> {
        let mut files = Vec::new();
        for file in self.table.all_files() {
            if file.is_directory() {
                continue;
            }
            files.push((file.idle_for().await, file));
        }
        // least recently used first
        files.sort_by(|lhs, rhs| rhs.0.cmp(&lhs.0));
        files
    }
}
