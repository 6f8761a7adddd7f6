//! Counters for an acquisition session, with cumulative persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Statistics for the current session.
#[derive(Debug)]
pub struct AcquisitionStats {
    /// Complete frames delivered by the source
    frames_synced: AtomicU64,
    /// Partial groups or corrupt records dropped while resynchronizing
    groups_discarded: AtomicU64,
    /// Malformed packets skipped by a packet source
    corrupt_packets: AtomicU64,
    windows_emitted: AtomicU64,
    /// Windows too short to collect
    short_windows: AtomicU64,
    /// Windows buffered into a collection
    instances_collected: AtomicU64,
    collections_saved: AtomicU64,
    flush_failures: AtomicU64,
    reconnects: AtomicU64,
    session_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl AcquisitionStats {
    pub fn new() -> Self {
        Self {
            frames_synced: AtomicU64::new(0),
            groups_discarded: AtomicU64::new(0),
            corrupt_packets: AtomicU64::new(0),
            windows_emitted: AtomicU64::new(0),
            short_windows: AtomicU64::new(0),
            instances_collected: AtomicU64::new(0),
            collections_saved: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            session_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create stats that continue from the counters saved at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut stats = Self::new();
        stats.persist_path = Some(path);

        if let Err(e) = stats.load() {
            tracing::warn!(error = %e, "could not load previous acquisition stats");
        }

        stats
    }

    pub fn record_frame(&self) {
        self.frames_synced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_discarded_groups(&self, count: u64) {
        self.groups_discarded.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_corrupt_packets(&self, count: u64) {
        self.corrupt_packets.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_window(&self) {
        self.windows_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_short_window(&self) {
        self.short_windows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_instance(&self) {
        self.instances_collected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collection_saved(&self) {
        self.collections_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush_failure(&self) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the current statistics.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_synced: self.frames_synced.load(Ordering::Relaxed),
            groups_discarded: self.groups_discarded.load(Ordering::Relaxed),
            corrupt_packets: self.corrupt_packets.load(Ordering::Relaxed),
            windows_emitted: self.windows_emitted.load(Ordering::Relaxed),
            short_windows: self.short_windows.load(Ordering::Relaxed),
            instances_collected: self.instances_collected.load(Ordering::Relaxed),
            collections_saved: self.collections_saved.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            session_start: self.session_start,
            session_duration_secs: (Utc::now() - self.session_start).num_seconds().max(0) as u64,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.snapshot();
        format!(
            "Acquisition Statistics:\n\
             - Frames synchronized: {}\n\
             - Groups discarded: {}\n\
             - Corrupt packets: {}\n\
             - Windows emitted: {}\n\
             - Short windows skipped: {}\n\
             - Instances collected: {}\n\
             - Collections saved: {}\n\
             - Flush failures: {}\n\
             - Reconnects: {}\n\
             - Session duration: {} seconds",
            stats.frames_synced,
            stats.groups_discarded,
            stats.corrupt_packets,
            stats.windows_emitted,
            stats.short_windows,
            stats.instances_collected,
            stats.collections_saved,
            stats.flush_failures,
            stats.reconnects,
            stats.session_duration_secs
        )
    }

    /// Save stats to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.snapshot();
            let persisted = PersistedStats {
                frames_synced: stats.frames_synced,
                groups_discarded: stats.groups_discarded,
                corrupt_packets: stats.corrupt_packets,
                windows_emitted: stats.windows_emitted,
                short_windows: stats.short_windows,
                instances_collected: stats.instances_collected,
                collections_saved: stats.collections_saved,
                flush_failures: stats.flush_failures,
                reconnects: stats.reconnects,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(persisted) = read_persisted(path)? {
                self.frames_synced.store(persisted.frames_synced, Ordering::Relaxed);
                self.groups_discarded
                    .store(persisted.groups_discarded, Ordering::Relaxed);
                self.corrupt_packets
                    .store(persisted.corrupt_packets, Ordering::Relaxed);
                self.windows_emitted
                    .store(persisted.windows_emitted, Ordering::Relaxed);
                self.short_windows
                    .store(persisted.short_windows, Ordering::Relaxed);
                self.instances_collected
                    .store(persisted.instances_collected, Ordering::Relaxed);
                self.collections_saved
                    .store(persisted.collections_saved, Ordering::Relaxed);
                self.flush_failures
                    .store(persisted.flush_failures, Ordering::Relaxed);
                self.reconnects.store(persisted.reconnects, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Reset all counters.
    pub fn reset(&self) {
        for counter in [
            &self.frames_synced,
            &self.groups_discarded,
            &self.corrupt_packets,
            &self.windows_emitted,
            &self.short_windows,
            &self.instances_collected,
            &self.collections_saved,
            &self.flush_failures,
            &self.reconnects,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for AcquisitionStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of acquisition statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frames_synced: u64,
    pub groups_discarded: u64,
    pub corrupt_packets: u64,
    pub windows_emitted: u64,
    pub short_windows: u64,
    pub instances_collected: u64,
    pub collections_saved: u64,
    pub flush_failures: u64,
    pub reconnects: u64,
    pub session_start: DateTime<Utc>,
    pub session_duration_secs: u64,
}

/// Stats format for persistence.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStats {
    pub frames_synced: u64,
    pub groups_discarded: u64,
    pub corrupt_packets: u64,
    pub windows_emitted: u64,
    #[serde(default)]
    pub short_windows: u64,
    pub instances_collected: u64,
    pub collections_saved: u64,
    pub flush_failures: u64,
    pub reconnects: u64,
    pub last_updated: DateTime<Utc>,
}

/// Read cumulative stats written by a previous session.
pub fn read_persisted(path: &Path) -> Result<Option<PersistedStats>, std::io::Error> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let persisted = serde_json::from_str(&content).map_err(std::io::Error::other)?;
    Ok(Some(persisted))
}

/// Thread-safe shared stats.
pub type SharedStats = Arc<AcquisitionStats>;

pub fn create_shared_stats() -> SharedStats {
    Arc::new(AcquisitionStats::new())
}

pub fn create_shared_stats_with_persistence(path: PathBuf) -> SharedStats {
    Arc::new(AcquisitionStats::with_persistence(path))
}
