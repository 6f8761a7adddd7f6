//! Acquisition statistics.
//!
//! Counters describing what the acquisition loop saw and did: frames,
//! discarded groups, corrupt packets, windows, collections and faults.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_stats, create_shared_stats_with_persistence, read_persisted, AcquisitionStats,
    PersistedStats, SharedStats, StatsSnapshot,
};
