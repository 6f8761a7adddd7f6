//! Frame types shared by every acquisition source.
//!
//! A source produces one [`SyncedFrame`] at a time: exactly `C` channel rows,
//! ordered by channel index, all carrying the same number of samples.

use serde::{Deserialize, Serialize};

/// One channel's worth of samples inside a synchronized frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRow {
    /// Channel index within the frame (`0..C`)
    pub channel_index: usize,
    /// Set only on the row that closes the frame
    pub terminator: bool,
    /// Raw sample values, unscaled
    pub samples: Vec<f64>,
}

impl ChannelRow {
    pub fn new(channel_index: usize, terminator: bool, samples: Vec<f64>) -> Self {
        Self {
            channel_index,
            terminator,
            samples,
        }
    }
}

/// A complete multi-channel frame recovered from a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedFrame {
    rows: Vec<ChannelRow>,
}

impl SyncedFrame {
    /// Build a frame from rows in any order; rows are sorted by channel index.
    pub fn from_rows(mut rows: Vec<ChannelRow>) -> Self {
        rows.sort_by_key(|row| row.channel_index);
        Self { rows }
    }

    /// Channel rows in ascending channel order.
    pub fn rows(&self) -> &[ChannelRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<ChannelRow> {
        self.rows
    }

    /// Number of channels (`C`).
    pub fn channel_count(&self) -> usize {
        self.rows.len()
    }

    /// Samples per channel; the shortest row wins if rows disagree.
    pub fn sample_count(&self) -> usize {
        self.rows.iter().map(|r| r.samples.len()).min().unwrap_or(0)
    }

    /// Samples of every channel, channel-major.
    pub fn channel_samples(&self) -> Vec<Vec<f64>> {
        self.rows.iter().map(|r| r.samples.clone()).collect()
    }
}
