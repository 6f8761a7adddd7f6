//! Window assembly from synchronized frames.
//!
//! A [`Window`] is the `C x L` unit stored and featurized downstream. The
//! [`OverlapAssembler`] turns a stream of frames into windows, optionally
//! gated by a minimum interval between emissions.

use crate::source::types::{ChannelRow, SyncedFrame};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Whether stored windows keep their per-row tag columns.
///
/// Retained windows carry two trailing columns per channel row:
/// `channel_index` then `terminator` (0 or 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagColumns {
    #[default]
    Retain,
    Strip,
}

impl TagColumns {
    /// Extra columns appended per row.
    pub fn width(self) -> usize {
        match self {
            TagColumns::Retain => 2,
            TagColumns::Strip => 0,
        }
    }
}

/// A `C x L` block of samples ready for storage or featurization.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    rows: Vec<ChannelRow>,
}

impl Window {
    /// Build a window from rows, truncating every row to `frame_length`.
    pub fn from_rows(mut rows: Vec<ChannelRow>, frame_length: usize) -> Self {
        for row in &mut rows {
            row.samples.truncate(frame_length);
        }
        Self { rows }
    }

    /// Frame rows truncated to `frame_length`.
    pub fn from_frame(frame: SyncedFrame, frame_length: usize) -> Self {
        Self::from_rows(frame.into_rows(), frame_length)
    }

    /// Rebuild a window from its array form.
    ///
    /// With [`TagColumns::Retain`] the trailing two columns are read back as
    /// tags; otherwise rows are numbered `0..C` and the last one terminates.
    pub fn from_array(array: ArrayView2<'_, f64>, tags: TagColumns) -> Self {
        let (channels, width) = array.dim();
        let sample_len = width.saturating_sub(tags.width());

        let rows = array
            .outer_iter()
            .enumerate()
            .map(|(i, row)| {
                let samples = row.iter().take(sample_len).copied().collect();
                match tags {
                    TagColumns::Retain if width >= 2 => ChannelRow::new(
                        row[width - 2].max(0.0) as usize,
                        row[width - 1] != 0.0,
                        samples,
                    ),
                    _ => ChannelRow::new(i, i + 1 == channels, samples),
                }
            })
            .collect();

        Self { rows }
    }

    pub fn rows(&self) -> &[ChannelRow] {
        &self.rows
    }

    pub fn channel_count(&self) -> usize {
        self.rows.len()
    }

    /// Samples per channel; the shortest row wins if rows disagree.
    pub fn sample_count(&self) -> usize {
        self.rows.iter().map(|r| r.samples.len()).min().unwrap_or(0)
    }

    /// Dense `C x (L + tags)` array.
    pub fn to_array(&self, tags: TagColumns) -> Array2<f64> {
        let samples = self.sample_count();
        let width = samples + tags.width();
        let mut array = Array2::<f64>::zeros((self.rows.len(), width));

        for (mut out, row) in array.outer_iter_mut().zip(&self.rows) {
            for (dst, &src) in out.iter_mut().zip(row.samples.iter().take(samples)) {
                *dst = src;
            }
            if tags == TagColumns::Retain {
                out[samples] = row.channel_index as f64;
                out[samples + 1] = if row.terminator { 1.0 } else { 0.0 };
            }
        }

        array
    }
}

/// Combine the previous frame with the current one.
///
/// Each channel becomes `prev ++ curr`, truncated to `frame_length`; tags come
/// from `curr`. Without a compatible previous frame the result is `curr`
/// truncated.
pub fn overlap_window(prev: Option<&SyncedFrame>, curr: &SyncedFrame, frame_length: usize) -> Window {
    let prev = prev.filter(|p| p.channel_count() == curr.channel_count());

    let rows = curr
        .rows()
        .iter()
        .enumerate()
        .map(|(i, row)| {
            let mut samples = Vec::with_capacity(frame_length);
            if let Some(prev) = prev {
                samples.extend(prev.rows()[i].samples.iter().take(frame_length).copied());
            }
            let room = frame_length.saturating_sub(samples.len());
            samples.extend(row.samples.iter().take(room).copied());
            ChannelRow::new(row.channel_index, row.terminator, samples)
        })
        .collect();

    Window { rows }
}

/// Turns synchronized frames into windows.
///
/// With an overlap interval configured, frames arriving before the interval
/// has elapsed are accumulated into the pending frame rather than dropped.
/// When the gate opens the pending frame is combined with the previously
/// emitted one via [`overlap_window`] and becomes the new previous frame.
pub struct OverlapAssembler {
    frame_length: usize,
    overlap: Option<Duration>,
    prev: Option<SyncedFrame>,
    pending: Option<SyncedFrame>,
    last_emit: Option<Instant>,
}

impl OverlapAssembler {
    pub fn new(frame_length: usize, overlap: Option<Duration>) -> Self {
        Self {
            frame_length,
            overlap,
            prev: None,
            pending: None,
            last_emit: None,
        }
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Feed one frame observed at `now`; returns a window when one is due.
    pub fn push(&mut self, frame: SyncedFrame, now: Instant) -> Option<Window> {
        let Some(gate) = self.overlap else {
            return Some(Window::from_frame(frame, self.frame_length));
        };

        self.absorb(frame);

        let due = match self.last_emit {
            None => true,
            Some(at) => now.saturating_duration_since(at) > gate,
        };
        if !due {
            return None;
        }

        let curr = self.pending.take()?;
        let window = overlap_window(self.prev.as_ref(), &curr, self.frame_length);
        self.prev = Some(curr);
        self.last_emit = Some(now);
        Some(window)
    }

    /// Forget all buffered frames; the next frame emits immediately.
    pub fn reset(&mut self) {
        self.prev = None;
        self.pending = None;
        self.last_emit = None;
    }

    fn absorb(&mut self, frame: SyncedFrame) {
        match self.pending.take() {
            Some(pending) if pending.channel_count() == frame.channel_count() => {
                let rows = pending
                    .into_rows()
                    .into_iter()
                    .zip(frame.into_rows())
                    .map(|(mut old, new)| {
                        old.samples.extend(new.samples);
                        ChannelRow::new(new.channel_index, new.terminator, old.samples)
                    })
                    .collect();
                self.pending = Some(SyncedFrame::from_rows(rows));
            }
            Some(_) => {
                tracing::warn!("channel count changed, dropping pending samples");
                self.pending = Some(frame);
            }
            None => self.pending = Some(frame),
        }
    }
}
