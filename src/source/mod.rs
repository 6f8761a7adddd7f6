//! Acquisition sources.
//!
//! Every transport is adapted to the [`FrameSource`] contract so the
//! acquisition loop is written once:
//!
//! - [`serial::FrameSynchronizer`]: framed binary records on a byte stream
//! - [`packet::SensorMultiplexer`]: `&label:v0,v1,...:` text packets, fed by
//!   [`udp::UdpPacketSource`] or [`ble::BlePacketSource`] (radio link with
//!   the `ble` feature)
//! - [`line::LineSource`]: one decimal sample per line
//! - `audio::AudioSource`: interleaved sample blocks (`audio` feature)

pub mod audio;
pub mod ble;
pub mod line;
pub mod packet;
pub mod serial;
pub mod types;
pub mod udp;

pub use ble::{BleLink, BleNotifier, BlePacketSource};
pub use line::LineSource;
pub use packet::{PacketError, PacketSource, SensorMultiplexer};
pub use serial::{FrameSynchronizer, RecordLayout, RESYNC_MARKER};
pub use types::{ChannelRow, SyncedFrame};
pub use udp::UdpPacketSource;

use thiserror::Error;

/// Violations of the channel contract agreed at session start.
///
/// These are never retried: continuing would silently corrupt training data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("sensor '{label}' appeared after the channel set was locked to {known:?}")]
    UnexpectedLabel { label: String, known: Vec<String> },

    #[error("sensor '{label}' changed from {expected} to {actual} channels mid-session")]
    ChannelCountChanged {
        label: String,
        expected: usize,
        actual: usize,
    },

    #[error("sensor '{label}' delivered {actual} values, expected {expected}")]
    IncompleteChannel {
        label: String,
        expected: usize,
        actual: usize,
    },
}

/// Errors surfaced by a [`FrameSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// No data arrived within the configured timeout.
    #[error("timed out waiting for sensor data")]
    Timeout,

    /// The transport is permanently gone.
    #[error("end of stream")]
    EndOfStream,

    /// Recoverable transport fault (corrupt data, transient I/O).
    #[error("transport fault: {0}")]
    Transport(String),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

impl SourceError {
    /// Whether the acquisition loop must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::EndOfStream | SourceError::Protocol(_))
    }
}

/// Recovered faults reported by a source since the previous drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceFaults {
    /// Partial or inconsistent frame groups dropped while resynchronizing
    pub discarded_groups: u64,
    /// Packets or lines that could not be parsed at all
    pub corrupt_packets: u64,
}

impl SourceFaults {
    pub fn is_empty(&self) -> bool {
        self.discarded_groups == 0 && self.corrupt_packets == 0
    }
}

/// A blocking producer of synchronized frames.
pub trait FrameSource {
    /// Block until the next complete frame is available.
    fn next_frame(&mut self) -> Result<SyncedFrame, SourceError>;

    /// Re-establish the transport after a timeout.
    fn reconnect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    /// Release the underlying transport handle.
    fn close(&mut self);

    /// Human-readable description for logs and the liveness token.
    fn describe(&self) -> String;

    /// Recovered faults since the previous call.
    fn drain_faults(&mut self) -> SourceFaults {
        SourceFaults::default()
    }

    /// Whether a read timeout means "no data yet" rather than a lost link.
    ///
    /// Byte-stream sensors pause between bursts; the loop keeps polling
    /// commands and never counts these timeouts toward giving up.
    fn stalls_on_timeout(&self) -> bool {
        false
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<SyncedFrame, SourceError> {
        (**self).next_frame()
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        (**self).reconnect()
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }

    fn drain_faults(&mut self) -> SourceFaults {
        (**self).drain_faults()
    }

    fn stalls_on_timeout(&self) -> bool {
        (**self).stalls_on_timeout()
    }
}

/// Map a reader error to a source error.
pub(crate) fn classify_io_error(err: std::io::Error) -> SourceError {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => SourceError::Timeout,
        ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::NotConnected => {
            SourceError::EndOfStream
        }
        _ => SourceError::Transport(err.to_string()),
    }
}
