//! Sensor multiplexer for packet-oriented sources (UDP, BLE).
//!
//! Each packet carries one or more sensor groups:
//!
//! ```text
//! &acc:0.12,-0.98,0.03:&gyro:1.5,0.2,-0.7:
//! ```
//!
//! The first packet observed fixes the set of sensor labels and each label's
//! channel count (the channel-set lock). A frame is `L` packets; each label's
//! values are then split round-robin into per-channel rows.

use crate::source::types::{ChannelRow, SyncedFrame};
use crate::source::{classify_io_error, FrameSource, ProtocolError, SourceError, SourceFaults};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

const GROUP_START: u8 = b'&';
const GROUP_END: u8 = b':';

/// Errors from a raw packet transport.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("timed out waiting for a packet")]
    Timeout,

    #[error("packet transport disconnected")]
    Disconnected,

    #[error("packet transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The link to the sensor dropped or could not be set up.
    #[error("sensor link error: {0}")]
    Link(String),
}

impl From<PacketError> for SourceError {
    fn from(err: PacketError) -> Self {
        match err {
            PacketError::Timeout => SourceError::Timeout,
            PacketError::Disconnected => SourceError::EndOfStream,
            PacketError::Io(e) => classify_io_error(e),
            PacketError::Link(reason) => SourceError::Transport(reason),
        }
    }
}

/// A transport that yields whole datagrams.
pub trait PacketSource {
    /// Receive one packet, waiting at most `timeout`.
    fn recv_packet(&mut self, timeout: Duration) -> Result<Vec<u8>, PacketError>;

    /// Drop packets that queued up while nobody was reading.
    fn discard_pending(&mut self) {}

    /// Re-establish the transport.
    fn reconnect(&mut self) -> Result<(), PacketError> {
        Ok(())
    }

    /// Release the transport handle.
    fn close(&mut self);

    fn describe(&self) -> String;
}

/// Reasons a single packet is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedPacket {
    #[error("packet must start with '&' and end with ':'")]
    Delimiters,

    #[error("packet is not valid UTF-8")]
    Encoding,

    #[error("sensor group '{0}' has no label or value separator")]
    MissingSeparator(String),

    #[error("sensor '{label}' has non-numeric value '{value}'")]
    BadValue { label: String, value: String },
}

/// One `label:v0,v1,...` group inside a packet.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorGroup {
    pub label: String,
    pub values: Vec<f64>,
}

/// Parse a packet into its sensor groups.
pub fn parse_packet(bytes: &[u8]) -> Result<Vec<SensorGroup>, MalformedPacket> {
    if bytes.first() != Some(&GROUP_START) || bytes.last() != Some(&GROUP_END) {
        return Err(MalformedPacket::Delimiters);
    }
    let text = std::str::from_utf8(bytes).map_err(|_| MalformedPacket::Encoding)?;

    text.split('&')
        .skip(1)
        .map(|group| -> Result<SensorGroup, MalformedPacket> {
            let (label, rest) = group
                .split_once(':')
                .filter(|(label, _)| !label.is_empty())
                .ok_or_else(|| MalformedPacket::MissingSeparator(group.to_string()))?;
            let csv = rest.strip_suffix(':').unwrap_or(rest);

            let values = csv
                .split(',')
                .map(|v| {
                    v.trim().parse::<f64>().map_err(|_| MalformedPacket::BadValue {
                        label: label.to_string(),
                        value: v.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            Ok(SensorGroup {
                label: label.to_string(),
                values,
            })
        })
        .collect()
}

/// Demultiplexes label-keyed packets into synchronized frames.
pub struct SensorMultiplexer<P> {
    source: P,
    /// Packets per frame (`L`)
    frame_length: usize,
    timeout: Duration,
    /// Label -> channel count, fixed by the first packet
    channel_set: Option<BTreeMap<String, usize>>,
    /// Corrupt packets skipped since the last drain
    faults: u64,
}

impl<P: PacketSource> SensorMultiplexer<P> {
    pub fn new(source: P, frame_length: usize, timeout: Duration) -> Self {
        Self {
            source,
            frame_length,
            timeout,
            channel_set: None,
            faults: 0,
        }
    }

    /// The locked channel set, once observed.
    pub fn channel_set(&self) -> Option<&BTreeMap<String, usize>> {
        self.channel_set.as_ref()
    }

    /// Total channel count (`C`), once locked.
    pub fn channel_count(&self) -> Option<usize> {
        self.channel_set.as_ref().map(|set| set.values().sum())
    }

    /// Receive `L` packets and assemble them into one frame.
    pub fn next_synced_frame(&mut self) -> Result<SyncedFrame, SourceError> {
        self.source.discard_pending();

        let mut buffers: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut received = 0;

        while received < self.frame_length {
            let packet = self.source.recv_packet(self.timeout)?;

            let groups = match parse_packet(&packet) {
                Ok(groups) => groups,
                Err(e) => {
                    tracing::warn!(error = %e, len = packet.len(), "dropping corrupt packet");
                    self.faults += 1;
                    continue;
                }
            };

            self.observe(&groups)?;
            for group in groups {
                buffers.entry(group.label).or_default().extend(group.values);
            }
            received += 1;
        }

        self.split(buffers)
    }

    /// Lock the channel set on first sight, then enforce it.
    fn observe(&mut self, groups: &[SensorGroup]) -> Result<(), ProtocolError> {
        let Some(set) = &self.channel_set else {
            let mut set = BTreeMap::new();
            for group in groups {
                set.entry(group.label.clone()).or_insert(group.values.len());
            }
            tracing::info!(channels = ?set, "channel set locked");
            self.channel_set = Some(set);
            return Ok(());
        };

        for group in groups {
            match set.get(&group.label) {
                None => {
                    return Err(ProtocolError::UnexpectedLabel {
                        label: group.label.clone(),
                        known: set.keys().cloned().collect(),
                    })
                }
                Some(&expected) if expected != group.values.len() => {
                    return Err(ProtocolError::ChannelCountChanged {
                        label: group.label.clone(),
                        expected,
                        actual: group.values.len(),
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// Split each label's interleaved values into channel rows.
    fn split(&self, buffers: BTreeMap<String, Vec<f64>>) -> Result<SyncedFrame, SourceError> {
        let Some(set) = &self.channel_set else {
            return Ok(SyncedFrame::from_rows(Vec::new()));
        };
        let last_label = set.keys().next_back();

        let mut rows = Vec::with_capacity(set.values().sum());
        let mut channel_index = 0;

        for (label, &count) in set {
            let values = buffers.get(label).map(Vec::as_slice).unwrap_or(&[]);
            let expected = count * self.frame_length;
            if values.len() != expected {
                return Err(ProtocolError::IncompleteChannel {
                    label: label.clone(),
                    expected,
                    actual: values.len(),
                }
                .into());
            }

            for c in 0..count {
                let samples: Vec<f64> = values.iter().skip(c).step_by(count).copied().collect();
                let terminator = Some(label) == last_label && c + 1 == count;
                rows.push(ChannelRow::new(channel_index, terminator, samples));
                channel_index += 1;
            }
        }

        Ok(SyncedFrame::from_rows(rows))
    }
}

impl<P: PacketSource> FrameSource for SensorMultiplexer<P> {
    fn next_frame(&mut self) -> Result<SyncedFrame, SourceError> {
        self.next_synced_frame()
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        self.source.reconnect().map_err(SourceError::from)
    }

    fn close(&mut self) {
        self.source.close();
    }

    fn describe(&self) -> String {
        self.source.describe()
    }

    fn drain_faults(&mut self) -> SourceFaults {
        SourceFaults {
            discarded_groups: 0,
            corrupt_packets: std::mem::take(&mut self.faults),
        }
    }
}
