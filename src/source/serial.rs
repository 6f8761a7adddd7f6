//! Frame synchronizer for framed binary byte streams.
//!
//! The stream has no transport-level framing. Every record is preceded by a
//! 4-byte resynchronization marker and has the layout:
//!
//! ```text
//! DE AD BE EF | samples: u16[K] | channel_index: u16 | terminator: u16
//! ```
//!
//! All fields are little-endian. `C` records (one per channel) make up one
//! frame; the last-arriving record of a frame carries `terminator = 1`.

use crate::source::types::{ChannelRow, SyncedFrame};
use crate::source::{classify_io_error, FrameSource, SourceError, SourceFaults};
use std::io::{BufReader, ErrorKind, Read};
use std::time::Duration;

/// Marker preceding every record on the wire.
pub const RESYNC_MARKER: [u8; 4] = [0xDE, 0xAD, 0xBE, 0xEF];

/// Fixed per-deployment record geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    /// Samples per record (`K`)
    pub samples_per_record: usize,
    /// Records per frame (`C`)
    pub channels: usize,
}

impl RecordLayout {
    /// Trailing `{channel_index, terminator}` header bytes.
    pub const TRAILER_BYTES: usize = 4;

    pub fn new(samples_per_record: usize, channels: usize) -> Self {
        Self {
            samples_per_record,
            channels,
        }
    }

    /// Bytes following each marker.
    pub fn record_size(&self) -> usize {
        2 * self.samples_per_record + Self::TRAILER_BYTES
    }

    /// Decode one record body (marker already consumed).
    pub fn decode(&self, bytes: &[u8]) -> RawRecord {
        let words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let k = self.samples_per_record;

        RawRecord {
            samples: words[..k].to_vec(),
            channel_index: words[k],
            terminator: words[k + 1],
        }
    }

    /// Encode a record, marker included.
    pub fn encode(&self, channel_index: u16, samples: &[u16], terminator: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(RESYNC_MARKER.len() + self.record_size());
        out.extend_from_slice(&RESYNC_MARKER);
        for sample in samples.iter().take(self.samples_per_record) {
            out.extend_from_slice(&sample.to_le_bytes());
        }
        // Short sample slices are zero-filled so the record keeps its size.
        for _ in samples.len()..self.samples_per_record {
            out.extend_from_slice(&0u16.to_le_bytes());
        }
        out.extend_from_slice(&channel_index.to_le_bytes());
        out.extend_from_slice(&u16::from(terminator).to_le_bytes());
        out
    }
}

/// One channel-tagged record as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub samples: Vec<u16>,
    pub channel_index: u16,
    pub terminator: u16,
}

impl RawRecord {
    fn into_row(self) -> ChannelRow {
        ChannelRow::new(
            self.channel_index as usize,
            self.terminator == 1,
            self.samples.into_iter().map(f64::from).collect(),
        )
    }
}

/// Reopens the underlying byte stream after a transport fault.
pub type Reopen<R> = Box<dyn FnMut() -> std::io::Result<R> + Send>;

/// Recovers [`SyncedFrame`]s from an unframed byte stream.
pub struct FrameSynchronizer<R> {
    reader: Option<BufReader<R>>,
    layout: RecordLayout,
    /// Records buffered since the last completed frame, in arrival order
    pending: Vec<RawRecord>,
    /// Groups and records dropped since the last drain
    faults: u64,
    description: String,
    reopen: Option<Reopen<R>>,
}

impl<R: Read> FrameSynchronizer<R> {
    pub fn new(reader: R, layout: RecordLayout) -> Self {
        Self {
            reader: Some(BufReader::new(reader)),
            layout,
            pending: Vec::with_capacity(layout.channels),
            faults: 0,
            description: "byte-stream".to_string(),
            reopen: None,
        }
    }

    /// Reopen the stream with `reopen` when the loop asks for a reconnect.
    ///
    /// Without it a reconnect only clears the pending group.
    pub fn with_reopen(mut self, reopen: impl FnMut() -> std::io::Result<R> + Send + 'static) -> Self {
        self.reopen = Some(Box::new(reopen));
        self
    }

    /// Attach a description used in logs.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Block until the next complete frame.
    ///
    /// Incomplete or inconsistent groups are dropped silently and
    /// synchronization restarts at the next marker.
    pub fn next_synced_frame(&mut self) -> Result<SyncedFrame, SourceError> {
        loop {
            let skipped = self.resync()?;
            if skipped > 0 {
                tracing::trace!(skipped, "resynchronized after discarding bytes");
            }

            let record = self.read_record()?;
            if let Some(frame) = self.accept(record) {
                return Ok(frame);
            }
        }
    }

    /// Read single bytes until the trailing four equal the marker.
    ///
    /// Returns the number of bytes discarded before the marker.
    fn resync(&mut self) -> Result<usize, SourceError> {
        let reader = self.reader.as_mut().ok_or_else(|| missing_reader(self.reopen.is_some()))?;
        let mut window = [0u8; 4];
        let mut consumed = 0usize;
        let mut byte = [0u8; 1];

        loop {
            match reader.read(&mut byte) {
                Ok(0) => return Err(SourceError::EndOfStream),
                Ok(_) => {
                    window.rotate_left(1);
                    window[3] = byte[0];
                    consumed += 1;
                    if consumed >= RESYNC_MARKER.len() && window == RESYNC_MARKER {
                        return Ok(consumed - RESYNC_MARKER.len());
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify_io_error(e)),
            }
        }
    }

    /// Read exactly one record body; a short read ends the stream.
    fn read_record(&mut self) -> Result<RawRecord, SourceError> {
        let reader = self.reader.as_mut().ok_or_else(|| missing_reader(self.reopen.is_some()))?;
        let mut buf = vec![0u8; self.layout.record_size()];
        let mut filled = 0;

        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) => return Err(SourceError::EndOfStream),
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify_io_error(e)),
            }
        }

        Ok(self.layout.decode(&buf))
    }

    /// Feed one record into the pending group.
    fn accept(&mut self, record: RawRecord) -> Option<SyncedFrame> {
        if record.terminator > 1 {
            tracing::debug!(flag = record.terminator, "ignoring record with invalid terminator");
            self.faults += 1;
            return None;
        }

        let index = record.channel_index as usize;
        let duplicate = self
            .pending
            .iter()
            .any(|r| r.channel_index == record.channel_index);
        if index >= self.layout.channels || duplicate {
            tracing::debug!(
                channel = index,
                buffered = self.pending.len(),
                "discarding partial frame on bad channel index"
            );
            self.discard_pending();
            return None;
        }

        let terminates = record.terminator == 1;
        self.pending.push(record);

        if terminates {
            if self.pending.len() == self.layout.channels {
                let rows = self.pending.drain(..).map(RawRecord::into_row).collect();
                return Some(SyncedFrame::from_rows(rows));
            }
            tracing::debug!(
                buffered = self.pending.len(),
                expected = self.layout.channels,
                "discarding partial frame on early terminator"
            );
            self.discard_pending();
        } else if self.pending.len() == self.layout.channels {
            tracing::debug!("discarding full frame without terminator");
            self.discard_pending();
        }

        None
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
        self.faults += 1;
    }
}

impl<R: Read> FrameSource for FrameSynchronizer<R> {
    fn next_frame(&mut self) -> Result<SyncedFrame, SourceError> {
        self.next_synced_frame()
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        self.pending.clear();
        let Some(reopen) = self.reopen.as_mut() else {
            return Ok(());
        };

        // Drop the old handle first; serial devices refuse a second open.
        self.reader = None;
        let reader = reopen().map_err(|e| SourceError::Transport(e.to_string()))?;
        self.reader = Some(BufReader::new(reader));
        tracing::info!(source = %self.description, "reopened byte stream");
        Ok(())
    }

    fn close(&mut self) {
        self.pending.clear();
        self.reader = None;
        self.reopen = None;
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn drain_faults(&mut self) -> SourceFaults {
        SourceFaults {
            discarded_groups: std::mem::take(&mut self.faults),
            corrupt_packets: 0,
        }
    }

    fn stalls_on_timeout(&self) -> bool {
        true
    }
}

/// Error for a read with no open reader. A failed reopen can still be
/// retried; a closed source is finished.
pub(crate) fn missing_reader(reopenable: bool) -> SourceError {
    if reopenable {
        SourceError::Transport("byte stream is not open".to_string())
    } else {
        SourceError::EndOfStream
    }
}

/// Open a serial port for the synchronizer.
pub fn open_serial_port(
    path: &str,
    baud_rate: u32,
    read_timeout: Duration,
) -> Result<Box<dyn serialport::SerialPort>, serialport::Error> {
    serialport::new(path, baud_rate)
        .timeout(read_timeout)
        .data_bits(serialport::DataBits::Eight)
        .flow_control(serialport::FlowControl::None)
        .open()
}

/// Pick a serial port, preferring microcontroller-looking names.
pub fn find_preferred_port() -> Option<String> {
    let ports: Vec<String> = serialport::available_ports()
        .ok()?
        .into_iter()
        .map(|p| p.port_name)
        .collect();

    ports
        .iter()
        .find(|name| {
            name.contains("usbmodem") || name.contains("teensy") || name.contains("ttyACM")
        })
        .or_else(|| ports.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn layout() -> RecordLayout {
        RecordLayout::new(4, 3)
    }

    fn record(channel: u16, terminator: bool) -> Vec<u8> {
        let base = channel * 10;
        layout().encode(channel, &[base, base + 1, base + 2, base + 3], terminator)
    }

    fn sync(bytes: Vec<u8>) -> FrameSynchronizer<Cursor<Vec<u8>>> {
        FrameSynchronizer::new(Cursor::new(bytes), layout())
    }

    #[test]
    fn test_record_size() {
        assert_eq!(layout().record_size(), 12);
        assert_eq!(RecordLayout::new(1500, 3).record_size(), 3004);
    }

    #[test]
    fn test_frame_in_order() {
        let mut bytes = Vec::new();
        bytes.extend(record(0, false));
        bytes.extend(record(1, false));
        bytes.extend(record(2, true));

        let frame = sync(bytes).next_synced_frame().unwrap();
        assert_eq!(frame.channel_count(), 3);
        assert_eq!(frame.rows()[1].samples, vec![10.0, 11.0, 12.0, 13.0]);
        assert!(frame.rows()[2].terminator);
    }

    #[test]
    fn test_reorders_by_channel_index() {
        let mut bytes = Vec::new();
        bytes.extend(record(2, false));
        bytes.extend(record(0, false));
        bytes.extend(record(1, true));

        let frame = sync(bytes).next_synced_frame().unwrap();
        let indices: Vec<usize> = frame.rows().iter().map(|r| r.channel_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(frame.rows()[0].samples[0], 0.0);
        assert_eq!(frame.rows()[2].samples[0], 20.0);
    }

    #[test]
    fn test_garbage_prefix_does_not_change_frame() {
        let mut clean = Vec::new();
        clean.extend(record(0, false));
        clean.extend(record(1, false));
        clean.extend(record(2, true));

        let mut noisy = vec![0x00, 0xDE, 0xAD, 0x13, 0xBE, 0xEF, 0xFF, 0xDE];
        noisy.extend(clean.clone());

        let expected = sync(clean).next_synced_frame().unwrap();
        let actual = sync(noisy).next_synced_frame().unwrap();
        assert_eq!(expected, actual);
    }

    #[test]
    fn test_early_terminator_discards_group() {
        let mut bytes = Vec::new();
        bytes.extend(record(0, false));
        bytes.extend(record(1, true)); // only two of three channels
        bytes.extend(record(0, false));
        bytes.extend(record(1, false));
        bytes.extend(record(2, true));

        let mut synchronizer = sync(bytes);
        let frame = synchronizer.next_synced_frame().unwrap();
        assert_eq!(frame.channel_count(), 3);
        assert_eq!(synchronizer.drain_faults().discarded_groups, 1);
        assert!(matches!(
            synchronizer.next_synced_frame(),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn test_duplicate_channel_discards_group() {
        let mut bytes = Vec::new();
        bytes.extend(record(0, false));
        bytes.extend(record(0, false));
        bytes.extend(record(0, false));
        bytes.extend(record(1, false));
        bytes.extend(record(2, true));

        let mut synchronizer = sync(bytes);
        let frame = synchronizer.next_synced_frame().unwrap();
        assert_eq!(frame.channel_count(), 3);
        assert_eq!(synchronizer.drain_faults().discarded_groups, 1);
    }

    #[test]
    fn test_out_of_range_channel_discards_group() {
        let mut bytes = Vec::new();
        bytes.extend(record(0, false));
        bytes.extend(record(7, false));
        bytes.extend(record(0, false));
        bytes.extend(record(1, false));
        bytes.extend(record(2, true));

        let frame = sync(bytes).next_synced_frame().unwrap();
        assert_eq!(frame.channel_count(), 3);
    }

    #[test]
    fn test_short_record_is_end_of_stream() {
        let mut bytes = record(0, false);
        bytes.truncate(bytes.len() - 3);

        assert!(matches!(
            sync(bytes).next_synced_frame(),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn test_close_releases_reader() {
        let mut synchronizer = sync(record(0, false));
        synchronizer.close();
        assert!(matches!(
            synchronizer.next_frame(),
            Err(SourceError::EndOfStream)
        ));
    }

    #[test]
    fn test_reconnect_reopens_stream() {
        let mut frame_bytes = Vec::new();
        frame_bytes.extend(record(0, false));
        frame_bytes.extend(record(1, false));
        frame_bytes.extend(record(2, true));

        // The first stream is cut mid-record; the reopened one is whole.
        let mut synchronizer =
            sync(record(0, false)[..5].to_vec()).with_reopen(move || Ok(Cursor::new(frame_bytes.clone())));
        assert!(matches!(
            synchronizer.next_frame(),
            Err(SourceError::EndOfStream)
        ));

        synchronizer.reconnect().unwrap();
        assert_eq!(synchronizer.next_frame().unwrap().channel_count(), 3);
        assert!(synchronizer.stalls_on_timeout());
    }

    #[test]
    fn test_failed_reopen_stays_retryable() {
        let mut synchronizer = sync(Vec::new()).with_reopen(|| {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no such device"))
        });

        assert!(matches!(synchronizer.reconnect(), Err(SourceError::Transport(_))));
        // Still reconnectable, so not the end of the stream.
        assert!(matches!(synchronizer.next_frame(), Err(SourceError::Transport(_))));

        synchronizer.close();
        assert!(matches!(synchronizer.next_frame(), Err(SourceError::EndOfStream)));
    }

    #[test]
    fn test_reconnect_without_reopen_keeps_reader() {
        let mut synchronizer = sync(Vec::new());
        assert!(synchronizer.reconnect().is_ok());
    }
}
