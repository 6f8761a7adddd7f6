//! Line-oriented serial source: one decimal sample per line.
//!
//! Each line becomes a single-sample, single-channel frame. The overlap
//! assembler accumulates these until its time gate opens.

use crate::source::types::{ChannelRow, SyncedFrame};
use crate::source::serial::{missing_reader, Reopen};
use crate::source::{classify_io_error, FrameSource, SourceError, SourceFaults};
use std::io::{BufRead, BufReader, ErrorKind, Read};

pub struct LineSource<R> {
    reader: Option<BufReader<R>>,
    line: String,
    /// Lines that were not a number
    faults: u64,
    description: String,
    reopen: Option<Reopen<R>>,
}

impl<R: Read> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: Some(BufReader::new(reader)),
            line: String::new(),
            faults: 0,
            description: "line".to_string(),
            reopen: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reopen(mut self, reopen: impl FnMut() -> std::io::Result<R> + Send + 'static) -> Self {
        self.reopen = Some(Box::new(reopen));
        self
    }

    /// Read lines until one parses as a sample.
    pub fn next_sample(&mut self) -> Result<f64, SourceError> {
        loop {
            let reader = self.reader.as_mut().ok_or_else(|| missing_reader(self.reopen.is_some()))?;
            self.line.clear();

            match reader.read_line(&mut self.line) {
                Ok(0) => return Err(SourceError::EndOfStream),
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                // Non-UTF-8 noise on the line
                Err(e) if e.kind() == ErrorKind::InvalidData => {
                    self.faults += 1;
                    continue;
                }
                Err(e) => return Err(classify_io_error(e)),
            }

            let text = self.line.trim();
            if text.is_empty() {
                continue;
            }
            match text.parse::<f64>() {
                Ok(value) => return Ok(value),
                Err(_) => {
                    tracing::debug!(line = text, "skipping unparseable sample line");
                    self.faults += 1;
                }
            }
        }
    }
}

impl<R: Read> FrameSource for LineSource<R> {
    fn next_frame(&mut self) -> Result<SyncedFrame, SourceError> {
        let value = self.next_sample()?;
        Ok(SyncedFrame::from_rows(vec![ChannelRow::new(
            0,
            true,
            vec![value],
        )]))
    }

    fn reconnect(&mut self) -> Result<(), SourceError> {
        let Some(reopen) = self.reopen.as_mut() else {
            return Ok(());
        };
        self.reader = None;
        let reader = reopen().map_err(|e| SourceError::Transport(e.to_string()))?;
        self.reader = Some(BufReader::new(reader));
        tracing::info!(source = %self.description, "reopened line port");
        Ok(())
    }

    fn close(&mut self) {
        self.reader = None;
        self.reopen = None;
    }

    fn describe(&self) -> String {
        self.description.clone()
    }

    fn drain_faults(&mut self) -> SourceFaults {
        SourceFaults {
            discarded_groups: 0,
            corrupt_packets: std::mem::take(&mut self.faults),
        }
    }

    fn stalls_on_timeout(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_each_line_is_a_frame() {
        let mut source = LineSource::new(Cursor::new("1.5\r\n2\n"));

        let frame = source.next_frame().unwrap();
        assert_eq!(frame.rows()[0].samples, vec![1.5]);
        assert!(frame.rows()[0].terminator);

        let frame = source.next_frame().unwrap();
        assert_eq!(frame.rows()[0].samples, vec![2.0]);

        assert!(matches!(source.next_frame(), Err(SourceError::EndOfStream)));
    }

    #[test]
    fn test_noise_lines_are_skipped() {
        let mut source = LineSource::new(Cursor::new("\n#boot\n3.25\n"));

        let frame = source.next_frame().unwrap();
        assert_eq!(frame.rows()[0].samples, vec![3.25]);
        assert_eq!(source.drain_faults().corrupt_packets, 1);
        assert!(source.stalls_on_timeout());
    }
}
