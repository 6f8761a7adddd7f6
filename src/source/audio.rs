//! Block audio source.
//!
//! Audio arrives as interleaved blocks (`ch0, ch1, ch0, ch1, ...`). One block
//! of `frame_length * channels` samples becomes one frame; the last channel
//! row carries the terminator. Device capture needs the `audio` feature.

use crate::source::types::{ChannelRow, SyncedFrame};

/// Split an interleaved block into one row per channel.
pub fn frame_from_interleaved<T>(block: &[T], channels: usize) -> SyncedFrame
where
    T: Copy + Into<f64>,
{
    if channels == 0 {
        return SyncedFrame::from_rows(Vec::new());
    }

    let rows = (0..channels)
        .map(|c| {
            let samples = block.iter().skip(c).step_by(channels).map(|&s| s.into()).collect();
            ChannelRow::new(c, c + 1 == channels, samples)
        })
        .collect();

    SyncedFrame::from_rows(rows)
}

#[cfg(feature = "audio")]
pub use capture::AudioSource;

#[cfg(feature = "audio")]
mod capture {
    use super::frame_from_interleaved;
    use crate::source::types::SyncedFrame;
    use crate::source::{FrameSource, SourceError};
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
    use std::time::Duration;

    /// Captures blocks from the default input device.
    pub struct AudioSource {
        stream: Option<cpal::Stream>,
        receiver: Receiver<Vec<f32>>,
        pending: Vec<f32>,
        block_len: usize,
        channels: usize,
        timeout: Duration,
        device: String,
    }

    impl AudioSource {
        /// Open the default input device at `sample_rate` with `channels`.
        pub fn open(
            channels: u16,
            sample_rate: u32,
            frame_length: usize,
            timeout: Duration,
        ) -> Result<Self, SourceError> {
            let host = cpal::default_host();
            let device = host
                .default_input_device()
                .ok_or_else(|| SourceError::Transport("no audio input device".to_string()))?;
            let name = device.name().unwrap_or_else(|_| "default".to_string());

            let config = cpal::StreamConfig {
                channels,
                sample_rate: cpal::SampleRate(sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let (sender, receiver) = bounded::<Vec<f32>>(256);
            let stream = device
                .build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let _ = sender.try_send(data.to_vec());
                    },
                    |err| tracing::warn!(error = %err, "audio stream error"),
                    None,
                )
                .map_err(|e| SourceError::Transport(e.to_string()))?;
            stream
                .play()
                .map_err(|e| SourceError::Transport(e.to_string()))?;

            tracing::info!(device = %name, channels, sample_rate, "audio capture started");

            Ok(Self {
                stream: Some(stream),
                receiver,
                pending: Vec::new(),
                block_len: frame_length * channels as usize,
                channels: channels as usize,
                timeout,
                device: name,
            })
        }
    }

    impl FrameSource for AudioSource {
        fn next_frame(&mut self) -> Result<SyncedFrame, SourceError> {
            if self.stream.is_none() {
                return Err(SourceError::EndOfStream);
            }
            while self.pending.len() < self.block_len {
                match self.receiver.recv_timeout(self.timeout) {
                    Ok(chunk) => self.pending.extend(chunk),
                    Err(RecvTimeoutError::Timeout) => return Err(SourceError::Timeout),
                    Err(RecvTimeoutError::Disconnected) => return Err(SourceError::EndOfStream),
                }
            }
            let block: Vec<f32> = self.pending.drain(..self.block_len).collect();
            Ok(frame_from_interleaved(&block, self.channels))
        }

        fn close(&mut self) {
            if let Some(stream) = self.stream.take() {
                let _ = stream.pause();
            }
            self.pending.clear();
        }

        fn describe(&self) -> String {
            format!("audio:{}", self.device)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deinterleave_stereo() {
        let block: [i16; 6] = [1, -1, 2, -2, 3, -3];
        let frame = frame_from_interleaved(&block, 2);

        assert_eq!(frame.channel_count(), 2);
        assert_eq!(frame.rows()[0].samples, vec![1.0, 2.0, 3.0]);
        assert_eq!(frame.rows()[1].samples, vec![-1.0, -2.0, -3.0]);
        assert!(!frame.rows()[0].terminator);
        assert!(frame.rows()[1].terminator);
    }

    #[test]
    fn test_deinterleave_mono() {
        let block: [f32; 3] = [0.5, 0.25, 0.125];
        let frame = frame_from_interleaved(&block, 1);

        assert_eq!(frame.rows()[0].samples, vec![0.5, 0.25, 0.125]);
        assert!(frame.rows()[0].terminator);
    }
}
