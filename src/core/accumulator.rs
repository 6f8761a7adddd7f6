//! Training collection state machine.
//!
//! ```text
//! Idle --start--> Collecting --N windows--> Flushing --ok--> Idle
//!                                               |
//!                                            failed (buffer kept, retried on next start)
//! ```

use crate::core::windowing::Window;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Idle,
    Collecting,
    /// A full batch is waiting to be persisted.
    Flushing,
}

/// What happened to a window offered to the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Not collecting; the window was only previewed.
    Ignored,
    /// Window of `samples` columns is shorter than the frame length and was skipped.
    Short { samples: usize },
    /// Window was buffered; `count` windows held so far.
    Added { count: usize },
    /// The batch is complete and must be flushed.
    Ready,
}

/// Buffers `instances` windows per collection trigger.
pub struct TrainingAccumulator {
    instances: usize,
    frame_length: usize,
    buffer: Vec<Window>,
    state: CollectionState,
}

impl TrainingAccumulator {
    pub fn new(instances: usize, frame_length: usize) -> Self {
        Self {
            instances,
            frame_length,
            buffer: Vec::with_capacity(instances),
            state: CollectionState::Idle,
        }
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn is_collecting(&self) -> bool {
        self.state == CollectionState::Collecting
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn instances(&self) -> usize {
        self.instances
    }

    pub fn frame_length(&self) -> usize {
        self.frame_length
    }

    /// Begin a new collection. Refused while a batch awaits flushing.
    pub fn start(&mut self) -> bool {
        match self.state {
            CollectionState::Flushing => false,
            CollectionState::Idle | CollectionState::Collecting => {
                self.buffer.clear();
                self.state = CollectionState::Collecting;
                true
            }
        }
    }

    pub fn push(&mut self, window: Window) -> PushOutcome {
        if self.state != CollectionState::Collecting {
            return PushOutcome::Ignored;
        }
        let samples = window.sample_count();
        if samples < self.frame_length {
            return PushOutcome::Short { samples };
        }

        self.buffer.push(window);
        if self.buffer.len() >= self.instances {
            self.state = CollectionState::Flushing;
            PushOutcome::Ready
        } else {
            PushOutcome::Added {
                count: self.buffer.len(),
            }
        }
    }

    /// The complete batch awaiting flush.
    pub fn batch(&self) -> &[Window] {
        &self.buffer
    }

    pub fn flush_succeeded(&mut self) {
        self.buffer.clear();
        self.state = CollectionState::Idle;
    }

    /// Keep the batch so the next trigger can retry it.
    pub fn flush_failed(&mut self) {
        self.state = CollectionState::Flushing;
    }

    /// Drop whatever is buffered. Returns the number of windows discarded.
    pub fn abort(&mut self) -> usize {
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.state = CollectionState::Idle;
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::types::{ChannelRow, SyncedFrame};

    fn window(len: usize) -> Window {
        let frame = SyncedFrame::from_rows(vec![ChannelRow::new(0, true, vec![1.0; len])]);
        Window::from_frame(frame, len)
    }

    #[test]
    fn test_idle_ignores_windows() {
        let mut acc = TrainingAccumulator::new(2, 4);
        assert_eq!(acc.push(window(4)), PushOutcome::Ignored);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_collects_exactly_instances() {
        let mut acc = TrainingAccumulator::new(3, 4);
        assert!(acc.start());

        assert_eq!(acc.push(window(4)), PushOutcome::Added { count: 1 });
        assert_eq!(acc.push(window(4)), PushOutcome::Added { count: 2 });
        assert_eq!(acc.push(window(4)), PushOutcome::Ready);
        assert_eq!(acc.state(), CollectionState::Flushing);
        assert_eq!(acc.batch().len(), 3);

        // Further windows are not buffered while flushing.
        assert_eq!(acc.push(window(4)), PushOutcome::Ignored);

        acc.flush_succeeded();
        assert_eq!(acc.state(), CollectionState::Idle);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_short_windows_skipped() {
        let mut acc = TrainingAccumulator::new(1, 4);
        acc.start();
        assert_eq!(acc.push(window(3)), PushOutcome::Short { samples: 3 });
        assert!(acc.is_collecting());
    }

    #[test]
    fn test_failed_flush_keeps_batch() {
        let mut acc = TrainingAccumulator::new(1, 4);
        acc.start();
        acc.push(window(4));

        acc.flush_failed();
        assert!(!acc.start());
        assert_eq!(acc.batch().len(), 1);

        acc.flush_succeeded();
        assert!(acc.start());
    }

    #[test]
    fn test_restart_clears_partial_batch() {
        let mut acc = TrainingAccumulator::new(3, 4);
        acc.start();
        acc.push(window(4));
        assert!(acc.start());
        assert!(acc.is_empty());
    }

    #[test]
    fn test_abort_discards_partial_batch() {
        let mut acc = TrainingAccumulator::new(3, 4);
        acc.start();
        acc.push(window(4));
        assert_eq!(acc.abort(), 1);
        assert_eq!(acc.state(), CollectionState::Idle);
    }
}
