//! The acquisition loop.
//!
//! One synchronous loop per source:
//!
//! ```text
//! poll commands -> next_frame -> assemble window -> preview
//!                                      |
//!                                      +-> accumulate -> flush to label store
//! ```
//!
//! Commands are only read at the top of an iteration, so nothing outside the
//! loop ever touches the accumulator or the transport.

use crate::config::{Config, ReconnectPolicy};
use crate::control::{Command, CommandSource, LabelSource};
use crate::core::accumulator::{CollectionState, PushOutcome, TrainingAccumulator};
use crate::core::windowing::{OverlapAssembler, TagColumns};
use crate::source::{FrameSource, ProtocolError, SourceError, SyncedFrame};
use crate::stats::SharedStats;
use crate::store::{LabelStore, PreviewSink};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Settings the loop needs, independent of where they came from.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub instances: usize,
    pub frame_length: usize,
    pub overlap: Option<Duration>,
    pub tags: TagColumns,
    pub reconnect: ReconnectPolicy,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            instances: config.acquisition.instances,
            frame_length: config.acquisition.frame_length,
            overlap: config.acquisition.overlap,
            tags: config.acquisition.tag_columns,
            reconnect: config.reconnect.clone(),
        }
    }

    pub fn with_overlap(mut self, overlap: Option<Duration>) -> Self {
        self.overlap = overlap;
        self
    }

    pub fn with_frame_length(mut self, frame_length: usize) -> Self {
        self.frame_length = frame_length;
        self
    }
}

/// Why the loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A `STOP` or `EXIT` command was received.
    Stopped(Command),
    /// The transport ended or never came back after reconnecting.
    EndOfStream,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("sensor protocol violation: {0}")]
    Protocol(#[from] ProtocolError),
}

pub struct Pipeline<S: FrameSource> {
    source: S,
    assembler: OverlapAssembler,
    accumulator: TrainingAccumulator,
    store: LabelStore,
    preview: Option<PreviewSink>,
    commands: Vec<Box<dyn CommandSource>>,
    label: Arc<dyn LabelSource>,
    stats: SharedStats,
    tags: TagColumns,
    reconnect: ReconnectPolicy,
}

impl<S: FrameSource> Pipeline<S> {
    pub fn new(
        source: S,
        settings: PipelineSettings,
        store: LabelStore,
        label: Arc<dyn LabelSource>,
        stats: SharedStats,
    ) -> Self {
        Self {
            source,
            assembler: OverlapAssembler::new(settings.frame_length, settings.overlap),
            accumulator: TrainingAccumulator::new(settings.instances, settings.frame_length),
            store,
            preview: None,
            commands: Vec::new(),
            label,
            stats,
            tags: settings.tags,
            reconnect: settings.reconnect,
        }
    }

    pub fn with_preview(mut self, preview: PreviewSink) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn with_commands(mut self, commands: impl CommandSource + 'static) -> Self {
        self.commands.push(Box::new(commands));
        self
    }

    pub fn collection_state(&self) -> CollectionState {
        self.accumulator.state()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Run until a terminating command, end of stream or a protocol fault.
    ///
    /// Timeouts of a stalling source only send the loop back to command
    /// polling. Other timeouts and transport faults back off and reconnect;
    /// after `max_attempts` of them in a row the stream counts as ended.
    /// The transport is closed on every exit path.
    pub fn run(&mut self) -> Result<RunOutcome, PipelineError> {
        tracing::info!(source = %self.source.describe(), "acquisition started");
        let mut failures: u32 = 0;
        let mut stalled = false;

        loop {
            if let Some(command) = self.drain_commands() {
                self.shutdown();
                return Ok(RunOutcome::Stopped(command));
            }

            let result = self.source.next_frame();
            self.record_faults();

            let frame = match result {
                Ok(frame) => {
                    if stalled {
                        tracing::info!("sensor data resumed");
                    }
                    failures = 0;
                    stalled = false;
                    frame
                }
                Err(SourceError::Timeout) if self.source.stalls_on_timeout() => {
                    if !stalled {
                        tracing::info!(source = %self.source.describe(), "sensor idle, waiting for data");
                        stalled = true;
                    }
                    continue;
                }
                Err(e @ (SourceError::Timeout | SourceError::Transport(_))) => {
                    failures += 1;
                    if failures > self.reconnect.max_attempts {
                        tracing::error!(attempts = failures - 1, error = %e, "sensor did not come back, giving up");
                        self.shutdown();
                        return Ok(RunOutcome::EndOfStream);
                    }
                    self.reconnect_after(failures, &e);
                    continue;
                }
                Err(SourceError::EndOfStream) => {
                    tracing::warn!(source = %self.source.describe(), "end of stream");
                    self.shutdown();
                    return Ok(RunOutcome::EndOfStream);
                }
                Err(SourceError::Protocol(e)) => {
                    tracing::error!(error = %e, "protocol violation, stopping");
                    self.shutdown();
                    return Err(PipelineError::Protocol(e));
                }
            };

            self.process_frame(frame);
        }
    }

    /// Apply pending commands. Returns a terminating command if one arrived.
    fn drain_commands(&mut self) -> Option<Command> {
        let mut pending = Vec::new();
        for source in &mut self.commands {
            while let Some(command) = source.poll() {
                pending.push(command);
            }
        }

        for command in pending {
            match command {
                Command::StartCollecting => self.begin_collection(),
                Command::Stop | Command::Exit => return Some(command),
            }
        }
        None
    }

    fn begin_collection(&mut self) {
        if self.accumulator.state() == CollectionState::Flushing {
            tracing::info!("retrying unsaved collection before starting a new one");
            self.flush();
            if self.accumulator.state() == CollectionState::Flushing {
                tracing::warn!("previous collection is still unsaved, not starting");
                return;
            }
        }

        if self.accumulator.is_collecting() {
            tracing::info!(discarded = self.accumulator.len(), "restarting collection");
        }
        self.accumulator.start();
        tracing::info!(instances = self.accumulator.instances(), "collecting");
    }

    fn process_frame(&mut self, frame: SyncedFrame) {
        self.stats.record_frame();

        let Some(window) = self.assembler.push(frame, Instant::now()) else {
            return;
        };
        self.stats.record_window();

        if let Some(preview) = &self.preview {
            if let Err(e) = preview.publish(&window) {
                tracing::debug!(error = %e, "preview write failed");
            }
        }

        match self.accumulator.push(window) {
            PushOutcome::Ignored => {}
            PushOutcome::Short { samples } => {
                self.stats.record_short_window();
                tracing::warn!(
                    samples,
                    frame_length = self.accumulator.frame_length(),
                    "window shorter than frame length, not collected"
                );
            }
            PushOutcome::Added { count } => {
                self.stats.record_instance();
                tracing::debug!(count, "instance collected");
            }
            PushOutcome::Ready => {
                self.stats.record_instance();
                self.flush();
            }
        }
    }

    fn flush(&mut self) {
        let label = match self.label.current_label() {
            Ok(label) => label,
            Err(e) => {
                tracing::error!(error = %e, "cannot save collection without a label");
                self.accumulator.flush_failed();
                self.stats.record_flush_failure();
                return;
            }
        };

        match self.store.append(&label, self.accumulator.batch(), self.tags) {
            Ok(events) => {
                tracing::info!(%label, events, "collection saved");
                self.accumulator.flush_succeeded();
                self.stats.record_collection_saved();
            }
            Err(e) => {
                tracing::error!(%label, error = %e, "saving collection failed, will retry on next trigger");
                self.accumulator.flush_failed();
                self.stats.record_flush_failure();
            }
        }
    }

    fn reconnect_after(&mut self, attempt: u32, cause: &SourceError) {
        let delay = self.reconnect.backoff(attempt);
        tracing::warn!(attempt, delay_ms = delay.as_millis() as u64, cause = %cause, "reconnecting");
        thread::sleep(delay);

        self.stats.record_reconnect();
        if let Err(e) = self.source.reconnect() {
            tracing::warn!(error = %e, "reconnect failed");
        }
    }

    fn record_faults(&mut self) {
        let faults = self.source.drain_faults();
        if faults.is_empty() {
            return;
        }
        self.stats.record_discarded_groups(faults.discarded_groups);
        self.stats.record_corrupt_packets(faults.corrupt_packets);
    }

    fn shutdown(&mut self) {
        self.source.close();
        let dropped = self.accumulator.abort();
        if dropped > 0 {
            tracing::info!(dropped, "discarded partial collection");
        }
        if let Err(e) = self.stats.save() {
            tracing::warn!(error = %e, "could not save acquisition stats");
        }
        tracing::info!("acquisition stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{command_channel, CommandSender, ControlError, FixedLabel, SharedLabel};
    use crate::source::{ChannelRow, SourceFaults};
    use crate::stats::create_shared_stats;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Replays scripted results, then reports end of stream.
    struct ScriptedSource {
        script: VecDeque<Result<SyncedFrame, SourceError>>,
        closed: Arc<AtomicBool>,
        /// Sent once the script runs out of frames.
        on_drain: Option<(CommandSender, Command)>,
        stalls: bool,
        faults: SourceFaults,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<SyncedFrame, SourceError>>) -> (Self, Arc<AtomicBool>) {
            let closed = Arc::new(AtomicBool::new(false));
            (
                Self {
                    script: script.into(),
                    closed: closed.clone(),
                    on_drain: None,
                    stalls: false,
                    faults: SourceFaults::default(),
                },
                closed,
            )
        }
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<SyncedFrame, SourceError> {
            match self.script.pop_front() {
                Some(result) => result,
                None => match self.on_drain.take() {
                    Some((sender, command)) => {
                        sender.send(command);
                        Err(SourceError::Timeout)
                    }
                    None => Err(SourceError::EndOfStream),
                },
            }
        }

        fn drain_faults(&mut self) -> SourceFaults {
            std::mem::take(&mut self.faults)
        }

        fn stalls_on_timeout(&self) -> bool {
            self.stalls
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    /// A transport that never delivers.
    struct DeadLink {
        reads: Arc<AtomicUsize>,
        reconnects: Arc<AtomicUsize>,
    }

    impl FrameSource for DeadLink {
        fn next_frame(&mut self) -> Result<SyncedFrame, SourceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Transport("device unplugged".into()))
        }

        fn reconnect(&mut self) -> Result<(), SourceError> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Err(SourceError::Transport("still unplugged".into()))
        }

        fn close(&mut self) {}

        fn describe(&self) -> String {
            "dead".to_string()
        }
    }

    fn frame(value: f64) -> Result<SyncedFrame, SourceError> {
        Ok(SyncedFrame::from_rows(vec![
            ChannelRow::new(0, false, vec![value; 4]),
            ChannelRow::new(1, true, vec![-value; 4]),
        ]))
    }

    fn settings(instances: usize) -> PipelineSettings {
        PipelineSettings {
            instances,
            frame_length: 4,
            overlap: None,
            tags: TagColumns::Retain,
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                max_attempts: 2,
            },
        }
    }

    #[test]
    fn test_collection_is_saved_after_instances() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        let (source, closed) = ScriptedSource::new((0..5).map(|i| frame(i as f64)).collect());
        let (sender, commands) = command_channel();
        sender.send(Command::StartCollecting);

        let stats = create_shared_stats();
        let mut pipeline = Pipeline::new(
            source,
            settings(3),
            store.clone(),
            Arc::new(FixedLabel("wave".into())),
            stats.clone(),
        )
        .with_commands(commands);

        assert_eq!(pipeline.run().unwrap(), RunOutcome::EndOfStream);
        assert!(closed.load(Ordering::SeqCst));

        let array = store.load("wave").unwrap().unwrap();
        assert_eq!(array.shape(), &[1, 3, 2, 6]);
        assert_eq!(stats.snapshot().collections_saved, 1);
        assert_eq!(stats.snapshot().windows_emitted, 5);
        assert_eq!(pipeline.collection_state(), CollectionState::Idle);
    }

    #[test]
    fn test_exit_discards_partial_collection() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        let (mut source, closed) = ScriptedSource::new(vec![frame(1.0), frame(2.0)]);
        let (sender, commands) = command_channel();
        sender.send(Command::StartCollecting);
        source.on_drain = Some((sender, Command::Exit));

        let mut pipeline = Pipeline::new(
            source,
            settings(5),
            store.clone(),
            Arc::new(FixedLabel("wave".into())),
            create_shared_stats(),
        )
        .with_commands(commands);

        assert_eq!(pipeline.run().unwrap(), RunOutcome::Stopped(Command::Exit));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(store.event_count("wave").unwrap(), 0);
    }

    #[test]
    fn test_protocol_violation_is_fatal() {
        let dir = tempdir().unwrap();
        let (source, closed) = ScriptedSource::new(vec![
            frame(1.0),
            Err(SourceError::Protocol(ProtocolError::UnexpectedLabel {
                label: "gyro".into(),
                known: vec!["acc".into()],
            })),
            frame(2.0),
        ]);

        let mut pipeline = Pipeline::new(
            source,
            settings(1),
            LabelStore::new(dir.path()),
            Arc::new(FixedLabel("wave".into())),
            create_shared_stats(),
        );

        assert!(matches!(pipeline.run(), Err(PipelineError::Protocol(_))));
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_timeouts_exhaust_reconnects() {
        let dir = tempdir().unwrap();
        let (source, closed) = ScriptedSource::new(vec![
            Err(SourceError::Timeout),
            Err(SourceError::Timeout),
            Err(SourceError::Timeout),
            frame(1.0),
        ]);
        let stats = create_shared_stats();

        let mut pipeline = Pipeline::new(
            source,
            settings(1),
            LabelStore::new(dir.path()),
            Arc::new(FixedLabel("wave".into())),
            stats.clone(),
        );

        assert_eq!(pipeline.run().unwrap(), RunOutcome::EndOfStream);
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(stats.snapshot().reconnects, 2);
        assert_eq!(stats.snapshot().frames_synced, 0);
    }

    #[test]
    fn test_missing_label_keeps_batch_for_retry() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        let label = SharedLabel::default();
        let (mut source, _closed) = ScriptedSource::new(vec![frame(1.0), frame(2.0)]);
        let (sender, commands) = command_channel();
        sender.send(Command::StartCollecting);
        source.on_drain = Some((sender.clone(), Command::Exit));

        let stats = create_shared_stats();
        let mut pipeline = Pipeline::new(source, settings(2), store.clone(), Arc::new(label.clone()), stats.clone())
            .with_commands(commands);

        // The flush fails without a label; exit discards the unsaved batch.
        assert_eq!(pipeline.run().unwrap(), RunOutcome::Stopped(Command::Exit));
        assert_eq!(stats.snapshot().flush_failures, 1);
        assert_eq!(store.event_count("wave").unwrap(), 0);
    }

    /// Fails the first lookup, then returns a fixed label.
    struct FlakyLabel {
        calls: AtomicUsize,
    }

    impl LabelSource for FlakyLabel {
        fn current_label(&self) -> Result<String, ControlError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ControlError::MissingLabel)
            } else {
                Ok("wave".to_string())
            }
        }
    }

    #[test]
    fn test_retry_on_next_trigger_saves_batch() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        let (mut source, _closed) = ScriptedSource::new(vec![frame(1.0), frame(2.0)]);
        let (sender, commands) = command_channel();
        sender.send(Command::StartCollecting);
        source.on_drain = Some((sender.clone(), Command::StartCollecting));

        let stats = create_shared_stats();
        let label = Arc::new(FlakyLabel {
            calls: AtomicUsize::new(0),
        });
        let mut pipeline =
            Pipeline::new(source, settings(2), store.clone(), label, stats.clone()).with_commands(commands);

        assert_eq!(pipeline.run().unwrap(), RunOutcome::EndOfStream);
        assert_eq!(stats.snapshot().flush_failures, 1);
        assert_eq!(stats.snapshot().collections_saved, 1);
        assert_eq!(store.event_count("wave").unwrap(), 1);
    }

    #[test]
    fn test_transport_faults_back_off_and_give_up() {
        let dir = tempdir().unwrap();
        let reads = Arc::new(AtomicUsize::new(0));
        let reconnects = Arc::new(AtomicUsize::new(0));
        let source = DeadLink {
            reads: reads.clone(),
            reconnects: reconnects.clone(),
        };
        let stats = create_shared_stats();

        let mut pipeline = Pipeline::new(
            source,
            settings(1),
            LabelStore::new(dir.path()),
            Arc::new(FixedLabel("wave".into())),
            stats.clone(),
        );

        let started = Instant::now();
        assert_eq!(pipeline.run().unwrap(), RunOutcome::EndOfStream);

        // One read per attempt plus the one that exhausts the budget.
        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(stats.snapshot().reconnects, 2);
        // Backoff of 1 ms then 2 ms.
        assert!(started.elapsed() >= Duration::from_millis(3));
    }

    #[test]
    fn test_stalled_source_waits_for_commands() {
        let dir = tempdir().unwrap();
        let mut script: Vec<_> = (0..50).map(|_| Err(SourceError::Timeout)).collect();
        script.push(frame(1.0));
        let (mut source, closed) = ScriptedSource::new(script);
        source.stalls = true;
        let (sender, commands) = command_channel();
        source.on_drain = Some((sender, Command::Exit));

        let stats = create_shared_stats();
        let mut pipeline = Pipeline::new(
            source,
            settings(5),
            LabelStore::new(dir.path()),
            Arc::new(FixedLabel("wave".into())),
            stats.clone(),
        )
        .with_commands(commands);

        // Far more timeouts than max_attempts, yet the loop keeps waiting.
        assert_eq!(pipeline.run().unwrap(), RunOutcome::Stopped(Command::Exit));
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(stats.snapshot().frames_synced, 1);
        assert_eq!(stats.snapshot().reconnects, 0);
    }

    #[test]
    fn test_source_faults_are_counted_separately() {
        let dir = tempdir().unwrap();
        let (mut source, _closed) = ScriptedSource::new(vec![frame(1.0)]);
        source.faults = SourceFaults {
            discarded_groups: 1,
            corrupt_packets: 3,
        };
        let stats = create_shared_stats();

        let mut pipeline = Pipeline::new(
            source,
            settings(1),
            LabelStore::new(dir.path()),
            Arc::new(FixedLabel("wave".into())),
            stats.clone(),
        );
        pipeline.run().unwrap();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.groups_discarded, 1);
        assert_eq!(snapshot.corrupt_packets, 3);
    }

    #[test]
    fn test_short_windows_are_counted_not_collected() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        let short = || {
            Ok(SyncedFrame::from_rows(vec![
                ChannelRow::new(0, false, vec![1.0; 2]),
                ChannelRow::new(1, true, vec![2.0; 2]),
            ]))
        };
        let (source, _closed) = ScriptedSource::new(vec![short(), short(), short()]);
        let (sender, commands) = command_channel();
        sender.send(Command::StartCollecting);

        let stats = create_shared_stats();
        let mut pipeline = Pipeline::new(
            source,
            settings(2),
            store.clone(),
            Arc::new(FixedLabel("wave".into())),
            stats.clone(),
        )
        .with_commands(commands);

        assert_eq!(pipeline.run().unwrap(), RunOutcome::EndOfStream);
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.windows_emitted, 3);
        assert_eq!(snapshot.short_windows, 3);
        assert_eq!(snapshot.instances_collected, 0);
        assert_eq!(store.event_count("wave").unwrap(), 0);
    }
}
