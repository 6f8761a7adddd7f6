//! sensor-frames - multi-channel sensor acquisition for gesture training.
//!
//! This library turns raw samples from a sensor (framed binary serial link,
//! UDP or BLE text packets, a line-oriented serial port or an audio device)
//! into fixed-length multi-channel windows, and accumulates labeled
//! collections of those windows into an append-only store shared with a
//! separate training process.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        sensor-frames                         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Source    │──▶│   Overlap   │──▶│  Training   │         │
//! │  │ (sync/mux)  │   │  Assembler  │   │ Accumulator │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         ▲                 │                 │                │
//! │         │                 ▼                 ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Control   │   │   Preview   │   │ Label Store │──▶ compile
//! │  │   (poll)    │   │    file     │   │   (.npy)    │   features
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use sensor_frames::{
//!     control::FixedLabel, pipeline::{Pipeline, PipelineSettings},
//!     source::{FrameSynchronizer, RecordLayout}, stats::create_shared_stats, Config, LabelStore,
//! };
//! use std::sync::Arc;
//!
//! let config = Config::default();
//! let port = std::fs::File::open("/dev/ttyACM0").unwrap();
//! let source = FrameSynchronizer::new(port, RecordLayout::new(1500, 3));
//!
//! let mut pipeline = Pipeline::new(
//!     source,
//!     PipelineSettings::from_config(&config),
//!     LabelStore::new(config.store_path()),
//!     Arc::new(FixedLabel("wave".into())),
//!     create_shared_stats(),
//! );
//! pipeline.run().unwrap();
//! ```

pub mod config;
pub mod control;
pub mod core;
pub mod pipeline;
pub mod source;
pub mod stats;
pub mod store;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, SourceKind};
pub use control::{Command, ControlError, ControlRequest};
pub use core::{
    featurize, featurize_window, FeatureConfig, FeatureError, FeatureKind, OverlapAssembler, TrainingAccumulator,
    Window,
};
pub use pipeline::{Pipeline, PipelineError, PipelineSettings, RunOutcome};
pub use source::{FrameSource, ProtocolError, SourceError, SourceFaults, SyncedFrame};
pub use stats::{AcquisitionStats, SharedStats, StatsSnapshot};
pub use store::{LabelStore, StoreError};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
