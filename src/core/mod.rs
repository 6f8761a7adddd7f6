//! Core processing for sensor-frames.
//!
//! This module contains:
//! - Window assembly from synchronized frames, with optional time-gated overlap
//! - Featurization of windows
//! - The training collection state machine
//! - Compilation of stored collections into a training set

pub mod accumulator;
pub mod features;
pub mod training_set;
pub mod windowing;

// Re-export commonly used types
pub use accumulator::{CollectionState, PushOutcome, TrainingAccumulator};
pub use features::{featurize, featurize_window, validate_bins, FeatureConfig, FeatureError, FeatureKind};
pub use training_set::{compile_training_set, TrainingSet, TrainingSetError};
pub use windowing::{overlap_window, OverlapAssembler, TagColumns, Window};
