//! Capture a labeled collection from a synthetic sensor.
//!
//! This example shows how to:
//! 1. Encode framed binary records the way the sensor firmware does
//! 2. Recover frames with the synchronizer
//! 3. Collect a batch of windows into a label store
//! 4. Compile stored collections into a feature matrix
//!
//! Run with: cargo run --example synthetic_stream

use std::f64::consts::TAU;
use std::io::Cursor;
use std::sync::Arc;

use sensor_frames::{
    control::{command_channel, Command, FixedLabel},
    core::{compile_training_set, TagColumns},
    pipeline::{Pipeline, PipelineSettings},
    source::{FrameSynchronizer, RecordLayout},
    stats::create_shared_stats,
    Config, FeatureConfig, FeatureKind, LabelStore,
};

const SAMPLES: usize = 200;
const CHANNELS: usize = 3;
const FRAMES: usize = 12;

/// A sine per channel, offset so values stay positive.
fn synthetic_stream(layout: RecordLayout, phase_step: f64) -> Vec<u8> {
    let mut bytes = Vec::new();
    for f in 0..FRAMES {
        for channel in 0..CHANNELS {
            let samples: Vec<u16> = (0..SAMPLES)
                .map(|i| {
                    let t = (f * SAMPLES + i) as f64 / SAMPLES as f64;
                    let freq = (channel + 1) as f64 * phase_step;
                    (2048.0 + 1000.0 * (TAU * freq * t).sin()) as u16
                })
                .collect();
            bytes.extend(layout.encode(channel as u16, &samples, channel + 1 == CHANNELS));
        }
        // Line noise between frames; the synchronizer skips it.
        bytes.extend([0x13, 0x37]);
    }
    bytes
}

fn main() -> anyhow::Result<()> {
    println!("sensor-frames - Synthetic Stream Demo");
    println!("=====================================");
    println!();

    let dir = tempfile::tempdir()?;
    let store = LabelStore::new(dir.path());
    let layout = RecordLayout::new(SAMPLES, CHANNELS);

    let mut config = Config::default();
    config.acquisition.instances = 5;
    config.acquisition.frame_length = SAMPLES;

    for (label, phase_step) in [("slow", 1.0), ("fast", 4.0)] {
        let source = FrameSynchronizer::new(Cursor::new(synthetic_stream(layout, phase_step)), layout)
            .with_description(format!("synthetic:{label}"));
        let (sender, commands) = command_channel();
        sender.send(Command::StartCollecting);

        let stats = create_shared_stats();
        let mut pipeline = Pipeline::new(
            source,
            PipelineSettings::from_config(&config),
            store.clone(),
            Arc::new(FixedLabel(label.to_string())),
            stats.clone(),
        )
        .with_commands(commands);

        let outcome = pipeline.run()?;
        println!("{label}: {outcome:?}");
        println!("{}", stats.summary());
        println!();
    }

    let labels = store.labels()?;
    println!("Stored labels: {labels:?}");

    let features = FeatureConfig {
        kind: FeatureKind::Variance,
        num_bins: 20,
        ..FeatureConfig::default()
    };
    let set = compile_training_set(&store, &labels, &features, TagColumns::Retain)?;
    println!(
        "Training set: {} rows x {} {} features",
        set.features.nrows(),
        set.features.ncols(),
        features.kind
    );

    Ok(())
}
