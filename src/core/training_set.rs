//! Compile stored collections into a feature matrix for training.

use crate::core::features::{featurize_window, FeatureConfig, FeatureError};
use crate::core::windowing::{TagColumns, Window};
use crate::store::{write_npy_atomic, LabelStore, StoreError};
use ndarray::{Array2, Axis, Ix2};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const FEATURES_FILE: &str = "training_features.npy";
pub const LABELS_FILE: &str = "training_labels.json";

#[derive(Debug, Error)]
pub enum TrainingSetError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("featurizing '{label}' failed: {source}")]
    Feature { label: String, source: FeatureError },

    #[error("store for '{label}' has shape {shape:?}, expected [events, instances, channels, width]")]
    Shape { label: String, shape: Vec<usize> },

    #[error("feature length changed from {expected} to {actual} in '{label}'")]
    FeatureLength {
        label: String,
        expected: usize,
        actual: usize,
    },

    #[error("no stored instances for {0:?}")]
    Empty(Vec<String>),

    #[error("could not write {path}: {reason}")]
    Output { path: PathBuf, reason: String },
}

/// Feature rows paired with their labels.
#[derive(Debug, Clone)]
pub struct TrainingSet {
    pub features: Array2<f64>,
    pub labels: Vec<String>,
}

/// Sidecar describing the label vector.
#[derive(Debug, Serialize, Deserialize)]
struct LabelsFile {
    feature: FeatureConfig,
    labels: Vec<String>,
}

impl TrainingSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Write the feature matrix and label vector into `dir`.
    pub fn write(&self, dir: &Path, config: &FeatureConfig) -> Result<(PathBuf, PathBuf), TrainingSetError> {
        let features_path = dir.join(FEATURES_FILE);
        let labels_path = dir.join(LABELS_FILE);

        write_npy_atomic(&features_path, &self.features)?;

        let sidecar = LabelsFile {
            feature: config.clone(),
            labels: self.labels.clone(),
        };
        let json = serde_json::to_string_pretty(&sidecar).map_err(|e| TrainingSetError::Output {
            path: labels_path.clone(),
            reason: e.to_string(),
        })?;
        std::fs::write(&labels_path, json).map_err(|e| TrainingSetError::Output {
            path: labels_path.clone(),
            reason: e.to_string(),
        })?;

        Ok((features_path, labels_path))
    }
}

/// Featurize every stored instance of `labels`.
///
/// Each `[C, W]` instance becomes one feature row; labels without a store are
/// skipped with a warning.
pub fn compile_training_set(
    store: &LabelStore,
    labels: &[String],
    config: &FeatureConfig,
    tags: TagColumns,
) -> Result<TrainingSet, TrainingSetError> {
    let mut rows: Vec<f64> = Vec::new();
    let mut row_labels = Vec::new();
    let mut width: Option<usize> = None;

    for label in labels {
        let Some(array) = store.load(label)? else {
            tracing::warn!(label = %label, "no store for label, skipping");
            continue;
        };
        if array.ndim() != 4 {
            return Err(TrainingSetError::Shape {
                label: label.clone(),
                shape: array.shape().to_vec(),
            });
        }

        for event in array.axis_iter(Axis(0)) {
            for instance in event.axis_iter(Axis(0)) {
                let instance = instance.into_dimensionality::<Ix2>().map_err(|_| TrainingSetError::Shape {
                    label: label.clone(),
                    shape: array.shape().to_vec(),
                })?;
                let window = Window::from_array(instance, tags);
                let features = featurize_window(&window, config).map_err(|source| TrainingSetError::Feature {
                    label: label.clone(),
                    source,
                })?;

                let expected = *width.get_or_insert(features.len());
                if features.len() != expected {
                    return Err(TrainingSetError::FeatureLength {
                        label: label.clone(),
                        expected,
                        actual: features.len(),
                    });
                }
                rows.extend(features);
                row_labels.push(label.clone());
            }
        }
    }

    let Some(width) = width else {
        return Err(TrainingSetError::Empty(labels.to_vec()));
    };
    let features = Array2::from_shape_vec((row_labels.len(), width), rows).map_err(|_| TrainingSetError::Shape {
        label: String::new(),
        shape: vec![row_labels.len(), width],
    })?;

    Ok(TrainingSet {
        features,
        labels: row_labels,
    })
}
