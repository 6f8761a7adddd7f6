//! Append-only per-label training store.
//!
//! Each label owns `training_data_<label>.npy`. Every flush appends one
//! collection event of shape `[INSTANCES, C, W]`, so the stored array is
//! `[events, INSTANCES, C, W]`. Deleting removes the last event.

use crate::core::windowing::{TagColumns, Window};
use crate::store::lock::LabelLock;
use crate::store::{write_npy_atomic, StoreError};
use ndarray::{concatenate, ArrayD, Axis, IxDyn, Slice};
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

const FILE_PREFIX: &str = "training_data_";
const FILE_SUFFIX: &str = ".npy";

/// Normalize a user-entered label for use in a file name.
///
/// Lowercases, trims, maps spaces and anything outside `[a-z0-9_.-]` to `_`.
pub fn sanitize_label(raw: &str) -> Result<String, StoreError> {
    let label: String = raw
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '_' | '.' | '-' => c,
            _ => '_',
        })
        .collect();

    if label.is_empty() || label.chars().all(|c| c == '.') {
        return Err(StoreError::InvalidLabel(raw.to_string()));
    }
    Ok(label)
}

/// Directory of per-label stores.
#[derive(Debug, Clone)]
pub struct LabelStore {
    root: PathBuf,
    lock_timeout: Duration,
}

impl LabelStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            lock_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store file for `label` after sanitizing.
    pub fn path_for(&self, label: &str) -> Result<PathBuf, StoreError> {
        let label = sanitize_label(label)?;
        Ok(self.root.join(format!("{FILE_PREFIX}{label}{FILE_SUFFIX}")))
    }

    /// The stored array, or `None` if nothing was saved for `label`.
    pub fn load(&self, label: &str) -> Result<Option<ArrayD<f64>>, StoreError> {
        let path = self.path_for(label)?;
        read_store(&path)
    }

    /// Number of saved collection events for `label`.
    pub fn event_count(&self, label: &str) -> Result<usize, StoreError> {
        Ok(self
            .load(label)?
            .map(|array| array.shape().first().copied().unwrap_or(0))
            .unwrap_or(0))
    }

    /// Append one collection event built from `windows`. Returns the new
    /// event count.
    pub fn append(&self, label: &str, windows: &[Window], tags: TagColumns) -> Result<usize, StoreError> {
        let block = event_block(windows, tags)?;
        self.append_block(label, block)
    }

    /// Append `block` (leading axis = events) to the label's store.
    pub fn append_block(&self, label: &str, block: ArrayD<f64>) -> Result<usize, StoreError> {
        if block.ndim() == 0 {
            return Err(StoreError::Empty);
        }
        let path = self.path_for(label)?;
        std::fs::create_dir_all(&self.root).map_err(|e| StoreError::io(&self.root, e))?;
        let _lock = LabelLock::acquire(&path, self.lock_timeout)?;

        let combined = match read_store(&path)? {
            Some(existing) => {
                if existing.ndim() != block.ndim() || existing.shape()[1..] != block.shape()[1..] {
                    return Err(StoreError::ShapeMismatch {
                        existing: existing.shape().to_vec(),
                        incoming: block.shape().to_vec(),
                    });
                }
                concatenate(Axis(0), &[existing.view(), block.view()]).map_err(|_| {
                    StoreError::ShapeMismatch {
                        existing: existing.shape().to_vec(),
                        incoming: block.shape().to_vec(),
                    }
                })?
            }
            None => block,
        };

        write_npy_atomic(&path, &combined)?;
        let events = combined.shape()[0];
        tracing::debug!(store = %path.display(), events, "appended collection event");
        Ok(events)
    }

    /// Remove the last saved event. Returns the remaining count, or `None` if
    /// the label has no store.
    pub fn delete_last(&self, label: &str) -> Result<Option<usize>, StoreError> {
        let path = self.path_for(label)?;
        if !path.exists() {
            return Ok(None);
        }
        let _lock = LabelLock::acquire(&path, self.lock_timeout)?;

        let Some(existing) = read_store(&path)? else {
            return Ok(None);
        };
        let events = existing.shape().first().copied().unwrap_or(0);
        if events == 0 {
            return Ok(Some(0));
        }

        let trimmed = existing
            .slice_axis(Axis(0), Slice::from(..events - 1))
            .to_owned();
        write_npy_atomic(&path, &trimmed)?;
        Ok(Some(events - 1))
    }

    /// Labels that currently have a store file, sorted.
    pub fn labels(&self) -> Result<Vec<String>, StoreError> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.root, e)),
        };

        let mut labels: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().into_string().ok()?;
                let label = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
                Some(label.to_string())
            })
            .collect();
        labels.sort();
        Ok(labels)
    }
}

/// Stack `windows` into a `[1, N, C, W]` block.
fn event_block(windows: &[Window], tags: TagColumns) -> Result<ArrayD<f64>, StoreError> {
    let first = windows.first().ok_or(StoreError::Empty)?.to_array(tags);
    let (channels, width) = first.dim();

    let mut data = Vec::with_capacity(windows.len() * channels * width);
    for window in windows {
        let array = window.to_array(tags);
        if array.dim() != (channels, width) {
            return Err(StoreError::ShapeMismatch {
                existing: vec![channels, width],
                incoming: array.shape().to_vec(),
            });
        }
        data.extend(array.iter().copied());
    }

    ArrayD::from_shape_vec(IxDyn(&[1, windows.len(), channels, width]), data).map_err(|_| {
        StoreError::ShapeMismatch {
            existing: vec![1, windows.len(), channels, width],
            incoming: vec![windows.len() * channels * width],
        }
    })
}

fn read_store(path: &Path) -> Result<Option<ArrayD<f64>>, StoreError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    ArrayD::<f64>::read_npy(BufReader::new(file))
        .map(Some)
        .map_err(|source| StoreError::Read {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::types::{ChannelRow, SyncedFrame};
    use tempfile::tempdir;

    fn window(base: f64) -> Window {
        let frame = SyncedFrame::from_rows(vec![
            ChannelRow::new(0, false, vec![base, base + 1.0]),
            ChannelRow::new(1, true, vec![base + 2.0, base + 3.0]),
        ]);
        Window::from_frame(frame, 2)
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("  Wave Hand ").unwrap(), "wave_hand");
        assert_eq!(sanitize_label("a/b").unwrap(), "a_b");
        assert_eq!(sanitize_label("fist-2.v1").unwrap(), "fist-2.v1");
        assert!(sanitize_label("   ").is_err());
        assert!(sanitize_label("..").is_err());
    }

    #[test]
    fn test_append_creates_store() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());

        assert_eq!(store.event_count("wave").unwrap(), 0);
        let events = store.append("wave", &[window(0.0), window(10.0)], TagColumns::Retain).unwrap();
        assert_eq!(events, 1);

        let array = store.load("wave").unwrap().unwrap();
        assert_eq!(array.shape(), &[1, 2, 2, 4]);
        assert_eq!(array[&[0, 1, 1, 0][..]], 12.0);
        assert_eq!(array[&[0, 1, 1, 3][..]], 1.0);
    }

    #[test]
    fn test_append_grows_leading_axis() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());

        store.append("wave", &[window(0.0)], TagColumns::Strip).unwrap();
        let events = store.append("wave", &[window(5.0)], TagColumns::Strip).unwrap();
        assert_eq!(events, 2);
        assert_eq!(store.load("wave").unwrap().unwrap().shape(), &[2, 1, 2, 2]);
    }

    #[test]
    fn test_append_rejects_shape_change() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());

        store.append("wave", &[window(0.0)], TagColumns::Strip).unwrap();
        assert!(matches!(
            store.append("wave", &[window(0.0)], TagColumns::Retain),
            Err(StoreError::ShapeMismatch { .. })
        ));
        assert_eq!(store.event_count("wave").unwrap(), 1);
    }

    #[test]
    fn test_delete_last_is_inverse_of_append() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());

        store.append("wave", &[window(0.0)], TagColumns::Retain).unwrap();
        let before = store.load("wave").unwrap().unwrap();

        store.append("wave", &[window(7.0)], TagColumns::Retain).unwrap();
        assert_eq!(store.delete_last("wave").unwrap(), Some(1));
        assert_eq!(store.load("wave").unwrap().unwrap(), before);
    }

    #[test]
    fn test_delete_last_missing_store_is_noop() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        assert_eq!(store.delete_last("ghost").unwrap(), None);
        assert!(store.labels().unwrap().is_empty());
    }

    #[test]
    fn test_labels_lists_stores() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        store.append("Wave", &[window(0.0)], TagColumns::Retain).unwrap();
        store.append("fist", &[window(0.0)], TagColumns::Retain).unwrap();

        assert_eq!(store.labels().unwrap(), vec!["fist".to_string(), "wave".to_string()]);
    }

    #[test]
    fn test_empty_batch_rejected() {
        let dir = tempdir().unwrap();
        let store = LabelStore::new(dir.path());
        assert!(matches!(
            store.append("wave", &[], TagColumns::Retain),
            Err(StoreError::Empty)
        ));
    }
}
