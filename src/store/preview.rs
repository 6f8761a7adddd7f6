//! Latest-window file for preview consumers.

use crate::core::windowing::{TagColumns, Window};
use crate::store::{write_npy_atomic, StoreError};
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Overwrites a single `.npy` file with every assembled window.
#[derive(Debug, Clone)]
pub struct PreviewSink {
    path: PathBuf,
    tags: TagColumns,
}

impl PreviewSink {
    pub fn new(path: impl Into<PathBuf>, tags: TagColumns) -> Self {
        Self {
            path: path.into(),
            tags,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publish(&self, window: &Window) -> Result<(), StoreError> {
        write_npy_atomic(&self.path, &window.to_array(self.tags))
    }
}

/// Read the most recent window.
///
/// A missing or unreadable file means no data yet and yields `None`.
pub fn read_latest_window(path: &Path) -> Option<Array2<f64>> {
    let file = File::open(path).ok()?;
    Array2::<f64>::read_npy(BufReader::new(file)).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::types::{ChannelRow, SyncedFrame};
    use tempfile::tempdir;

    fn window(value: f64) -> Window {
        let frame = SyncedFrame::from_rows(vec![ChannelRow::new(0, true, vec![value; 3])]);
        Window::from_frame(frame, 3)
    }

    #[test]
    fn test_publish_overwrites() {
        let dir = tempdir().unwrap();
        let sink = PreviewSink::new(dir.path().join("latest_window.npy"), TagColumns::Strip);

        sink.publish(&window(1.0)).unwrap();
        sink.publish(&window(2.0)).unwrap();

        let latest = read_latest_window(sink.path()).unwrap();
        assert_eq!(latest.dim(), (1, 3));
        assert_eq!(latest[[0, 0]], 2.0);
    }

    #[test]
    fn test_missing_or_torn_file_is_no_data() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("latest_window.npy");
        assert!(read_latest_window(&path).is_none());

        std::fs::write(&path, b"\x93NUMPY\x01").unwrap();
        assert!(read_latest_window(&path).is_none());
    }
}
