//! On-disk persistence.
//!
//! - [`label_store::LabelStore`]: one append-only `.npy` array per label
//! - [`lock::LabelLock`]: per-label exclusive lock file
//! - [`preview::PreviewSink`]: latest-window file for preview consumers
//!
//! Every write goes to a temporary file in the target directory and is then
//! renamed over the destination, so readers see either the old or the new
//! array and never a partial one.

pub mod label_store;
pub mod lock;
pub mod preview;

pub use label_store::{sanitize_label, LabelStore};
pub use lock::LabelLock;
pub use preview::{read_latest_window, PreviewSink};

use ndarray_npy::{ReadNpyError, WriteNpyError, WriteNpyExt};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid label '{0}'")]
    InvalidLabel(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: ReadNpyError },

    #[error("could not write {path}: {source}")]
    Write { path: PathBuf, source: WriteNpyError },

    #[error("shape mismatch: store holds {existing:?}, new data is {incoming:?}")]
    ShapeMismatch {
        existing: Vec<usize>,
        incoming: Vec<usize>,
    },

    #[error("timed out waiting for lock {0}")]
    LockTimeout(PathBuf),

    #[error("nothing to store")]
    Empty,
}

impl StoreError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Write `array` to `path` via a same-directory temporary file and rename.
pub(crate) fn write_npy_atomic<A>(path: &Path, array: &A) -> Result<(), StoreError>
where
    A: WriteNpyExt + ?Sized,
{
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;

    let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| StoreError::io(&dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        array.write_npy(&mut writer).map_err(|source| StoreError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        writer.flush().map_err(|e| StoreError::io(path, e))?;
    }
    tmp.as_file().sync_all().map_err(|e| StoreError::io(path, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}
