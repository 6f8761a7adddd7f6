//! File slots and label sources.
//!
//! A [`FileCommandSlot`] holds one command token written by an external
//! orchestrator; the loop reads it and clears it. Label sources supply the
//! label used when a collection is flushed.

use crate::control::command::{Command, CommandSource};
use crate::control::ControlError;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Read-then-clear command file.
#[derive(Debug, Clone)]
pub struct FileCommandSlot {
    path: PathBuf,
}

impl FileCommandSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a command for the acquisition process to pick up.
    pub fn write(&self, command: Command) -> Result<(), ControlError> {
        std::fs::write(&self.path, command.token())?;
        Ok(())
    }

    /// Read the pending token and clear the slot.
    pub fn take(&self) -> Result<Option<Command>, ControlError> {
        let token = match std::fs::read_to_string(&self.path) {
            Ok(token) => token,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if token.trim().is_empty() {
            return Ok(None);
        }
        std::fs::write(&self.path, "")?;
        Command::parse(&token)
    }
}

impl CommandSource for FileCommandSlot {
    fn poll(&mut self) -> Option<Command> {
        match self.take() {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!(slot = %self.path.display(), error = %e, "ignoring command slot");
                None
            }
        }
    }
}

/// Supplies the label for the next flush.
pub trait LabelSource: Send + Sync {
    fn current_label(&self) -> Result<String, ControlError>;
}

/// A label fixed for the whole session.
#[derive(Debug, Clone)]
pub struct FixedLabel(pub String);

impl LabelSource for FixedLabel {
    fn current_label(&self) -> Result<String, ControlError> {
        Ok(self.0.clone())
    }
}

/// Label read from a file at flush time.
#[derive(Debug, Clone)]
pub struct FileLabelSlot {
    path: PathBuf,
}

impl FileLabelSlot {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn write(&self, label: &str) -> Result<(), ControlError> {
        std::fs::write(&self.path, label.trim())?;
        Ok(())
    }
}

impl LabelSource for FileLabelSlot {
    fn current_label(&self) -> Result<String, ControlError> {
        let label = std::fs::read_to_string(&self.path)?;
        let label = label.trim();
        if label.is_empty() {
            return Err(ControlError::MissingLabel);
        }
        Ok(label.to_string())
    }
}

/// Label updated in-process, e.g. by the control server.
#[derive(Debug, Clone, Default)]
pub struct SharedLabel {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedLabel {
    pub fn new(initial: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn set(&self, label: impl Into<String>) {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(label.into());
    }

    pub fn get(&self) -> Option<String> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl LabelSource for SharedLabel {
    fn current_label(&self) -> Result<String, ControlError> {
        self.get().ok_or(ControlError::MissingLabel)
    }
}

/// Try each source in order; the first that yields a label wins.
pub struct LabelChain {
    sources: Vec<Box<dyn LabelSource>>,
}

impl LabelChain {
    pub fn new(sources: Vec<Box<dyn LabelSource>>) -> Self {
        Self { sources }
    }
}

impl LabelSource for LabelChain {
    fn current_label(&self) -> Result<String, ControlError> {
        let mut last = ControlError::MissingLabel;
        for source in &self.sources {
            match source.current_label() {
                Ok(label) => return Ok(label),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}
