//! Process liveness token.
//!
//! Written at startup so health checks can find the acquisition process, and
//! removed when the guard drops.

use crate::control::ControlError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivenessToken {
    pub pid: u32,
    pub hostname: String,
    pub session_id: Uuid,
    /// Source the process is reading, e.g. `serial:/dev/ttyACM0`
    pub source: String,
    pub started_at: DateTime<Utc>,
}

impl LivenessToken {
    pub fn new(source: impl Into<String>) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            pid: std::process::id(),
            hostname,
            session_id: Uuid::new_v4(),
            source: source.into(),
            started_at: Utc::now(),
        }
    }

    /// Read a token; `None` if no process has published one.
    pub fn read(path: &Path) -> Result<Option<Self>, ControlError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let token = serde_json::from_str(&content).map_err(|e| ControlError::Token(e.to_string()))?;
        Ok(Some(token))
    }
}

/// Keeps the token on disk for the lifetime of the guard.
#[derive(Debug)]
pub struct LivenessGuard {
    path: PathBuf,
    token: LivenessToken,
}

impl LivenessGuard {
    pub fn publish(path: impl Into<PathBuf>, token: LivenessToken) -> Result<Self, ControlError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&token).map_err(|e| ControlError::Token(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(Self { path, token })
    }

    pub fn token(&self) -> &LivenessToken {
        &self.token
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        // Leave a token published by a newer session in place.
        if let Ok(Some(current)) = LivenessToken::read(&self.path) {
            if current.session_id != self.token.session_id {
                return;
            }
        }
        let _ = std::fs::remove_file(&self.path);
    }
}
