//! Configuration for sensor-frames.

use crate::core::features::FeatureConfig;
use crate::core::windowing::TagColumns;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Main configuration for an acquisition process.
///
/// Sections missing from the file take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory for label stores, preview and runtime files
    pub data_path: PathBuf,

    /// Frame geometry and collection size
    pub acquisition: AcquisitionConfig,

    /// Featurization used when compiling training sets
    pub features: FeatureConfig,

    pub serial: SerialConfig,
    pub udp: UdpConfig,
    pub line: LineConfig,
    pub audio: AudioConfig,
    pub ble: BleConfig,
    pub control: ControlConfig,
    pub reconnect: ReconnectPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensor-frames");

        Self {
            data_path: data_dir,
            acquisition: AcquisitionConfig::default(),
            features: FeatureConfig::default(),
            serial: SerialConfig::default(),
            udp: UdpConfig::default(),
            line: LineConfig::default(),
            audio: AudioConfig::default(),
            ble: BleConfig::default(),
            control: ControlConfig::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_path();

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| ConfigError::IoError(e.to_string()))?;
            let config: Config = serde_json::from_str(&content)
                .map_err(|e| ConfigError::ParseError(e.to_string()))?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<(), ConfigError> {
        let config_path = Self::config_path();

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::IoError(e.to_string()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(&config_path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sensor-frames")
            .join("config.json")
    }

    /// Ensure all required directories exist.
    pub fn ensure_directories(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(self.store_path())
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Ok(())
    }

    /// Directory holding one store file per label.
    pub fn store_path(&self) -> PathBuf {
        self.data_path.join("training")
    }

    /// Latest-window file read by preview consumers.
    pub fn preview_path(&self) -> PathBuf {
        self.data_path.join("latest_window.npy")
    }

    pub fn stats_path(&self) -> PathBuf {
        self.data_path.join("stats.json")
    }

    pub fn liveness_path(&self) -> PathBuf {
        self.data_path.join("acquire.pid")
    }

    /// Reject settings that would make acquisition meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let acq = &self.acquisition;
        if acq.instances == 0 {
            return Err(ConfigError::Invalid("instances must be at least 1".into()));
        }
        if acq.frame_length == 0 {
            return Err(ConfigError::Invalid("frame_length must be at least 1".into()));
        }
        if acq.channels == 0 {
            return Err(ConfigError::Invalid("channels must be at least 1".into()));
        }
        if self.serial.samples_per_record == 0 {
            return Err(ConfigError::Invalid(
                "serial.samples_per_record must be at least 1".into(),
            ));
        }
        if self.audio.channels == 0 {
            return Err(ConfigError::Invalid("audio.channels must be at least 1".into()));
        }
        if self.line.frame_length == 0 {
            return Err(ConfigError::Invalid("line.frame_length must be at least 1".into()));
        }

        // A zero read timeout is rejected by the OS and would fail every read.
        for (name, timeout) in [
            ("serial.read_timeout", self.serial.read_timeout),
            ("udp.timeout", self.udp.timeout),
            ("audio.timeout", self.audio.timeout),
            ("ble.timeout", self.ble.timeout),
            ("line.overlap", self.line.overlap),
        ] {
            if timeout.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }
}

/// Frame geometry and collection size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Windows collected per trigger
    pub instances: usize,
    /// Samples per channel in a window (`L`)
    pub frame_length: usize,
    /// Channels per frame (`C`) for the byte-stream source
    pub channels: usize,
    /// Minimum time between windows; `None` emits every frame
    #[serde(with = "duration_serde::option")]
    pub overlap: Option<Duration>,
    /// Whether windows keep their channel-index/terminator columns
    pub tag_columns: TagColumns,
    /// Mirror every window to the latest-window file
    pub preview: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            instances: 10,
            frame_length: 1500,
            channels: 3,
            overlap: None,
            tag_columns: TagColumns::Retain,
            preview: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port path; auto-detected when absent
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Samples per record (`K`)
    pub samples_per_record: usize,
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 2_000_000,
            samples_per_record: 1500,
            read_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UdpConfig {
    pub bind: SocketAddr,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 6789)),
            timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LineConfig {
    pub port: Option<String>,
    pub baud_rate: u32,
    /// Samples per window; one line is one sample, so this is far below
    /// the byte-stream `frame_length`
    pub frame_length: usize,
    /// Time gate for the single-sample line source
    #[serde(with = "duration_serde")]
    pub overlap: Duration,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: 9600,
            frame_length: 100,
            overlap: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub channels: u16,
    pub sample_rate: u32,
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 48_000,
            timeout: Duration::from_secs(2),
        }
    }
}

/// Mobile sensor reached over a Bluetooth-LE UART-style service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// Only connect to a peripheral advertising this name
    pub device_name: Option<String>,
    /// Advertised service carrying the sensor stream
    pub service: Uuid,
    /// Notifying characteristic the packets arrive on
    pub rx_characteristic: Uuid,
    #[serde(with = "duration_serde")]
    pub scan_timeout: Duration,
    /// Longest wait for one packet
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            service: Uuid::from_u128(0xAAAAAAA0_B5A3_F393_E0A9_E50E24DCCA9E),
            rx_characteristic: Uuid::from_u128(0xAAAAAAA2_B5A3_F393_E0A9_E50E24DCCA9E),
            scan_timeout: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
        }
    }
}

/// Where commands and the current label come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Loopback control-plane address
    pub bind: SocketAddr,
    /// Optional read-then-clear command file
    pub command_slot: Option<PathBuf>,
    /// Optional current-label file
    pub label_slot: Option<PathBuf>,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 6790)),
            command_slot: None,
            label_slot: None,
        }
    }
}

/// Backoff applied after a source times out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(with = "duration_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,
    /// Consecutive timeouts tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            max_attempts: 20,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the `attempt`-th reconnect (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }
}

/// Acquisition source selectable from the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Serial,
    Udp,
    Line,
    Audio,
    Ble,
}

impl FromStr for SourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "serial" | "teensy" => Ok(SourceKind::Serial),
            "udp" => Ok(SourceKind::Udp),
            "line" | "arduino" => Ok(SourceKind::Line),
            "audio" | "microphone" => Ok(SourceKind::Audio),
            "ble" | "mobile" => Ok(SourceKind::Ble),
            other => Err(ConfigError::Invalid(format!("unknown source '{other}'"))),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Serial => "serial",
            SourceKind::Udp => "udp",
            SourceKind::Line => "line",
            SourceKind::Audio => "audio",
            SourceKind::Ble => "ble",
        };
        f.write_str(name)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Serialize error: {0}")]
    SerializeError(String),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Serde support for Duration, in milliseconds.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serialize, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            duration
                .map(|d| d.as_millis() as u64)
                .serialize(serializer)
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let millis = Option::<u64>::deserialize(deserializer)?;
            Ok(millis.map(Duration::from_millis))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_parsing() {
        assert_eq!("serial".parse::<SourceKind>().unwrap(), SourceKind::Serial);
        assert_eq!(" UDP ".parse::<SourceKind>().unwrap(), SourceKind::Udp);
        assert_eq!("arduino".parse::<SourceKind>().unwrap(), SourceKind::Line);
        assert_eq!("ble".parse::<SourceKind>().unwrap(), SourceKind::Ble);
        assert_eq!(SourceKind::Ble.to_string(), "ble");
        assert!("camera".parse::<SourceKind>().is_err());
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.acquisition.instances, 10);
        assert_eq!(config.acquisition.frame_length, 1500);
        assert_eq!(config.acquisition.channels, 3);
        assert!(config.acquisition.overlap.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_instances() {
        let mut config = Config::default();
        config.acquisition.instances = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let mut config = Config::default();
        config.udp.timeout = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("udp.timeout"));

        let mut config = Config::default();
        config.serial.read_timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.audio.timeout = Duration::ZERO;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_line_source_has_own_frame_length() {
        let mut config = Config::default();
        assert!(config.line.frame_length < config.acquisition.frame_length);

        config.line.frame_length = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_sections_take_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"line": {"port": "/dev/ttyACM1"}}"#).unwrap();
        assert_eq!(parsed.line.port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(parsed.line.frame_length, 100);
        assert_eq!(parsed.ble.timeout, Duration::from_secs(10));
        assert_eq!(
            parsed.ble.service.to_string(),
            "aaaaaaa0-b5a3-f393-e0a9-e50e24dcca9e"
        );
    }

    #[test]
    fn test_json_roundtrip_keeps_durations() {
        let mut config = Config::default();
        config.acquisition.overlap = Some(Duration::from_millis(250));

        let json = serde_json::to_string(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.acquisition.overlap, Some(Duration::from_millis(250)));
        assert_eq!(parsed.udp.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(250));
        assert_eq!(policy.backoff(2), Duration::from_millis(500));
        assert_eq!(policy.backoff(30), Duration::from_secs(5));
    }
}
