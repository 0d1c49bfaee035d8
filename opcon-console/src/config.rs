//! Configuration for the operator console.

use std::path::Path;

use serde::{Deserialize, Serialize};

use opcon_core::config::{BrokerConfig, DeviceTuning, RateLimitConfig, StreamOptions};
use opcon_core::video::StreamSession;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Video source settings.
    pub stream: StreamConfig,
    /// Broker connection and topics.
    pub broker: BrokerConfig,
    /// Outbound command admission.
    pub rate_limit: RateLimitConfig,
    /// Device constants.
    pub device: DeviceTuning,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Video source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// `rtmp://` or `rtsp://` source.
    pub url: String,
    /// Start decoding at launch.
    pub enabled: bool,
    /// Frames between periodic stats log lines (0 disables them).
    pub stats_every: u64,
    /// Path of the `ffmpeg` binary.
    pub ffmpeg: String,
    /// Path of the `ffprobe` binary.
    pub ffprobe: String,
    pub options: StreamOptions,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "rtmp://127.0.0.1:1935/live/test".into(),
            enabled: true,
            stats_every: 300,
            ffmpeg: "ffmpeg".into(),
            ffprobe: "ffprobe".into(),
            options: StreamOptions::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl ConsoleConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Write the default configuration to a file (for bootstrapping).
    pub fn write_default(path: &Path) -> std::io::Result<()> {
        let text = toml::to_string_pretty(&Self::default()).map_err(std::io::Error::other)?;
        std::fs::write(path, text)
    }

    /// The stream session to open.
    pub fn stream_session(&self) -> StreamSession {
        StreamSession::new(self.stream.url.clone()).with_options(self.stream.options.clone())
    }
}

// ── Tests ────────────────────────────────────────────────────────
