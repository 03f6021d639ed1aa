use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broadcast server (MJPEG viewers) settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    #[serde(default = "default_accept_poll_ms")]
    pub accept_poll_ms: u64,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn accept_poll(&self) -> Duration {
        Duration::from_millis(self.accept_poll_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            accept_poll_ms: default_accept_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    /// Upstream `multipart/x-mixed-replace` stream.
    Mjpeg,
    /// Single-JPEG endpoint polled at `fps`.
    Snapshot,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub url: String,
    #[serde(default = "default_source_mode")]
    pub mode: SourceMode,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
    /// Longest wait for the next chunk of an open stream before reconnecting.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

pub const MIN_FPS: f64 = 0.01;
pub const MAX_FPS: f64 = 240.0;

impl SourceConfig {
    /// Interval between frames at the configured rate, with fps clamped to
    /// `MIN_FPS..=MAX_FPS`. Non-positive or non-finite rates fall back to 1 fps.
    pub fn frame_interval(&self) -> Duration {
        if !self.fps.is_finite() || self.fps <= 0.0 {
            tracing::warn!(fps = self.fps, "invalid source fps, using 1 fps");
            return Duration::from_secs(1);
        }
        let fps = self.fps.clamp(MIN_FPS, MAX_FPS);
        if fps != self.fps {
            tracing::warn!(fps = self.fps, clamped = fps, "source fps out of range");
        }
        Duration::from_secs_f64(1.0 / fps)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms.max(1))
    }
}

/// Output flavour of the external encoder. Only changes the argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderTarget {
    Hls,
    Rtsp,
    Rtmp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EncoderConfig {
    #[serde(default = "default_encoder_program")]
    pub program: String,
    #[serde(default = "default_encoder_target")]
    pub target: EncoderTarget,
    /// Output directory for HLS, push URL for RTSP/RTMP.
    #[serde(default = "default_destination")]
    pub destination: String,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_rtsp_transport")]
    pub rtsp_transport: String,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl EncoderConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
            target: default_encoder_target(),
            destination: default_destination(),
            framerate: default_framerate(),
            bitrate_kbps: default_bitrate_kbps(),
            rtsp_transport: default_rtsp_transport(),
            write_timeout_ms: default_write_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

/// Which sinks a live-view session enables.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_true")]
    pub preview: bool,
    #[serde(default)]
    pub restream: bool,
    #[serde(default)]
    pub autostart: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            preview: true,
            restream: false,
            autostart: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: default_api_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_server_port() -> u16 {
    9091
}
fn default_handshake_timeout_ms() -> u64 {
    2000
}
fn default_send_timeout_ms() -> u64 {
    2000
}
fn default_accept_poll_ms() -> u64 {
    100
}
fn default_source_mode() -> SourceMode {
    SourceMode::Mjpeg
}
fn default_fps() -> f64 {
    25.0
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_reconnect_max_secs() -> u64 {
    30
}
fn default_read_timeout_ms() -> u64 {
    10_000
}
fn default_encoder_program() -> String {
    "ffmpeg".into()
}
fn default_encoder_target() -> EncoderTarget {
    EncoderTarget::Hls
}
fn default_destination() -> String {
    "hls".into()
}
fn default_framerate() -> u32 {
    25
}
fn default_bitrate_kbps() -> u32 {
    2000
}
fn default_rtsp_transport() -> String {
    "tcp".into()
}
fn default_write_timeout_ms() -> u64 {
    2000
}
fn default_stop_grace_ms() -> u64 {
    5000
}
fn default_api_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}
