//! Frame producers: the camera-side boundary of the pipeline.
//!
//! A [`FrameSource`] hands out one encoded JPEG per call. Camera controls live
//! on a separate [`CameraControl`] handle so they never queue behind a capture
//! that is waiting on the camera. Failures never cross this boundary as
//! errors: an empty capture is `None`, an unsupported or failed control is
//! `false`.

pub mod mjpeg;
pub mod snapshot;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use framecast_common::config::{SourceConfig, SourceMode};

pub use mjpeg::MjpegSource;
pub use snapshot::SnapshotSource;

#[async_trait]
pub trait FrameSource: Send {
    /// Wait for and return the next frame, or `None` if none could be produced.
    async fn capture_frame(&mut self) -> Option<Bytes>;

    /// Control handle for the camera behind this source.
    fn controls(&self) -> Arc<dyn CameraControl> {
        Arc::new(NoCameraControl)
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// Camera operations that may run while a capture is in flight.
#[async_trait]
pub trait CameraControl: Send + Sync {
    /// Switch the camera's live-view output on or off.
    async fn enable_preview(&self, _enable: bool) -> bool {
        true
    }

    async fn zoom(&self, _speed: i32) -> bool {
        false
    }

    async fn shutter(&self) -> bool {
        false
    }
}

/// Controls for sources that only deliver frames.
pub struct NoCameraControl;

impl CameraControl for NoCameraControl {}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error("upstream stream ended")]
    Ended,
    #[error("no data from upstream within {0:?}")]
    ReadTimeout(Duration),
}

/// Build the source selected by `config.mode`.
pub fn from_config(config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    Ok(match config.mode {
        SourceMode::Mjpeg => Box::new(MjpegSource::new(config)?),
        SourceMode::Snapshot => Box::new(SnapshotSource::new(config)?),
    })
}
