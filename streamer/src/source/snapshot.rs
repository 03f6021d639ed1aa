use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use framecast_common::config::SourceConfig;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::warn;

use super::{FrameSource, SourceError};

/// Polling fallback: fetch a single JPEG from `url` once per frame interval.
pub struct SnapshotSource {
    url: String,
    client: reqwest::Client,
    interval: Duration,
    ticker: Option<Interval>,
}

impl SnapshotSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.connect_timeout_secs.max(1) * 2))
            .build()
            .map_err(SourceError::Client)?;
        Ok(Self {
            url: config.url.clone(),
            client,
            interval: config.frame_interval(),
            ticker: None,
        })
    }

    async fn fetch(&self) -> Result<Bytes, SourceError> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(SourceError::HttpConnect)?;
        if !resp.status().is_success() {
            return Err(SourceError::HttpStatus(resp.status().as_u16()));
        }
        resp.bytes().await.map_err(SourceError::HttpStream)
    }
}

#[async_trait]
impl FrameSource for SnapshotSource {
    async fn capture_frame(&mut self) -> Option<Bytes> {
        let interval = self.interval;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker
        });
        ticker.tick().await;

        match self.fetch().await {
            Ok(jpeg) if !jpeg.is_empty() => Some(jpeg),
            Ok(_) => {
                warn!(url = self.url, "camera returned an empty snapshot");
                None
            }
            Err(e) => {
                warn!(error = %e, url = self.url, "failed to fetch camera frame");
                None
            }
        }
    }

    fn name(&self) -> &str {
        "snapshot"
    }
}
