use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use framecast_common::config::SourceConfig;
use framecast_common::multipart::{boundary_from_content_type, MultipartDecoder, BOUNDARY};
use futures_util::{Stream, StreamExt};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error, info, warn};

use super::{FrameSource, SourceError};

const INITIAL_BACKOFF: Duration = Duration::from_secs(2);

type ByteStream = Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send + Sync>>;

/// An open upstream response and its part decoder.
struct Upstream {
    body: ByteStream,
    decoder: MultipartDecoder,
}

/// Pulls frames from an upstream MJPEG (`multipart/x-mixed-replace`) endpoint.
///
/// The connection is opened lazily on the first capture and reopened after it
/// drops or goes quiet for `read_timeout_ms`. Failed connects back off
/// exponentially, 2 s doubling up to `reconnect_max_secs`.
pub struct MjpegSource {
    url: String,
    client: reqwest::Client,
    upstream: Option<Upstream>,
    backoff: Duration,
    max_backoff: Duration,
    read_timeout: Duration,
}

impl MjpegSource {
    pub fn new(config: &SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(SourceError::Client)?;
        Ok(Self {
            url: config.url.clone(),
            client,
            upstream: None,
            backoff: INITIAL_BACKOFF,
            max_backoff: Duration::from_secs(config.reconnect_max_secs).max(INITIAL_BACKOFF),
            read_timeout: config.read_timeout(),
        })
    }
}

async fn connect(client: &reqwest::Client, url: &str) -> Result<Upstream, SourceError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(SourceError::HttpConnect)?;

    if !response.status().is_success() {
        return Err(SourceError::HttpStatus(response.status().as_u16()));
    }

    let boundary = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(boundary_from_content_type)
        .unwrap_or_else(|| BOUNDARY.to_string());

    info!(url, status = %response.status(), boundary, "connected to MJPEG stream");

    Ok(Upstream {
        body: Box::pin(response.bytes_stream()),
        decoder: MultipartDecoder::new(&boundary),
    })
}

/// Read from `upstream` until one non-empty part is decoded. Waiting longer
/// than `read_timeout` for a chunk fails the stream.
async fn next_part(upstream: &mut Upstream, read_timeout: Duration) -> Result<Bytes, SourceError> {
    loop {
        match upstream.decoder.next_part() {
            Ok(Some(part)) if !part.is_empty() => return Ok(part),
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "malformed MJPEG part, resyncing");
                continue;
            }
        }

        match tokio::time::timeout(read_timeout, upstream.body.next()).await {
            Ok(Some(Ok(chunk))) => upstream.decoder.push(&chunk),
            Ok(Some(Err(e))) => return Err(SourceError::HttpStream(e)),
            Ok(None) => return Err(SourceError::Ended),
            Err(_) => return Err(SourceError::ReadTimeout(read_timeout)),
        }
    }
}

#[async_trait]
impl FrameSource for MjpegSource {
    async fn capture_frame(&mut self) -> Option<Bytes> {
        if self.upstream.is_none() {
            info!(url = self.url, "connecting to MJPEG stream");
            match connect(&self.client, &self.url).await {
                Ok(upstream) => {
                    self.upstream = Some(upstream);
                    self.backoff = INITIAL_BACKOFF;
                }
                Err(e) => {
                    error!(error = %e, url = self.url, "MJPEG connect failed, retrying in {:?}", self.backoff);
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(self.max_backoff);
                    return None;
                }
            }
        }

        let upstream = self.upstream.as_mut()?;
        match next_part(upstream, self.read_timeout).await {
            Ok(frame) => {
                debug!(bytes = frame.len(), "MJPEG frame received");
                Some(frame)
            }
            Err(e) => {
                warn!(error = %e, url = self.url, "MJPEG stream interrupted, reconnecting");
                self.upstream = None;
                None
            }
        }
    }

    fn name(&self) -> &str {
        "mjpeg"
    }
}
