use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use framecast_common::config::EncoderConfig;
use framecast_common::frame::Frame;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastError, BroadcastServer, ServerState, ServerStatus};
use crate::encoder::{EncoderError, EncoderPipeSink, EncoderStatus, StopOutcome};
use crate::sink::FrameSink;
use crate::source::{CameraControl, FrameSource};

pub type SharedSource = Arc<Mutex<Box<dyn FrameSource>>>;

/// Which sinks a live-view session feeds.
#[derive(Debug, Clone, Default)]
pub struct LiveView {
    /// Local MJPEG preview through the broadcast server.
    pub preview: bool,
    /// Remote restream through the encoder subprocess.
    pub restream: Option<EncoderConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Broadcast(#[from] BroadcastError),
    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub live: bool,
    pub preview: bool,
    pub restream: bool,
    pub source: String,
    pub frames_produced: u64,
    pub broadcast: ServerStatus,
    pub encoder: EncoderStatus,
}

struct Session {
    preview: bool,
    restream: bool,
    cancel: CancellationToken,
    producer: JoinHandle<()>,
}

/// Owns the producer task and decides which sinks it feeds.
///
/// All sink lifecycle changes happen under `session`. The producer is always
/// joined before a sink it was feeding is stopped, and it is only spawned
/// after every sink it will feed has started.
pub struct StreamController {
    source: SharedSource,
    controls: Arc<dyn CameraControl>,
    source_name: String,
    broadcast: Arc<BroadcastServer>,
    encoder: Arc<EncoderPipeSink>,
    server_port: u16,
    retry_interval: Duration,
    frames_produced: Arc<AtomicU64>,
    session: Mutex<Option<Session>>,
}

impl StreamController {
    pub fn new(
        source: Box<dyn FrameSource>,
        broadcast: Arc<BroadcastServer>,
        encoder: Arc<EncoderPipeSink>,
        server_port: u16,
        retry_interval: Duration,
    ) -> Self {
        let source_name = source.name().to_string();
        let controls = source.controls();
        Self {
            source: Arc::new(Mutex::new(source)),
            controls,
            source_name,
            broadcast,
            encoder,
            server_port,
            retry_interval,
            frames_produced: Arc::new(AtomicU64::new(0)),
            session: Mutex::new(None),
        }
    }

    /// Switch to `view`. A broadcast server that stays enabled keeps its
    /// viewers; the encoder is always relaunched so a new target takes effect.
    ///
    /// If a sink fails to start, every sink is stopped and the error returned.
    pub async fn configure(&self, view: LiveView) -> Result<(), ControllerError> {
        let mut session = self.session.lock().await;
        if let Some(current) = session.take() {
            halt_producer(current).await;
        }

        if !view.preview {
            self.broadcast.stop().await;
        }
        self.stop_encoder().await;

        if !view.preview && view.restream.is_none() {
            self.controls.enable_preview(false).await;
            info!("live view disabled");
            return Ok(());
        }

        if let Err(e) = self.start_sinks(&view).await {
            self.broadcast.stop().await;
            self.stop_encoder().await;
            return Err(e);
        }

        if !self.controls.enable_preview(true).await {
            warn!(source = self.source_name, "source refused to enable preview");
        }

        let mut sinks: Vec<Arc<dyn FrameSink>> = Vec::new();
        if view.preview {
            sinks.push(self.broadcast.clone());
        }
        if view.restream.is_some() {
            sinks.push(self.encoder.clone());
        }

        let cancel = CancellationToken::new();
        let producer = tokio::spawn(run_producer(
            Arc::clone(&self.source),
            sinks,
            cancel.clone(),
            Arc::clone(&self.frames_produced),
            self.retry_interval,
        ));

        info!(
            preview = view.preview,
            restream = view.restream.is_some(),
            source = self.source_name,
            "live view enabled"
        );
        *session = Some(Session {
            preview: view.preview,
            restream: view.restream.is_some(),
            cancel,
            producer,
        });
        Ok(())
    }

    /// Stop the producer, then every sink. Idempotent.
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        let Some(current) = session.take() else {
            return;
        };
        halt_producer(current).await;
        self.broadcast.stop().await;
        self.stop_encoder().await;
        self.controls.enable_preview(false).await;
        info!("live view stopped");
    }

    /// Does not take the source lock; answers while a capture is pending.
    pub async fn zoom(&self, speed: i32) -> bool {
        self.controls.zoom(speed).await
    }

    pub async fn shutter(&self) -> bool {
        self.controls.shutter().await
    }

    pub async fn status(&self) -> ControllerStatus {
        let (live, preview, restream) = match self.session.lock().await.as_ref() {
            Some(s) => (true, s.preview, s.restream),
            None => (false, false, false),
        };
        ControllerStatus {
            live,
            preview,
            restream,
            source: self.source_name.clone(),
            frames_produced: self.frames_produced.load(Ordering::Relaxed),
            broadcast: self.broadcast.status().await,
            encoder: self.encoder.status().await,
        }
    }

    async fn start_sinks(&self, view: &LiveView) -> Result<(), ControllerError> {
        if view.preview && self.broadcast.state() != ServerState::Running {
            self.broadcast.start(self.server_port).await?;
        }
        if let Some(encoder_config) = &view.restream {
            self.encoder.start(encoder_config).await?;
        }
        Ok(())
    }

    async fn stop_encoder(&self) {
        match self.encoder.stop().await {
            Ok(StopOutcome::Killed) => warn!("encoder had to be killed"),
            Ok(StopOutcome::Exited(status)) if !status.success() => {
                warn!(%status, "encoder exited with failure")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "failed to stop encoder cleanly"),
        }
    }
}

async fn halt_producer(session: Session) {
    session.cancel.cancel();
    if let Err(e) = session.producer.await {
        warn!(error = %e, "producer task ended abnormally");
    }
}

async fn capture(source: &SharedSource) -> Option<Bytes> {
    source.lock().await.capture_frame().await
}

/// Pull frames and push each one to every sink, in order, until cancelled.
async fn run_producer(
    source: SharedSource,
    sinks: Vec<Arc<dyn FrameSink>>,
    cancel: CancellationToken,
    frames_produced: Arc<AtomicU64>,
    retry_interval: Duration,
) {
    let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
    debug!(sinks = ?names, "producer started");
    let mut seq: u64 = 0;

    loop {
        let captured = tokio::select! {
            _ = cancel.cancelled() => break,
            data = capture(&source) => data,
        };
        let Some(data) = captured else {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(retry_interval) => continue,
            }
        };

        let frame = Frame::now(data, seq);
        if !frame.looks_like_jpeg() {
            debug!(bytes = frame.len(), "dropping non-JPEG frame");
            continue;
        }
        seq += 1;

        for sink in &sinks {
            sink.push(&frame).await;
        }
        let total = frames_produced.fetch_add(1, Ordering::Relaxed) + 1;
        if total % 100 == 0 {
            debug!(total, "frames produced");
        }
    }
    debug!(frames = seq, "producer stopped");
}
