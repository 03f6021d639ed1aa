use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use framecast_common::config::{EncoderConfig, EncoderTarget};
use framecast_common::frame::Frame;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::sink::FrameSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderSinkState {
    Idle,
    Launching,
    Streaming,
    Failed,
    Stopped,
}

impl EncoderSinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Launching,
            2 => Self::Streaming,
            3 => Self::Failed,
            4 => Self::Stopped,
            _ => Self::Idle,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Launching => 1,
            Self::Streaming => 2,
            Self::Failed => 3,
            Self::Stopped => 4,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
    #[error("could not get stdin handle")]
    Stdin,
    #[error("failed to create output directory {path}: {source}")]
    OutputDir { path: String, source: io::Error },
    #[error("encoder already running (pid {0:?})")]
    AlreadyRunning(Option<u32>),
    #[error("failed to wait for encoder: {0}")]
    Wait(io::Error),
    #[error("failed to kill encoder: {0}")]
    Kill(io::Error),
}

/// How `stop` ended the subprocess.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Exited(ExitStatus),
    /// Still alive after the grace period; terminated forcefully.
    Killed,
}

/// Program plus argument list for one encoder launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl EncoderCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Build the encoder invocation for `config.target`. Input is always a
    /// stream of JPEGs on stdin; only the output half differs per target.
    pub fn for_target(config: &EncoderConfig) -> Self {
        let fps = config.framerate.max(1);
        let mut args: Vec<String> = vec!["-hide_banner".into(), "-loglevel".into(), "warning".into()];
        args.extend(["-y", "-f", "image2pipe"].map(String::from));
        if config.target == EncoderTarget::Rtmp {
            args.extend(["-vcodec", "mjpeg"].map(String::from));
        }
        args.extend([
            "-framerate".into(),
            fps.to_string(),
            "-i".into(),
            "-".into(),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "ultrafast".into(),
            "-tune".into(),
            "zerolatency".into(),
        ]);

        match config.target {
            EncoderTarget::Hls => {
                args.extend([
                    "-g".into(),
                    fps.saturating_mul(2).to_string(),
                    "-f".into(),
                    "hls".into(),
                    "-hls_time".into(),
                    "2".into(),
                    "-hls_list_size".into(),
                    "5".into(),
                    "-hls_flags".into(),
                    "delete_segments".into(),
                    format!("{}/stream.m3u8", config.destination.trim_end_matches('/')),
                ]);
            }
            EncoderTarget::Rtsp => {
                // Small GOP keeps RTSP join latency down.
                args.extend([
                    "-g".into(),
                    fps.to_string(),
                    "-pix_fmt".into(),
                    "yuv420p".into(),
                    "-f".into(),
                    "rtsp".into(),
                    "-rtsp_transport".into(),
                    config.rtsp_transport.clone(),
                    "-rtsp_flags".into(),
                    "prefer_tcp".into(),
                    config.destination.clone(),
                ]);
            }
            EncoderTarget::Rtmp => {
                let bitrate = config.bitrate_kbps;
                args.extend([
                    "-b:v".into(),
                    format!("{bitrate}k"),
                    "-maxrate".into(),
                    format!("{bitrate}k"),
                    "-bufsize".into(),
                    format!("{}k", bitrate.saturating_mul(2)),
                    "-g".into(),
                    fps.saturating_mul(2).to_string(),
                    "-pix_fmt".into(),
                    "yuv420p".into(),
                    "-f".into(),
                    "flv".into(),
                    "-flvflags".into(),
                    "no_duration_filesize".into(),
                    config.destination.clone(),
                ]);
            }
        }

        Self {
            program: config.program.clone(),
            args,
        }
    }
}

/// Owned handle to a running encoder subprocess.
///
/// Exposes the stdin write end, EOF, wait and kill separately so the stop
/// policy lives in one place.
pub struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    pid: Option<u32>,
}

impl EncoderProcess {
    /// Spawn `command` with stdin piped. Stderr is drained into debug logs so
    /// a chatty encoder can never block on a full pipe.
    pub fn spawn(command: &EncoderCommand) -> Result<Self, EncoderError> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EncoderError::Spawn {
                program: command.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(EncoderError::Stdin)?;
        let pid = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(pid, line = %line, "encoder output");
                }
            });
        }

        Ok(Self {
            child,
            stdin: Some(stdin),
            pid,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    /// Write one frame and flush it through to the encoder.
    pub async fn write_frame(&mut self, data: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "encoder input closed"))?;
        stdin.write_all(data).await?;
        stdin.flush().await
    }

    /// Close the write end; the encoder sees EOF.
    pub fn close_input(&mut self) {
        self.stdin.take();
    }

    pub async fn wait(&mut self) -> io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// Kill the process and reap it.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EncoderStatus {
    pub state: EncoderSinkState,
    pub target: Option<EncoderTarget>,
    pub pid: Option<u32>,
    pub frames_written: u64,
}

struct Inner {
    process: Option<EncoderProcess>,
    target: Option<EncoderTarget>,
    write_timeout: Duration,
    stop_grace: Duration,
}

/// Frame sink that feeds raw JPEGs into an external encoder's stdin.
///
/// A broken pipe or stalled write flips the sink to `Failed` instead of
/// returning an error; the producer keeps serving its other sinks and callers
/// learn about it through [`state`](Self::state).
pub struct EncoderPipeSink {
    state: AtomicU8,
    frames_written: AtomicU64,
    inner: Mutex<Inner>,
}

impl EncoderPipeSink {
    pub fn new() -> Self {
        let defaults = EncoderConfig::default();
        Self {
            state: AtomicU8::new(EncoderSinkState::Idle.as_u8()),
            frames_written: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                process: None,
                target: None,
                write_timeout: defaults.write_timeout(),
                stop_grace: defaults.stop_grace(),
            }),
        }
    }

    /// Launch the encoder for `config.target`.
    pub async fn start(&self, config: &EncoderConfig) -> Result<(), EncoderError> {
        if config.target == EncoderTarget::Hls {
            tokio::fs::create_dir_all(&config.destination)
                .await
                .map_err(|source| EncoderError::OutputDir {
                    path: config.destination.clone(),
                    source,
                })?;
        }
        let command = EncoderCommand::for_target(config);
        self.launch(
            &command,
            Some(config.target),
            config.write_timeout(),
            config.stop_grace(),
        )
        .await
    }

    /// Launch an arbitrary command as the encoder.
    pub async fn launch(
        &self,
        command: &EncoderCommand,
        target: Option<EncoderTarget>,
        write_timeout: Duration,
        stop_grace: Duration,
    ) -> Result<(), EncoderError> {
        let mut inner = self.inner.lock().await;
        if let Some(process) = inner.process.as_ref() {
            return Err(EncoderError::AlreadyRunning(process.id()));
        }

        self.set_state(EncoderSinkState::Launching);
        let process = match EncoderProcess::spawn(command) {
            Ok(p) => p,
            Err(e) => {
                error!(program = command.program, error = %e, "failed to launch encoder");
                self.set_state(EncoderSinkState::Idle);
                return Err(e);
            }
        };

        info!(
            program = command.program,
            args = command.args.join(" "),
            pid = process.id(),
            "encoder started"
        );
        inner.process = Some(process);
        inner.target = target;
        inner.write_timeout = write_timeout;
        inner.stop_grace = stop_grace;
        self.frames_written.store(0, Ordering::Relaxed);
        self.set_state(EncoderSinkState::Streaming);
        Ok(())
    }

    /// Write one frame to the encoder. No-op unless streaming.
    pub async fn write(&self, frame: &Frame) {
        if self.state() != EncoderSinkState::Streaming {
            return;
        }
        let mut inner = self.inner.lock().await;
        let write_timeout = inner.write_timeout;
        let Some(process) = inner.process.as_mut() else {
            return;
        };

        match tokio::time::timeout(write_timeout, process.write_frame(&frame.data)).await {
            Ok(Ok(())) => {
                let written = self.frames_written.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(seq = frame.seq, bytes = frame.len(), written, "pushed frame to encoder");
            }
            Ok(Err(e)) => {
                warn!(pid = process.id(), error = %e, "encoder pipe broken, marking sink failed");
                process.close_input();
                self.set_state(EncoderSinkState::Failed);
            }
            Err(_) => {
                // A partial frame is already in the pipe; the stream is unusable.
                warn!(pid = process.id(), timeout = ?write_timeout, "encoder write stalled, marking sink failed");
                process.close_input();
                self.set_state(EncoderSinkState::Failed);
            }
        }
    }

    /// Close the pipe and wait for the encoder to exit, killing it if it is
    /// still alive after the grace period. Idempotent.
    pub async fn stop(&self) -> Result<StopOutcome, EncoderError> {
        let mut inner = self.inner.lock().await;
        let grace = inner.stop_grace;
        let Some(mut process) = inner.process.take() else {
            return Ok(StopOutcome::NotRunning);
        };
        let pid = process.id();

        process.close_input();
        let outcome = match tokio::time::timeout(grace, process.wait()).await {
            Ok(Ok(status)) => {
                info!(pid, %status, frames = self.frames_written.load(Ordering::Relaxed), "encoder exited");
                Ok(StopOutcome::Exited(status))
            }
            Ok(Err(e)) => Err(EncoderError::Wait(e)),
            Err(_) => {
                warn!(pid, grace = ?grace, "encoder ignored EOF, killing");
                match process.kill().await {
                    Ok(()) => Ok(StopOutcome::Killed),
                    Err(e) => Err(EncoderError::Kill(e)),
                }
            }
        };
        self.set_state(EncoderSinkState::Stopped);
        outcome
    }

    pub fn state(&self) -> EncoderSinkState {
        EncoderSinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_failed(&self) -> bool {
        self.state() == EncoderSinkState::Failed
    }

    pub async fn status(&self) -> EncoderStatus {
        let inner = self.inner.lock().await;
        EncoderStatus {
            state: self.state(),
            target: inner.target,
            pid: inner.process.as_ref().and_then(EncoderProcess::id),
            frames_written: self.frames_written.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: EncoderSinkState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }
}

impl Default for EncoderPipeSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FrameSink for EncoderPipeSink {
    async fn push(&self, frame: &Frame) {
        self.write(frame).await;
    }

    fn name(&self) -> &str {
        "encoder"
    }
}

/// Check whether the encoder program is runnable. Logs a warning if not found.
pub async fn check_encoder_available(program: &str) -> bool {
    match Command::new(program).arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!(program, "encoder is available");
            true
        }
        Ok(_) => {
            warn!(program, "encoder returned non-zero for -version; restreaming may fail");
            false
        }
        Err(e) => {
            warn!(
                program,
                error = %e,
                "encoder not found on PATH; restreaming will fail. Install ffmpeg with libx264 support."
            );
            false
        }
    }
}
