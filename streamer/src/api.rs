use std::path::{Component, Path};
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use framecast_common::config::{EncoderConfig, EncoderTarget};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::broadcast::BroadcastError;
use crate::controller::{ControllerError, LiveView, StreamController};
use crate::encoder::EncoderError;

// ---------------------------------------------------------------------------
// App state
// ---------------------------------------------------------------------------

struct AppState {
    controller: Arc<StreamController>,
    /// `[encoder]` section; restream requests only override a few fields of it.
    encoder: EncoderConfig,
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Every response body: `code` is 0 on success.
#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    code: i32,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LiveRequest {
    #[serde(default)]
    preview: bool,
    #[serde(default)]
    restream: Option<RestreamRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RestreamRequest {
    target: EncoderTarget,
    destination: String,
    framerate: Option<u32>,
    bitrate_kbps: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ZoomRequest {
    speed: i32,
}

const CODE_CONFIGURE_FAILED: i32 = 1;
const CODE_ALREADY_RUNNING: i32 = 2;
const CODE_CONTROL_UNSUPPORTED: i32 = 3;
const CODE_INVALID_REQUEST: i32 = 4;

const MAX_FRAMERATE: u32 = 120;
const MAX_BITRATE_KBPS: u32 = 100_000;

impl RestreamRequest {
    /// Apply the request on top of the configured encoder settings.
    fn merge_into(self, base: &EncoderConfig) -> Result<EncoderConfig, String> {
        check_destination(self.target, &self.destination)?;
        let framerate = self.framerate.unwrap_or(base.framerate);
        if !(1..=MAX_FRAMERATE).contains(&framerate) {
            return Err(format!("framerate must be within 1..={MAX_FRAMERATE}"));
        }
        let bitrate_kbps = self.bitrate_kbps.unwrap_or(base.bitrate_kbps);
        if !(1..=MAX_BITRATE_KBPS).contains(&bitrate_kbps) {
            return Err(format!("bitrate_kbps must be within 1..={MAX_BITRATE_KBPS}"));
        }
        Ok(EncoderConfig {
            target: self.target,
            destination: self.destination,
            framerate,
            bitrate_kbps,
            ..base.clone()
        })
    }
}

/// HLS output must be a relative directory below the working directory;
/// push targets must be URLs with the matching scheme.
fn check_destination(target: EncoderTarget, destination: &str) -> Result<(), String> {
    let ok = match target {
        EncoderTarget::Hls => {
            !destination.is_empty()
                && Path::new(destination)
                    .components()
                    .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        }
        EncoderTarget::Rtsp => {
            destination.starts_with("rtsp://") || destination.starts_with("rtsps://")
        }
        EncoderTarget::Rtmp => {
            destination.starts_with("rtmp://") || destination.starts_with("rtmps://")
        }
    };
    if ok {
        Ok(())
    } else {
        Err(format!("invalid destination {destination:?} for {target:?} target"))
    }
}

fn ok<T: Serialize>(message: &str, data: T) -> Response {
    Json(Envelope {
        code: 0,
        message: message.to_string(),
        data: Some(data),
    })
    .into_response()
}

fn fail(status: StatusCode, code: i32, message: String) -> Response {
    let body = Envelope::<()> {
        code,
        message,
        data: None,
    };
    (status, Json(body)).into_response()
}

fn configure_error(e: &ControllerError) -> Response {
    let (status, code) = match e {
        ControllerError::Broadcast(BroadcastError::AlreadyRunning(_))
        | ControllerError::Encoder(EncoderError::AlreadyRunning(_)) => {
            (StatusCode::CONFLICT, CODE_ALREADY_RUNNING)
        }
        _ => (StatusCode::INTERNAL_SERVER_ERROR, CODE_CONFIGURE_FAILED),
    };
    fail(status, code, e.to_string())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /live
async fn live_status(State(state): State<Arc<AppState>>) -> Response {
    ok("ok", state.controller.status().await)
}

/// POST /live
/// Body: { "preview": true, "restream": null | { "target": "hls", "destination": "hls", "framerate": 25, "bitrate_kbps": 2000 } }
async fn configure_live(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LiveRequest>, JsonRejection>,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            return fail(StatusCode::BAD_REQUEST, CODE_INVALID_REQUEST, rejection.body_text());
        }
    };
    let restream = match request.restream.map(|r| r.merge_into(&state.encoder)).transpose() {
        Ok(restream) => restream,
        Err(message) => return fail(StatusCode::BAD_REQUEST, CODE_INVALID_REQUEST, message),
    };
    let view = LiveView {
        preview: request.preview,
        restream,
    };

    info!(preview = view.preview, restream = view.restream.is_some(), "live view requested");
    match state.controller.configure(view).await {
        Ok(()) => ok("live view configured", state.controller.status().await),
        Err(e) => {
            error!(error = %e, "failed to configure live view");
            configure_error(&e)
        }
    }
}

/// DELETE /live
async fn stop_live(State(state): State<Arc<AppState>>) -> Response {
    state.controller.stop().await;
    ok("live view stopped", state.controller.status().await)
}

/// POST /camera/zoom
/// Body: { "speed": -3 }
async fn zoom(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ZoomRequest>,
) -> Response {
    if state.controller.zoom(body.speed).await {
        ok("zoom applied", body.speed)
    } else {
        fail(
            StatusCode::NOT_IMPLEMENTED,
            CODE_CONTROL_UNSUPPORTED,
            "zoom not supported by source".into(),
        )
    }
}

/// POST /camera/shutter
async fn shutter(State(state): State<Arc<AppState>>) -> Response {
    if state.controller.shutter().await {
        ok("shutter released", ())
    } else {
        fail(
            StatusCode::NOT_IMPLEMENTED,
            CODE_CONTROL_UNSUPPORTED,
            "shutter not supported by source".into(),
        )
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// `encoder` is the configured encoder section that restream requests build on.
pub fn router(controller: Arc<StreamController>, encoder: EncoderConfig) -> Router {
    let state = Arc::new(AppState {
        controller,
        encoder,
    });
    Router::new()
        .route("/live", get(live_status).post(configure_live).delete(stop_live))
        .route("/camera/zoom", post(zoom))
        .route("/camera/shutter", post(shutter))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::BroadcastServer;
    use crate::encoder::EncoderPipeSink;
    use crate::source::{CameraControl, FrameSource};
    use async_trait::async_trait;
    use bytes::Bytes;
    use framecast_common::config::ServerConfig;
    use serde_json::{json, Value};
    use std::net::SocketAddr;
    use std::time::Duration;

    struct ShutterOnly;

    #[async_trait]
    impl CameraControl for ShutterOnly {
        async fn shutter(&self) -> bool {
            true
        }
    }

    struct StillSource;

    #[async_trait]
    impl FrameSource for StillSource {
        async fn capture_frame(&mut self) -> Option<Bytes> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Some(Bytes::from_static(b"\xFF\xD8still\xFF\xD9"))
        }

        fn controls(&self) -> Arc<dyn CameraControl> {
            Arc::new(ShutterOnly)
        }

        fn name(&self) -> &str {
            "still"
        }
    }

    async fn serve(encoder: EncoderConfig) -> (SocketAddr, Arc<StreamController>) {
        let server_config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        let controller = Arc::new(StreamController::new(
            Box::new(StillSource),
            Arc::new(BroadcastServer::new(&server_config)),
            Arc::new(EncoderPipeSink::new()),
            0,
            Duration::from_millis(10),
        ));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&controller), encoder);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, controller)
    }

    async fn call(method: reqwest::Method, url: String, body: Option<Value>) -> (u16, Value) {
        let client = reqwest::Client::new();
        let mut request = client.request(method, url);
        if let Some(body) = body {
            request = request
                .header("content-type", "application/json")
                .body(body.to_string());
        }
        let response = request.send().await.unwrap();
        let status = response.status().as_u16();
        let bytes = response.bytes().await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn live_view_lifecycle_over_http() {
        let (addr, controller) = serve(EncoderConfig::default()).await;
        let live = format!("http://{addr}/live");

        let (status, body) = call(reqwest::Method::GET, live.clone(), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["live"], false);
        assert_eq!(body["data"]["source"], "still");

        let (status, body) = call(
            reqwest::Method::POST,
            live.clone(),
            Some(json!({ "preview": true, "restream": null })),
        )
        .await;
        assert_eq!(status, 200);
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["preview"], true);
        assert_eq!(body["data"]["restream"], false);
        assert_eq!(body["data"]["broadcast"]["state"], "running");
        assert_eq!(body["data"]["encoder"]["state"], "idle");

        let (status, body) = call(reqwest::Method::DELETE, live, None).await;
        assert_eq!(status, 200);
        assert_eq!(body["data"]["live"], false);
        assert_eq!(body["data"]["broadcast"]["state"], "stopped");
        assert!(!controller.status().await.live);
    }

    fn unlaunchable_encoder() -> EncoderConfig {
        EncoderConfig {
            program: "/nonexistent/framecast-encoder".into(),
            ..EncoderConfig::default()
        }
    }

    #[tokio::test]
    async fn failed_restream_reports_error_envelope() {
        let (addr, controller) = serve(unlaunchable_encoder()).await;
        let (status, body) = call(
            reqwest::Method::POST,
            format!("http://{addr}/live"),
            Some(json!({
                "preview": false,
                "restream": { "target": "rtmp", "destination": "rtmp://127.0.0.1/live/test" }
            })),
        )
        .await;
        assert_eq!(status, 500);
        assert_eq!(body["code"], CODE_CONFIGURE_FAILED);
        assert!(body["data"].is_null());
        assert!(body["message"].as_str().unwrap().contains("/nonexistent/framecast-encoder"));
        assert!(!controller.status().await.live);
    }

    #[tokio::test]
    async fn restream_body_cannot_choose_encoder_settings() {
        let (addr, controller) = serve(unlaunchable_encoder()).await;
        for field in ["program", "write_timeout_ms", "stop_grace_ms"] {
            let mut restream = json!({ "target": "rtmp", "destination": "rtmp://127.0.0.1/live/test" });
            restream[field] = json!("/bin/sh");
            let (status, body) = call(
                reqwest::Method::POST,
                format!("http://{addr}/live"),
                Some(json!({ "preview": false, "restream": restream })),
            )
            .await;
            assert_eq!(status, 400, "{field} accepted");
            assert_eq!(body["code"], CODE_INVALID_REQUEST);
            assert!(body["message"].as_str().unwrap().contains(field));
        }
        let status = controller.status().await;
        assert!(!status.live);
        assert_eq!(status.encoder.pid, None);
    }

    #[tokio::test]
    async fn out_of_range_restream_values_are_rejected() {
        let (addr, controller) = serve(unlaunchable_encoder()).await;
        let bodies = [
            json!({ "target": "rtmp", "destination": "rtmp://h/app", "framerate": u32::MAX }),
            json!({ "target": "rtmp", "destination": "rtmp://h/app", "framerate": 0 }),
            json!({ "target": "rtmp", "destination": "rtmp://h/app", "bitrate_kbps": u32::MAX }),
            json!({ "target": "rtmp", "destination": "/tmp/out.flv" }),
            json!({ "target": "hls", "destination": "../outside" }),
            json!({ "target": "hls", "destination": "/var/www/hls" }),
        ];
        for restream in bodies {
            let (status, body) = call(
                reqwest::Method::POST,
                format!("http://{addr}/live"),
                Some(json!({ "preview": false, "restream": restream.clone() })),
            )
            .await;
            assert_eq!(status, 400, "{restream} accepted");
            assert_eq!(body["code"], CODE_INVALID_REQUEST);
        }
        assert!(!controller.status().await.live);
    }

    #[test]
    fn restream_request_builds_on_configured_encoder() {
        let base = EncoderConfig {
            program: "/opt/ffmpeg/bin/ffmpeg".into(),
            framerate: 15,
            bitrate_kbps: 800,
            stop_grace_ms: 1234,
            ..EncoderConfig::default()
        };
        let request = RestreamRequest {
            target: EncoderTarget::Rtsp,
            destination: "rtsp://media.local:8554/cam".into(),
            framerate: Some(30),
            bitrate_kbps: None,
        };
        let merged = request.merge_into(&base).unwrap();
        assert_eq!(merged.program, "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(merged.stop_grace_ms, 1234);
        assert_eq!(merged.target, EncoderTarget::Rtsp);
        assert_eq!(merged.destination, "rtsp://media.local:8554/cam");
        assert_eq!(merged.framerate, 30);
        assert_eq!(merged.bitrate_kbps, 800);
    }

    #[tokio::test]
    async fn camera_controls_map_support_to_status() {
        let (addr, _controller) = serve(EncoderConfig::default()).await;

        let (status, body) = call(
            reqwest::Method::POST,
            format!("http://{addr}/camera/zoom"),
            Some(json!({ "speed": 2 })),
        )
        .await;
        assert_eq!(status, 501);
        assert_eq!(body["code"], CODE_CONTROL_UNSUPPORTED);

        let (status, body) = call(reqwest::Method::POST, format!("http://{addr}/camera/shutter"), None).await;
        assert_eq!(status, 200);
        assert_eq!(body["code"], 0);
    }
}
