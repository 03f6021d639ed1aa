use std::path::PathBuf;
use std::sync::Arc;

use framecast_common::config::Config;
use framecast_streamer::broadcast::BroadcastServer;
use framecast_streamer::controller::{LiveView, StreamController};
use framecast_streamer::encoder::{check_encoder_available, EncoderPipeSink};
use framecast_streamer::{api, source};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        url = config.source.url,
        mode = ?config.source.mode,
        preview_port = config.server.port,
        api_port = config.api.port,
        "starting framecast streamer"
    );

    if config.session.restream {
        check_encoder_available(&config.encoder.program).await;
    }

    let frame_source = match source::from_config(&config.source) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to build frame source");
            std::process::exit(1);
        }
    };

    let controller = Arc::new(StreamController::new(
        frame_source,
        Arc::new(BroadcastServer::new(&config.server)),
        Arc::new(EncoderPipeSink::new()),
        config.server.port,
        config.source.frame_interval(),
    ));

    if config.session.autostart {
        let view = LiveView {
            preview: config.session.preview,
            restream: config.session.restream.then(|| config.encoder.clone()),
        };
        if let Err(e) = controller.configure(view).await {
            error!(error = %e, "autostart failed");
        }
    }

    let app = api::router(Arc::clone(&controller), config.encoder.clone());
    let addr = format!("0.0.0.0:{}", config.api.port);
    info!(addr, "control API starting");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        eprintln!("Failed to bind to {addr}: {e}");
        std::process::exit(1);
    });

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown requested");
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "control API failed");
    }

    controller.stop().await;
    info!("framecast streamer stopped");
}
