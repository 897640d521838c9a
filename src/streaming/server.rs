use crate::config::ServerConfig;
use crate::error::{Result, StreamError};
use crate::ingest;
use crate::recorder::RecorderHandle;
use crate::state::SharedPipeline;
use crate::streaming::{api, handlers};
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

/// Shared state for the axum server
#[derive(Clone)]
pub struct ServerState {
    pub shared: SharedPipeline,
    pub recorder: RecorderHandle,
}

/// HTTP server hosting the ingest channel, the viewer stream and the
/// status/control API.
pub struct StreamServer {
    config: ServerConfig,
    state: ServerState,
}

impl StreamServer {
    pub fn new(config: ServerConfig, shared: SharedPipeline, recorder: RecorderHandle) -> Self {
        Self {
            config,
            state: ServerState { shared, recorder },
        }
    }

    /// Bind and serve until cancelled.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let app = build_router(self.state.clone());
        let addr = format!("{}:{}", self.config.ip, self.config.port);

        info!("Starting camgate server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            StreamError::BindFailed {
                address: addr.clone(),
                source: e,
            }
        })?;

        info!("Camgate server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
            .map_err(|e| StreamError::StartupFailed {
                details: format!("server error: {}", e),
            })?;

        Ok(())
    }
}

/// The full route table. The original device firmware expects permissive
/// CORS on every endpoint.
pub fn build_router(state: ServerState) -> Router {
    Router::new()
        .route("/", get(api::root_handler))
        .route("/ws", get(ingest::ws_ingest_handler))
        .route("/ws_stats", get(api::ws_stats_handler))
        .route("/esp32_video_feed", get(handlers::video_feed_handler))
        .route("/esp32_frame", get(handlers::single_frame_handler))
        .route("/performance_stats", get(api::performance_stats_handler))
        .route("/health", get(api::health_handler))
        .route("/system_info", get(api::system_info_handler))
        .route("/reset_stats", get(api::reset_stats_handler))
        .route(
            "/frame_rate_control",
            get(api::frame_rate_get_handler).post(api::frame_rate_set_handler),
        )
        .route(
            "/image_enhancement",
            get(api::enhancement_get_handler).post(api::enhancement_set_handler),
        )
        .route("/image_enhancement/mode", post(api::enhancement_mode_handler))
        .route(
            "/security_recording/status",
            get(api::recording_status_handler),
        )
        .route(
            "/security_recording/start",
            post(api::recording_start_handler),
        )
        .route("/security_recording/stop", post(api::recording_stop_handler))
        .route(
            "/security_recording/restart",
            post(api::recording_restart_handler),
        )
        .route(
            "/security_recording/merge",
            post(api::recording_merge_handler),
        )
        .route(
            "/security_recording/cleanup",
            post(api::recording_cleanup_handler),
        )
        .route(
            "/security_recording/disconnect",
            post(api::recording_disconnect_handler),
        )
        .route(
            "/security_recording/reconnect",
            post(api::recording_reconnect_handler),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CamgateConfig;
    use crate::recorder::RecorderService;
    use crate::state::PipelineShared;

    #[tokio::test]
    async fn test_router_builds() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = CamgateConfig::default();
        config.recording.path = tmp.path().display().to_string();

        let shared = PipelineShared::new(config.clone());
        let cancel = CancellationToken::new();
        let (recorder, _join) = RecorderService::spawn(config.recording, cancel.child_token());

        let _router = build_router(ServerState { shared, recorder });
        cancel.cancel();
    }
}
