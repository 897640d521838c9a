use crate::enhance::EnhanceMode;
use crate::state::SharedPipeline;
use crate::streaming::server::ServerState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

/// Root endpoint: server identity and endpoint map
pub async fn root_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = state.shared.stats.read();
    Json(json!({
        "server": "camgate",
        "version": env!("CARGO_PKG_VERSION"),
        "features": [
            "adaptive quality control",
            "predictive network analysis",
            "frame prioritization",
            "segmented security recording",
            "buffered MJPEG streaming",
        ],
        "system_state": stats.system_state,
        "endpoints": {
            "ingest": "/ws",
            "video_feed": "/esp32_video_feed",
            "single_frame": "/esp32_frame",
            "performance": "/performance_stats",
            "health": "/health",
            "system_info": "/system_info",
            "reset_stats": "/reset_stats",
            "recording": "/security_recording/status",
        }
    }))
}

/// Full statistics object
pub async fn performance_stats_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let shared = &state.shared;
    let snapshot = shared.stats.read().snapshot();
    let buffering = shared.buffer.buffering_status();
    let (target_fps, min_fps, current_fps) = {
        let frame_rate = shared.frame_rate.lock();
        (
            frame_rate.target_fps,
            frame_rate.min_fps,
            frame_rate.current_fps(),
        )
    };

    Json(json!({
        "stats": snapshot,
        "target_fps": target_fps,
        "min_fps_guarantee": min_fps,
        "controller_fps": current_fps,
        "pending_queue": shared.queue.len(),
        "viewers": shared.viewer_count(),
        "producers": shared.producer_count(),
        "buffering": {
            "active": buffering.buffering_active,
            "buffered_frames": buffering.buffered_frames,
            "min_required": buffering.min_required,
            "ready_to_stream": buffering.ready_to_stream,
            "time_since_last_stream_secs": buffering.time_since_last_stream.as_secs_f64(),
        },
    }))
}

/// Summary health check
pub async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let shared = &state.shared;
    let stats = shared.stats.read();
    let has_frame = shared.latest_frame.read().is_some();

    Json(json!({
        "status": "healthy",
        "system_state": stats.system_state,
        "frames_available": has_frame,
        "fps": stats.fps,
        "buffer_utilization_pct": stats.buffer_utilization_pct,
        "producers": shared.producer_count(),
        "viewers": shared.viewer_count(),
    }))
}

/// Diagnostics plus operator recommendations
pub async fn system_info_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let shared = &state.shared;
    let snapshot = shared.stats.read().snapshot();
    let recommendations = recommendations(shared);

    Json(json!({
        "stats": snapshot,
        "buffer": {
            "size": shared.buffer.len(),
            "capacity": shared.buffer.capacity(),
        },
        "queue": {
            "size": shared.queue.len(),
            "capacity": shared.queue.capacity(),
        },
        "config": {
            "target_fps": shared.config.stream.target_fps,
            "min_fps": shared.config.stream.min_fps,
            "min_quality": shared.config.quality.min_quality,
            "max_quality": shared.config.quality.max_quality,
            "recording_path": shared.config.recording.path.clone(),
            "retention_days": shared.config.recording.retention_days,
        },
        "recommendations": recommendations,
    }))
}

/// Derive operator guidance from current stats
fn recommendations(shared: &SharedPipeline) -> Vec<String> {
    let stats = shared.stats.read();
    let mut out = Vec::new();

    if stats.fps < shared.config.stream.min_fps as f64 && stats.fps > 0.0 {
        out.push(format!(
            "FPS ({:.1}) is below the guaranteed minimum; check the producer link",
            stats.fps
        ));
    }
    if stats.network_jitter > 0.2 {
        out.push("Network jitter is high; consider moving the camera closer to the AP".to_string());
    }
    if stats.buffer_utilization_pct > 90.0 {
        out.push("Frame buffer near capacity; viewers may be too slow".to_string());
    }
    if stats.consecutive_drops > 5 {
        out.push("Sustained frame drops; the producer outpaces processing".to_string());
    }
    if stats.adaptation_confidence < 0.3 {
        out.push("Controller confidence is low; FPS is unstable".to_string());
    }
    if out.is_empty() {
        out.push("System operating normally".to_string());
    }
    out
}

/// Reset all counters and controller histories
pub async fn reset_stats_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let shared = &state.shared;
    shared.stats.write().reset();
    shared.frame_rate.lock().reset();
    shared.log_gate.clear();
    info!("Statistics reset by operator");
    Json(json!({ "status": "ok", "message": "statistics reset" }))
}

#[derive(Debug, Deserialize)]
pub struct FrameRateUpdate {
    pub target_fps: Option<u32>,
    pub min_fps: Option<u32>,
}

pub async fn frame_rate_get_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let frame_rate = state.shared.frame_rate.lock();
    Json(json!({
        "target_fps": frame_rate.target_fps,
        "min_fps": frame_rate.min_fps,
        "current_fps": frame_rate.current_fps(),
        "compensation": frame_rate.compensation(),
    }))
}

pub async fn frame_rate_set_handler(
    State(state): State<ServerState>,
    Json(update): Json<FrameRateUpdate>,
) -> impl IntoResponse {
    let mut frame_rate = state.shared.frame_rate.lock();
    let target = update.target_fps.unwrap_or(frame_rate.target_fps);
    let min = update.min_fps.unwrap_or(frame_rate.min_fps);

    match frame_rate.set_targets(target, min) {
        Ok(()) => {
            info!("Frame rate targets updated: target={} min={}", target, min);
            (
                StatusCode::OK,
                Json(json!({
                    "status": "ok",
                    "target_fps": target,
                    "min_fps": min,
                })),
            )
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "error": e.to_string() })),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub struct EnhancementUpdate {
    pub enabled: Option<bool>,
    pub budget_ms: Option<u64>,
}

pub async fn enhancement_get_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let settings = state.shared.enhancer_settings.read().clone();
    let stats = state.shared.stats.read();
    Json(json!({
        "mode": settings.mode,
        "enabled": settings.enabled,
        "budget_ms": settings.budget.as_millis() as u64,
        "last_applied_mode": stats.enhancement_mode.clone(),
        "last_processing_time_ms": stats.enhancement_time_ms,
        "last_quality_improvement": stats.quality_improvement,
    }))
}

pub async fn enhancement_set_handler(
    State(state): State<ServerState>,
    Json(update): Json<EnhancementUpdate>,
) -> impl IntoResponse {
    if update.enabled.is_none() && update.budget_ms.is_none() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "error": "provide at least one of: enabled, budget_ms"
            })),
        );
    }

    let mut settings = state.shared.enhancer_settings.write();
    if let Some(enabled) = update.enabled {
        settings.enabled = enabled;
    }
    if let Some(budget_ms) = update.budget_ms {
        settings.budget = Duration::from_millis(budget_ms);
    }
    info!(
        "Enhancer settings updated: enabled={} budget={:?}",
        settings.enabled, settings.budget
    );

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "enabled": settings.enabled,
            "budget_ms": settings.budget.as_millis() as u64,
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct EnhancementModeRequest {
    pub mode: String,
}

pub async fn enhancement_mode_handler(
    State(state): State<ServerState>,
    Json(request): Json<EnhancementModeRequest>,
) -> impl IntoResponse {
    match EnhanceMode::parse(&request.mode) {
        Some(mode) => {
            state.shared.enhancer_settings.write().mode = mode;
            info!("Enhancement mode forced to {}", mode.as_str());
            (
                StatusCode::OK,
                Json(json!({ "status": "ok", "mode": mode })),
            )
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "error": format!(
                    "unknown mode '{}'; expected auto/day/low_light/night/security",
                    request.mode
                )
            })),
        ),
    }
}

pub async fn recording_status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    match state.recorder.status().await {
        Some(status) => {
            let recording = &state.shared.config.recording;
            (
                StatusCode::OK,
                Json(json!({
                    "recording": status,
                    "configuration": {
                        "recording_fps": recording.recording_fps,
                        "min_frames_per_segment": recording.min_frames_per_segment,
                        "min_segment_duration_secs": recording.min_segment_duration_secs,
                        "target_segment_duration_secs": recording.target_segment_duration_secs,
                        "max_segment_duration_secs": recording.max_segment_duration_secs,
                        "absolute_min_segment_size_bytes": recording.absolute_min_segment_size_bytes,
                        "retention_days": recording.retention_days,
                        "path": recording.path.clone(),
                    },
                })),
            )
        }
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "error", "error": "recorder unavailable" })),
        ),
    }
}

pub async fn recording_start_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let started = state.recorder.start().await;
    Json(json!({ "status": if started { "ok" } else { "error" }, "recording_active": started }))
}

pub async fn recording_stop_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let saved = state.recorder.stop().await;
    Json(json!({ "status": "ok", "segments_saved": saved }))
}

pub async fn recording_restart_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let ok = state.recorder.restart().await;
    if ok {
        Json(json!({ "status": "ok", "message": "recording restarted" })).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "status": "error", "error": "restart failed" })),
        )
            .into_response()
    }
}

pub async fn recording_merge_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let merged = state.recorder.force_merge().await;
    Json(json!({ "status": "ok", "merged_groups": merged }))
}

pub async fn recording_cleanup_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let cleaned = state.recorder.cleanup_tiny().await;
    Json(json!({ "status": "ok", "files_cleaned": cleaned }))
}

pub async fn recording_disconnect_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let saved = state.recorder.disconnected().await;
    Json(json!({ "status": "ok", "segments_saved": saved }))
}

pub async fn recording_reconnect_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let ok = state.recorder.reconnected().await;
    Json(json!({ "status": if ok { "ok" } else { "error" }, "recording_active": ok }))
}

/// Live stats over WebSocket: one JSON snapshot per second
pub async fn ws_stats_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_stats_session(socket, state))
}

async fn run_stats_session(mut socket: WebSocket, state: ServerState) {
    debug!("stats WebSocket client connected");

    loop {
        let payload = {
            let snapshot = state.shared.stats.read().snapshot();
            json!({
                "stats": snapshot,
                "viewers": state.shared.viewer_count(),
                "producers": state.shared.producer_count(),
                "pending_queue": state.shared.queue.len(),
            })
        };

        let text = match serde_json::to_string(&payload) {
            Ok(text) => text,
            Err(e) => {
                debug!("stats serialization failed: {}", e);
                break;
            }
        };

        if socket.send(Message::Text(text)).await.is_err() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    debug!("stats WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CamgateConfig;
    use crate::state::PipelineShared;

    #[test]
    fn test_recommendations_for_healthy_system() {
        let shared = PipelineShared::new(CamgateConfig::default());
        {
            let mut stats = shared.stats.write();
            stats.fps = 30.0;
            stats.network_jitter = 0.01;
        }
        let recs = recommendations(&shared);
        assert_eq!(recs, vec!["System operating normally".to_string()]);
    }

    #[test]
    fn test_recommendations_flag_problems() {
        let shared = PipelineShared::new(CamgateConfig::default());
        {
            let mut stats = shared.stats.write();
            stats.fps = 5.0;
            stats.network_jitter = 0.5;
            stats.buffer_utilization_pct = 95.0;
            stats.consecutive_drops = 10;
            stats.adaptation_confidence = 0.1;
        }
        let recs = recommendations(&shared);
        assert_eq!(recs.len(), 5);
        assert!(recs[0].contains("below the guaranteed minimum"));
    }
}
