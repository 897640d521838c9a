use crate::control::SystemState;
use crate::state::SharedPipeline;
use crate::streaming::encode::{encode_jpeg, KEEPALIVE_JPEG};
use crate::streaming::server::ServerState;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};
use uuid::Uuid;

/// Handler for the multipart MJPEG live stream
pub async fn video_feed_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let viewer_id = Uuid::new_v4();
    info!(%viewer_id, "viewer connected to video feed");

    let shared = state.shared.clone();
    let headers = diagnostic_headers(&shared);

    let stream = async_stream::stream! {
        let _guard = ViewerGuard::register(&shared);

        // Buffering gate: hold the viewer until enough material has
        // accumulated to pace through short underruns.
        let gate_opened = Instant::now();
        loop {
            if shared.buffer.should_start_streaming(Instant::now()) {
                if shared.log_gate.allow_info("buffering_complete") {
                    info!(
                        "initial buffering completed in {:.3}s, starting stream",
                        gate_opened.elapsed().as_secs_f64()
                    );
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let target_fps = shared.config.stream.target_fps.max(1);
        let min_fps = shared.config.stream.min_fps.max(1);
        let max_empty_frames = shared.config.stream.max_empty_frames;
        let base_interval = Duration::from_secs_f64(1.0 / target_fps as f64);
        let max_interval = Duration::from_secs_f64(1.0 / min_fps as f64);

        let mut consecutive_empty = 0u32;
        let mut encode_error_logged = false;

        loop {
            let emission_start = Instant::now();

            match shared.buffer.take_best() {
                Some(frame) => {
                    consecutive_empty = 0;

                    let (quality, current_fps, jitter, utilization, compensation) = {
                        let stats = shared.stats.read();
                        (
                            stats.quality_level,
                            stats.fps,
                            stats.network_jitter,
                            shared.buffer.utilization(),
                            stats.compensation_factor,
                        )
                    };

                    let effective = effective_quality(
                        quality,
                        current_fps,
                        target_fps,
                        min_fps,
                        jitter,
                        utilization,
                        frame.quality_score,
                        shared.config.quality.min_quality,
                        shared.config.quality.max_quality,
                    );

                    match encode_jpeg(Arc::clone(&frame.pixels), effective).await {
                        Ok(jpeg) => {
                            shared.buffer.reset_buffering();
                            {
                                let mut stats = shared.stats.write();
                                stats.total_frames_sent += 1;
                                stats.latency_ms =
                                    emission_start.elapsed().as_secs_f64() * 1000.0;
                            }

                            yield Ok::<_, axum::Error>(Bytes::from(
                                "--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_string(),
                            ));
                            yield Ok(Bytes::from(jpeg));
                            yield Ok(Bytes::from("\r\n"));
                        }
                        Err(e) => {
                            // One line per session; a bad frame never ends
                            // a healthy stream
                            if !encode_error_logged {
                                error!(%viewer_id, "frame encode failed: {}", e);
                                encode_error_logged = true;
                            }
                            continue;
                        }
                    }

                    let optimal = shared
                        .frame_rate
                        .lock()
                        .optimal_interval(jitter, utilization);
                    let device = device_pacing_factor(current_fps);
                    let buffering = buffering_pacing_factor(&shared, current_fps);
                    let mut adjusted = optimal
                        .mul_f64(compensation.max(0.1))
                        .mul_f64(device)
                        .mul_f64(buffering);
                    if adjusted > max_interval {
                        adjusted = max_interval;
                        if shared.log_gate.allow_info("interval_capped") {
                            debug!("outbound interval capped at {} FPS", min_fps);
                        }
                    }

                    let elapsed = emission_start.elapsed();
                    if adjusted > elapsed {
                        tokio::time::sleep(adjusted - elapsed).await;
                    }
                }
                None => {
                    consecutive_empty += 1;

                    // Keep-alive guarantees periodic bytes to the viewer
                    yield Ok(Bytes::from(
                        "--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_string(),
                    ));
                    yield Ok(Bytes::from_static(KEEPALIVE_JPEG));
                    yield Ok(Bytes::from("\r\n"));

                    let current_fps = shared.stats.read().fps;
                    let sleep = if consecutive_empty > max_empty_frames {
                        if shared.log_gate.allow_warn("buffer_empty_recovery") {
                            debug!(
                                "buffer empty for {} emissions, extended recovery",
                                consecutive_empty
                            );
                        }
                        if current_fps < 2.0 {
                            base_interval.mul_f64(3.0)
                        } else {
                            base_interval.mul_f64(2.0)
                        }
                    } else if current_fps < 2.0 {
                        base_interval.mul_f64(2.0)
                    } else if current_fps < min_fps as f64
                        || shared.buffer.utilization() < 0.1
                    {
                        base_interval
                    } else {
                        base_interval.mul_f64(1.5)
                    };
                    tokio::time::sleep(sleep).await;
                }
            }
        }
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        );
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    builder
        .body(axum::body::Body::from_stream(stream))
        .unwrap()
}

/// Handler for the single-frame endpoint: the most recent processed frame,
/// re-encoded at the controller's current quality.
pub async fn single_frame_handler(State(state): State<ServerState>) -> Response {
    let shared = &state.shared;

    let Some(frame) = shared.latest_frame.read().clone() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, "1")],
            "No frame available",
        )
            .into_response();
    };

    let (quality, system_state) = {
        let stats = shared.stats.read();
        (stats.quality_level, stats.system_state)
    };

    // Under critical load the single-frame path sheds extra quality
    let quality = if system_state == SystemState::Critical {
        quality.saturating_sub(15).max(45)
    } else {
        quality
    };

    match encode_jpeg(Arc::clone(&frame.pixels), quality).await {
        Ok(jpeg) => {
            let mut builder = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "image/jpeg");
            for (name, value) in diagnostic_headers(shared) {
                builder = builder.header(name, value);
            }
            builder.body(axum::body::Body::from(jpeg)).unwrap()
        }
        Err(e) => {
            error!("single frame encode failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Frame encoding failed").into_response()
        }
    }
}

/// No-cache plus the diagnostic `X-*` headers every frame/stream response
/// carries.
fn diagnostic_headers(shared: &SharedPipeline) -> Vec<(&'static str, String)> {
    let stats = shared.stats.read();
    vec![
        (
            "Cache-Control",
            "no-cache, no-store, must-revalidate".to_string(),
        ),
        ("Pragma", "no-cache".to_string()),
        ("Expires", "0".to_string()),
        ("X-FPS", format!("{:.2}", stats.fps)),
        ("X-Frame-Quality", stats.quality_level.to_string()),
        (
            "X-Compensation-Factor",
            format!("{:.3}", stats.compensation_factor),
        ),
        (
            "X-Buffer-Utilization",
            format!("{:.1}%", stats.buffer_utilization_pct),
        ),
        ("X-Network-Jitter", format!("{:.4}", stats.network_jitter)),
        ("X-System-State", stats.system_state.as_str().to_string()),
    ]
}

/// Effective per-emission quality: the controller's setpoint, shed further
/// under low FPS, heavy jitter or a saturated buffer. Floors keep security
/// footage legible; the shed never raises quality above the setpoint.
#[allow(clippy::too_many_arguments)]
fn effective_quality(
    base: u8,
    current_fps: f64,
    target_fps: u32,
    min_fps: u32,
    jitter: f64,
    utilization: f64,
    frame_quality: f64,
    min_quality: u8,
    max_quality: u8,
) -> u8 {
    let mut quality = base;

    if current_fps < min_fps as f64 {
        quality = if current_fps < 2.0 {
            shed(quality, 4, 78)
        } else {
            shed(quality, 3, 80)
        };
    } else if current_fps < target_fps as f64 * 0.6 {
        quality = shed(quality, 3, 78);
    } else if current_fps > target_fps as f64 * 0.9 {
        quality = quality.saturating_add(3).min(max_quality);
    }

    if jitter > 0.25 {
        quality = shed(quality, 2, 78);
    }

    if utilization > 0.9 {
        quality = shed(quality, 2, 78);
    }

    if frame_quality < 45.0 {
        quality = shed(quality, 1, 78);
    }

    quality.clamp(min_quality, max_quality)
}

/// Lower `quality` by `delta`, stopping at `floor`; never raises.
fn shed(quality: u8, delta: u8, floor: u8) -> u8 {
    quality.min(quality.saturating_sub(delta).max(floor))
}

/// Device-class pacing factor: speed delivery up when the producer is
/// slow, ease off slightly when it runs hot.
fn device_pacing_factor(current_fps: f64) -> f64 {
    if current_fps < 2.0 {
        0.6
    } else if current_fps < 10.0 {
        0.7
    } else if current_fps < 15.0 {
        0.8
    } else if current_fps > 25.0 {
        1.1
    } else {
        1.0
    }
}

/// Faster delivery while the buffering gate is re-arming
fn buffering_pacing_factor(shared: &SharedPipeline, current_fps: f64) -> f64 {
    if shared.buffer.buffering_status().buffering_active {
        if current_fps < 2.0 {
            0.7
        } else {
            0.9
        }
    } else {
        1.0
    }
}

/// Viewer counting tied to the response body lifetime
struct ViewerGuard {
    shared: SharedPipeline,
}

impl ViewerGuard {
    fn register(shared: &SharedPipeline) -> Self {
        shared.viewers.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: shared.clone(),
        }
    }
}

impl Drop for ViewerGuard {
    fn drop(&mut self) {
        self.shared.viewers.fetch_sub(1, Ordering::Relaxed);
        debug!("viewer disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shed_lowers_to_floor_but_never_raises() {
        // Above the floor: sheds down to it
        assert_eq!(shed(80, 4, 78), 78);
        assert_eq!(shed(85, 3, 78), 82);
        // At or below the floor: untouched
        assert_eq!(shed(78, 4, 78), 78);
        assert_eq!(shed(60, 4, 78), 60);
    }

    #[test]
    fn test_effective_quality_healthy_path_raises_gently() {
        // FPS above 0.9×target with clean network: quality climbs capped
        let q = effective_quality(80, 29.0, 30, 15, 0.0, 0.5, 70.0, 60, 90);
        assert_eq!(q, 83);

        let q = effective_quality(89, 29.0, 30, 15, 0.0, 0.5, 70.0, 60, 90);
        assert_eq!(q, 90);
    }

    #[test]
    fn test_effective_quality_sheds_under_pressure() {
        // Low FPS, heavy jitter and a saturated buffer all shed quality
        let q = effective_quality(88, 5.0, 30, 15, 0.3, 0.95, 70.0, 60, 90);
        assert!(q < 88);
        assert!(q >= 60);
    }

    #[test]
    fn test_effective_quality_respects_bounds() {
        for fps in [0.5, 5.0, 14.0, 29.0, 35.0] {
            for jitter in [0.0, 0.3] {
                for util in [0.05, 0.5, 0.95] {
                    let q = effective_quality(75, fps, 30, 15, jitter, util, 50.0, 60, 90);
                    assert!((60..=90).contains(&q));
                }
            }
        }
    }

    #[test]
    fn test_device_pacing_bands() {
        assert_eq!(device_pacing_factor(1.5), 0.6);
        assert_eq!(device_pacing_factor(8.0), 0.7);
        assert_eq!(device_pacing_factor(12.0), 0.8);
        assert_eq!(device_pacing_factor(20.0), 1.0);
        assert_eq!(device_pacing_factor(28.0), 1.1);
    }
}
