use crate::frame::FrameEnvelope;
use crate::quality;
use crate::queue::PushOutcome;
use crate::recorder::RecorderHandle;
use crate::state::SharedPipeline;
use crate::streaming::server::ServerState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use image::RgbImage;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upgrade handler for the producer ingest channel at `/ws`
pub async fn ws_ingest_handler(
    ws: WebSocketUpgrade,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        run_producer_session(socket, state.shared.clone(), state.recorder.clone())
    })
}

/// One persistent producer session: binary messages are complete JPEG
/// frames; text messages are ignored. A single bad frame never tears the
/// session down.
pub async fn run_producer_session(
    mut socket: WebSocket,
    shared: SharedPipeline,
    recorder: RecorderHandle,
) {
    let producer_id = Uuid::new_v4().to_string();
    let prior = shared.producers.fetch_add(1, Ordering::Relaxed);
    if prior > 0 {
        warn!(
            producer_id,
            "additional producer connected; pipeline is designed for one"
        );
    }
    info!(producer_id, "producer connected");

    while let Some(message) = socket.recv().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                // Log, close gracefully, return; reconnect gets a new session
                debug!(producer_id, "ingest channel error: {}", e);
                break;
            }
        };

        match message {
            Message::Binary(payload) => {
                admit_frame(&shared, &producer_id, payload).await;
            }
            Message::Text(_) => {
                // Control chatter from the device is not part of the frame
                // protocol
            }
            Message::Close(_) => {
                info!(producer_id, "producer closed the session");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    shared.producers.fetch_sub(1, Ordering::Relaxed);
    let saved = recorder.disconnected().await;
    info!(
        producer_id,
        saved_segments = saved,
        "producer session ended, recorder flushed"
    );
}

/// Decode, score, and enqueue one binary payload. Decode failures are
/// dropped silently; queue overflow evicts the lowest-priority pending
/// frame and counts a drop.
async fn admit_frame(shared: &SharedPipeline, producer_id: &str, payload: Vec<u8>) {
    let receive_start = Instant::now();

    let decoded = tokio::task::spawn_blocking(move || decode_and_score(payload)).await;

    let (pixels, jpeg, quality_score) = match decoded {
        Ok(Some(result)) => result,
        Ok(None) => {
            // Transient producer garbage; the session continues
            debug!(producer_id, "dropping undecodable frame");
            return;
        }
        Err(e) => {
            debug!(producer_id, "frame decode task failed: {}", e);
            return;
        }
    };

    // Under pipeline distress admitting more frames only makes things
    // worse; shed at the ingress.
    let drop_now = {
        let jitter = shared.stats.read().network_jitter;
        shared
            .frame_rate
            .lock()
            .should_drop(shared.buffer.utilization(), jitter)
    };
    if drop_now {
        shared.stats.write().record_drop(Instant::now());
        debug!(producer_id, "dropping frame under pipeline pressure");
        return;
    }

    let network_delay = receive_start.elapsed();
    let sequence = shared.next_sequence();

    let envelope = FrameEnvelope::new(
        pixels,
        jpeg,
        sequence,
        network_delay,
        quality_score,
        Some(producer_id.to_string()),
    );

    match shared.queue.push(envelope) {
        PushOutcome::Queued => {}
        PushOutcome::EvictedPrior { evicted_sequence } => {
            let mut stats = shared.stats.write();
            stats.record_drop(Instant::now());
            debug!(
                producer_id,
                evicted_sequence, "queue full, displaced lowest-priority frame"
            );
        }
    }
}

/// JPEG decode plus quality scoring, both CPU-bound, run off the event loop
fn decode_and_score(payload: Vec<u8>) -> Option<(RgbImage, Vec<u8>, f64)> {
    let pixels = match image::load_from_memory(&payload) {
        Ok(decoded) => decoded.to_rgb8(),
        Err(_) => return None,
    };
    let score = quality::score_frame(&pixels);
    Some((pixels, payload, score))
}
