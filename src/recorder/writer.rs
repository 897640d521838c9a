use crate::error::RecorderError;
use crate::recorder::segment::SegmentFrame;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Encode a segment's JPEG frames into an MP4 file at `path`.
///
/// Runs on the blocking pool. After writing, the actual file size is
/// checked against `min_size_bytes`: undersized output is deleted and
/// rejected unless `force_save` is set (disconnect recovery). Returns the
/// final file size in bytes.
pub async fn write_segment(
    frames: Vec<SegmentFrame>,
    path: PathBuf,
    fps: u32,
    min_size_bytes: u64,
    force_save: bool,
) -> Result<u64, RecorderError> {
    if frames.is_empty() {
        return Err(RecorderError::SegmentRejected {
            details: "cannot save empty segment".to_string(),
        });
    }

    encode_to_file(frames, path.clone(), fps).await?;

    let size = tokio::fs::metadata(&path)
        .await
        .map(|m| m.len())
        .map_err(|e| RecorderError::SegmentSave {
            details: format!("size check failed for {}: {}", path.display(), e),
        })?;

    if size < min_size_bytes && !force_save {
        warn!(
            "Video file below minimum size ({} < {} bytes), removing: {}",
            size,
            min_size_bytes,
            path.display()
        );
        let _ = tokio::fs::remove_file(&path).await;
        return Err(RecorderError::SegmentRejected {
            details: format!("written file {} bytes below minimum {}", size, min_size_bytes),
        });
    }

    if size < min_size_bytes {
        warn!(
            "Force save: keeping small video file ({} bytes): {}",
            size,
            path.display()
        );
    }

    Ok(size)
}

/// Concatenate already-written MP4 files into one output without
/// re-encoding (stream-copy remux).
pub async fn merge_files(inputs: Vec<PathBuf>, output: PathBuf) -> Result<(), RecorderError> {
    if inputs.len() < 2 {
        return Err(RecorderError::Merge {
            hour_key: "unknown".to_string(),
            details: "need at least two files to merge".to_string(),
        });
    }
    remux_concat(inputs, output).await
}

#[cfg(all(target_os = "linux", feature = "video_encoding"))]
async fn encode_to_file(
    frames: Vec<SegmentFrame>,
    path: PathBuf,
    fps: u32,
) -> Result<(), RecorderError> {
    tokio::task::spawn_blocking(move || encode_frames_blocking(&frames, &path, fps))
        .await
        .map_err(|e| RecorderError::Encoding {
            details: format!("encode task panicked: {}", e),
        })?
}

#[cfg(all(target_os = "linux", feature = "video_encoding"))]
async fn remux_concat(inputs: Vec<PathBuf>, output: PathBuf) -> Result<(), RecorderError> {
    tokio::task::spawn_blocking(move || remux_concat_blocking(&inputs, &output))
        .await
        .map_err(|e| RecorderError::Encoding {
            details: format!("merge task panicked: {}", e),
        })?
}

#[cfg(not(all(target_os = "linux", feature = "video_encoding")))]
async fn encode_to_file(
    _frames: Vec<SegmentFrame>,
    _path: PathBuf,
    _fps: u32,
) -> Result<(), RecorderError> {
    Err(RecorderError::EncoderUnavailable)
}

#[cfg(not(all(target_os = "linux", feature = "video_encoding")))]
async fn remux_concat(_inputs: Vec<PathBuf>, _output: PathBuf) -> Result<(), RecorderError> {
    Err(RecorderError::EncoderUnavailable)
}

/// Candidate encoder pipelines, tried in order until one opens. All scale
/// to the fixed 640x480 recording resolution.
#[cfg(all(target_os = "linux", feature = "video_encoding"))]
fn pipeline_candidates(path: &Path, fps: u32) -> Vec<(&'static str, String)> {
    let sink = path.to_string_lossy();
    vec![
        (
            "x264",
            format!(
                "appsrc name=src format=time is-live=false do-timestamp=true caps=image/jpeg,framerate={fps}/1 ! \
                 jpegparse ! \
                 jpegdec ! \
                 videoconvert ! videoscale ! video/x-raw,format=I420,width=640,height=480 ! \
                 x264enc speed-preset=medium bitrate=10000 key-int-max=60 ! \
                 video/x-h264,stream-format=byte-stream,alignment=au,profile=high ! \
                 h264parse config-interval=1 ! \
                 mp4mux faststart=true ! \
                 filesink location={sink}"
            ),
        ),
        (
            "mpeg4",
            format!(
                "appsrc name=src format=time is-live=false do-timestamp=true caps=image/jpeg,framerate={fps}/1 ! \
                 jpegparse ! \
                 jpegdec ! \
                 videoconvert ! videoscale ! video/x-raw,format=I420,width=640,height=480 ! \
                 avenc_mpeg4 bitrate=8000000 ! \
                 mp4mux faststart=true ! \
                 filesink location={sink}"
            ),
        ),
    ]
}

#[cfg(all(target_os = "linux", feature = "video_encoding"))]
fn encode_frames_blocking(
    frames: &[SegmentFrame],
    path: &Path,
    fps: u32,
) -> Result<(), RecorderError> {
    let mut last_error = RecorderError::EncoderUnavailable;
    for (label, desc) in pipeline_candidates(path, fps.max(1)) {
        match run_encode_pipeline(label, &desc, frames, fps.max(1)) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("[{}] encoder pipeline failed: {}", label, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}

#[cfg(all(target_os = "linux", feature = "video_encoding"))]
fn run_encode_pipeline(
    label: &str,
    pipeline_desc: &str,
    frames: &[SegmentFrame],
    fps: u32,
) -> Result<(), RecorderError> {
    use gstreamer::prelude::*;
    use gstreamer::Pipeline;
    use gstreamer_app::AppSrc;

    // Encoding is bulk work; drop its scheduling priority below the
    // ingest/streaming tasks.
    {
        use libc::{setpriority, PRIO_PROCESS};
        let _ = unsafe { setpriority(PRIO_PROCESS as u32, 0, 10) };
    }

    gstreamer::init().map_err(|e| RecorderError::Encoding {
        details: format!("[{}] failed to initialize GStreamer: {}", label, e),
    })?;

    let pipeline = gstreamer::parse::launch(pipeline_desc)
        .map_err(|e| RecorderError::Encoding {
            details: format!("[{}] failed to create pipeline: {}", label, e),
        })?
        .downcast::<Pipeline>()
        .map_err(|_| RecorderError::Encoding {
            details: format!("[{}] failed to downcast to Pipeline", label),
        })?;

    let appsrc = pipeline
        .by_name("src")
        .ok_or_else(|| RecorderError::Encoding {
            details: format!("[{}] failed to get appsrc element", label),
        })?
        .downcast::<AppSrc>()
        .map_err(|_| RecorderError::Encoding {
            details: format!("[{}] failed to downcast to AppSrc", label),
        })?;

    appsrc.set_property("format", gstreamer::Format::Time);
    appsrc.set_property("is-live", false);

    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|e| RecorderError::Encoding {
            details: format!("[{}] failed to start pipeline: {}", label, e),
        })?;

    let frame_duration_ns = 1_000_000_000u64 / fps as u64;

    for (frame_index, frame) in frames.iter().enumerate() {
        let mut buffer =
            gstreamer::Buffer::with_size(frame.jpeg.len()).map_err(|e| RecorderError::Encoding {
                details: format!("[{}] failed to create buffer: {}", label, e),
            })?;

        {
            let buffer_ref = buffer.get_mut().unwrap();
            let mut map = buffer_ref.map_writable().map_err(|e| RecorderError::Encoding {
                details: format!("[{}] failed to map buffer: {}", label, e),
            })?;
            map.copy_from_slice(&frame.jpeg);
        }

        let pts = frame_index as u64 * frame_duration_ns;
        buffer
            .get_mut()
            .unwrap()
            .set_pts(gstreamer::ClockTime::from_nseconds(pts));
        buffer
            .get_mut()
            .unwrap()
            .set_duration(gstreamer::ClockTime::from_nseconds(frame_duration_ns));

        appsrc.push_buffer(buffer).map_err(|e| RecorderError::Encoding {
            details: format!("[{}] failed to push buffer: {:?}", label, e),
        })?;
    }

    appsrc.end_of_stream().map_err(|e| RecorderError::Encoding {
        details: format!("[{}] failed to signal EOS: {:?}", label, e),
    })?;

    wait_for_eos(label, &pipeline)?;

    info!(
        "[{}] segment encoding completed: {} frames",
        label,
        frames.len()
    );
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "video_encoding"))]
fn remux_concat_blocking(inputs: &[PathBuf], output: &Path) -> Result<(), RecorderError> {
    use gstreamer::prelude::*;
    use gstreamer::Pipeline;

    gstreamer::init().map_err(|e| RecorderError::Encoding {
        details: format!("failed to initialize GStreamer: {}", e),
    })?;

    let mut desc = format!(
        "concat name=cat ! h264parse ! mp4mux faststart=true ! filesink location={}",
        output.to_string_lossy()
    );
    for input in inputs {
        desc.push_str(&format!(
            " filesrc location={} ! qtdemux ! h264parse ! cat.",
            input.to_string_lossy()
        ));
    }

    let pipeline = gstreamer::parse::launch(&desc)
        .map_err(|e| RecorderError::Encoding {
            details: format!("failed to create merge pipeline: {}", e),
        })?
        .downcast::<Pipeline>()
        .map_err(|_| RecorderError::Encoding {
            details: "failed to downcast merge pipeline".to_string(),
        })?;

    pipeline
        .set_state(gstreamer::State::Playing)
        .map_err(|e| RecorderError::Encoding {
            details: format!("failed to start merge pipeline: {}", e),
        })?;

    wait_for_eos("merge", &pipeline)?;

    info!(
        "Merged {} files into {}",
        inputs.len(),
        output.display()
    );
    Ok(())
}

#[cfg(all(target_os = "linux", feature = "video_encoding"))]
fn wait_for_eos(label: &str, pipeline: &gstreamer::Pipeline) -> Result<(), RecorderError> {
    use gstreamer::prelude::*;

    let bus = pipeline.bus().unwrap();
    for msg in bus.iter_timed(gstreamer::ClockTime::from_seconds(30)) {
        match msg.view() {
            gstreamer::MessageView::Eos(..) => break,
            gstreamer::MessageView::Error(err) => {
                let details = format!(
                    "[{}] pipeline error: {} ({})",
                    label,
                    err.error(),
                    err.debug().unwrap_or_default()
                );
                let _ = pipeline.set_state(gstreamer::State::Null);
                return Err(RecorderError::Encoding { details });
            }
            _ => {}
        }
    }

    pipeline
        .set_state(gstreamer::State::Null)
        .map_err(|e| RecorderError::Encoding {
            details: format!("[{}] failed to stop pipeline: {}", label, e),
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::SystemTime;

    fn frame() -> SegmentFrame {
        SegmentFrame {
            jpeg: Arc::new(vec![0xFF, 0xD8, 0xFF, 0xD9]),
            at: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn test_empty_segment_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let result =
            write_segment(Vec::new(), tmp.path().join("out.mp4"), 60, 512_000, false).await;
        assert!(matches!(
            result,
            Err(RecorderError::SegmentRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_merge_requires_two_inputs() {
        let tmp = tempfile::tempdir().unwrap();
        let result = merge_files(
            vec![tmp.path().join("one.mp4")],
            tmp.path().join("out.mp4"),
        )
        .await;
        assert!(matches!(result, Err(RecorderError::Merge { .. })));
    }

    #[cfg(not(all(target_os = "linux", feature = "video_encoding")))]
    #[tokio::test]
    async fn test_encoder_unavailable_without_feature() {
        let tmp = tempfile::tempdir().unwrap();
        let result = write_segment(
            vec![frame()],
            tmp.path().join("out.mp4"),
            60,
            512_000,
            false,
        )
        .await;
        assert!(matches!(result, Err(RecorderError::EncoderUnavailable)));
    }
}
