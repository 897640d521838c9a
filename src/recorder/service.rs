use crate::config::RecordingConfig;
use crate::error::RecorderError;
use crate::logfilter::LogGate;
use crate::quality::rgb_stats;
use crate::recorder::layout::{self, HourLayout};
use crate::recorder::retention::{self, SweepResult};
use crate::recorder::segment::{SegmentLimits, VideoSegment};
use crate::recorder::writer;
use chrono::{DateTime, Local, Timelike};
use image::RgbImage;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A dead producer is declared after this long without frames
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum age before auto-save will touch a small segment
const AUTO_SAVE_MIN_AGE: Duration = Duration::from_secs(30);

/// Combined partial duration that qualifies an hour for rewriting
const COMPLETE_HOUR_THRESHOLD: Duration = Duration::from_secs(58 * 60);

/// Process-level error ceiling before critical recovery
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// One processed frame offered to the recorder: pixels for validation,
/// JPEG bytes for the container.
#[derive(Debug, Clone)]
pub struct RecorderFrame {
    pub pixels: Arc<RgbImage>,
    pub jpeg: Arc<Vec<u8>>,
    pub at: SystemTime,
}

/// Operator and pipeline commands accepted by the recorder task
pub enum RecorderCommand {
    Start(oneshot::Sender<bool>),
    Stop(oneshot::Sender<usize>),
    Restart(oneshot::Sender<bool>),
    ForceMerge(oneshot::Sender<usize>),
    CleanupTiny(oneshot::Sender<usize>),
    Disconnected(oneshot::Sender<usize>),
    Reconnected(oneshot::Sender<bool>),
    Status(Box<oneshot::Sender<RecorderStatus>>),
}

/// Cheap cloneable handle for talking to the recorder task
#[derive(Clone)]
pub struct RecorderHandle {
    frames: mpsc::Sender<RecorderFrame>,
    commands: mpsc::Sender<RecorderCommand>,
}

impl RecorderHandle {
    /// Offer a frame without ever blocking the processor; a saturated
    /// recorder simply loses the frame.
    pub fn offer_frame(&self, frame: RecorderFrame) {
        if let Err(e) = self.frames.try_send(frame) {
            debug!("recorder frame channel saturated: {}", e);
        }
    }

    pub async fn start(&self) -> bool {
        self.request(RecorderCommand::Start).await.unwrap_or(false)
    }

    pub async fn stop(&self) -> usize {
        self.request(RecorderCommand::Stop).await.unwrap_or(0)
    }

    pub async fn restart(&self) -> bool {
        self.request(RecorderCommand::Restart)
            .await
            .unwrap_or(false)
    }

    pub async fn force_merge(&self) -> usize {
        self.request(RecorderCommand::ForceMerge).await.unwrap_or(0)
    }

    pub async fn cleanup_tiny(&self) -> usize {
        self.request(RecorderCommand::CleanupTiny)
            .await
            .unwrap_or(0)
    }

    pub async fn disconnected(&self) -> usize {
        self.request(RecorderCommand::Disconnected)
            .await
            .unwrap_or(0)
    }

    pub async fn reconnected(&self) -> bool {
        self.request(RecorderCommand::Reconnected)
            .await
            .unwrap_or(false)
    }

    pub async fn status(&self) -> Option<RecorderStatus> {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(RecorderCommand::Status(Box::new(tx)))
            .await
            .is_err()
        {
            return None;
        }
        rx.await.ok()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RecorderCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(build(tx)).await.is_err() {
            return None;
        }
        rx.await.ok()
    }
}

/// Health of one in-memory segment, exposed by the status API
#[derive(Debug, Clone, Serialize)]
pub struct SegmentHealth {
    pub segment_number: usize,
    pub frame_count: usize,
    pub duration_secs: f64,
    pub estimated_size_kb: f64,
    pub ready_for_save: bool,
    pub can_merge: bool,
    pub age_secs: f64,
    pub error_count: u32,
    pub saved: bool,
}

/// Recorder status snapshot for the status API
#[derive(Debug, Clone, Serialize)]
pub struct RecorderStatus {
    pub recording_active: bool,
    pub connection_status: String,
    pub current_hour: Option<String>,
    pub current_directory: Option<String>,
    pub using_fallback_directory: bool,
    pub low_fps_mode: bool,
    pub recording_fps: u32,
    pub auto_save_interval_secs: u64,
    pub accumulated_frames: u64,
    pub seconds_since_last_frame: Option<f64>,
    pub unsaved_segments: usize,
    pub frames_at_risk: usize,
    pub seconds_since_last_auto_save: f64,
    pub total_errors: u64,
    pub recovery_attempts: u32,
    pub segments: Vec<SegmentHealth>,
}

/// Entry in the saved-partials ledger used by the on-disk hour merge
#[derive(Debug, Clone)]
struct SavedPartial {
    path: PathBuf,
    hour_key: String,
    hour: u32,
    date: DateTime<Local>,
    duration: Duration,
}

/// The segmented recorder, confined to a single task.
///
/// All segment state is owned here; other tasks communicate through the
/// frame channel and the command channel, which gives merge, save,
/// retention and disconnect handling serial semantics.
pub struct RecorderService {
    config: RecordingConfig,
    limits: SegmentLimits,
    log_gate: LogGate,

    frames_rx: mpsc::Receiver<RecorderFrame>,
    commands_rx: mpsc::Receiver<RecorderCommand>,
    cancel: CancellationToken,

    recording_active: bool,
    layout: Option<HourLayout>,
    segments: Vec<VideoSegment>,
    saved_partials: Vec<SavedPartial>,
    next_segment_number: usize,
    accumulated_frames: u64,

    last_frame: Option<Instant>,
    last_auto_save: Instant,
    last_merge_check: Instant,

    low_fps_mode: bool,
    auto_save_interval: Duration,

    total_errors: u64,
    consecutive_errors: u32,
    recovery_attempts: u32,
    needs_recovery: bool,
}

impl RecorderService {
    /// Spawn the recorder task; returns its handle and join handle.
    pub fn spawn(
        config: RecordingConfig,
        cancel: CancellationToken,
    ) -> (RecorderHandle, tokio::task::JoinHandle<()>) {
        let (frames_tx, frames_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let service = Self::new(config, frames_rx, commands_rx, cancel);
        let join = tokio::spawn(service.run());

        (
            RecorderHandle {
                frames: frames_tx,
                commands: commands_tx,
            },
            join,
        )
    }

    fn new(
        config: RecordingConfig,
        frames_rx: mpsc::Receiver<RecorderFrame>,
        commands_rx: mpsc::Receiver<RecorderCommand>,
        cancel: CancellationToken,
    ) -> Self {
        let limits = SegmentLimits::from(&config);
        let auto_save_interval = Duration::from_secs(config.auto_save_interval_secs);
        Self {
            config,
            limits,
            log_gate: LogGate::new(),
            frames_rx,
            commands_rx,
            cancel,
            recording_active: false,
            layout: None,
            segments: Vec::new(),
            saved_partials: Vec::new(),
            next_segment_number: 0,
            accumulated_frames: 0,
            last_frame: None,
            last_auto_save: Instant::now(),
            last_merge_check: Instant::now(),
            low_fps_mode: false,
            auto_save_interval,
            total_errors: 0,
            consecutive_errors: 0,
            recovery_attempts: 0,
            needs_recovery: false,
        }
    }

    async fn run(mut self) {
        info!("Recorder task started");

        let mut housekeeping = tokio::time::interval(Duration::from_secs(1));
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut retention_tick = tokio::time::interval(Duration::from_secs(3600));
        retention_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Recorder shutting down, saving all segments");
                    self.save_all(true).await;
                    break;
                }
                frame = self.frames_rx.recv() => match frame {
                    Some(frame) => self.on_frame(frame).await,
                    None => break,
                },
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                _ = housekeeping.tick() => self.on_housekeeping().await,
                _ = retention_tick.tick() => {
                    if let Err(e) = self.run_sweep().await {
                        warn!("Retention sweep failed: {}", e);
                    }
                }
            }

            if self.needs_recovery {
                self.needs_recovery = false;
                self.critical_recovery().await;
            }
        }

        info!("Recorder task stopped");
    }

    async fn on_frame(&mut self, frame: RecorderFrame) {
        if !self.recording_active {
            info!("Recording not active, starting a new session");
            self.start_recording().await;
        }

        if !validate_frame(&frame.pixels) {
            debug!("Skipping invalid frame");
            return;
        }

        let now = Local::now();
        let hour_expired = self
            .layout
            .as_ref()
            .map(|l| l.elapsed_secs(now) >= 3600)
            .unwrap_or(true);
        if hour_expired {
            self.start_new_hour().await;
        }

        if self.segments.is_empty() {
            self.create_segment();
        }

        let (width, height) = (frame.pixels.width(), frame.pixels.height());
        if let Some(segment) = self.segments.last_mut() {
            segment.add_frame(Arc::clone(&frame.jpeg), width, height, frame.at);
            self.accumulated_frames += 1;
        }

        let should_roll = self
            .segments
            .last()
            .map(|s| s.should_roll_over())
            .unwrap_or(false);
        if should_roll {
            let index = self.segments.len() - 1;
            if self.save_segment(index, false, false).await.is_some() {
                self.create_segment();
            } else if let Some(segment) = self.segments.last_mut() {
                // An unsavable segment must not grow without bound
                if segment.duration().as_secs_f64() >= self.limits.max_duration_secs {
                    if self.log_gate.allow_warn("unsavable_segment_dropped") {
                        warn!(
                            "Dropping unsavable segment {} after {:.0}s",
                            segment.segment_number,
                            segment.duration().as_secs_f64()
                        );
                    }
                    segment.cleanup();
                    self.segments.pop();
                    self.create_segment();
                }
            }
        }

        self.adjust_fps_mode();
        self.last_frame = Some(Instant::now());
    }

    async fn on_command(&mut self, command: RecorderCommand) {
        match command {
            RecorderCommand::Start(reply) => {
                self.start_recording().await;
                let _ = reply.send(self.recording_active);
            }
            RecorderCommand::Stop(reply) => {
                let saved = self.stop_recording().await;
                let _ = reply.send(saved);
            }
            RecorderCommand::Restart(reply) => {
                let ok = self.force_restart().await;
                let _ = reply.send(ok);
            }
            RecorderCommand::ForceMerge(reply) => {
                let merged = self.merge_in_memory().await + self.merge_saved_partials().await;
                let _ = reply.send(merged);
            }
            RecorderCommand::CleanupTiny(reply) => {
                let merged = self.merge_saved_partials().await;
                let removed = retention::cleanup_tiny(&PathBuf::from(&self.config.path))
                    .await
                    .unwrap_or(0);
                let _ = reply.send(merged + removed);
            }
            RecorderCommand::Disconnected(reply) => {
                let saved = self.handle_disconnection().await;
                let _ = reply.send(saved);
            }
            RecorderCommand::Reconnected(reply) => {
                let ok = self.handle_reconnection().await;
                let _ = reply.send(ok);
            }
            RecorderCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    async fn on_housekeeping(&mut self) {
        // A silent producer is a disconnected producer
        if self.recording_active {
            if let Some(last) = self.last_frame {
                if last.elapsed() > DISCONNECT_TIMEOUT {
                    if self.log_gate.allow_warn("producer_silent") {
                        warn!(
                            "No frames for {:?}, treating producer as disconnected",
                            DISCONNECT_TIMEOUT
                        );
                    }
                    self.handle_disconnection().await;
                }
            }
        }

        if self.last_auto_save.elapsed() >= self.auto_save_interval {
            self.auto_save_small_segments().await;
            self.last_auto_save = Instant::now();
        }

        let merge_interval = Duration::from_secs(self.config.merge_check_interval_secs);
        if self.last_merge_check.elapsed() >= merge_interval {
            self.merge_in_memory().await;
            self.merge_saved_partials().await;
            self.last_merge_check = Instant::now();
        }
    }

    async fn start_recording(&mut self) {
        if self.recording_active {
            self.stop_recording().await;
        }
        self.start_new_hour().await;
        self.recording_active = true;
        info!("Security recording session started");
    }

    async fn stop_recording(&mut self) -> usize {
        if !self.recording_active {
            return 0;
        }
        let saved = self.save_all(true).await;
        self.merge_saved_partials().await;
        self.recording_active = false;
        info!("Recording stopped, {} segments saved", saved);
        saved
    }

    async fn force_restart(&mut self) -> bool {
        info!("Force restarting recording session");
        if self.recording_active {
            self.stop_recording().await;
        }
        self.cleanup_segments();
        self.accumulated_frames = 0;
        self.last_frame = None;
        self.last_auto_save = Instant::now();
        self.start_recording().await;
        self.recording_active
    }

    async fn start_new_hour(&mut self) {
        // Anything unsaved from the previous hour is rescued first
        self.save_all(true).await;
        self.cleanup_segments();

        let root = PathBuf::from(&self.config.path);
        let layout = layout::create_hour_layout(&root, Local::now()).await;
        info!(
            "Started new recording hour: {}",
            layout.hour_start.format("%Y-%m-%d %H:%M:%S")
        );
        self.layout = Some(layout);
        self.next_segment_number = 0;
    }

    fn create_segment(&mut self) {
        let number = self.next_segment_number;
        self.next_segment_number += 1;
        self.segments
            .push(VideoSegment::new(Local::now(), number, self.limits));
        info!("Created new segment {}", number);
    }

    /// Save one segment; `force` bypasses the validity and size floors
    /// (disconnect recovery only).
    async fn save_segment(
        &mut self,
        index: usize,
        is_complete: bool,
        force: bool,
    ) -> Option<PathBuf> {
        let layout = self.layout.clone()?;
        let min_size = self.config.absolute_min_segment_size_bytes;

        let (frames, path, duration, hour_key, hour, date) = {
            let segment = self.segments.get(index)?;
            if segment.file_path.is_some() || segment.is_empty() {
                return None;
            }

            if !force {
                if !segment.is_ready_for_save() {
                    warn!(
                        "Segment rejected for save: {} frames, {:.1}s duration",
                        segment.frame_count(),
                        segment.duration().as_secs_f64()
                    );
                    return None;
                }
                let estimated_kb = segment.estimated_size_kb();
                if estimated_kb < min_size as f64 / 1024.0 {
                    warn!(
                        "Segment rejected: estimated size {:.1}KB below minimum {:.1}KB",
                        estimated_kb,
                        min_size as f64 / 1024.0
                    );
                    return None;
                }
            }

            let dir = if is_complete {
                &layout.complete_hours_dir
            } else {
                &layout.partial_segments_dir
            };
            let name =
                layout::segment_file_name(is_complete, &segment.start_time, segment.segment_number);
            (
                segment.frames().to_vec(),
                dir.join(name),
                segment.duration(),
                segment.hour_key(),
                segment.start_time.hour(),
                segment.start_time,
            )
        };

        match writer::write_segment(frames, path.clone(), self.effective_fps(), min_size, force)
            .await
        {
            Ok(size) => {
                info!(
                    "Saved segment: {} ({:.1}KB, {:.1}s)",
                    path.display(),
                    size as f64 / 1024.0,
                    duration.as_secs_f64()
                );
                if let Some(segment) = self.segments.get_mut(index) {
                    segment.file_path = Some(path.clone());
                    segment.is_complete = is_complete;
                }
                if !is_complete {
                    self.saved_partials.push(SavedPartial {
                        path: path.clone(),
                        hour_key,
                        hour,
                        date,
                        duration,
                    });
                }
                self.consecutive_errors = 0;
                Some(path)
            }
            Err(RecorderError::EncoderUnavailable) => {
                if self.log_gate.allow_warn("encoder_unavailable") {
                    warn!("Segment not saved: video encoder unavailable in this build");
                }
                None
            }
            Err(RecorderError::SegmentRejected { details }) => {
                debug!("Segment save rejected: {}", details);
                None
            }
            Err(e) => {
                error!("Segment save failed: {}", e);
                if let Some(segment) = self.segments.get_mut(index) {
                    segment.record_error("save");
                    // The newest frame is the most likely corruption point
                    segment.drop_last_frame();
                }
                self.note_error();
                None
            }
        }
    }

    /// Force-save every unsaved non-empty segment; returns the saved count
    async fn save_all(&mut self, force: bool) -> usize {
        let mut saved = 0;
        for index in 0..self.segments.len() {
            if self.save_segment(index, false, force).await.is_some() {
                saved += 1;
            }
        }
        saved
    }

    /// Save small segments that have been at risk for a while. Protects
    /// data against abrupt producer loss.
    async fn auto_save_small_segments(&mut self) -> usize {
        let mut saved = 0;
        for index in 0..self.segments.len() {
            let at_risk = {
                let segment = &self.segments[index];
                !segment.is_empty()
                    && segment.file_path.is_none()
                    && !segment.is_ready_for_save()
                    && segment.age() > AUTO_SAVE_MIN_AGE
            };
            if at_risk && self.save_segment(index, false, true).await.is_some() {
                saved += 1;
            }
        }
        if saved > 0 {
            info!("Auto-saved {} small segments for protection", saved);
            self.merge_saved_partials().await;
        }
        saved
    }

    /// Merge in-memory segments sharing an hour key. A merged segment that
    /// becomes valid is saved and its inputs retired; otherwise it stays
    /// for further accumulation.
    async fn merge_in_memory(&mut self) -> usize {
        use std::collections::HashMap;

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, segment) in self.segments.iter().enumerate() {
            if segment.can_be_merged() {
                groups.entry(segment.hour_key()).or_default().push(index);
            }
        }

        let mut merged_count = 0;
        for (hour_key, mut indexes) in groups {
            if indexes.len() < 2 {
                continue;
            }
            indexes.sort_by_key(|&i| self.segments[i].start_time);

            let number = self.next_segment_number;
            self.next_segment_number += 1;
            let mut merged =
                VideoSegment::new(self.segments[indexes[0]].start_time, number, self.limits);

            for &index in &indexes {
                let (width, height) = self.segments[index].dimensions();
                for frame in self.segments[index].take_frames() {
                    merged.add_frame(frame.jpeg, width, height, frame.at);
                }
            }

            info!(
                "Merged {} segments for hour {}: {} frames, {:.1}s",
                indexes.len(),
                hour_key,
                merged.frame_count(),
                merged.duration().as_secs_f64()
            );

            // Drop the emptied inputs (highest index first)
            let mut doomed = indexes;
            doomed.sort_unstable_by(|a, b| b.cmp(a));
            for index in doomed {
                self.segments.remove(index);
            }

            let ready = merged.is_ready_for_save();
            self.segments.push(merged);
            if ready {
                let index = self.segments.len() - 1;
                self.save_segment(index, false, false).await;
            }
            merged_count += 1;
        }

        merged_count
    }

    /// Rewrite saved partials as a complete-hour file once an hour has
    /// accumulated enough material on disk.
    async fn merge_saved_partials(&mut self) -> usize {
        use std::collections::HashMap;

        let Some(layout) = self.layout.clone() else {
            return 0;
        };

        let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
        for (index, partial) in self.saved_partials.iter().enumerate() {
            groups.entry(partial.hour_key.clone()).or_default().push(index);
        }

        let mut merged_hours = 0;
        for (hour_key, indexes) in groups {
            if indexes.len() < 2 {
                continue;
            }
            let total: Duration = indexes
                .iter()
                .map(|&i| self.saved_partials[i].duration)
                .sum();
            if total < COMPLETE_HOUR_THRESHOLD {
                continue;
            }

            let first = &self.saved_partials[indexes[0]];
            let output = layout
                .complete_hours_dir
                .join(layout::complete_hour_file_name(&first.date, first.hour));
            let inputs: Vec<PathBuf> = indexes
                .iter()
                .map(|&i| self.saved_partials[i].path.clone())
                .collect();

            match writer::merge_files(inputs.clone(), output.clone()).await {
                Ok(()) => {
                    info!(
                        "Rewrote {} partials for hour {} as {}",
                        inputs.len(),
                        hour_key,
                        output.display()
                    );
                    for input in &inputs {
                        let _ = tokio::fs::remove_file(input).await;
                    }
                    let mut doomed = indexes;
                    doomed.sort_unstable_by(|a, b| b.cmp(a));
                    for index in doomed {
                        self.saved_partials.remove(index);
                    }
                    merged_hours += 1;
                }
                Err(RecorderError::EncoderUnavailable) => {
                    if self.log_gate.allow_warn("merge_encoder_unavailable") {
                        warn!("Hour merge skipped: encoder unavailable in this build");
                    }
                }
                Err(e) => {
                    warn!("Hour merge failed for {}: {}", hour_key, e);
                    self.note_error();
                }
            }
        }

        merged_hours
    }

    /// Producer disconnect: rescue everything, then go idle.
    async fn handle_disconnection(&mut self) -> usize {
        warn!("Producer disconnection: force-saving all current segments");
        let saved = self.save_all(true).await;
        self.merge_saved_partials().await;
        self.cleanup_segments();
        self.recording_active = false;
        info!(
            "Disconnection handled: {} segments saved, recording stopped",
            saved
        );
        saved
    }

    /// Producer reconnect: clean leftovers and open a fresh hour.
    async fn handle_reconnection(&mut self) -> bool {
        info!("Producer reconnection: starting new recording session");
        self.cleanup_segments();
        self.accumulated_frames = 0;
        self.last_frame = None;
        self.last_auto_save = Instant::now();
        self.start_recording().await;
        self.recording_active
    }

    /// Switch the container rate and auto-save cadence when the producer
    /// slows to a crawl, and back once it recovers.
    fn adjust_fps_mode(&mut self) {
        let Some(last) = self.last_frame else {
            return;
        };
        let interval = last.elapsed().as_secs_f64();
        if interval <= 0.0 {
            return;
        }
        let fps = 1.0 / interval;

        if fps < self.config.low_fps_threshold && !self.low_fps_mode {
            if self.log_gate.allow_warn("low_fps_mode") {
                warn!(
                    "Low FPS detected ({:.1} < {:.1}), switching to low FPS recording",
                    fps, self.config.low_fps_threshold
                );
            }
            self.low_fps_mode = true;
            self.auto_save_interval = Duration::from_secs(30);
        } else if fps >= self.config.low_fps_threshold && self.low_fps_mode {
            info!(
                "FPS recovered ({:.1}), resuming normal recording rate",
                fps
            );
            self.low_fps_mode = false;
            self.auto_save_interval = Duration::from_secs(self.config.auto_save_interval_secs);
        }
    }

    fn effective_fps(&self) -> u32 {
        if self.low_fps_mode {
            1
        } else {
            self.config.recording_fps
        }
    }

    fn note_error(&mut self) {
        self.total_errors += 1;
        self.consecutive_errors += 1;
        if self.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
            error!(
                "Recorder reached {} consecutive errors, scheduling critical recovery",
                self.consecutive_errors
            );
            self.needs_recovery = true;
        }
    }

    /// Critical recovery: stop, discard problematic state, repair the
    /// directory layout, and restart. Bounded attempts; beyond that the
    /// recorder performs an emergency reset and stays idle.
    async fn critical_recovery(&mut self) {
        self.recovery_attempts += 1;
        if self.recovery_attempts > MAX_RECOVERY_ATTEMPTS {
            error!(
                "Recovery attempt limit reached ({}), performing emergency reset",
                MAX_RECOVERY_ATTEMPTS
            );
            self.emergency_reset();
            return;
        }

        warn!(
            "Critical recovery attempt {}/{}",
            self.recovery_attempts, MAX_RECOVERY_ATTEMPTS
        );
        self.recording_active = false;
        self.cleanup_segments();
        self.saved_partials.clear();
        self.consecutive_errors = 0;

        let root = PathBuf::from(&self.config.path);
        self.layout = Some(layout::create_hour_layout(&root, Local::now()).await);
        self.recording_active = true;
        info!("Critical recovery completed, recording restarted");
    }

    /// Last resort: clear all in-memory state and resume fresh on the
    /// next frame.
    fn emergency_reset(&mut self) {
        warn!("Emergency reset: clearing all recorder state");
        self.cleanup_segments();
        self.saved_partials.clear();
        self.layout = None;
        self.recording_active = false;
        self.accumulated_frames = 0;
        self.consecutive_errors = 0;
        self.recovery_attempts = 0;
        self.low_fps_mode = false;
        self.last_frame = None;
    }

    fn cleanup_segments(&mut self) {
        for segment in &mut self.segments {
            segment.cleanup();
        }
        self.segments.clear();
    }

    async fn run_sweep(&mut self) -> Result<SweepResult, RecorderError> {
        let root = PathBuf::from(&self.config.path);
        let result = retention::sweep(&root, self.config.retention_days).await?;
        if result.files_deleted > 0 || result.dirs_removed > 0 {
            info!(
                "Retention sweep: {} files deleted ({} bytes), {} directories removed",
                result.files_deleted, result.bytes_freed, result.dirs_removed
            );
        }
        // Forget ledger entries whose files the sweep removed
        let mut kept = Vec::new();
        for partial in self.saved_partials.drain(..) {
            if partial.path.exists() {
                kept.push(partial);
            }
        }
        self.saved_partials = kept;
        Ok(result)
    }

    fn status(&self) -> RecorderStatus {
        let seconds_since_last_frame = self.last_frame.map(|at| at.elapsed().as_secs_f64());
        let connection_status = match (self.recording_active, seconds_since_last_frame) {
            (true, Some(age)) if age < DISCONNECT_TIMEOUT.as_secs_f64() => "connected",
            (true, Some(_)) => "disconnected",
            (true, None) => "waiting",
            (false, _) => "stopped",
        };

        let unsaved: Vec<&VideoSegment> = self
            .segments
            .iter()
            .filter(|s| s.file_path.is_none() && !s.is_empty())
            .collect();

        RecorderStatus {
            recording_active: self.recording_active,
            connection_status: connection_status.to_string(),
            current_hour: self
                .layout
                .as_ref()
                .map(|l| l.hour_start.format("%H:00").to_string()),
            current_directory: self
                .layout
                .as_ref()
                .map(|l| l.hour_dir.display().to_string()),
            using_fallback_directory: self
                .layout
                .as_ref()
                .map(|l| l.is_fallback)
                .unwrap_or(false),
            low_fps_mode: self.low_fps_mode,
            recording_fps: self.effective_fps(),
            auto_save_interval_secs: self.auto_save_interval.as_secs(),
            accumulated_frames: self.accumulated_frames,
            seconds_since_last_frame,
            unsaved_segments: unsaved.len(),
            frames_at_risk: unsaved.iter().map(|s| s.frame_count()).sum(),
            seconds_since_last_auto_save: self.last_auto_save.elapsed().as_secs_f64(),
            total_errors: self.total_errors,
            recovery_attempts: self.recovery_attempts,
            segments: self
                .segments
                .iter()
                .map(|s| SegmentHealth {
                    segment_number: s.segment_number,
                    frame_count: s.frame_count(),
                    duration_secs: s.duration().as_secs_f64(),
                    estimated_size_kb: s.estimated_size_kb(),
                    ready_for_save: s.is_ready_for_save(),
                    can_merge: s.can_be_merged(),
                    age_secs: s.age().as_secs_f64(),
                    error_count: s.error_count(),
                    saved: s.file_path.is_some(),
                })
                .collect(),
        }
    }
}

/// Pixel-level validation before a frame enters a segment: plausible
/// dimensions, not near-black, not near-white, not near-uniform.
fn validate_frame(pixels: &RgbImage) -> bool {
    if pixels.width() < 100 || pixels.height() < 100 {
        return false;
    }

    let (mean, variance) = rgb_stats(pixels);
    if mean < 5.0 || mean > 250.0 {
        return false;
    }
    if variance < 10.0 {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn test_config(root: &std::path::Path) -> RecordingConfig {
        let mut config = crate::config::CamgateConfig::default().recording;
        config.path = root.display().to_string();
        // Small thresholds so unit tests can exercise validity
        config.min_frames_per_segment = 5;
        config.min_segment_duration_secs = 1.0;
        config.min_frames_per_second = 1;
        config.target_segment_duration_secs = 10.0;
        config.max_segment_duration_secs = 20.0;
        config
    }

    fn service(root: &std::path::Path) -> RecorderService {
        let (_ftx, frx) = mpsc::channel(4);
        let (_ctx, crx) = mpsc::channel(4);
        RecorderService::new(test_config(root), frx, crx, CancellationToken::new())
    }

    fn good_frame() -> RecorderFrame {
        let pixels = RgbImage::from_fn(160, 120, |x, y| {
            let v = ((x * 2 + y * 3) % 255) as u8;
            Rgb([v, v / 2, v / 3])
        });
        RecorderFrame {
            pixels: Arc::new(pixels),
            jpeg: Arc::new(vec![0xFF, 0xD8, 0xFF, 0xD9]),
            at: SystemTime::now(),
        }
    }

    #[test]
    fn test_validate_frame_rejects_bad_frames() {
        // Too small
        assert!(!validate_frame(&RgbImage::from_pixel(
            50,
            50,
            Rgb([128, 128, 128])
        )));
        // Near-black
        assert!(!validate_frame(&RgbImage::from_pixel(
            160,
            120,
            Rgb([1, 1, 1])
        )));
        // Near-white
        assert!(!validate_frame(&RgbImage::from_pixel(
            160,
            120,
            Rgb([253, 253, 253])
        )));
        // Uniform
        assert!(!validate_frame(&RgbImage::from_pixel(
            160,
            120,
            Rgb([128, 128, 128])
        )));
        // Real content
        assert!(validate_frame(&good_frame().pixels));
    }

    #[tokio::test]
    async fn test_first_frame_starts_recording() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());
        assert!(!s.recording_active);

        s.on_frame(good_frame()).await;

        assert!(s.recording_active);
        assert_eq!(s.segments.len(), 1);
        assert_eq!(s.accumulated_frames, 1);
        assert!(s.layout.is_some());
    }

    #[tokio::test]
    async fn test_invalid_frames_do_not_accumulate() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());

        let bad = RecorderFrame {
            pixels: Arc::new(RgbImage::from_pixel(160, 120, Rgb([0, 0, 0]))),
            jpeg: Arc::new(vec![0xFF, 0xD8, 0xFF, 0xD9]),
            at: SystemTime::now(),
        };
        s.on_frame(bad).await;
        assert_eq!(s.accumulated_frames, 0);
    }

    #[tokio::test]
    async fn test_disconnection_clears_segments_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());
        for _ in 0..3 {
            s.on_frame(good_frame()).await;
        }
        assert!(s.recording_active);

        s.handle_disconnection().await;

        assert!(!s.recording_active);
        assert!(s.segments.is_empty());
    }

    #[tokio::test]
    async fn test_reconnection_restarts_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());
        s.handle_disconnection().await;
        assert!(!s.recording_active);

        assert!(s.handle_reconnection().await);
        assert!(s.recording_active);
        assert_eq!(s.accumulated_frames, 0);
    }

    #[tokio::test]
    async fn test_status_reflects_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());
        for _ in 0..3 {
            s.on_frame(good_frame()).await;
        }

        let status = s.status();
        assert!(status.recording_active);
        assert_eq!(status.connection_status, "connected");
        assert_eq!(status.segments.len(), 1);
        assert_eq!(status.segments[0].frame_count, 3);
        assert_eq!(status.frames_at_risk, 3);
        assert!(!status.using_fallback_directory);
    }

    #[tokio::test]
    async fn test_idle_status_is_stopped() {
        let tmp = tempfile::tempdir().unwrap();
        let s = service(tmp.path());
        let status = s.status();
        assert!(!status.recording_active);
        assert_eq!(status.connection_status, "stopped");
    }

    #[tokio::test]
    async fn test_merge_in_memory_combines_same_hour_segments() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());
        s.start_recording().await;

        // Two small same-hour segments, built directly
        for _ in 0..2 {
            s.create_segment();
            let (w, h) = (160, 120);
            if let Some(seg) = s.segments.last_mut() {
                for _ in 0..2 {
                    seg.add_frame(
                        Arc::new(vec![0xFF, 0xD8, 0xFF, 0xD9]),
                        w,
                        h,
                        SystemTime::now(),
                    );
                }
            }
        }
        assert_eq!(s.segments.len(), 2);

        let merged = s.merge_in_memory().await;
        assert_eq!(merged, 1);
        assert_eq!(s.segments.len(), 1);
        assert_eq!(s.segments[0].frame_count(), 4);
    }

    #[tokio::test]
    async fn test_emergency_reset_after_exhausted_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());
        s.start_recording().await;

        s.recovery_attempts = MAX_RECOVERY_ATTEMPTS;
        s.critical_recovery().await;

        assert!(!s.recording_active);
        assert!(s.segments.is_empty());
        assert_eq!(s.recovery_attempts, 0);
    }

    #[tokio::test]
    async fn test_error_escalation_flags_recovery() {
        let tmp = tempfile::tempdir().unwrap();
        let mut s = service(tmp.path());
        for _ in 0..MAX_CONSECUTIVE_ERRORS {
            s.note_error();
        }
        assert!(s.needs_recovery);
        assert_eq!(s.total_errors, MAX_CONSECUTIVE_ERRORS as u64);
    }
}
