use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CamgateConfig {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub quality: QualityConfig,
    pub enhancer: EnhancerConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// IP address to bind to
    #[serde(default = "default_server_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_server_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StreamConfig {
    /// Target outbound frames per second
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Minimum guaranteed frames per second
    #[serde(default = "default_min_fps")]
    pub min_fps: u32,

    /// Frame buffer capacity (number of processed frames)
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// Pending (pre-enhancement) priority queue capacity
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Delay before streaming starts once enough frames buffered (seconds)
    #[serde(default = "default_buffering_delay")]
    pub buffering_delay_secs: f64,

    /// Minimum buffered frames before streaming can start
    #[serde(default = "default_min_buffered_frames")]
    pub min_buffered_frames: usize,

    /// Hard ceiling on how long the buffering gate may hold a viewer (seconds)
    #[serde(default = "default_max_buffering_time")]
    pub max_buffering_time_secs: f64,

    /// Consecutive empty takes before a viewer enters extended recovery sleep
    #[serde(default = "default_max_empty_frames")]
    pub max_empty_frames: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct QualityConfig {
    /// Hard floor for the JPEG quality setpoint
    #[serde(default = "default_min_quality")]
    pub min_quality: u8,

    /// Hard ceiling for the JPEG quality setpoint
    #[serde(default = "default_max_quality")]
    pub max_quality: u8,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EnhancerConfig {
    /// Enhancement mode: auto, day, low_light, night, security
    #[serde(default = "default_enhancer_mode")]
    pub mode: String,

    /// Enable the enhancement stage
    #[serde(default = "default_enhancer_enabled")]
    pub enabled: bool,

    /// Per-frame CPU budget in milliseconds
    #[serde(default = "default_enhancer_budget_ms")]
    pub budget_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RecordingConfig {
    /// Root directory for recorded video
    #[serde(default = "default_recording_path")]
    pub path: String,

    /// Container frame rate for saved segments
    #[serde(default = "default_recording_fps")]
    pub recording_fps: u32,

    /// Minimum frame count before a segment may be saved normally
    #[serde(default = "default_min_frames_per_segment")]
    pub min_frames_per_segment: usize,

    /// Minimum duration before a segment may be saved normally (seconds)
    #[serde(default = "default_min_segment_duration")]
    pub min_segment_duration_secs: f64,

    /// Minimum frames-per-second-of-duration ratio for a valid segment
    #[serde(default = "default_min_frames_per_second")]
    pub min_frames_per_second: u32,

    /// Duration at which a segment rolls over (seconds)
    #[serde(default = "default_target_segment_duration")]
    pub target_segment_duration_secs: f64,

    /// Hard duration ceiling for a single segment (seconds)
    #[serde(default = "default_max_segment_duration")]
    pub max_segment_duration_secs: f64,

    /// Files below this size are never emitted as a normal save (bytes)
    #[serde(default = "default_absolute_min_segment_size")]
    pub absolute_min_segment_size_bytes: u64,

    /// Delete recordings older than this many days
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Force-save interval for at-risk small segments (seconds)
    #[serde(default = "default_auto_save_interval")]
    pub auto_save_interval_secs: u64,

    /// In-memory segment merge check interval (seconds)
    #[serde(default = "default_merge_check_interval")]
    pub merge_check_interval_secs: u64,

    /// Below this observed FPS the recorder switches to low-FPS mode
    #[serde(default = "default_low_fps_threshold")]
    pub low_fps_threshold: f64,
}

impl CamgateConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("camgate.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("server.ip", default_server_ip())?
            .set_default("server.port", default_server_port())?
            .set_default("stream.target_fps", default_target_fps())?
            .set_default("stream.min_fps", default_min_fps())?
            .set_default("stream.buffer_capacity", default_buffer_capacity() as i64)?
            .set_default("stream.queue_capacity", default_queue_capacity() as i64)?
            .set_default("stream.buffering_delay_secs", default_buffering_delay())?
            .set_default(
                "stream.min_buffered_frames",
                default_min_buffered_frames() as i64,
            )?
            .set_default(
                "stream.max_buffering_time_secs",
                default_max_buffering_time(),
            )?
            .set_default("stream.max_empty_frames", default_max_empty_frames())?
            .set_default("quality.min_quality", default_min_quality() as i64)?
            .set_default("quality.max_quality", default_max_quality() as i64)?
            .set_default("enhancer.mode", default_enhancer_mode())?
            .set_default("enhancer.enabled", default_enhancer_enabled())?
            .set_default("enhancer.budget_ms", default_enhancer_budget_ms() as i64)?
            .set_default("recording.path", default_recording_path())?
            .set_default("recording.recording_fps", default_recording_fps())?
            .set_default(
                "recording.min_frames_per_segment",
                default_min_frames_per_segment() as i64,
            )?
            .set_default(
                "recording.min_segment_duration_secs",
                default_min_segment_duration(),
            )?
            .set_default(
                "recording.min_frames_per_second",
                default_min_frames_per_second(),
            )?
            .set_default(
                "recording.target_segment_duration_secs",
                default_target_segment_duration(),
            )?
            .set_default(
                "recording.max_segment_duration_secs",
                default_max_segment_duration(),
            )?
            .set_default(
                "recording.absolute_min_segment_size_bytes",
                default_absolute_min_segment_size() as i64,
            )?
            .set_default("recording.retention_days", default_retention_days())?
            .set_default(
                "recording.auto_save_interval_secs",
                default_auto_save_interval() as i64,
            )?
            .set_default(
                "recording.merge_check_interval_secs",
                default_merge_check_interval() as i64,
            )?
            .set_default("recording.low_fps_threshold", default_low_fps_threshold())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("CAMGATE").separator("_"))
            .build()?;

        let config: CamgateConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream.target_fps == 0 {
            return Err(ConfigError::Message(
                "stream.target_fps must be greater than 0".to_string(),
            ));
        }

        if self.stream.min_fps == 0 || self.stream.min_fps > self.stream.target_fps {
            return Err(ConfigError::Message(
                "stream.min_fps must be in 1..=target_fps".to_string(),
            ));
        }

        if self.stream.buffer_capacity == 0 {
            return Err(ConfigError::Message(
                "stream.buffer_capacity must be greater than 0".to_string(),
            ));
        }

        if self.stream.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "stream.queue_capacity must be greater than 0".to_string(),
            ));
        }

        if self.stream.min_buffered_frames > self.stream.buffer_capacity {
            return Err(ConfigError::Message(
                "stream.min_buffered_frames must not exceed buffer_capacity".to_string(),
            ));
        }

        if self.quality.min_quality == 0
            || self.quality.max_quality > 100
            || self.quality.min_quality > self.quality.max_quality
        {
            return Err(ConfigError::Message(
                "quality bounds must satisfy 0 < min <= max <= 100".to_string(),
            ));
        }

        match self.enhancer.mode.as_str() {
            "auto" | "day" | "low_light" | "night" | "security" => {}
            other => {
                return Err(ConfigError::Message(format!(
                    "enhancer.mode '{}' is not one of auto/day/low_light/night/security",
                    other
                )));
            }
        }

        if self.recording.recording_fps == 0 {
            return Err(ConfigError::Message(
                "recording.recording_fps must be greater than 0".to_string(),
            ));
        }

        if self.recording.min_segment_duration_secs <= 0.0
            || self.recording.target_segment_duration_secs
                < self.recording.min_segment_duration_secs
            || self.recording.max_segment_duration_secs
                < self.recording.target_segment_duration_secs
        {
            return Err(ConfigError::Message(
                "recording segment durations must satisfy min <= target <= max".to_string(),
            ));
        }

        if self.recording.retention_days == 0 {
            return Err(ConfigError::Message(
                "recording.retention_days must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for CamgateConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                ip: default_server_ip(),
                port: default_server_port(),
            },
            stream: StreamConfig {
                target_fps: default_target_fps(),
                min_fps: default_min_fps(),
                buffer_capacity: default_buffer_capacity(),
                queue_capacity: default_queue_capacity(),
                buffering_delay_secs: default_buffering_delay(),
                min_buffered_frames: default_min_buffered_frames(),
                max_buffering_time_secs: default_max_buffering_time(),
                max_empty_frames: default_max_empty_frames(),
            },
            quality: QualityConfig {
                min_quality: default_min_quality(),
                max_quality: default_max_quality(),
            },
            enhancer: EnhancerConfig {
                mode: default_enhancer_mode(),
                enabled: default_enhancer_enabled(),
                budget_ms: default_enhancer_budget_ms(),
            },
            recording: RecordingConfig {
                path: default_recording_path(),
                recording_fps: default_recording_fps(),
                min_frames_per_segment: default_min_frames_per_segment(),
                min_segment_duration_secs: default_min_segment_duration(),
                min_frames_per_second: default_min_frames_per_second(),
                target_segment_duration_secs: default_target_segment_duration(),
                max_segment_duration_secs: default_max_segment_duration(),
                absolute_min_segment_size_bytes: default_absolute_min_segment_size(),
                retention_days: default_retention_days(),
                auto_save_interval_secs: default_auto_save_interval(),
                merge_check_interval_secs: default_merge_check_interval(),
                low_fps_threshold: default_low_fps_threshold(),
            },
        }
    }
}

// Default value functions
fn default_server_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    8000
}

fn default_target_fps() -> u32 {
    30
}
fn default_min_fps() -> u32 {
    15
}
fn default_buffer_capacity() -> usize {
    150
}
fn default_queue_capacity() -> usize {
    100
}
fn default_buffering_delay() -> f64 {
    1.0
}
fn default_min_buffered_frames() -> usize {
    8
}
fn default_max_buffering_time() -> f64 {
    2.0
}
fn default_max_empty_frames() -> u32 {
    20
}

fn default_min_quality() -> u8 {
    60
}
fn default_max_quality() -> u8 {
    90
}

fn default_enhancer_mode() -> String {
    "auto".to_string()
}
fn default_enhancer_enabled() -> bool {
    true
}
fn default_enhancer_budget_ms() -> u64 {
    50
}

fn default_recording_path() -> String {
    "security_videos".to_string()
}
fn default_recording_fps() -> u32 {
    60
}
fn default_min_frames_per_segment() -> usize {
    3600
}
fn default_min_segment_duration() -> f64 {
    60.0
}
fn default_min_frames_per_second() -> u32 {
    30
}
fn default_target_segment_duration() -> f64 {
    600.0
}
fn default_max_segment_duration() -> f64 {
    1800.0
}
fn default_absolute_min_segment_size() -> u64 {
    512_000
}
fn default_retention_days() -> u32 {
    14
}
fn default_auto_save_interval() -> u64 {
    60
}
fn default_merge_check_interval() -> u64 {
    300
}
fn default_low_fps_threshold() -> f64 {
    5.0
}
