// Core building blocks
pub mod buffer;
pub mod config;
pub mod control;
pub mod enhance;
pub mod error;
pub mod frame;
pub mod logfilter;
pub mod metrics;
pub mod quality;
pub mod queue;
pub mod stats;

// Pipeline tasks
pub mod ingest;
pub mod processor;
pub mod recorder;
pub mod streaming;

// Shared state and application coordination
pub mod app;
pub mod state;

// Re-export common types at the crate root
pub use app::Camgate;
pub use buffer::{BufferingStatus, FrameBuffer};
pub use config::CamgateConfig;
pub use control::{AdaptiveController, ControlOutputs, FrameRateController, SystemState};
pub use enhance::{AdaptiveEnhancer, EnhanceMode, EnhanceReport, EnhancerSettings, FrameEnhancer};
pub use error::{CamgateError, Result};
pub use frame::FrameEnvelope;
pub use logfilter::LogGate;
pub use metrics::NetworkMetrics;
pub use queue::{FramePriorityQueue, PushOutcome};
pub use recorder::{RecorderFrame, RecorderHandle, RecorderService, RecorderStatus, VideoSegment};
pub use state::{PipelineShared, SharedPipeline};
pub use stats::{PerformanceStats, StatsSnapshot};
pub use streaming::{ServerState, StreamServer};
