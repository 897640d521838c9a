pub mod layout;
pub mod retention;
pub mod segment;
pub mod service;
pub mod writer;

pub use retention::SweepResult;
pub use segment::{SegmentFrame, SegmentLimits, VideoSegment};
pub use service::{
    RecorderCommand, RecorderFrame, RecorderHandle, RecorderService, RecorderStatus, SegmentHealth,
};
