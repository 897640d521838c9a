use thiserror::Error;

/// Main error type for the camgate system
#[derive(Error, Debug)]
pub enum CamgateError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Stream server error: {0}")]
    Stream(#[from] StreamError),

    #[error("Enhancer error: {0}")]
    Enhance(#[from] EnhanceError),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error("Control loop error: {0}")]
    Control(#[from] ControlError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },

    #[error("Graceful shutdown requested")]
    Shutdown,
}

/// Ingest path error types
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Frame decode failed: {details}")]
    Decode { details: String },

    #[error("Frame rejected by queue: {details}")]
    QueueRejected { details: String },

    #[error("Ingest channel error: {details}")]
    Channel { details: String },

    #[error("Producer session closed")]
    SessionClosed,
}

/// Stream server error types
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("Failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Server startup failed: {details}")]
    StartupFailed { details: String },

    #[error("Frame encoding failed: {details}")]
    FrameEncoding { details: String },

    #[error("No frame available")]
    NoFrame,

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),
}

/// Enhancer error types
#[derive(Error, Debug)]
pub enum EnhanceError {
    #[error("Filter chain failed in {mode} mode: {details}")]
    FilterChain { mode: String, details: String },

    #[error("Unknown enhancement mode: {mode}")]
    UnknownMode { mode: String },

    #[error("Per-frame budget of {budget_ms}ms exceeded")]
    BudgetExceeded { budget_ms: u64 },
}

/// Recorder error types
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Failed to create recording directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        source: std::io::Error,
    },

    #[error("Segment save failed: {details}")]
    SegmentSave { details: String },

    #[error("Segment rejected: {details}")]
    SegmentRejected { details: String },

    #[error("Video encoder unavailable on this platform or build")]
    EncoderUnavailable,

    #[error("Video encoding failed: {details}")]
    Encoding { details: String },

    #[error("Merge failed for hour {hour_key}: {details}")]
    Merge { hour_key: String, details: String },

    #[error("Retention sweep failed: {details}")]
    Retention { details: String },

    #[error("Recorder channel closed")]
    ChannelClosed,

    #[error("Recovery failed after {attempts} attempts")]
    RecoveryFailed { attempts: u32 },
}

/// Adaptive control error types
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("Invalid frame rate setting: {details}")]
    InvalidFrameRate { details: String },

    #[error("Invalid quality bounds: {details}")]
    InvalidQualityBounds { details: String },
}

impl CamgateError {
    /// Create a system error with a message
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    /// Create a component error with component name and message
    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Check if this error is recoverable without operator intervention
    pub fn is_recoverable(&self) -> bool {
        match self {
            CamgateError::Ingest(IngestError::Decode { .. }) => true,
            CamgateError::Ingest(IngestError::SessionClosed) => true,
            CamgateError::Ingest(IngestError::Channel { .. }) => true,
            CamgateError::Stream(StreamError::FrameEncoding { .. }) => true,
            CamgateError::Stream(StreamError::NoFrame) => true,
            CamgateError::Enhance(_) => true,
            CamgateError::Recorder(RecorderError::SegmentSave { .. }) => true,
            CamgateError::Recorder(RecorderError::SegmentRejected { .. }) => true,
            CamgateError::Recorder(RecorderError::Merge { .. }) => true,
            CamgateError::Recorder(RecorderError::EncoderUnavailable) => true,
            CamgateError::Io(_) => true,
            CamgateError::Shutdown => false,
            CamgateError::Config(_) => false,
            CamgateError::Recorder(RecorderError::RecoveryFailed { .. }) => false,
            _ => false,
        }
    }

    /// Get the component name associated with this error
    pub fn component_name(&self) -> &str {
        match self {
            CamgateError::Ingest(_) => "ingest",
            CamgateError::Stream(_) => "stream",
            CamgateError::Enhance(_) => "enhance",
            CamgateError::Recorder(_) => "recorder",
            CamgateError::Control(_) => "control",
            CamgateError::Config(_) => "config",
            CamgateError::Component { component, .. } => component,
            _ => "system",
        }
    }

    /// Get error severity level for structured logging
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CamgateError::Shutdown => ErrorSeverity::Info,
            CamgateError::Ingest(IngestError::Decode { .. }) => ErrorSeverity::Debug,
            CamgateError::Recorder(RecorderError::EncoderUnavailable) => ErrorSeverity::Warning,
            CamgateError::Recorder(RecorderError::RecoveryFailed { .. }) => ErrorSeverity::Critical,
            CamgateError::Config(_) => ErrorSeverity::Critical,
            _ if self.is_recoverable() => ErrorSeverity::Warning,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for structured logging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl ErrorSeverity {
    /// Convert to tracing level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            ErrorSeverity::Debug => tracing::Level::DEBUG,
            ErrorSeverity::Info => tracing::Level::INFO,
            ErrorSeverity::Warning => tracing::Level::WARN,
            ErrorSeverity::Error => tracing::Level::ERROR,
            ErrorSeverity::Critical => tracing::Level::ERROR,
        }
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, CamgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_formatting() {
        let decode_error = CamgateError::Ingest(IngestError::Decode {
            details: "truncated payload".to_string(),
        });
        assert_eq!(
            decode_error.to_string(),
            "Ingest error: Frame decode failed: truncated payload"
        );

        let system_error = CamgateError::system("Test system error");
        assert_eq!(system_error.to_string(), "System error: Test system error");
    }

    #[test]
    fn test_error_source_chains() {
        use std::error::Error;

        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let camgate_error = CamgateError::Io(io_error);

        assert!(camgate_error.source().is_some());
        assert_eq!(
            camgate_error.source().unwrap().to_string(),
            "File not found"
        );
    }

    #[test]
    fn test_recoverable_error_classification() {
        assert!(CamgateError::Ingest(IngestError::Decode {
            details: "bad".to_string()
        })
        .is_recoverable());
        assert!(CamgateError::Stream(StreamError::NoFrame).is_recoverable());
        assert!(CamgateError::Recorder(RecorderError::EncoderUnavailable).is_recoverable());

        assert!(!CamgateError::Shutdown.is_recoverable());
        assert!(
            !CamgateError::Recorder(RecorderError::RecoveryFailed { attempts: 3 })
                .is_recoverable()
        );
        assert!(!CamgateError::system("fatal").is_recoverable());
    }

    #[test]
    fn test_component_name_extraction() {
        assert_eq!(
            CamgateError::Ingest(IngestError::SessionClosed).component_name(),
            "ingest"
        );
        assert_eq!(
            CamgateError::Recorder(RecorderError::ChannelClosed).component_name(),
            "recorder"
        );
        assert_eq!(
            CamgateError::component("custom", "test").component_name(),
            "custom"
        );
        assert_eq!(CamgateError::system("test").component_name(), "system");
    }

    #[test]
    fn test_error_severity_levels() {
        use ErrorSeverity::*;

        assert_eq!(CamgateError::Shutdown.severity(), Info);
        assert_eq!(
            CamgateError::Ingest(IngestError::Decode {
                details: "bad".to_string()
            })
            .severity(),
            Debug
        );
        assert_eq!(
            CamgateError::Recorder(RecorderError::RecoveryFailed { attempts: 3 }).severity(),
            Critical
        );
        assert_eq!(
            CamgateError::Recorder(RecorderError::EncoderUnavailable).severity(),
            Warning
        );
    }
}
