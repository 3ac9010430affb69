//! Error types for rtpchain.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    // Configuration errors
    #[error("invalid stage configuration: at least one stage must be enabled")]
    NoStageEnabled,

    #[error("failed to parse configuration: {0}")]
    Config(#[from] toml::de::Error),

    // Packet delivery errors
    /// The stage no longer accepts input. This is the expected shutdown
    /// signal for forwarding links, not a fault.
    #[error("stage input closed")]
    PipeClosed,

    /// A per-packet delivery failure. Links log these and keep going.
    #[error("delivery failed in {stage}: {message}")]
    Delivery { stage: String, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    /// Builds a delivery error tagged with the failing stage's identifier.
    pub fn delivery(stage: &str, message: impl Into<String>) -> Self {
        ChainError::Delivery {
            stage: stage.to_string(),
            message: message.into(),
        }
    }

    /// True for the closed-pipe condition, the one error a forwarding link
    /// treats as termination rather than something to report.
    pub fn is_pipe_closed(&self) -> bool {
        matches!(self, ChainError::PipeClosed)
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, ChainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_stage_enabled_display() {
        let error = ChainError::NoStageEnabled;
        assert_eq!(
            error.to_string(),
            "invalid stage configuration: at least one stage must be enabled"
        );
    }

    #[test]
    fn test_pipe_closed_display() {
        assert_eq!(ChainError::PipeClosed.to_string(), "stage input closed");
    }

    #[test]
    fn test_delivery_display() {
        let error = ChainError::delivery("RTPForwarder", "socket send failed");
        assert_eq!(
            error.to_string(),
            "delivery failed in RTPForwarder: socket send failed"
        );
    }

    #[test]
    fn test_is_pipe_closed() {
        assert!(ChainError::PipeClosed.is_pipe_closed());
        assert!(!ChainError::NoStageEnabled.is_pipe_closed());
        assert!(!ChainError::delivery("x", "y").is_pipe_closed());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error: ChainError = io_error.into();
        assert!(matches!(error, ChainError::Io(_)));
    }
}
