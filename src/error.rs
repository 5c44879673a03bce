//! Unified error type for the capture-and-transcription pipeline

use std::error::Error;
use std::fmt;

/// Errors surfaced by the pipeline components.
///
/// Every variant carries the internal detail for diagnostics; the short
/// string shown to the user comes from [`PipelineError::user_message`] and
/// never round-trips the detail.
#[derive(Debug, Clone)]
pub enum PipelineError {
    /// Microphone access denied or no input device present
    Permission(String),

    /// Transcription request or model download failed
    Network(String),

    /// Engine bootstrap or model load failed; safe to retry initialization
    Initialization(String),

    /// A streaming session is already active
    AlreadyStreaming,

    /// Unknown model size tier; fails before any network call
    UnsupportedModel(String),

    /// Malformed or unparseable audio container
    InvalidAudio(String),

    /// I/O error (cache files, temp files)
    Io(String),
}

impl PipelineError {
    /// Short user-facing message for this error.
    pub fn user_message(&self) -> &'static str {
        match self {
            PipelineError::Permission(_) => "Microphone access was denied or no device is available",
            PipelineError::Network(_) => "Transcription service is unreachable, please try again",
            PipelineError::Initialization(_) => "The speech engine failed to start",
            PipelineError::AlreadyStreaming => "A transcription stream is already running",
            PipelineError::UnsupportedModel(_) => "Unknown model size",
            PipelineError::InvalidAudio(_) => "The recorded audio could not be processed",
            PipelineError::Io(_) => "A local file operation failed",
        }
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Permission(msg) => write!(f, "Permission error: {}", msg),
            PipelineError::Network(msg) => write!(f, "Network error: {}", msg),
            PipelineError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
            PipelineError::AlreadyStreaming => write!(f, "Already streaming"),
            PipelineError::UnsupportedModel(msg) => write!(f, "Unsupported model tier: {}", msg),
            PipelineError::InvalidAudio(msg) => write!(f, "Invalid audio: {}", msg),
            PipelineError::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl Error for PipelineError {}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::Network(err.to_string())
    }
}

impl From<hound::Error> for PipelineError {
    fn from(err: hound::Error) -> Self {
        PipelineError::InvalidAudio(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_are_short_and_detail_free() {
        let err = PipelineError::Network("connection reset by peer (os error 104)".to_string());
        assert!(!err.user_message().contains("os error"));
        assert!(!err.user_message().is_empty());
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Io(_)));
    }
}
