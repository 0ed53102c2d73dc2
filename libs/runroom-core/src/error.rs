use std::io;
use thiserror::Error;

/// Why an execution stopped before producing a process exit.
///
/// The `Display` text is what the session sees as an output line.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Language is not supported")]
    UnsupportedLanguage(String),

    #[error("No code provided")]
    EmptyCode,

    #[error("Failed to prepare source file: {0}")]
    ArtifactIo(#[source] io::Error),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

impl RunError {
    /// Bad input from the client rather than a fault on this instance.
    /// Such jobs still count as completed.
    pub fn is_user_error(&self) -> bool {
        matches!(self, RunError::UnsupportedLanguage(_) | RunError::EmptyCode)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job store error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("bus error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("event name '{0}' is reserved for execution events")]
    ReservedEvent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_classified() {
        assert!(RunError::UnsupportedLanguage("ruby".into()).is_user_error());
        assert!(RunError::EmptyCode.is_user_error());
        assert!(!RunError::ArtifactIo(io::Error::from(io::ErrorKind::PermissionDenied))
            .is_user_error());
    }

    #[test]
    fn test_messages_shown_to_session() {
        assert_eq!(
            RunError::UnsupportedLanguage("ruby".into()).to_string(),
            "Language is not supported"
        );
        assert_eq!(RunError::EmptyCode.to_string(), "No code provided");
    }
}
