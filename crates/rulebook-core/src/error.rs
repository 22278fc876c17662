use thiserror::Error;

/// Errors raised by the tutor core.
///
/// Most of these never reach the UI: the session controller contains them at
/// the pipeline stage that produced them and turns them into a defined state.
#[derive(Debug, Error)]
pub enum TutorError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Document ingestion failed: {0}")]
    Ingestion(String),

    #[error("Chat completion failed: {0}")]
    Completion(String),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Audio playback failed: {0}")]
    Playback(String),

    #[error("Rule search failed: {0}")]
    Search(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Not supported on this device: {0}")]
    Unsupported(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TutorError>;
