use thiserror::Error;

/// Which native step a decode failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStage {
    /// New turn delta (or first turn with its preamble).
    Delta,
    /// Full conversation replay.
    Conversation,
    /// Rebuilding the cache from the buffer after it went stale.
    Rebuild,
    /// Isolated prompt.
    Isolated,
}

impl std::fmt::Display for DecodeStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecodeStage::Delta => "turn delta",
            DecodeStage::Conversation => "conversation",
            DecodeStage::Rebuild => "cache rebuild",
            DecodeStage::Isolated => "isolated prompt",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Model file not found: {path}")]
    ModelNotFound { path: String },

    #[error("Model load failed: {0}")]
    LoadFailed(String),

    #[error("Model unload failed: {0}")]
    UnloadFailed(String),

    #[error("No model is loaded")]
    NotLoaded,

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Decode of {stage} failed: {reason}")]
    Decode { stage: DecodeStage, reason: String },

    #[error("Context overflow: need {needed} tokens, context holds {capacity}")]
    ContextOverflow { needed: usize, capacity: usize },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Generation cancelled before it started")]
    Cancelled,

    #[error("Engine panicked: {0}")]
    Panicked(String),

    #[error("Session worker is not running")]
    WorkerUnavailable,

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;
