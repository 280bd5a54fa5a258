use thiserror::Error;

/// Errors produced by the termhub session layer and protocol.
#[derive(Debug, Error)]
pub enum TermError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("process spawn failed: {0}")]
    ProcessSpawnFailed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("session attached elsewhere")]
    Detached,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for TermError {
    fn from(e: serde_json::Error) -> Self {
        TermError::InvalidMessage(e.to_string())
    }
}

impl TermError {
    /// Whether this error was caused by the terminal device or the connection
    /// rather than by the caller's request.
    pub fn is_io(&self) -> bool {
        matches!(self, TermError::Io(_) | TermError::Transport(_))
    }
}

pub type TermResult<T> = Result<T, TermError>;
