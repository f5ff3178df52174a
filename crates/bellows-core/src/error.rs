use thiserror::Error;

/// Core error type for bellows operations.
#[derive(Error, Debug)]
pub enum BellowsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// Recoverable failure; callers retry on the next tick rather than inline.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable failure; the owning component stops instead of retrying.
    #[error("terminal failure: {0}")]
    Terminal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BellowsError {
    /// Whether the error indicates a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Whether the error indicates a failed or expired authorization.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }

    /// Whether the error is worth retrying on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Database(_))
    }
}

impl From<serde_json::Error> for BellowsError {
    fn from(e: serde_json::Error) -> Self {
        BellowsError::Serialization(e.to_string())
    }
}

/// Result type alias using BellowsError.
pub type Result<T> = std::result::Result<T, BellowsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(BellowsError::NotFound("runner".into()).is_not_found());
        assert!(BellowsError::Unauthorized("token expired".into()).is_unauthorized());
        assert!(BellowsError::Transient("connection reset".into()).is_transient());
        assert!(!BellowsError::Terminal("no such provider".into()).is_transient());
    }
}
