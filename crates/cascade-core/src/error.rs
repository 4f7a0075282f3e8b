use thiserror::Error;

/// Core error type for cascade operations.
///
/// Step-level failures are not errors: they travel through
/// [`StepOutcome`](crate::step::StepOutcome) and surface on the
/// [`WorkflowResult`](crate::result::WorkflowResult). This type covers the
/// machinery around the engine: configuration, resolution, persistence.
#[derive(Error, Debug)]
pub enum CascadeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No step registered for type id '{0}'")]
    Unresolved(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Concurrent update detected: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CascadeError {
    fn from(e: serde_json::Error) -> Self {
        CascadeError::Serialization(e.to_string())
    }
}

/// Result type alias using CascadeError.
pub type Result<T> = std::result::Result<T, CascadeError>;
