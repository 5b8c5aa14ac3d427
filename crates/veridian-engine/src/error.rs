use thiserror::Error;
use veridian_serving::ServingError;

/// Request-scope error taxonomy. Kinds are stable wire strings; the facade
/// maps them to HTTP statuses.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model integrity: {0}")]
    ModelIntegrity(String),

    #[error("backend transport: {0}")]
    BackendTransport(String),

    #[error("backend protocol: {0}")]
    BackendProtocol(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl InferenceError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::ModelIntegrity(_) => "MODEL_INTEGRITY",
            Self::BackendTransport(_) => "BACKEND_TRANSPORT",
            Self::BackendProtocol(_) => "BACKEND_PROTOCOL",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Cancelled(_) => "CANCELLED",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<ServingError> for InferenceError {
    fn from(err: ServingError) -> Self {
        match err {
            ServingError::Transport { .. } => Self::BackendTransport(err.to_string()),
            // A serving-reported model/tensor mismatch is not retryable and
            // surfaces with the same request-fatal class as a broken exchange.
            ServingError::Protocol { .. } | ServingError::Backend { .. } => {
                Self::BackendProtocol(err.to_string())
            }
        }
    }
}
