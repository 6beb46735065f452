//! Error types for robotline-core

use thiserror::Error;

/// Main error type for the robotline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Logical error reported by the backend, kept verbatim
    #[error("{0}")]
    Backend(String),

    /// A row from the backend did not have a usable shape
    #[error("malformed {kind} payload: {message}")]
    Payload { kind: &'static str, message: String },

    /// Plan not found
    #[error("plan not found: {0}")]
    PlanNotFound(String),

    /// Step not found
    #[error("step not found: {0}")]
    StepNotFound(String),

    /// A plan cannot make the requested status change
    #[error("plan {plan_id} is {status} and cannot be {action}")]
    InvalidPlanTransition {
        plan_id: String,
        status: &'static str,
        action: &'static str,
    },

    /// Rejected user input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Change feed error
    #[error("change feed error: {0}")]
    Feed(String),
}

impl Error {
    pub(crate) fn payload(kind: &'static str, message: impl Into<String>) -> Self {
        Error::Payload {
            kind,
            message: message.into(),
        }
    }
}

/// Result type alias for robotline-core
pub type Result<T> = std::result::Result<T, Error>;
