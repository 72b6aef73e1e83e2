//! Error types for the K8up operator

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Watch stream error
    #[error("Watch error: {0}")]
    Watch(#[from] kube::runtime::watcher::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Reconcile failure that must not be retried
    #[error("Permanent failure: {0}")]
    Permanent(String),

    /// Handler panicked while reconciling
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Shared state used before it was injected
    #[error("{0} used before initialization")]
    NotInitialized(&'static str),

    /// Shared state injected twice
    #[error("{0} already initialized")]
    AlreadyInitialized(&'static str),

    /// Metrics collector registration error
    #[error("Metrics registration error: {0}")]
    Registration(#[from] prometheus::Error),

    /// Initial listing for a controller failed
    #[error("Controller '{controller}' failed to list resources: {source}")]
    InitialList {
        controller: String,
        #[source]
        source: Box<Error>,
    },

    /// One or more controllers terminated with an error
    #[error("Controllers failed: {}", .0.join(", "))]
    ControllersFailed(Vec<String>),

    /// Controllers did not drain within the shutdown timeout
    #[error("Controllers did not stop within {0:?}")]
    ShutdownTimeout(Duration),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    /// Create a permanent reconcile failure
    pub fn permanent(msg: impl Into<String>) -> Self {
        Error::Permanent(msg.into())
    }

    /// Whether a reconcile that failed with this error may be retried
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::Permanent(_)
                | Error::Validation(_)
                | Error::Config(_)
                | Error::NotInitialized(_)
                | Error::AlreadyInitialized(_)
        )
    }
}
