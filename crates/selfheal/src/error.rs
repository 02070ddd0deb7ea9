//! Error types for the remediation engine.

use thiserror::Error;

/// Errors surfaced by policies, primitives and their collaborators.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Condition '{condition}' is already registered")]
    AlreadyRegistered { condition: String },

    #[error("Policy '{policy}' has not been initialized")]
    NotInitialized { policy: String },

    #[error("Policy '{policy}' was already initialized")]
    AlreadyInitialized { policy: String },

    #[error("Template render error: {0}")]
    TemplateError(String),

    #[error("Template decode error: {0}")]
    DecodeError(#[from] serde_yaml::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Ticket manager error: {0}")]
    TicketError(String),

    #[error("Status query error: {0}")]
    StatusError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Remediation {kind} '{name}' failed")]
    JobFailed { kind: String, name: String },

    #[error("Polling '{name}' aborted after {errors} consecutive errors: {last}")]
    PollAborted {
        name: String,
        errors: u32,
        last: String,
    },

    #[error("context done: {0}")]
    ContextDone(String),

    #[error("Operation canceled: {0}")]
    Canceled(String),

    #[error("Aggressive remediation is disabled")]
    NotAggressive,

    #[error("Node {node} is busy: {reason}")]
    NodeBusy { node: String, reason: String },

    #[error("Node {node} must be cordoned before it is drained")]
    NotCordoned { node: String },

    #[error("Drain of node {node} did not finish within {seconds}s")]
    DrainTimeout { node: String, seconds: u64 },

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// NotFound from either our own lookups or the API server.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// Errors after which a policy should wait for the next observation
    /// instead of escalating the ticket.
    #[must_use]
    pub fn is_deferrable(&self) -> bool {
        matches!(self, Error::ContextDone(_) | Error::Canceled(_))
    }

    pub(crate) fn not_found(resource: impl Into<String>) -> Self {
        Error::NotFound {
            resource: resource.into(),
        }
    }
}
