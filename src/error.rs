//! Error types for the IPFS operator
//!
//! Every failure is classified as either transient (requeue with backoff) or
//! configuration (surface on status and wait for a spec change).

use thiserror::Error;

use crate::crd::SpecValidationError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How the control loop should respond to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Not-yet-ready collaborators, timeouts, write conflicts
    Transient,
    /// Invalid spec values; retried only after the spec changes
    Configuration,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Status write conflict on {0}, resource changed since it was read")]
    Conflict(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Workload error: {0}")]
    WorkloadError(String),

    #[error("Follow session error: {0}")]
    FollowError(String),

    #[error("Validation failed: {}", format_validation(.0))]
    ValidationError(Vec<SpecValidationError>),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Reconcile cancelled")]
    Cancelled,

    #[error("Finalizer error: {0}")]
    FinalizerError(String),
}

fn format_validation(errors: &[SpecValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Classify the error for requeue decisions.
    ///
    /// Anything that is neither clearly transient nor a spec problem is
    /// treated as configuration so one bad resource cannot spin the loop.
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => match resp.code {
                409 | 404 | 429 | 500..=599 => ErrorClass::Transient,
                _ => ErrorClass::Configuration,
            },
            Error::KubeError(_)
            | Error::Conflict(_)
            | Error::NotFound(_)
            | Error::Timeout(_)
            | Error::WorkloadError(_)
            | Error::FollowError(_)
            | Error::Cancelled => ErrorClass::Transient,
            Error::ValidationError(_)
            | Error::ConfigError(_)
            | Error::SerializationError(_)
            | Error::FinalizerError(_) => ErrorClass::Configuration,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Short label used in metrics and condition reasons
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Timeout(_) => "timeout",
            Error::WorkloadError(_) => "workload",
            Error::FollowError(_) => "follow",
            Error::ValidationError(_) => "validation",
            Error::ConfigError(_) => "config",
            Error::SerializationError(_) => "serialization",
            Error::Cancelled => "cancelled",
            Error::FinalizerError(_) => "finalizer",
        }
    }

    /// Map a kube API error onto the conflict/not-found variants
    pub fn from_kube(err: kube::Error, what: impl Into<String>) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 409 => Error::Conflict(what.into()),
            kube::Error::Api(resp) if resp.code == 404 => Error::NotFound(what.into()),
            _ => Error::KubeError(err),
        }
    }
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(err: kube::runtime::finalizer::Error<Error>) -> Self {
        use kube::runtime::finalizer::Error as FinalizerError;
        match err {
            FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
            FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => {
                Error::KubeError(e)
            }
            FinalizerError::UnnamedObject => {
                Error::FinalizerError("object has no name".to_string())
            }
            FinalizerError::InvalidFinalizer => {
                Error::FinalizerError("invalid finalizer name".to_string())
            }
        }
    }
}
