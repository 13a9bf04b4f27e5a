use std::fmt;
use thiserror::Error;
use tokio::time::Duration;

use crate::ceph::command::CommandError;

/// Requeue interval for peers that exist but are not ready yet
pub const DEPENDENCY_REQUEUE: Duration = Duration::from_secs(10);
/// Requeue interval for transient failures
pub const TRANSIENT_REQUEUE: Duration = Duration::from_secs(15);

#[derive(Error, Debug)]
pub enum StdError {
    #[error("JsonSerializationError: {0}")]
    JsonSerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer Error: {0}")]
    // NB: awkward type because finalizer::Error embeds the reconciler error (which is this)
    // so boxing this error to break cycles
    FinalizerError(#[source] Box<kube::runtime::finalizer::Error<Error>>),

    #[error("MetadataMissing: {0}")]
    MetadataMissing(String),

    #[error("InvalidArgument: {0}")]
    InvalidArgument(String),

    #[error("DecodingError: {0}")]
    DecodingError(String),

    #[error("SerializationError: {0}")]
    SerializationError(String),

    #[error("HttpError: {0}")]
    HttpError(String),

    #[error("IoError: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CommandError: {0}")]
    CommandError(#[from] CommandError),

    #[error("NoNodesAvailable: {0}")]
    NoNodesAvailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl StdError {
    pub fn metric_label(&self) -> String {
        match self {
            StdError::JsonSerializationError(_) => "json",
            StdError::KubeError(_) => "kube",
            StdError::FinalizerError(_) => "finalizer",
            StdError::MetadataMissing(_) => "metadata_missing",
            StdError::InvalidArgument(_) => "invalid_argument",
            StdError::DecodingError(_) => "decoding",
            StdError::SerializationError(_) => "serialization",
            StdError::HttpError(_) => "http",
            StdError::IoError(_) => "io",
            StdError::CommandError(_) => "command",
            StdError::NoNodesAvailable(_) => "no_nodes_available",
            StdError::Timeout(_) => "timeout",
            StdError::Cancelled => "cancelled",
            StdError::Context { source, .. } => return source.metric_label(),
        }
        .to_string()
    }
}

#[derive(Error, Debug)]
pub struct ErrorWithRequeue {
    pub duration: Duration,
    pub error: StdError,
}

impl ErrorWithRequeue {
    pub fn new(error: StdError, duration: Duration) -> ErrorWithRequeue {
        ErrorWithRequeue { error, duration }
    }

    pub fn metric_label(&self) -> String {
        self.error.metric_label()
    }
}

impl fmt::Display for ErrorWithRequeue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

/// How the reconcile loop and the status reporter treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Requeue with backoff; never shown as `Failed`
    Transient,
    /// A peer resource is absent or not ready; `Progressing` and a short requeue
    DependencyMissing,
    /// Deletion refused while dependents exist; condition only, wait for a watch event
    BlockedByDependents,
    /// The declarative spec fails semantic validation; `Failed` until the spec changes
    Invalid,
    /// Operator will not auto-repair; `Failed` with a specific reason
    Fatal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "Transient"),
            ErrorKind::DependencyMissing => write!(f, "DependencyMissing"),
            ErrorKind::BlockedByDependents => write!(f, "BlockedByDependents"),
            ErrorKind::Invalid => write!(f, "Invalid"),
            ErrorKind::Fatal => write!(f, "Fatal"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Standard Error: {0}")]
    StdError(#[from] StdError),

    #[error("Error With Requeue: {0}")]
    ErrorWithRequeue(#[source] ErrorWithRequeue),

    #[error("waiting for {peer}: {message}")]
    DependencyMissing { peer: String, message: String },

    #[error("deletion is blocked by dependents: {}", blockers.join(", "))]
    BlockedByDependents { blockers: Vec<String> },

    #[error("invalid spec: {0}")]
    Invalid(String),

    #[error("{reason}: {message}")]
    Fatal { reason: String, message: String },
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::StdError(e) => e.metric_label(),
            Error::ErrorWithRequeue(e) => e.metric_label(),
            Error::DependencyMissing { .. } => "dependency_missing".to_string(),
            Error::BlockedByDependents { .. } => "blocked_by_dependents".to_string(),
            Error::Invalid(_) => "invalid".to_string(),
            Error::Fatal { .. } => "fatal".to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::StdError(StdError::Context { source, .. }) => source.kind(),
            Error::StdError(StdError::InvalidArgument(_)) => ErrorKind::Invalid,
            Error::StdError(StdError::NoNodesAvailable(_)) => ErrorKind::Invalid,
            Error::StdError(_) | Error::ErrorWithRequeue(_) => ErrorKind::Transient,
            Error::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            Error::BlockedByDependents { .. } => ErrorKind::BlockedByDependents,
            Error::Invalid(_) => ErrorKind::Invalid,
            Error::Fatal { .. } => ErrorKind::Fatal,
        }
    }

    /// Short CamelCase reason used for status conditions and events
    pub fn reason(&self) -> String {
        match self {
            Error::StdError(StdError::Context { source, .. }) => source.reason(),
            Error::StdError(StdError::NoNodesAvailable(_)) => "NoNodesAvailable".to_string(),
            Error::Fatal { reason, .. } => reason.clone(),
            other => other.kind().to_string(),
        }
    }

    /// Explicit requeue interval carried by the error, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Error::StdError(StdError::Context { source, .. }) => source.requeue_after(),
            Error::ErrorWithRequeue(e) => Some(e.duration),
            Error::StdError(_) => Some(TRANSIENT_REQUEUE),
            Error::DependencyMissing { .. } => Some(DEPENDENCY_REQUEUE),
            _ => None,
        }
    }

    pub fn requeue(error: StdError, duration: Duration) -> Self {
        Error::ErrorWithRequeue(ErrorWithRequeue::new(error, duration))
    }

    pub fn dependency(peer: impl Into<String>, message: impl Into<String>) -> Self {
        Error::DependencyMissing {
            peer: peer.into(),
            message: message.into(),
        }
    }

    pub fn fatal(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Fatal {
            reason: reason.into(),
            message: message.into(),
        }
    }

    /// The exit code of the command that produced this error, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::StdError(StdError::CommandError(e)) => e.exit_code(),
            Error::StdError(StdError::Context { source, .. }) => source.exit_code(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::StdError(StdError::KubeError(kube::Error::Api(resp))) => resp.code == 404,
            Error::StdError(StdError::Context { source, .. }) => source.is_not_found(),
            _ => false,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::StdError(StdError::KubeError(e))
    }
}

impl From<CommandError> for Error {
    fn from(e: CommandError) -> Self {
        Error::StdError(StdError::CommandError(e))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::StdError(StdError::IoError(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::StdError(StdError::JsonSerializationError(e))
    }
}

/// Wraps lower level errors with a description of the failed operation
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            Error::StdError(StdError::Context {
                context: context.into(),
                source: Box::new(e.into()),
            })
        })
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| {
            Error::StdError(StdError::Context {
                context: f(),
                source: Box::new(e.into()),
            })
        })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_the_inner_kind() {
        let inner: Result<()> = Err(Error::fatal("FsidMismatch", "stored fsid differs"));
        let wrapped = inner.context("failed to start mons").unwrap_err();
        assert_eq!(wrapped.kind(), ErrorKind::Fatal);
        assert_eq!(wrapped.reason(), "FsidMismatch");
        assert!(wrapped.to_string().starts_with("Standard Error: failed to start mons"));
    }

    #[test]
    fn command_errors_are_transient_and_carry_exit_codes() {
        let err: Error = CommandError::Exit {
            summary: "ceph orch set".to_string(),
            code: 22,
            stderr: "module not ready".to_string(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.exit_code(), Some(22));
        assert_eq!(err.requeue_after(), Some(TRANSIENT_REQUEUE));
        assert_eq!(err.metric_label(), "command");
    }

    #[test]
    fn dependency_and_invalid_kinds() {
        let dep = Error::dependency("CephObjectStore my-store", "not ready");
        assert_eq!(dep.kind(), ErrorKind::DependencyMissing);
        assert_eq!(dep.requeue_after(), Some(DEPENDENCY_REQUEUE));

        let invalid = Error::Invalid("missing script".to_string());
        assert_eq!(invalid.kind(), ErrorKind::Invalid);
        assert_eq!(invalid.requeue_after(), None);

        let nodes: Error = StdError::NoNodesAvailable("no nodes for mon d".into()).into();
        assert_eq!(nodes.kind(), ErrorKind::Invalid);
        assert_eq!(nodes.reason(), "NoNodesAvailable");
    }
}
