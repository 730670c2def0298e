//! Error taxonomy at component boundaries.

use repltree_coord::CoordError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("coordinator unavailable: {0}")]
    CoordinatorUnavailable(String),

    #[error("coordinator session expired")]
    CoordinatorSessionExpired,

    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error("replica is readonly")]
    ReplicaReadonly,

    #[error("part {0} already exists")]
    PartAlreadyExists(String),

    #[error("part {0} not found")]
    PartNotFound(String),

    #[error("checksum mismatch for part {0}")]
    ChecksumMismatch(String),

    #[error("too many concurrent operations: {0}")]
    TooManyConcurrentOperations(String),

    #[error("operation aborted: {0}")]
    Aborted(String),

    #[error("interserver authentication failed")]
    AuthFailed,

    #[error("quorum not satisfied in time: {0}")]
    QuorumTimeout(String),

    #[error("logical invariant violated: {0}")]
    LogicalInvariantViolated(String),

    /// Coordinator errors that do not map to a domain kind (missing node,
    /// unexpected children, ...). Carried verbatim.
    #[error("coordinator error: {0}")]
    Coordinator(CoordError),

    #[error("fetch from {replica} failed: {message}")]
    FetchFailed { replica: String, message: String },
}

impl EngineError {
    /// Retry in place with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::CoordinatorUnavailable(_)
                | EngineError::TooManyConcurrentOperations(_)
                | EngineError::FetchFailed { .. }
        )
    }

    /// Abandon the attempt; the restart task owns recovery.
    pub fn is_session_expired(&self) -> bool {
        matches!(self, EngineError::CoordinatorSessionExpired)
    }

    /// Fatal to the table: go readonly and report loudly.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::LogicalInvariantViolated(_))
    }

    /// Silent during shutdown or drop; logged at INFO, never at ERROR.
    pub fn is_aborted(&self) -> bool {
        matches!(self, EngineError::Aborted(_))
    }
}

impl From<CoordError> for EngineError {
    fn from(err: CoordError) -> Self {
        match err {
            CoordError::ConnectionLoss => {
                EngineError::CoordinatorUnavailable("connection loss".into())
            }
            CoordError::SessionExpired => EngineError::CoordinatorSessionExpired,
            CoordError::BadVersion {
                path,
                expected,
                actual,
            } => EngineError::VersionConflict(format!(
                "{path}: expected {expected}, actual {actual}"
            )),
            // Op-level transport and session failures keep their kind.
            CoordError::MultiFailed { index, source } => match *source {
                CoordError::ConnectionLoss => {
                    EngineError::CoordinatorUnavailable("connection loss".into())
                }
                CoordError::SessionExpired => EngineError::CoordinatorSessionExpired,
                CoordError::BadVersion {
                    path,
                    expected,
                    actual,
                } => EngineError::VersionConflict(format!(
                    "{path}: expected {expected}, actual {actual}"
                )),
                other => EngineError::Coordinator(CoordError::MultiFailed {
                    index,
                    source: Box::new(other),
                }),
            },
            other => EngineError::Coordinator(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
