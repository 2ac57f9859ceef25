//! Error type shared by the xrepl master subsystems.

use serde::{Deserialize, Serialize};

use crate::types::LeaderTerm;

/// Status code attached to every RPC error response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MasterErrorCode {
    /// Malformed or contradictory request.
    InvalidRequest,
    /// A referenced stream, table, namespace or group does not exist.
    ObjectNotFound,
    /// Duplicate slot name or replication group.
    ObjectAlreadyPresent,
    /// Invariant violation detected while serving the request.
    IllegalState,
    /// This master is not the leader.
    NotTheLeader,
    /// Unexpected failure in a collaborator.
    InternalError,
    /// Anything else.
    UnknownError,
}

/// Error types for CDC stream and xCluster replication metadata operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MasterError {
    /// Malformed or contradictory request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The referenced object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object already exists.
    #[error("already present: {0}")]
    AlreadyPresent(String),

    /// An invariant would be violated, or a race was detected late.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The operation was aborted on purpose.
    #[error("aborted: {0}")]
    Aborted(String),

    /// A deadline expired while waiting on fan-out completion or polling.
    #[error("timed out: {0}")]
    TimedOut(String),

    /// A write was issued with a term that is no longer the leader term.
    #[error("not the leader: write term {requested}, current term {current}")]
    NotLeader {
        /// Term of the current leader.
        current: LeaderTerm,
        /// Term the write was issued under.
        requested: LeaderTerm,
    },

    /// A remote producer RPC failed.
    #[error("remote error: {0}")]
    Remote(String),

    /// The request asks for something this master does not support.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Unexpected failure in a collaborator.
    #[error("internal error: {0}")]
    Internal(String),

    /// A persisted record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<bincode::Error> for MasterError {
    fn from(e: bincode::Error) -> Self {
        MasterError::Serialization(e.to_string())
    }
}

impl MasterError {
    /// Maps the error to the status code reported to RPC callers.
    pub fn code(&self) -> MasterErrorCode {
        match self {
            MasterError::InvalidArgument(_) | MasterError::NotSupported(_) => {
                MasterErrorCode::InvalidRequest
            }
            MasterError::NotFound(_) => MasterErrorCode::ObjectNotFound,
            MasterError::AlreadyPresent(_) => MasterErrorCode::ObjectAlreadyPresent,
            MasterError::IllegalState(_) => MasterErrorCode::IllegalState,
            MasterError::NotLeader { .. } => MasterErrorCode::NotTheLeader,
            MasterError::Internal(_) | MasterError::Serialization(_) => {
                MasterErrorCode::InternalError
            }
            MasterError::Aborted(_) | MasterError::TimedOut(_) | MasterError::Remote(_) => {
                MasterErrorCode::UnknownError
            }
        }
    }

    /// Returns true for [`MasterError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, MasterError::NotFound(_))
    }

    /// Returns true for [`MasterError::TimedOut`].
    pub fn is_timed_out(&self) -> bool {
        matches!(self, MasterError::TimedOut(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = MasterError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            MasterError::InvalidArgument("x".into()).code(),
            MasterErrorCode::InvalidRequest
        );
        assert_eq!(
            MasterError::NotFound("x".into()).code(),
            MasterErrorCode::ObjectNotFound
        );
        assert_eq!(
            MasterError::AlreadyPresent("x".into()).code(),
            MasterErrorCode::ObjectAlreadyPresent
        );
        assert_eq!(
            MasterError::NotLeader {
                current: LeaderTerm::new(2),
                requested: LeaderTerm::new(1),
            }
            .code(),
            MasterErrorCode::NotTheLeader
        );
    }

    #[test]
    fn test_bincode_error_converts() {
        let bad: std::result::Result<String, bincode::Error> = bincode::deserialize(&[0xff]);
        let err: MasterError = bad.unwrap_err().into();
        assert!(matches!(err, MasterError::Serialization(_)));
        assert_eq!(err.code(), MasterErrorCode::InternalError);
    }

    #[test]
    fn test_display() {
        let err = MasterError::NotFound("stream abc".into());
        assert_eq!(err.to_string(), "not found: stream abc");
    }
}
