//! Unified error type for Grainhost
//!
//! A single error enum shared by every crate in the workspace. Variants follow
//! how callers must react to them: authorization denials and revoked grants are
//! terminal, transport disconnections are retried once, unimplemented backend
//! features select a fallback, malformed data fails loudly.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of failure reported by a capability RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RpcErrorKind {
    /// The call failed for an application-level reason.
    Failed,
    /// The callee is temporarily out of resources.
    Overloaded,
    /// The connection to the callee was lost; the process may have died.
    Disconnected,
    /// The callee does not implement the method.
    Unimplemented,
}

impl fmt::Display for RpcErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RpcErrorKind::Failed => "failed",
            RpcErrorKind::Overloaded => "overloaded",
            RpcErrorKind::Disconnected => "disconnected",
            RpcErrorKind::Unimplemented => "unimplemented",
        };
        f.write_str(name)
    }
}

/// Error returned by a capability RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("rpc {kind}: {message}")]
pub struct RpcError {
    /// What kind of failure this is
    pub kind: RpcErrorKind,
    /// Human readable detail
    pub message: String,
}

impl RpcError {
    /// Create an RPC error of the given kind
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Create a `failed` RPC error
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Failed, message)
    }

    /// Create a `disconnected` RPC error
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Disconnected, message)
    }

    /// Create an `unimplemented` RPC error
    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(RpcErrorKind::Unimplemented, message)
    }
}

/// Unified error type for all Grainhost operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum GrainhostError {
    /// The principal may not access the grain, or lacks a required permission
    #[error("Permission denied: {message}")]
    PermissionDenied {
        /// What was denied
        message: String,
    },

    /// The grant used for this request has been revoked
    #[error("Revoked: {message}")]
    Revoked {
        /// Which grant was revoked
        message: String,
    },

    /// The grant used for this request has expired
    #[error("Expired: {message}")]
    Expired {
        /// Which grant expired
        message: String,
    },

    /// A referenced record does not exist
    #[error("Not found: {message}")]
    NotFound {
        /// What was not found
        message: String,
    },

    /// A record existed but has since been deleted or closed
    #[error("Gone: {message}")]
    Gone {
        /// What disappeared
        message: String,
    },

    /// A request payload exceeded its size limit
    #[error("Payload too large: {message}")]
    PayloadTooLarge {
        /// Which payload and which limit
        message: String,
    },

    /// The owning account is over its storage or grain quota
    #[error("Quota exceeded: {message}")]
    QuotaExceeded {
        /// Which quota was exhausted
        message: String,
    },

    /// Malformed grant, requirement or request data
    #[error("Invalid: {message}")]
    Invalid {
        /// Description of the malformed input
        message: String,
    },

    /// A capability RPC to a backend process failed
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Internal invariant violation
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the failure
        message: String,
    },
}

impl GrainhostError {
    /// Create a permission denied error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create a revoked-grant error
    pub fn revoked(message: impl Into<String>) -> Self {
        Self::Revoked {
            message: message.into(),
        }
    }

    /// Create an expired-grant error
    pub fn expired(message: impl Into<String>) -> Self {
        Self::Expired {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a gone error
    pub fn gone(message: impl Into<String>) -> Self {
        Self::Gone {
            message: message.into(),
        }
    }

    /// Create a payload too large error
    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::PayloadTooLarge {
            message: message.into(),
        }
    }

    /// Create a quota exceeded error
    pub fn quota_exceeded(message: impl Into<String>) -> Self {
        Self::QuotaExceeded {
            message: message.into(),
        }
    }

    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether this is a transport-level disconnection
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Rpc(rpc) if rpc.kind == RpcErrorKind::Disconnected)
    }

    /// Whether the backend reported the method as unimplemented
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Rpc(rpc) if rpc.kind == RpcErrorKind::Unimplemented)
    }

    /// HTTP status and reason phrase a front end should answer with
    pub fn http_status(&self) -> (u16, &'static str) {
        match self {
            Self::PermissionDenied { .. } | Self::Revoked { .. } | Self::Expired { .. } => {
                (403, "Forbidden")
            }
            Self::NotFound { .. } => (404, "Not Found"),
            Self::Gone { .. } => (410, "Gone"),
            Self::PayloadTooLarge { .. } | Self::Invalid { .. } => (400, "Bad Request"),
            Self::QuotaExceeded { .. } => (402, "Payment Required"),
            Self::Rpc(_) | Self::Internal { .. } => (500, "Internal Server Error"),
        }
    }
}

/// Standard Result type for Grainhost operations
pub type Result<T> = std::result::Result<T, GrainhostError>;

impl From<serde_json::Error> for GrainhostError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid(err.to_string())
    }
}

impl From<std::io::Error> for GrainhostError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = GrainhostError::permission_denied("grain g1");
        assert!(matches!(err, GrainhostError::PermissionDenied { .. }));
        assert_eq!(err.to_string(), "Permission denied: grain g1");
        assert_eq!(err.http_status().0, 403);
    }

    #[test]
    fn test_rpc_classification() {
        let err: GrainhostError = RpcError::disconnected("supervisor died").into();
        assert!(err.is_disconnected());
        assert!(!err.is_unimplemented());
        assert_eq!(err.to_string(), "rpc disconnected: supervisor died");

        let err: GrainhostError = RpcError::unimplemented("postStreaming").into();
        assert!(err.is_unimplemented());
        assert_eq!(err.http_status().0, 500);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "config missing");
        let err = GrainhostError::from(io_err);
        assert!(matches!(err, GrainhostError::NotFound { .. }));
    }
}
