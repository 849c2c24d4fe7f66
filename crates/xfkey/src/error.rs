//! Error types for kernel IPsec operations.

use std::io;

/// Result type for kernel IPsec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while talking to the kernel IPsec subsystem.
///
/// The variants fall into five classes, see [`ErrorClass`]:
/// transport failures, protocol violations while decoding, kernel
/// rejections, consistency errors of the in-memory policy mirror and
/// configuration errors raised before any kernel call.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error from socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket setup or I/O failure with operation context.
    #[error("{operation}: {source}")]
    Transport {
        /// The socket operation that failed.
        operation: &'static str,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The kernel accepted fewer bytes than the framed message.
    #[error("partial write: {written} of {expected} bytes")]
    PartialWrite {
        /// Bytes actually written.
        written: usize,
        /// Length of the framed message.
        expected: usize,
    },

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Kernel rejected a request.
    #[error("{operation}: {message} (errno {errno})")]
    Kernel {
        /// The operation that failed.
        operation: String,
        /// The errno value from the kernel (positive).
        errno: i32,
        /// Human-readable error message.
        message: String,
    },

    /// Message was truncated.
    #[error("message truncated: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Expected message length.
        expected: usize,
        /// Actual bytes available.
        actual: usize,
    },

    /// Malformed or overrunning extension/attribute.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Policy id missing from the in-memory mirror.
    #[error("policy {id} not found in policy store")]
    PolicyNotFound {
        /// Kernel policy id / index.
        id: u32,
    },

    /// Algorithm has no encoding for the selected backend.
    #[error("algorithm {algorithm} not supported by {backend} backend")]
    UnsupportedAlgorithm {
        /// Backend name ("pfkey" or "xfrm").
        backend: &'static str,
        /// Algorithm display name.
        algorithm: String,
    },

    /// Invalid configuration or request parameters.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Coarse error classification used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Socket open/bind/send/receive failure.
    Transport,
    /// Malformed message; dropped, socket keeps running.
    ProtocolViolation,
    /// Non-zero kernel ack.
    KernelRejection,
    /// In-memory mirror is stale.
    Consistency,
    /// Rejected before any kernel call.
    Configuration,
}

impl Error {
    /// Create a kernel error with operation context from an errno value.
    ///
    /// Accepts both the negative netlink convention and the positive
    /// PF_KEY `sadb_msg_errno` convention.
    pub fn from_errno_with_context(errno: i32, operation: impl Into<String>) -> Self {
        let errno = errno.abs();
        let message = io::Error::from_raw_os_error(errno).to_string();
        Self::Kernel {
            operation: operation.into(),
            errno,
            message,
        }
    }

    /// Wrap an I/O error with the socket operation that produced it.
    pub fn transport(operation: &'static str, source: io::Error) -> Self {
        Self::Transport { operation, source }
    }

    /// Classify this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::Transport { .. } | Self::PartialWrite { .. } => {
                ErrorClass::Transport
            }
            Self::Truncated { .. } | Self::ProtocolViolation(_) => ErrorClass::ProtocolViolation,
            Self::Kernel { .. } => ErrorClass::KernelRejection,
            Self::PolicyNotFound { .. } => ErrorClass::Consistency,
            Self::UnsupportedAlgorithm { .. } | Self::Config(_) | Self::Json(_) => {
                ErrorClass::Configuration
            }
        }
    }

    /// Check if this is a kernel rejection.
    pub fn is_kernel_rejection(&self) -> bool {
        self.class() == ErrorClass::KernelRejection
    }

    /// Check if this is a decoding failure.
    pub fn is_protocol_violation(&self) -> bool {
        self.class() == ErrorClass::ProtocolViolation
    }

    /// Check if the in-memory policy mirror is stale.
    pub fn is_consistency(&self) -> bool {
        self.class() == ErrorClass::Consistency
    }

    /// Check if this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        self.class() == ErrorClass::Configuration
    }

    /// Check if this is a "not found" error (ENOENT, ESRCH).
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kernel { errno, .. } => matches!(*errno, libc::ENOENT | libc::ESRCH),
            Self::PolicyNotFound { .. } => true,
            _ => false,
        }
    }

    /// Check if this is an "already exists" error (EEXIST).
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::Kernel { errno, .. } if *errno == libc::EEXIST)
    }

    /// Get the errno value if this is a kernel error.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Kernel { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}
