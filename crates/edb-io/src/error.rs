//! Error type shared by transports and the I/O layer.
//!
//! The layer never invents failures of its own for calls: whatever a transport
//! returns is propagated unchanged, only its timing changes (a buffered write
//! fails when its batch is flushed, not when it was issued).

/// Status codes a transport may report, numbered as on the wire.
pub mod status_codes {
    pub const INVALID_ARGUMENT: i32 = 3;
    pub const UNAVAILABLE: i32 = 14;
}

/// RPC errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RpcError {
    /// Server process is gone or unreachable.
    #[error("server unavailable: {message}")]
    Unavailable { message: String },

    /// Server rejected the request payload.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// Any other transport-level failure.
    #[error("transport error (status {code}): {message}")]
    Transport { code: i32, message: String },

    /// I/O management was started while already active.
    #[error("I/O management is already active (mode: {mode})")]
    AlreadyActive { mode: String },
}

impl RpcError {
    /// Map a transport status to an error.
    pub fn from_status(code: i32, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            status_codes::UNAVAILABLE => Self::Unavailable { message },
            status_codes::INVALID_ARGUMENT => Self::InvalidArgument { message },
            _ => Self::Transport { code, message },
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            code: -1,
            message: message.into(),
        }
    }

    /// Whether a transport-level retry could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Result type for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;
