//! Error types for policy schema loading.

/// Policy schema errors.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Schema text could not be parsed.
    #[error("failed to parse policy schema ({format}): {message}")]
    Parse { format: &'static str, message: String },

    /// A service or method name was empty.
    #[error("empty {what} name in policy schema")]
    EmptyName { what: &'static str },

    /// Two flags on the same method contradict each other.
    #[error("conflicting flags on {service}/{method}: {reason}")]
    ConflictingFlags {
        service: String,
        method: String,
        reason: String,
    },

    /// An invalidation scope entry is malformed.
    #[error("invalid invalidation scope on {service}/{method}: {reason}")]
    InvalidScope {
        service: String,
        method: String,
        reason: String,
    },
}

impl From<serde_yaml::Error> for PolicyError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse {
            format: "yaml",
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PolicyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse {
            format: "json",
            message: err.to_string(),
        }
    }
}

/// Result type for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;
