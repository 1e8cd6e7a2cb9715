use thiserror::Error;

#[derive(Debug, Error)]
pub enum GearshiftError {
    /// A named connection, worker or capability is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request violates a task-level invariant.
    #[error("Domain error: {0}")]
    Domain(String),

    /// Any failure reported by the persistence layer.
    #[error("Database error: {0}")]
    Storage(String),

    /// A broker call failed for one connection.
    #[error("Dispatch error ({connection}): {reason}")]
    Transport { connection: String, reason: String },
}

impl GearshiftError {
    /// Short, stable error code for CLI output and logs.
    pub fn code(&self) -> &'static str {
        match self {
            GearshiftError::Config(_) => "CONFIG_ERROR",
            GearshiftError::Domain(_) => "DOMAIN_ERROR",
            GearshiftError::Storage(_) => "DATABASE_ERROR",
            GearshiftError::Transport { .. } => "DISPATCH_ERROR",
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        GearshiftError::Config(message.into())
    }

    pub fn domain(message: impl Into<String>) -> Self {
        GearshiftError::Domain(message.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        GearshiftError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GearshiftError>;
