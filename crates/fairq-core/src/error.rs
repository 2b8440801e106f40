//! Error types for fairq

use thiserror::Error;

/// Main error type for fairq
#[derive(Error, Debug)]
pub enum FairqError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Submitted bundle carries a missing or malformed job descriptor
    #[error("Invalid submission: {0}")]
    InvalidSubmission(String),

    /// Executor is not on the allow-list
    #[error("Unauthorized executor: {0}")]
    Unauthorized(String),

    /// Image build failed
    #[error("Build error: {0}")]
    Build(String),

    /// Not enough free GPU devices
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The runtime does not know the container
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Snapshot read or write failed
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Feature path that is known to be missing
    #[error("Not implemented: {0}")]
    Unimplemented(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for fairq operations
pub type FairqResult<T> = Result<T, FairqError>;

impl FairqError {
    /// Whether the failed unit of work should be retried on a later cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, FairqError::ResourceExhausted(_))
    }

    /// Whether a bundle failing with this error belongs in quarantine
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            FairqError::InvalidSubmission(_) | FairqError::Unauthorized(_)
        )
    }
}

impl From<serde_json::Error> for FairqError {
    fn from(err: serde_json::Error) -> Self {
        FairqError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for FairqError {
    fn from(err: toml::de::Error) -> Self {
        FairqError::Config(err.to_string())
    }
}

impl From<::config::ConfigError> for FairqError {
    fn from(err: ::config::ConfigError) -> Self {
        FairqError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = FairqError::Config("invalid config".to_string());
        assert_eq!(err.to_string(), "Configuration error: invalid config");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: FairqError = io_err.into();
        assert!(matches!(err, FairqError::Io(_)));
    }

    #[test]
    fn test_only_resource_exhaustion_is_transient() {
        assert!(FairqError::ResourceExhausted("gpu".to_string()).is_transient());
        assert!(!FairqError::Runtime("bad flag".to_string()).is_transient());
        assert!(!FairqError::Build("oops".to_string()).is_transient());
    }

    #[test]
    fn test_submission_errors() {
        assert!(FairqError::Unauthorized("mallory".to_string()).is_submission_error());
        assert!(FairqError::InvalidSubmission("no name".to_string()).is_submission_error());
        assert!(!FairqError::Build("oops".to_string()).is_submission_error());
    }
}
