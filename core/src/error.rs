use thiserror::Error;

/// oci-relay error types
#[derive(Error, Debug)]
pub enum RelayError {
    /// Manifest or blob absent from the store
    #[error("Not found: {reference}")]
    NotFound { reference: String },

    /// Caller error: bad reference, unmatched overwrite, invalid config
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Digest or size mismatch between content and its descriptor
    #[error("Integrity error: {digest} - {message}")]
    IntegrityError { digest: String, message: String },

    /// Transport, auth, server-side or timeout failure
    #[error("Registry error: {registry} - {message}")]
    RegistryError { registry: String, message: String },

    /// Local stream read/write failure
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Malformed JSON/YAML document
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl RelayError {
    /// Whether re-running the whole replication may succeed.
    ///
    /// Only transport-level failures qualify. Integrity and configuration
    /// errors would reproduce with the same input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayError::RegistryError { .. })
    }

    /// Shorthand for a `RegistryError`.
    pub fn registry(registry: impl Into<String>, message: impl Into<String>) -> Self {
        RelayError::RegistryError {
            registry: registry.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for RelayError {
    fn from(err: serde_yaml::Error) -> Self {
        RelayError::SerializationError(err.to_string())
    }
}

/// Result type alias for oci-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;
