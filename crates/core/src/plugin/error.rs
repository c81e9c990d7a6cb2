//! Error types for processing plugins.

use thiserror::Error;

/// Errors a processing plugin can report.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PluginError {
    /// An option name or value is not supported.
    #[error("invalid option {name}: {reason}")]
    InvalidOption { name: String, reason: String },

    /// A protocol extension is not supported.
    #[error("invalid extension {name}: {reason}")]
    InvalidExtension { name: String, reason: String },

    /// The catalog item does not exist.
    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// Acquisition or delivery failed.
    #[error("processing failed: {message}")]
    Processing { message: String, retryable: bool },

    /// The order-level package could not be produced.
    #[error("packaging failed: {0}")]
    Packaging(String),
}

impl PluginError {
    pub fn invalid_option(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PluginError::InvalidOption {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_extension(name: impl Into<String>, reason: impl Into<String>) -> Self {
        PluginError::InvalidExtension {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// A transient failure the engine may retry.
    pub fn transient(message: impl Into<String>) -> Self {
        PluginError::Processing {
            message: message.into(),
            retryable: true,
        }
    }

    /// A failure that retrying cannot fix.
    pub fn permanent(message: impl Into<String>) -> Self {
        PluginError::Processing {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PluginError::Processing { retryable: true, .. })
    }

    /// Returns true for errors caused by the submitted request itself.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            PluginError::InvalidOption { .. } | PluginError::InvalidExtension { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PluginError::transient("timeout").is_retryable());
        assert!(!PluginError::permanent("corrupt").is_retryable());
        assert!(!PluginError::ItemNotFound("x".into()).is_retryable());
        assert!(!PluginError::Packaging("x".into()).is_retryable());
    }

    #[test]
    fn test_validation_classification() {
        assert!(PluginError::invalid_option("format", "unknown").is_validation());
        assert!(PluginError::invalid_extension("x", "unknown").is_validation());
        assert!(!PluginError::transient("x").is_validation());
    }

    #[test]
    fn test_error_display() {
        let err = PluginError::invalid_option("format", "unsupported value PNG");
        assert_eq!(err.to_string(), "invalid option format: unsupported value PNG");
    }
}
