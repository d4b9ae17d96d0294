use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "tiers.anonymous.limit")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "key_codec", "fallback_store")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the gateway layer.
///
/// Store-level failures stay inside the gateway (fallback or fail-closed);
/// only `Validation` and `Handler` ever surface to callers, as HTTP 400/500.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Backend '{backend}' unavailable: {message}")]
    BackendUnavailable { backend: String, message: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Handler error: {message}{}", format_context(.context))]
    Handler {
        message: String,
        context: ErrorContext,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a backend-unavailable error for a named backend.
    pub fn backend_unavailable(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Create a new handler error with structured context
    pub fn handler_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Handler {
            message: msg.into(),
            context,
        }
    }

    /// True when the error marks a store backend as transiently down.
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::BackendUnavailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_context_builder() {
        let ctx = ErrorContext::new()
            .with_field_path("tiers.anonymous.limit")
            .with_details("must be >= 1")
            .with_source("config_validator");
        assert_eq!(ctx.field_path.as_deref(), Some("tiers.anonymous.limit"));
        assert_eq!(ctx.details.as_deref(), Some("must be >= 1"));
        assert_eq!(ctx.source.as_deref(), Some("config_validator"));
    }

    #[test]
    fn test_error_display_includes_context() {
        let err = Error::validation_with_context(
            "empty path",
            ErrorContext::new().with_source("key_codec"),
        );
        let rendered = err.to_string();
        assert!(rendered.contains("empty path"));
        assert!(rendered.contains("source: key_codec"));
    }

    #[test]
    fn test_backend_unavailable_classification() {
        let err = Error::backend_unavailable("redis", "connection refused");
        assert!(err.is_backend_unavailable());
        assert!(err.to_string().contains("redis"));

        let other = Error::validation_with_context("bad", ErrorContext::new());
        assert!(!other.is_backend_unavailable());
    }
}
