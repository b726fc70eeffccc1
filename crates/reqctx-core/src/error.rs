//! Context error types and their stable codes.

use uuid::Uuid;

/// Stable error codes, one per [`ContextError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextErrorCode {
    /// Tracked work was requested where no Tokio runtime is available.
    Unsupported,
    /// A write was attempted outside any frame of the scope.
    NoActive,
    /// A fault was caught by an isolated execution region.
    Contained,
    /// Runtime configuration could not be parsed.
    Config,
}

impl ContextErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unsupported => "CTX_UNSUPPORTED",
            Self::NoActive => "CTX_NO_ACTIVE",
            Self::Contained => "CTX_CONTAINED",
            Self::Config => "CTX_CONFIG",
        }
    }
}

impl std::fmt::Display for ContextErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by context creation, entry and writes.
///
/// Reads never produce an error: a missing context is `None`.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("context tracking is not supported here: {0}")]
    UnsupportedEnvironment(String),

    #[error("no active context for scope '{scope}'; run() or bind() must be called first")]
    NoActiveContext { scope: String },

    #[error("fault contained in region {region}: {message}")]
    Contained { region: Uuid, message: String },

    #[error("invalid context configuration: {0}")]
    Config(#[from] serde_json::Error),
}

impl ContextError {
    pub fn no_active(scope: impl Into<String>) -> Self {
        Self::NoActiveContext { scope: scope.into() }
    }

    pub fn error_code(&self) -> ContextErrorCode {
        match self {
            Self::UnsupportedEnvironment(_) => ContextErrorCode::Unsupported,
            Self::NoActiveContext { .. } => ContextErrorCode::NoActive,
            Self::Contained { .. } => ContextErrorCode::Contained,
            Self::Config(_) => ContextErrorCode::Config,
        }
    }
}
