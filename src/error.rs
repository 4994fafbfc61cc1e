// ⚠️ Engine Errors - typed faults with machine-readable codes
//
// Store, engine and migration code returns anyhow::Result; these typed
// faults travel inside the anyhow chain and stay downcastable, which is
// what the classifier relies on.

use thiserror::Error;

/// Text marker embedded in every missing-key fault.
///
/// Faults that arrive as plain text (no structured code) are still recognized
/// as missing-key when they carry this marker.
pub const MISSING_KEY_MARKER: &str = "DELETE_MISSING_KEY";

// ============================================================================
// ERROR CODE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    MissingKey,
    DuplicateKey,
    ExhaustedRetries,
    Validation,
    Unclassified,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingKey => "missing_key",
            ErrorCode::DuplicateKey => "duplicate_key",
            ErrorCode::ExhaustedRetries => "exhausted_retries",
            ErrorCode::Validation => "validation",
            ErrorCode::Unclassified => "unclassified",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENGINE ERROR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("DELETE_MISSING_KEY: {key} is not tracked in `{structure}`")]
    MissingKey { structure: String, key: String },

    #[error("{key} is already tracked in `{structure}`")]
    DuplicateKey { structure: String, key: String },

    #[error("no unique candidate found after {attempts} attempts")]
    ExhaustedRetries { attempts: u32 },

    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0}")]
    Unclassified(String),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::MissingKey { .. } => ErrorCode::MissingKey,
            EngineError::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            EngineError::ExhaustedRetries { .. } => ErrorCode::ExhaustedRetries,
            EngineError::Validation { .. } => ErrorCode::Validation,
            EngineError::Unclassified(_) => ErrorCode::Unclassified,
        }
    }

    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        EngineError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }
}
