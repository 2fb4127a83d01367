use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Broad failure categories surfaced by engine operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Duplicate names, unknown references, structurally invalid gates.
    Validation,
    /// Missing or malformed geometry fields.
    Geometry,
    /// Mismatched axes/transforms/thresholds or non-overlapping regions on merge.
    Consistency,
    /// FMO projection needs an axis profile that was not provided.
    MissingData,
    /// Persisted index differs from the in-memory index and overwrite was not requested.
    StaleIndex,
    NotFound,
    Io,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatingError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatingError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    pub fn geometry(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Geometry, message)
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Consistency, message)
    }

    pub fn missing_data(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MissingData, message)
    }

    pub fn stale_index(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::StaleIndex, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl fmt::Display for GatingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl Error for GatingError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_code_and_message() {
        let err = GatingError::validation("population 'cd4' already exists");
        assert_eq!(err.code, ErrorCode::Validation);
        assert_eq!(
            err.to_string(),
            "Validation: population 'cd4' already exists"
        );
    }
}
