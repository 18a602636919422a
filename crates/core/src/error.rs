//! Error types shared across the Herald core.

use serde::{Deserialize, Serialize};

/// Result type for core operations.
pub type HeraldResult<T> = Result<T, HeraldError>;

/// A single validation violation, field-scoped and machine-readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    /// Field or control key at fault (e.g. `amount`, `recipients`)
    pub field: String,
    /// Stable reason code (e.g. `required`, `tier-limit-exceeded`)
    pub code: String,
    pub message: String,
}

impl Violation {
    pub fn new(
        field: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Errors produced by the orchestration core.
#[derive(Debug, thiserror::Error)]
pub enum HeraldError {
    /// Input rejected before any job was created. Carries every violation
    /// at once rather than failing on the first.
    #[error("validation failed: {}", format_violations(.0))]
    Validation(Vec<Violation>),

    /// A referenced entity does not exist.
    #[error("{resource} not found: {id}")]
    NotFound { resource: &'static str, id: String },

    /// Transient infrastructure failure; safe to retry with backoff.
    #[error("transient error: {0}")]
    Transient(String),

    /// Misconfiguration; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A distributed lock could not be acquired within budget.
    #[error("lock busy: {0}")]
    LockBusy(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HeraldError {
    pub fn not_found(resource: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            resource,
            id: id.to_string(),
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::LockBusy(_))
    }

    /// Recover a typed error that crossed an `anyhow` boundary; anything
    /// foreign is treated as transient.
    pub fn from_anyhow(error: anyhow::Error) -> Self {
        match error.downcast::<HeraldError>() {
            Ok(typed) => typed,
            Err(other) => Self::Transient(other.to_string()),
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{} [{}]: {}", v.field, v.code, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_reports_all_violations() {
        let err = HeraldError::Validation(vec![
            Violation::new("workflow", "required", "workflow identifier is required"),
            Violation::new("recipients", "required", "at least one recipient is required"),
        ]);

        let message = err.to_string();
        assert!(message.contains("workflow [required]"));
        assert!(message.contains("recipients [required]"));
    }

    #[test]
    fn test_from_anyhow_recovers_typed_errors() {
        let typed = HeraldError::from_anyhow(anyhow::Error::from(HeraldError::not_found(
            "workflow", "w1",
        )));
        assert!(matches!(typed, HeraldError::NotFound { .. }));

        let foreign = HeraldError::from_anyhow(anyhow::anyhow!("socket closed"));
        assert!(foreign.is_retryable());
    }

    #[test]
    fn test_retryable_classes() {
        assert!(HeraldError::Transient("store timeout".to_string()).is_retryable());
        assert!(HeraldError::LockBusy("digest:w:k:s".to_string()).is_retryable());
        assert!(!HeraldError::Configuration("bad url".to_string()).is_retryable());
        assert!(!HeraldError::not_found("workflow", "w1").is_retryable());
        assert!(!HeraldError::Validation(vec![]).is_retryable());
    }
}
