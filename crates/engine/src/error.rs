use domain::models::{ExportJobStatus, UnavailableReason};
use domain::services::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the export engine.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage I/O error: {0}")]
    TransientIo(String),

    #[error("Storage quota exceeded: package is larger than {limit_bytes} bytes")]
    StorageQuotaExceeded { limit_bytes: u64 },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: ExportJobStatus,
        to: ExportJobStatus,
    },

    #[error("Corrupted artifact for job {job_id}: {detail}")]
    CorruptedArtifact { job_id: Uuid, detail: String },

    #[error("Package unavailable ({reason}): {}", .reason.message())]
    PackageUnavailable { reason: UnavailableReason },

    #[error("An export is already in progress for tool {tool_id}")]
    AlreadyInProgress { tool_id: Uuid },

    #[error("Export job {job_id} is already {status}")]
    AlreadyTerminal {
        job_id: Uuid,
        status: ExportJobStatus,
    },

    #[error("Export job not found: {0}")]
    NotFound(Uuid),

    #[error("Tool not found: {0}")]
    ToolNotFound(Uuid),

    #[error("Repository error: {0}")]
    Repository(String),
}

impl ExportError {
    /// Stable machine-readable code for the outer layer.
    pub fn code(&self) -> &'static str {
        match self {
            ExportError::Validation(_) => "validation_error",
            ExportError::TransientIo(_) => "storage_error",
            ExportError::StorageQuotaExceeded { .. } => "quota_exceeded",
            ExportError::InvalidStateTransition { .. }
            | ExportError::AlreadyInProgress { .. }
            | ExportError::AlreadyTerminal { .. } => "conflict",
            ExportError::CorruptedArtifact { .. } => "corrupted_artifact",
            ExportError::PackageUnavailable { .. } => "package_unavailable",
            ExportError::NotFound(_) | ExportError::ToolNotFound(_) => "not_found",
            ExportError::Repository(_) => "internal_error",
        }
    }

    /// Whether a failed step should leave nothing to compensate.
    pub fn is_validation(&self) -> bool {
        matches!(self, ExportError::Validation(_))
    }
}

impl From<RepositoryError> for ExportError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::ActiveJobExists { tool_id } => {
                ExportError::AlreadyInProgress { tool_id }
            }
            RepositoryError::Backend(msg) => ExportError::Repository(msg),
        }
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::TransientIo(err.to_string())
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Validation(format!("Invalid tool configuration: {}", err))
    }
}

impl From<validator::ValidationErrors> for ExportError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| match &e.message {
                    Some(message) => format!("{}: {}", field, message),
                    None => format!("{}: {}", field, e.code),
                })
            })
            .collect();

        if messages.is_empty() {
            messages.push(errors.to_string());
        }
        messages.sort();

        ExportError::Validation(messages.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use validator::Validate;

    #[test]
    fn test_error_codes() {
        let job_id = Uuid::new_v4();
        assert_eq!(ExportError::Validation("x".into()).code(), "validation_error");
        assert_eq!(ExportError::NotFound(job_id).code(), "not_found");
        assert_eq!(ExportError::ToolNotFound(job_id).code(), "not_found");
        assert_eq!(
            ExportError::AlreadyTerminal {
                job_id,
                status: ExportJobStatus::Cancelled
            }
            .code(),
            "conflict"
        );
        assert_eq!(
            ExportError::PackageUnavailable {
                reason: UnavailableReason::Expired
            }
            .code(),
            "package_unavailable"
        );
        assert_eq!(
            ExportError::StorageQuotaExceeded { limit_bytes: 10 }.code(),
            "quota_exceeded"
        );
    }

    #[test]
    fn test_package_unavailable_message() {
        let err = ExportError::PackageUnavailable {
            reason: UnavailableReason::NotReady,
        };
        assert_eq!(
            err.to_string(),
            "Package unavailable (not_ready): The export package is not ready yet"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = ExportError::InvalidStateTransition {
            from: ExportJobStatus::Completed,
            to: ExportJobStatus::InProgress,
        };
        assert_eq!(
            err.to_string(),
            "Invalid state transition from completed to in_progress"
        );
    }

    #[test]
    fn test_from_repository_error() {
        let tool_id = Uuid::new_v4();
        let err: ExportError = RepositoryError::ActiveJobExists { tool_id }.into();
        assert!(matches!(err, ExportError::AlreadyInProgress { tool_id: t } if t == tool_id));

        let err: ExportError = RepositoryError::Backend("boom".into()).into();
        assert_eq!(err.code(), "internal_error");
    }

    #[derive(Validate)]
    struct Named {
        #[validate(length(min = 1, message = "Name is required"))]
        name: String,
    }

    #[test]
    fn test_from_validation_errors() {
        let errors = Named {
            name: String::new(),
        }
        .validate()
        .unwrap_err();
        let err: ExportError = errors.into();
        assert_eq!(err.to_string(), "Validation error: name: Name is required");
    }
}
