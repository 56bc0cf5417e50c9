use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::domain::InstanceId;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("form listing unavailable: {0}")]
    FetchError(String),

    #[error("failed to download form {form_id}: {message}")]
    FormDownload { form_id: String, message: String },

    #[error("operation interrupted")]
    Interrupted,

    #[error("there is nothing to submit")]
    NothingToSubmit,

    #[error("no valid Google account selected")]
    GoogleAccountNotSet,

    #[error("access to Google accounts is not permitted")]
    GoogleAccountNotPermitted,

    #[error("spreadsheet uploads are not available in this build")]
    SpreadsheetUnavailable,

    #[error("missing config file fieldsync.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("request failed: {0}")]
    Http(String),

    #[error("server returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("background task failed: {0}")]
    Worker(String),
}

impl SyncError {
    /// Pre-flight failures of a submission batch, raised before any instance is touched.
    pub fn is_submit_error(&self) -> bool {
        matches!(
            self,
            SyncError::NothingToSubmit
                | SyncError::GoogleAccountNotSet
                | SyncError::GoogleAccountNotPermitted
                | SyncError::SpreadsheetUnavailable
        )
    }
}

/// Failure of a single instance upload. Never aborts a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic)]
pub enum UploadError {
    #[error("network error: {0}")]
    Transport(String),

    #[error("server returned status {status}: {message}")]
    ServerStatus { status: u16, message: String },

    #[error("authentication requested by {host}")]
    AuthRequested { host: String },

    #[error("invalid destination URL: {0}")]
    InvalidDestination(String),

    #[error("form {0} has no submission endpoint")]
    MissingSubmissionMetadata(String),

    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("spreadsheet upload failed: {0}")]
    Spreadsheet(String),

    #[error("could not read submission files: {0}")]
    Filesystem(String),
}

impl UploadError {
    pub fn is_auth_request(&self) -> bool {
        matches!(self, UploadError::AuthRequested { .. })
    }

    /// Text shown to the user next to the instance that failed.
    pub fn display_message(&self) -> String {
        match self {
            UploadError::ServerStatus { status, message } if message.trim().is_empty() => {
                format!("Error: server responded with status {status}")
            }
            UploadError::ServerStatus { message, .. } => format!("Error: {}", message.trim()),
            UploadError::Rejected(message) => message.clone(),
            other => format!("Error: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_status_message_prefers_body() {
        let err = UploadError::ServerStatus {
            status: 500,
            message: "database offline\n".to_string(),
        };
        assert_eq!(err.display_message(), "Error: database offline");

        let empty = UploadError::ServerStatus {
            status: 502,
            message: String::new(),
        };
        assert_eq!(
            empty.display_message(),
            "Error: server responded with status 502"
        );
    }

    #[test]
    fn only_auth_requested_is_auth_request() {
        assert!(
            UploadError::AuthRequested {
                host: "example.org".to_string()
            }
            .is_auth_request()
        );
        assert!(!UploadError::Transport("timeout".to_string()).is_auth_request());
    }
}
