//! Error classification and JSON error responses for the admin API
//!
//! Every component error maps onto an [`ErrorCode`], and every code belongs to
//! one [`ErrorKind`] so callers can tell validation problems from conflicts and
//! from operational (I/O, lock, process) failures.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Broad error classes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input shape, unknown script or action, missing parameter
    Validation,
    /// Duplicate domain, protected-site deletion
    Conflict,
    /// Referenced record or backup does not exist
    NotFound,
    /// Backup failure, lock timeout, spawn failure, I/O or database error
    Resource,
    /// External script ran and failed or timed out
    Process,
}

/// Machine-readable error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    UnknownScript,
    UnknownAction,
    MissingParameter,
    Unsupported,
    DuplicateDomain,
    ProtectedSite,
    NotFound,
    BackupNotFound,
    ConfigSectionNotFound,
    LockTimeout,
    BackupFailed,
    SpawnFailed,
    ScriptFailed,
    ScriptTimeout,
    StorageError,
    IoError,
    RollbackIncomplete,
    Unauthorized,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ErrorCode::InvalidInput
            | ErrorCode::UnknownScript
            | ErrorCode::UnknownAction
            | ErrorCode::MissingParameter
            | ErrorCode::Unsupported
            | ErrorCode::Unauthorized => ErrorKind::Validation,
            ErrorCode::DuplicateDomain | ErrorCode::ProtectedSite => ErrorKind::Conflict,
            ErrorCode::NotFound | ErrorCode::BackupNotFound => ErrorKind::NotFound,
            ErrorCode::ConfigSectionNotFound
            | ErrorCode::LockTimeout
            | ErrorCode::BackupFailed
            | ErrorCode::SpawnFailed
            | ErrorCode::StorageError
            | ErrorCode::IoError
            | ErrorCode::RollbackIncomplete => ErrorKind::Resource,
            ErrorCode::ScriptFailed | ErrorCode::ScriptTimeout => ErrorKind::Process,
        }
    }

    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::NotFound | ErrorCode::BackupNotFound => StatusCode::NOT_FOUND,
            ErrorCode::DuplicateDomain | ErrorCode::ProtectedSite => StatusCode::CONFLICT,
            ErrorCode::LockTimeout => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ScriptFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::ScriptTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::ConfigSectionNotFound
            | ErrorCode::BackupFailed
            | ErrorCode::SpawnFailed
            | ErrorCode::StorageError
            | ErrorCode::IoError
            | ErrorCode::RollbackIncomplete => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::UnknownScript => "UNKNOWN_SCRIPT",
            ErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ErrorCode::MissingParameter => "MISSING_PARAMETER",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::DuplicateDomain => "DUPLICATE_DOMAIN",
            ErrorCode::ProtectedSite => "PROTECTED_SITE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BackupNotFound => "BACKUP_NOT_FOUND",
            ErrorCode::ConfigSectionNotFound => "CONFIG_SECTION_NOT_FOUND",
            ErrorCode::LockTimeout => "LOCK_TIMEOUT",
            ErrorCode::BackupFailed => "BACKUP_FAILED",
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::ScriptFailed => "SCRIPT_FAILED",
            ErrorCode::ScriptTimeout => "SCRIPT_TIMEOUT",
            ErrorCode::StorageError => "STORAGE_ERROR",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::RollbackIncomplete => "ROLLBACK_INCOMPLETE",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
        }
    }
}

/// Implemented by every component error so the API layer can classify it
pub trait Classify {
    fn code(&self) -> ErrorCode;

    fn kind(&self) -> ErrorKind {
        self.code().kind()
    }
}

/// JSON error body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub kind: ErrorKind,
    pub message: String,
    /// Captured script output, when the error came from an external script
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            kind: code.kind(),
            message: message.into(),
            output: None,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Convert to the `{success, data, error}` envelope as a JSON string
    pub fn to_json(&self) -> String {
        let envelope = serde_json::json!({
            "success": false,
            "data": null,
            "error": self,
        });
        serde_json::to_string(&envelope).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"data":null,"error":{{"code":"{}","message":"{}"}}}}"#,
                self.code.as_str(),
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

/// Create a JSON error response with an X-Hostgate-Error header
pub fn json_error_response(error: ErrorResponse) -> Response<Full<Bytes>> {
    let status = error.code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Hostgate-Error", error.code.as_str())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}
