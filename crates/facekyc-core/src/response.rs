use serde::Serialize;

use crate::errors::{AppError, AppResult, ErrorKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&AppError> for ErrorDetail {
    fn from(err: &AppError) -> Self {
        Self {
            kind: err.kind(),
            message: err.human_message(),
        }
    }
}

/// Tagged result handed across the service boundary.
///
/// Serializes as `{"success": true, ...payload}` or
/// `{"success": false, "error": {"kind": ..., "message": ...}}`.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceResponse<T> {
    pub success: bool,
    #[serde(flatten)]
    pub payload: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
}

impl<T> ServiceResponse<T> {
    pub fn from_result(result: AppResult<T>) -> Self {
        match result {
            Ok(payload) => Self {
                success: true,
                payload: Some(payload),
                error: None,
            },
            Err(err) => Self {
                success: false,
                payload: None,
                error: Some(ErrorDetail::from(&err)),
            },
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|detail| detail.kind)
    }
}

impl<T> From<AppResult<T>> for ServiceResponse<T> {
    fn from(result: AppResult<T>) -> Self {
        Self::from_result(result)
    }
}
