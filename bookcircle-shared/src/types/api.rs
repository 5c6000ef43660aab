use serde::{Deserialize, Serialize};

use crate::errors::{ClientError, ClientResult, ErrorCode};

/// Wire envelope every API endpoint responds with. Success bodies carry
/// `data` (plus an optional human message); failures carry `error`.
/// Decoded as one shape so callers branch on `success` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiErrorDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl<T> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            error: None,
        }
    }

    pub fn fail(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(ApiErrorDetail {
                code: code.code().to_string(),
                message: message.into(),
                details: None,
            }),
        }
    }

    /// Collapse the envelope into a result. A success flag without a
    /// body and a failure flag without an error detail are both treated
    /// as malformed responses.
    pub fn into_result(self) -> ClientResult<T> {
        if self.success {
            self.data
                .ok_or_else(|| ClientError::internal("success response without data"))
        } else {
            Err(self.failure())
        }
    }

    /// Variant of [`Envelope::into_result`] for endpoints whose success
    /// body is empty.
    pub fn into_unit_result(self) -> ClientResult<()> {
        if self.success {
            Ok(())
        } else {
            Err(self.failure())
        }
    }

    fn failure(self) -> ClientError {
        let Some(detail) = self.error else {
            return ClientError::internal("error response without error detail");
        };
        let code = ErrorCode::from_code(&detail.code).unwrap_or(ErrorCode::InternalError);
        ClientError::Known {
            code,
            message: detail.message,
            details: detail.details,
        }
    }
}
