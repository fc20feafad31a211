use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StorageError;
use crate::validators::ValidationError;

/// Standard error payload handed back to callers instead of panicking
/// Contains stable machine-readable error code and human-readable message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable error code (e.g., "NETWORK_ERROR", "UNAUTHORIZED")
    pub error: String,

    /// Human-readable error message
    pub message: String,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.error, self.message)
    }
}

/// Common error codes used across the client
pub mod error_codes {
    // Authentication errors
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const NOT_AUTHENTICATED: &str = "NOT_AUTHENTICATED";

    // Validation errors
    pub const INVALID_VALUE: &str = "INVALID_VALUE";
    pub const INVALID_EMAIL: &str = "INVALID_EMAIL";
    pub const INVALID_PASSWORD: &str = "INVALID_PASSWORD";
    pub const FIELD_OUT_OF_RANGE: &str = "FIELD_OUT_OF_RANGE";
    pub const NO_SELECTION: &str = "NO_SELECTION";

    // Remote errors
    pub const NETWORK_ERROR: &str = "NETWORK_ERROR";
    pub const HTTP_STATUS: &str = "HTTP_STATUS";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
    pub const PARTIAL_FAILURE: &str = "PARTIAL_FAILURE";

    // Local errors
    pub const STORAGE_ERROR: &str = "STORAGE_ERROR";
    pub const SOCKET_ERROR: &str = "SOCKET_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Response wrapper used by the mobile backend
///
/// Every `/greenhouses/ds-*` endpoint answers with this shape:
/// `{"success": true, "status": "OK", "message": "...", "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status: Option<serde_json::Value>,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    /// Unwrap the payload, failing when the backend flagged the call as unsuccessful
    pub fn into_data(self) -> Result<T> {
        if !self.success {
            return Err(ClientError::Decode(format!(
                "Backend reported failure: {}",
                self.message.unwrap_or_else(|| "no message".to_string())
            )));
        }
        self.data
            .ok_or_else(|| ClientError::Decode("Response envelope has no data".to_string()))
    }
}

/// Body shape of failed auth/service calls (`{"message": ...}` or `{"error": ...}`)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteErrorBody {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub detail: Option<String>,
}

impl RemoteErrorBody {
    /// Best human-readable message carried by a failed response body
    pub fn extract(body: &str) -> Option<String> {
        let parsed: RemoteErrorBody = serde_json::from_str(body).ok()?;
        parsed.message.or(parsed.error).or(parsed.detail)
    }
}

/// Main error type for remote calls
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Unexpected status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response body: {0}")]
    Decode(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ClientError {
    /// Build a status error from a non-2xx response body
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = RemoteErrorBody::extract(body).unwrap_or_else(|| {
            if body.is_empty() {
                "empty response body".to_string()
            } else {
                body.chars().take(256).collect()
            }
        });
        ClientError::Status { status, message }
    }

    /// Stable error code for this error
    pub fn code(&self) -> &'static str {
        match self {
            ClientError::Http(_) => error_codes::NETWORK_ERROR,
            ClientError::Status { status: 401, .. } | ClientError::Status { status: 403, .. } => {
                error_codes::UNAUTHORIZED
            }
            ClientError::Status { status: 404, .. } => error_codes::NOT_FOUND,
            ClientError::Status { .. } => error_codes::HTTP_STATUS,
            ClientError::Decode(_) => error_codes::INVALID_RESPONSE,
            ClientError::Validation(_) => error_codes::INVALID_VALUE,
            ClientError::Storage(_) => error_codes::STORAGE_ERROR,
        }
    }

    /// Render into the error payload shape
    pub fn to_error_response(&self) -> ErrorResponse {
        let message = match self {
            ClientError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        };
        ErrorResponse::new(self.code(), message)
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Decode(err.to_string())
    }
}

impl From<ClientError> for ErrorResponse {
    fn from(err: ClientError) -> Self {
        err.to_error_response()
    }
}

/// Result type alias for remote calls
pub type Result<T> = std::result::Result<T, ClientError>;
