// Error handling module
// Defines the bridge error taxonomy, its wire tags, and HTTP response conversion

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Errors that can terminate a privileged call
#[derive(Error, Debug)]
pub enum BridgeError {
    /// No response arrived within the caller's budget
    #[error("Timed out waiting for a response")]
    Timeout,

    /// No identity is signed in
    #[error("Authentication required: no signed-in identity")]
    AuthRequired,

    /// Credential renewal was attempted and failed
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// Remote document store returned a non-success status
    #[error("Backend error: {status} - {message}")]
    BackendError { status: u16, message: String },

    /// Handler failed in an unexpected way, or the payload was malformed
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// No handler is registered for the request type
    #[error("No handler registered for {0}")]
    NotHandled(String),

    /// The transport was closed before a response arrived
    #[error("Transport disconnected")]
    Disconnected,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Wire tag carried next to the error message in a failure response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    AuthRequired,
    AuthExpired,
    BackendError,
    ProtocolError,
    NotHandled,
    Disconnected,
    Internal,
}

impl BridgeError {
    /// Wire tag for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Timeout => ErrorKind::Timeout,
            BridgeError::AuthRequired => ErrorKind::AuthRequired,
            BridgeError::AuthExpired(_) => ErrorKind::AuthExpired,
            BridgeError::BackendError { .. } => ErrorKind::BackendError,
            BridgeError::ProtocolError(_) => ErrorKind::ProtocolError,
            BridgeError::NotHandled(_) => ErrorKind::NotHandled,
            BridgeError::Disconnected => ErrorKind::Disconnected,
            BridgeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Backend status code, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            BridgeError::BackendError { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Rebuild an error from the fields of a failure response
    pub fn from_wire(kind: Option<ErrorKind>, status: Option<u16>, message: String) -> Self {
        match kind {
            Some(ErrorKind::Timeout) => BridgeError::Timeout,
            Some(ErrorKind::AuthRequired) => BridgeError::AuthRequired,
            Some(ErrorKind::AuthExpired) => BridgeError::AuthExpired(message),
            Some(ErrorKind::BackendError) => BridgeError::BackendError {
                status: status.unwrap_or(500),
                message,
            },
            Some(ErrorKind::NotHandled) => BridgeError::NotHandled(message),
            Some(ErrorKind::Disconnected) => BridgeError::Disconnected,
            Some(ErrorKind::Internal) => BridgeError::Internal(anyhow::anyhow!(message)),
            Some(ErrorKind::ProtocolError) | None => BridgeError::ProtocolError(message),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::AuthRequired | BridgeError::AuthExpired(_) => StatusCode::UNAUTHORIZED,
            BridgeError::BackendError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            BridgeError::ProtocolError(_) => StatusCode::BAD_REQUEST,
            BridgeError::NotHandled(_) => StatusCode::NOT_FOUND,
            BridgeError::Disconnected => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let kind = self.kind();
        let message = match &self {
            BridgeError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": kind,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
