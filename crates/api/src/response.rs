//! Shared response envelope types for API handlers.
//!
//! Read endpoints answer with a `{ "data": ... }` envelope. Registration,
//! execution and deletion answer with the flat status bodies clients poll
//! against: [`StatusResponse`] and [`MessageResponse`].

use imgflow_core::status::StatusCode;
use serde::Serialize;

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Serialize)]
pub struct DataResponse<T: Serialize> {
    pub data: T,
}

/// `{statusCode, identifier, statusMessage, statusLocation?}`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    /// Numeric status; `202` for accepted executions.
    pub status_code: u16,
    pub identifier: String,
    pub status_message: String,
    /// Where to poll for progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_location: Option<String>,
}

impl StatusResponse {
    pub fn registered(identifier: impl ToString, status_code: StatusCode, message: &str) -> Self {
        Self {
            status_code: status_code.code() as u16,
            identifier: identifier.to_string(),
            status_message: message.to_string(),
            status_location: None,
        }
    }

    pub fn accepted(identifier: impl ToString, message: &str, location: String) -> Self {
        Self {
            status_code: 202,
            identifier: identifier.to_string(),
            status_message: message.to_string(),
            status_location: Some(location),
        }
    }
}

/// `{message}` body used by deletions.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}
