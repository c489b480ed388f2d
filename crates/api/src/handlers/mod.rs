pub mod algorithms;
pub mod collections;
pub mod processes;
pub mod workflows;

use axum::body::Bytes;
use axum::http::StatusCode;
use axum::Json;
use imgflow_core::naming::service_path;
use imgflow_core::service::ServiceKind;
use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::response::StatusResponse;
use crate::state::AppState;

/// Parse an execution payload. An empty body is an empty object.
fn request_payload(body: &Bytes) -> AppResult<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body)
        .map_err(|e| AppError::BadRequest(format!("Request body is not valid JSON: {e}")))
}

/// Admit an execution of `/{kind}/{name}/{version}` and answer 202.
///
/// The dispatch loop is triggered once the response body exists, so the
/// caller is never held up by container start-up.
async fn execute_service(
    state: &AppState,
    kind: ServiceKind,
    name: &str,
    version: &str,
    body: &Bytes,
) -> AppResult<(StatusCode, Json<StatusResponse>)> {
    let payload = request_payload(body)?;
    let path = service_path(kind, name, version);
    let execution = state.engine.execute(&path, payload).await?;

    tracing::info!(
        identifier = %execution.identifier,
        service = %path,
        "Execution accepted",
    );

    let response = StatusResponse::accepted(
        execution.identifier,
        &execution.status.status_message,
        format!("/processes/{}", execution.identifier),
    );
    state.engine.trigger();
    Ok((StatusCode::ACCEPTED, Json(response)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_an_object() {
        assert_eq!(request_payload(&Bytes::from_static(b"  \n")).unwrap(), serde_json::json!({}));
    }

    #[test]
    fn invalid_payload_is_bad_request() {
        assert!(matches!(
            request_payload(&Bytes::from_static(b"{oops")),
            Err(AppError::BadRequest(_))
        ));
    }
}
