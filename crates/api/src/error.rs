use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use imgflow_core::error::CoreError;
use serde_json::{json, Value};

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and adds HTTP-specific variants.
/// Every variant renders as `{message, errorType}` with optional extra
/// fields. A duplicate registration is reported with the kind of the entry
/// it collided with: `WorkflowDuplication` or `AlgorithmDuplication`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `imgflow_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

fn internal() -> (StatusCode, String, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "InternalError".to_string(),
        "An internal error occurred".to_string(),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut extra: Option<Value> = None;

        let (status, error_type, message) = match &self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Validation(v) => {
                    extra = Some(json!({ "kind": v.kind.as_str() }));
                    (
                        StatusCode::BAD_REQUEST,
                        "ValidationError".to_string(),
                        v.message.clone(),
                    )
                }
                CoreError::Duplicate {
                    kind,
                    identifier,
                    status,
                    ..
                } => {
                    extra = Some(json!({
                        "identifier": identifier,
                        "statusCode": status.status_code,
                    }));
                    (
                        StatusCode::CONFLICT,
                        format!("{}Duplication", kind.label()),
                        core.to_string(),
                    )
                }
                CoreError::NotFound { .. } => {
                    (StatusCode::NOT_FOUND, "NotFound".to_string(), core.to_string())
                }
                CoreError::Conflict(msg) => {
                    (StatusCode::CONFLICT, "Conflict".to_string(), msg.clone())
                }
                CoreError::Io { .. }
                | CoreError::Serialization { .. }
                | CoreError::ContainerExecution(_) => {
                    tracing::error!(error = %core, "Internal core error");
                    internal()
                }
            },

            // --- HTTP-specific errors ---
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, "BadRequest".to_string(), msg.clone())
            }
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let mut body = json!({
            "message": message,
            "errorType": error_type,
        });
        if let (Some(Value::Object(fields)), Some(target)) = (extra, body.as_object_mut()) {
            target.extend(fields);
        }

        (status, axum::Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use imgflow_core::error::ValidationKind;
    use imgflow_core::service::ServiceKind;
    use imgflow_core::status::StatusRecord;

    use super::*;

    async fn render(err: AppError) -> (StatusCode, Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn validation_carries_kind() {
        let err = AppError::Core(CoreError::validation(ValidationKind::Cyclic, "a -> b -> a"));
        let (status, json) = render(err).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["errorType"], "ValidationError");
        assert_eq!(json["kind"], "Cyclic");
        assert_eq!(json["message"], "a -> b -> a");
    }

    #[tokio::test]
    async fn workflow_duplicate_names_kind() {
        let id = uuid::Uuid::new_v4();
        let err = AppError::Core(CoreError::Duplicate {
            kind: ServiceKind::Workflow,
            name: "ocr".into(),
            version: "1.0".into(),
            identifier: id,
            status: StatusRecord::done("workflow registered"),
        });
        let (status, json) = render(err).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["errorType"], "WorkflowDuplication");
        assert_eq!(json["message"], "Workflow ocr version 1.0 already exists");
        assert_eq!(json["identifier"], id.to_string());
        assert_eq!(json["statusCode"], 200);
    }

    #[tokio::test]
    async fn io_errors_are_sanitized() {
        let err = AppError::Core(CoreError::Io {
            path: "/srv/data/registry/services.json".into(),
            source: std::io::Error::other("disk full"),
        });
        let (status, json) = render(err).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["errorType"], "InternalError");
        assert_eq!(json["message"], "An internal error occurred");
    }

    #[tokio::test]
    async fn not_found_maps_to_404() {
        let err = AppError::Core(CoreError::not_found("Service", "/workflows/ocr/1.0"));
        let (status, json) = render(err).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["errorType"], "NotFound");
        assert_eq!(json["message"], "Service /workflows/ocr/1.0 not found");
    }
}
