#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use http_body_util::BodyExt;
use imgflow_core::runtime::{ContainerRuntime, ExecutionError, ExecutionOutput, ExecutionRequest};
use imgflow_pipeline::QueueConfig;
use imgflow_store::collections::FetchError;
use imgflow_store::FileFetcher;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use imgflow_api::config::ServerConfig;
use imgflow_api::router::build_app_router;
use imgflow_api::state::AppState;

/// Runtime that echoes its image and inputs as the container output.
/// The image `fail` exits 1 instead.
pub struct EchoRuntime;

#[async_trait]
impl ContainerRuntime for EchoRuntime {
    async fn run(
        &self,
        request: ExecutionRequest,
        _cancel: CancellationToken,
    ) -> Result<ExecutionOutput, ExecutionError> {
        if request.image == "fail" {
            return Err(ExecutionError::Exited {
                exit_code: 1,
                stderr: "segmentation fault".into(),
            });
        }
        let output = json!({ "image": request.image, "inputs": request.inputs });
        Ok(ExecutionOutput {
            stdout: output.to_string(),
            stderr: String::new(),
            exit_code: 0,
            duration_ms: 1,
            parsed_output: Some(output),
        })
    }
}

/// Fetcher serving a fixed set of URLs; anything else is a 404.
#[derive(Default)]
pub struct StaticFetcher {
    files: HashMap<String, Vec<u8>>,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, bytes: &[u8]) -> Self {
        self.files.insert(url.to_string(), bytes.to_vec());
        self
    }
}

#[async_trait]
impl FileFetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.files.get(url).cloned().ok_or_else(|| FetchError::Rejected {
            url: url.to_string(),
            status: 404,
        })
    }
}

/// Build a test `ServerConfig` rooted at `data_root`.
pub fn test_config(data_root: &std::path::Path) -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
        data_root: data_root.to_path_buf(),
    }
}

pub struct TestApp {
    pub dir: tempfile::TempDir,
    pub state: AppState,
    pub router: Router,
}

/// Build the full application router, with all middleware, on a fresh
/// data root.
pub async fn build_test_app() -> TestApp {
    let fetcher = StaticFetcher::default()
        .with("http://files.test/page-1.png", b"page one")
        .with("http://files.test/page-2.png", b"page two");
    build_test_app_with(fetcher).await
}

pub async fn build_test_app_with(fetcher: StaticFetcher) -> TestApp {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let queue_config = QueueConfig {
        retry_backoff: Duration::from_millis(10),
        default_timeout: Duration::from_secs(5),
        ..QueueConfig::default()
    };
    let state = AppState::build(
        config.clone(),
        queue_config,
        Arc::new(EchoRuntime),
        Arc::new(fetcher),
    )
    .await
    .unwrap();
    let router = build_app_router(state.clone(), &config);
    TestApp { dir, state, router }
}

impl TestApp {
    pub async fn get(&self, uri: &str) -> Response {
        self.send(Method::GET, uri, None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> Response {
        self.send(Method::POST, uri, Some(body)).await
    }

    pub async fn delete(&self, uri: &str) -> Response {
        self.send(Method::DELETE, uri, None).await
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> Response {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Poll `uri` until `data.status.statusCode` is terminal and every
    /// listed step has settled.
    pub async fn poll_until_settled(&self, uri: &str) -> Value {
        for _ in 0..500 {
            let json = body_json(self.get(uri).await).await;
            let code = json["data"]["status"]["statusCode"].as_i64().unwrap_or(0);
            let steps_settled = json["data"]["steps"]
                .as_array()
                .map(|steps| {
                    steps
                        .iter()
                        .all(|s| s["status"]["statusCode"].as_i64().unwrap_or(0) >= 200)
                })
                .unwrap_or(true);
            if code >= 200 && steps_settled {
                return json;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{uri} never settled");
    }
}

/// Read a response body as JSON.
pub async fn body_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
