//! Collection download, polling and deletion over HTTP.

mod common;

use axum::http::StatusCode;
use common::{body_json, build_test_app};
use serde_json::json;

#[tokio::test]
async fn collection_becomes_available_after_all_files() {
    let app = build_test_app().await;

    let response = app
        .post(
            "/collections",
            json!({
                "name": "scans",
                "files": [
                    { "url": "http://files.test/page-1.png" },
                    { "url": "http://files.test/page-2.png", "name": "second.png" }
                ]
            }),
        )
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = body_json(response).await;
    assert_eq!(accepted["identifier"], "scans");
    let location = accepted["statusLocation"].as_str().unwrap().to_string();

    let status = app.poll_until_settled(&location).await;
    let data = &status["data"];
    assert_eq!(data["status"]["statusCode"], 200);
    assert_eq!(data["status"]["statusMessage"], "Collection is available");
    assert_eq!(data["downloaded"], 2);

    let mut names: Vec<String> = data["files"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["filename"].as_str().unwrap().to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["page-1.png", "second.png"]);
}

#[tokio::test]
async fn failed_fetch_marks_collection_failed() {
    let app = build_test_app().await;

    app.post(
        "/collections",
        json!({ "name": "broken", "files": [{ "url": "http://files.test/missing.png" }] }),
    )
    .await;

    let status = app.poll_until_settled("/collections/broken").await;
    assert_eq!(status["data"]["status"]["statusCode"], 500);
}

#[tokio::test]
async fn live_collection_name_conflicts() {
    let app = build_test_app().await;
    let body = json!({ "name": "scans", "files": [{ "url": "http://files.test/page-1.png" }] });

    assert_eq!(app.post("/collections", body.clone()).await.status(), StatusCode::ACCEPTED);
    let response = app.post("/collections", body).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn deleted_collection_is_not_found() {
    let app = build_test_app().await;
    app.post(
        "/collections",
        json!({ "name": "scans", "files": [{ "url": "http://files.test/page-1.png" }] }),
    )
    .await;
    app.poll_until_settled("/collections/scans").await;

    let response = app.delete("/collections/scans").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["message"],
        "Collection scans successfully deleted!"
    );
    assert_eq!(app.get("/collections/scans").await.status(), StatusCode::NOT_FOUND);
}
