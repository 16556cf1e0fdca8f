mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::*;
use docchunk::config::TasksConfig;
use docchunk::server::{router, AppState};

async fn spawn_server(h: &Harness) -> String {
    let state = AppState::new(Arc::new(h.pipeline()), TasksConfig::default(), 2);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn wait_for_status(client: &reqwest::Client, url: &str, status: &str) -> Value {
    for _ in 0..100 {
        let body: Value = client.get(url).send().await.unwrap().json().await.unwrap();
        if body["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task at {} never reached {}", url, status);
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let base = spawn_server(&h).await;
    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_create_runs_task_in_background() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/tasks", base))
        .json(&json!({ "url": "https://example.com/report.pdf", "chunk_size": 512 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(created["chunk_size"], 512);

    let task_url = format!("{}/tasks/{}", base, id);
    let done = wait_for_status(&client, &task_url, "Succeeded").await;
    assert_eq!(done["document"]["page_count"], 2);
    assert!(done["document"].get("markdown").is_none());

    let chunks: Value = client
        .get(format!("{}/chunks", task_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chunks["chunks"].as_array().unwrap().len(), 2);
    assert_eq!(chunks["chunks"][1]["page_numbers"], json!([1]));

    // terminal tasks cannot be cancelled
    let resp = client
        .post(format!("{}/cancel", task_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "invalid_state");

    let resp = client.delete(&task_url).send().await.unwrap();
    assert_eq!(resp.status(), 204);
    let resp = client.get(&task_url).send().await.unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_invalid_requests() {
    let h = Harness::new(TWO_PAGE_MARKDOWN);
    let base = spawn_server(&h).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/tasks", base))
        .json(&json!({ "url": "not a url" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/tasks", base))
        .json(&json!({ "url": "https://example.com/a.pdf", "delete_after_minutes": i64::MAX }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 422);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .post(format!("{}/tasks", base))
        .header("content-type", "application/json")
        .body("{ not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");

    let resp = client
        .get(format!("{}/tasks/unknown/chunks", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");
}
