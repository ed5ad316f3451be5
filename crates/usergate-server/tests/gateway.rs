mod common;

use common::{Harness, TestStore, config};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;

async fn create(client: &Client, harness: &Harness, name: &str) -> Value {
    let res = client
        .post(harness.http_url("/api/v1/users"))
        .json(&json!({ "name": name, "email": format!("{name}@x.com"), "phone": "+1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    res.json().await.unwrap()
}

#[tokio::test]
async fn preflight_short_circuits_with_cors_headers() {
    let store = Arc::new(TestStore::new());
    let harness = Harness::start_with_store(config(), store.clone()).await;
    let client = Client::new();

    for path in ["/api/v1/users", "/api/v1/users/whatever", "/no/such/route"] {
        let res = client
            .request(Method::OPTIONS, harness.http_url(path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let headers = res.headers();
        assert_eq!(headers["access-control-allow-origin"], "*");
        assert_eq!(
            headers["access-control-allow-methods"],
            "GET, POST, PUT, DELETE, OPTIONS"
        );
        assert_eq!(
            headers["access-control-allow-headers"],
            "Content-Type, Authorization"
        );
        assert!(res.bytes().await.unwrap().is_empty());
    }

    // Nothing reached the datastore, while a real call does.
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    let res = client
        .get(harness.http_url("/api/v1/users"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(store.calls.load(Ordering::SeqCst), 1);

    harness.shutdown().await;
}

#[tokio::test]
async fn unsupported_method_is_a_json_error() {
    let store = Arc::new(TestStore::new());
    let harness = Harness::start_with_store(config(), store.clone()).await;
    let client = Client::new();

    for (method, path) in [
        (Method::PATCH, "/api/v1/users/01HGW2N7EHJVJ6Z0E3GRHPZ8XW"),
        (Method::DELETE, "/api/v1/users"),
        (Method::POST, "/health"),
    ] {
        let res = client
            .request(method.clone(), harness.http_url(path))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::NOT_IMPLEMENTED, "{method} {path}");
        assert_eq!(res.headers()["access-control-allow-origin"], "*");
        let body: Value = res.json().await.unwrap();
        assert_eq!(body["code"], 12);
        assert!(body["message"].as_str().unwrap().contains(method.as_str()));
        assert_eq!(body["details"], json!([]));
    }
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn user_crud_round_trip() {
    let harness = Harness::start().await;
    let client = Client::new();

    let created = create(&client, &harness, "A").await;
    let id = created["id"].as_str().unwrap().to_string();
    assert_eq!(id.len(), 26);
    assert_eq!(created["name"], "A");
    assert!(!created["created_at"].as_str().unwrap().is_empty());
    assert!(!created["updated_at"].as_str().unwrap().is_empty());

    let res = client
        .get(harness.http_url(&format!("/api/v1/users/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
    let fetched: Value = res.json().await.unwrap();
    assert_eq!(fetched, created);

    let updated: Value = client
        .put(harness.http_url(&format!("/api/v1/users/{id}")))
        .json(&json!({ "email": "new@x.com" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(updated["name"], "A");
    assert_eq!(updated["email"], "new@x.com");
    assert_eq!(updated["phone"], "+1");
    assert_eq!(updated["created_at"], created["created_at"]);

    let res = client
        .delete(harness.http_url(&format!("/api/v1/users/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.json::<Value>().await.unwrap(), json!({}));

    let res = client
        .get(harness.http_url(&format!("/api/v1/users/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], 5);
    assert_eq!(body["message"], "user not found");
    assert_eq!(body["details"], json!([]));

    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_and_malformed_ids() {
    let harness = Harness::start().await;
    let client = Client::new();

    let missing = usergate_core::types::new_user_id();
    let res = client
        .get(harness.http_url(&format!("/api/v1/users/{missing}")))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .get(harness.http_url("/api/v1/users/not-an-id"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    assert_eq!(res.json::<Value>().await.unwrap()["code"], 3);

    harness.shutdown().await;
}

#[tokio::test]
async fn listing_normalizes_pagination() {
    let harness = Harness::start().await;
    let client = Client::new();
    for i in 0..12 {
        create(&client, &harness, &format!("u{i}")).await;
    }

    let first: Value = client
        .get(harness.http_url("/api/v1/users?page=0&page_size=-3"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(first["page"], 1);
    assert_eq!(first["page_size"], 10);
    assert_eq!(first["total"], 12);
    assert_eq!(first["users"].as_array().unwrap().len(), 10);

    let second: Value = client
        .get(harness.http_url("/api/v1/users?page=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["page"], 2);
    assert_eq!(second["users"].as_array().unwrap().len(), 2);

    harness.shutdown().await;
}

#[tokio::test]
async fn malformed_requests_never_reach_the_backend() {
    let harness = Harness::start().await;
    let client = Client::new();

    let res = client
        .post(harness.http_url("/api/v1/users"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["code"], 3);

    let res = client
        .get(harness.http_url("/api/v1/users?page=first"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let list: Value = client
        .get(harness.http_url("/api/v1/users"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["total"], 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn auxiliary_routes() {
    let harness = Harness::start().await;
    let client = Client::new();

    let res = client.get(harness.http_url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.json::<Value>().await.unwrap(),
        json!({ "status": "SERVING" })
    );

    let res = client
        .get(harness.http_url("/swagger.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "application/json");
    let doc: Value = res.json().await.unwrap();
    assert_eq!(doc["swagger"], "2.0");

    let res = client
        .get(harness.http_url("/swagger/"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.text().await.unwrap().contains("swagger-ui"));

    let res = client
        .get(harness.http_url("/no/such/route"))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.headers()["access-control-allow-origin"], "*");
    assert_eq!(res.json::<Value>().await.unwrap()["code"], 5);

    harness.shutdown().await;
}
