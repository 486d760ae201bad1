//! Gateway routing tests that run without a live WhatsApp connection:
//! parameter validation, health probe, and the fallback route.

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use tower::ServiceExt;

use linkgate::Config;
use linkgate::gateway::{AppState, app};
use linkgate::link::Linker;

fn test_app() -> Router {
    let config = Arc::new(Config::default());
    app(AppState {
        linker: Arc::new(Linker::new(config)),
    })
}

async fn get(uri: &str) -> (StatusCode, serde_json::Value) {
    let response = test_app()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&body).unwrap();
    (status, json)
}

#[tokio::test]
async fn health_is_ok() {
    let (status, json) = get("/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn pair_without_number_is_400() {
    let (status, json) = get("/pair").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        json["error"]
            .as_str()
            .unwrap()
            .contains("full international")
    );
}

#[tokio::test]
async fn pair_with_garbage_number_is_400() {
    let (status, json) = get("/pair?number=abc").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid phone number"));
}

#[tokio::test]
async fn pair_with_short_number_is_400() {
    let (status, _) = get("/pair?number=12345").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn pair_with_leading_zero_number_is_400() {
    let (status, _) = get("/pair?number=0123456789").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_route_is_404_with_route_list() {
    let (status, json) = get("/nope").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let routes = json["routes"].as_array().unwrap();
    assert!(routes.iter().any(|r| r.as_str().unwrap().contains("/pair")));
    assert!(routes.iter().any(|r| r.as_str().unwrap().contains("/qr")));
}
