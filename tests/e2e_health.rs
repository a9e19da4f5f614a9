//! E2E tests for health check and basic server functionality

mod common;

use common::TestServer;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/health")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_server_starts_successfully() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/health")).send().await;

    assert!(response.is_ok());
}

#[tokio::test]
async fn test_404_for_unknown_routes() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/unknown/route")).send().await.unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_metrics_endpoint_is_public() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/metrics")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("stegodon_"));
}
