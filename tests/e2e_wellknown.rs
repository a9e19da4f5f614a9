//! E2E tests for .well-known endpoints (WebFinger, NodeInfo, host-meta)

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_webfinger_unknown_account_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:nobody@test.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_webfinger_rejects_foreign_domain() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:testuser@other.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_webfinger_with_account() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:testuser@test.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], "acct:testuser@test.example.com");
    let links = json["links"].as_array().unwrap();
    let self_link = links.iter().find(|l| l["rel"] == "self").unwrap();
    assert_eq!(self_link["type"], "application/activity+json");
    assert_eq!(self_link["href"], "https://test.example.com/users/testuser");
}

#[tokio::test]
async fn test_nodeinfo_discovery_links() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/.well-known/nodeinfo")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    let links = json["links"].as_array().unwrap();
    assert!(links.iter().any(|l| l["rel"] == "http://nodeinfo.diaspora.software/ns/schema/2.0"));
    assert!(links.iter().any(|l| l["rel"] == "http://nodeinfo.diaspora.software/ns/schema/2.1"));
}

#[tokio::test]
async fn test_nodeinfo_2_0_reports_user_and_post_counts() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server.client.get(&server.url("/nodeinfo/2.0")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["version"], "2.0");
    assert_eq!(json["software"]["name"], "stegodon");
    assert_eq!(json["usage"]["users"]["total"], 1);
    assert_eq!(json["usage"]["users"]["activeMonth"], 0);
    assert_eq!(json["usage"]["users"]["activeHalfyear"], 0);
    assert_eq!(json["usage"]["localPosts"], 0);
    assert!(json["software"].get("repository").is_none());
}

#[tokio::test]
async fn test_nodeinfo_counts_account_with_recent_note_as_active() {
    use chrono::Utc;
    use stegodon_federation::data::{NewNote, Visibility};
    use uuid::Uuid;

    let server = TestServer::new().await;
    let account = server.create_test_account().await;

    server
        .state
        .store
        .insert_note(NewNote {
            id: Uuid::new_v4(),
            object_uri: format!("{}/notes/{}", server.state.config.server.base_url(), Uuid::new_v4()),
            created_by: account.id.to_string(),
            message: "hi".to_string(),
            content_html: "<p>hi</p>".to_string(),
            created_at: Utc::now(),
            in_reply_to_uri: None,
            visibility: Visibility::Public.as_str().to_string(),
            sensitive: false,
            content_warning: None,
            from_relay: false,
            raw_json: None,
        })
        .await
        .unwrap();

    let response = server.client.get(&server.url("/nodeinfo/2.0")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["usage"]["users"]["activeMonth"], 1);
    assert_eq!(json["usage"]["users"]["activeHalfyear"], 1);
}

#[tokio::test]
async fn test_nodeinfo_2_1_includes_repository() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/nodeinfo/2.1")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["version"], "2.1");
    assert!(json["software"].get("repository").is_some());
}

#[tokio::test]
async fn test_nodeinfo_unsupported_version_is_404() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/nodeinfo/3.0")).send().await.unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_host_meta_endpoint() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url("/.well-known/host-meta")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("lrdd"));
    assert!(body.contains("/.well-known/webfinger?resource={uri}"));
}
