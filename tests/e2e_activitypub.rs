//! E2E tests for ActivityPub federation endpoints

mod common;

use common::TestServer;
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn test_actor_endpoint_returns_person() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server
        .client
        .get(&server.url("/users/testuser"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Person");
    assert_eq!(json["preferredUsername"], "testuser");
    assert_eq!(json["inbox"], "https://test.example.com/users/testuser/inbox");
    assert_eq!(json["outbox"], "https://test.example.com/users/testuser/outbox");
    assert_eq!(json["endpoints"]["sharedInbox"], "https://test.example.com/inbox");
    assert!(json["publicKey"]["publicKeyPem"].as_str().unwrap().contains("BEGIN PUBLIC KEY"));
}

#[tokio::test]
async fn test_actor_endpoint_unknown_user_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(&server.url("/users/nobody"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_actor_content_negotiation_redirects_html() {
    let no_redirect_client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = no_redirect_client
        .get(server.url("/users/testuser"))
        .header("Accept", "text/html")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 302);
    assert_eq!(response.headers().get("location").unwrap(), "/u/testuser");
}

#[tokio::test]
async fn test_outbox_is_empty_ordered_collection() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server.client.get(&server.url("/users/testuser/outbox")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "OrderedCollection");
    assert_eq!(json["totalItems"], 0);
    assert_eq!(json["orderedItems"], json!([]));
}

#[tokio::test]
async fn test_followers_collection_empty() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server.client.get(&server.url("/users/testuser/followers")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "OrderedCollection");
    assert_eq!(json["totalItems"], 0);
}

#[tokio::test]
async fn test_following_collection_empty() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server.client.get(&server.url("/users/testuser/following")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "OrderedCollection");
    assert_eq!(json["totalItems"], 0);
}

#[tokio::test]
async fn test_inbox_rejects_missing_signature() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let activity = json!({
        "id": "https://remote.example.com/activities/1",
        "type": "Follow",
        "actor": "https://remote.example.com/users/alice",
        "object": "https://test.example.com/users/testuser"
    });

    let response = server
        .client
        .post(&server.url("/users/testuser/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&activity)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_inbox_accepts_validly_signed_follow() {
    let server = TestServer::new().await;
    server.create_test_account().await;
    let remote = server.create_remote_actor("alice", "remote.example.com").await;

    let body = serde_json::to_vec(&json!({
        "id": format!("https://remote.example.com/activities/{}", Uuid::new_v4()),
        "type": "Follow",
        "actor": remote.actor_uri,
        "object": "https://test.example.com/users/testuser"
    }))
    .unwrap();

    let response = server
        .signed_post("/users/testuser/inbox", &body, &remote.public_key_id, common::TEST_PRIVATE_KEY)
        .await;

    assert_eq!(response.status(), 200);

    let followers = server
        .state
        .store
        .list_accepted_followers(stegodon_federation::data::ActorRef::Local(
            server.state.store.get_account_by_username("testuser").await.unwrap().unwrap().id,
        ))
        .await
        .unwrap();
    assert_eq!(followers.len(), 1);
}

#[tokio::test]
async fn test_inbox_rejects_tampered_body() {
    let server = TestServer::new().await;
    server.create_test_account().await;
    let remote = server.create_remote_actor("alice", "remote.example.com").await;

    let signed_body = serde_json::to_vec(&json!({
        "id": "https://remote.example.com/activities/1",
        "type": "Follow",
        "actor": remote.actor_uri,
        "object": "https://test.example.com/users/testuser"
    }))
    .unwrap();

    // Sign one body but send a different one.
    use stegodon_federation::federation::sign_request;
    let url = format!("http://{}/users/testuser/inbox", server.host_port());
    let signed = sign_request("POST", &url, Some(&signed_body), common::TEST_PRIVATE_KEY, &remote.public_key_id).unwrap();

    let tampered_body = serde_json::to_vec(&json!({
        "id": "https://remote.example.com/activities/1",
        "type": "Follow",
        "actor": remote.actor_uri,
        "object": "https://test.example.com/users/someone-else"
    }))
    .unwrap();

    let host_only = server.host_port().split(':').next().unwrap();
    let mut request = server
        .client
        .post(&server.url("/users/testuser/inbox"))
        .header("host", host_only)
        .header("signature", &signed.signature)
        .header("date", &signed.date)
        .body(tampered_body);
    if let Some(digest) = &signed.digest {
        request = request.header("digest", digest);
    }

    let response = request.send().await.unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_shared_inbox_accepts_validly_signed_activity() {
    let server = TestServer::new().await;
    server.create_test_account().await;
    let remote = server.create_remote_actor("alice", "remote.example.com").await;

    let body = serde_json::to_vec(&json!({
        "id": format!("https://remote.example.com/activities/{}", Uuid::new_v4()),
        "type": "Follow",
        "actor": remote.actor_uri,
        "object": "https://test.example.com/users/testuser"
    }))
    .unwrap();

    let response = server.signed_post("/inbox", &body, &remote.public_key_id, common::TEST_PRIVATE_KEY).await;

    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn test_inbox_unknown_user_is_404() {
    let server = TestServer::new().await;
    let remote = server.create_remote_actor("alice", "remote.example.com").await;

    let body = serde_json::to_vec(&json!({
        "id": "https://remote.example.com/activities/1",
        "type": "Follow",
        "actor": remote.actor_uri,
        "object": "https://test.example.com/users/nobody"
    }))
    .unwrap();

    let response = server
        .signed_post("/users/nobody/inbox", &body, &remote.public_key_id, common::TEST_PRIVATE_KEY)
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_note_endpoint_returns_note_object() {
    use chrono::Utc;
    use stegodon_federation::data::{NewNote, Visibility};

    let server = TestServer::new().await;
    let account = server.create_test_account().await;

    let note_id = Uuid::new_v4();
    let note_uri = format!("{}/notes/{}", server.state.config.server.base_url(), note_id);
    server
        .state
        .store
        .insert_note(NewNote {
            id: note_id,
            object_uri: note_uri.clone(),
            created_by: account.id.to_string(),
            message: "hello".to_string(),
            content_html: "<p>hello</p>".to_string(),
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

    let response = server.client.get(&server.url(&format!("/notes/{}", note_id))).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["type"], "Note");
    assert_eq!(json["id"], note_uri);
    assert_eq!(json["attributedTo"], "https://test.example.com/users/testuser");
    assert_eq!(json["content"], "<p>hello</p>");
}

#[tokio::test]
async fn test_note_endpoint_unknown_id_is_404() {
    let server = TestServer::new().await;

    let response = server.client.get(&server.url(&format!("/notes/{}", Uuid::new_v4()))).send().await.unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_inbox_rejects_oversized_body() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let oversized = vec![b'a'; 2 * 1024 * 1024];

    let response = server
        .client
        .post(&server.url("/users/testuser/inbox"))
        .header("Content-Type", "application/activity+json")
        .body(oversized)
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 413);
}
