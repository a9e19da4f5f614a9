//! E2E tests for federation scenarios
//!
//! Covers the flows spanning multiple modules end to end:
//! - Local post → outbox Create(Note)
//! - Remote Follow → auto-accept → delivery task enqueued
//! - Remote Undo(Follow) → follower removed
//! - Remote Like → like count recomputed
//! - Delivery queue reservation and backoff rescheduling

mod common;

use chrono::Utc;
use common::TestServer;
use serde_json::json;
use stegodon_federation::data::{ActorRef, NewNote, Visibility};
use uuid::Uuid;

#[tokio::test]
async fn test_local_post_appears_in_outbox_as_create_note() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;

    let note_uri = format!("{}/users/testuser/notes/{}", server.state.config.server.base_url(), Uuid::new_v4());
    server
        .state
        .store
        .insert_note(NewNote {
            id: Uuid::new_v4(),
            object_uri: note_uri.clone(),
            created_by: account.id.to_string(),
            message: "hello fediverse".to_string(),
            content_html: "<p>hello fediverse</p>".to_string(),
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

    let response = server.client.get(&server.url("/users/testuser/outbox")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["totalItems"], 1);
    let item = &json["orderedItems"][0];
    assert_eq!(item["type"], "Create");
    assert_eq!(item["object"]["type"], "Note");
    assert_eq!(item["object"]["id"], note_uri);
    assert_eq!(item["object"]["content"], "<p>hello fediverse</p>");
    assert_eq!(item["to"], json!(["https://www.w3.org/ns/activitystreams#Public"]));
}

#[tokio::test]
async fn test_remote_follow_auto_accepts_and_enqueues_delivery() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
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

    let followers = server.state.store.list_accepted_followers(ActorRef::Local(account.id)).await.unwrap();
    assert_eq!(followers.len(), 1);
    assert_eq!(followers[0].follower(), ActorRef::Remote(remote.id));

    // handle_follow enqueues an Accept(Follow) delivery back to the follower's inbox.
    let reserved = server
        .state
        .store
        .reserve_due_delivery_tasks(10, Utc::now(), Utc::now() + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].target_inbox, remote.inbox_uri);
}

#[tokio::test]
async fn test_duplicate_follow_activity_is_idempotent() {
    let server = TestServer::new().await;
    server.create_test_account().await;
    let remote = server.create_remote_actor("alice", "remote.example.com").await;

    let activity_id = format!("https://remote.example.com/activities/{}", Uuid::new_v4());
    let body = serde_json::to_vec(&json!({
        "id": activity_id,
        "type": "Follow",
        "actor": remote.actor_uri,
        "object": "https://test.example.com/users/testuser"
    }))
    .unwrap();

    let first = server
        .signed_post("/users/testuser/inbox", &body, &remote.public_key_id, common::TEST_PRIVATE_KEY)
        .await;
    assert_eq!(first.status(), 200);

    let second = server
        .signed_post("/users/testuser/inbox", &body, &remote.public_key_id, common::TEST_PRIVATE_KEY)
        .await;
    assert_eq!(second.status(), 200);

    let followers = server
        .state
        .store
        .list_accepted_followers(ActorRef::Local(
            server.state.store.get_account_by_username("testuser").await.unwrap().unwrap().id,
        ))
        .await
        .unwrap();
    assert_eq!(followers.len(), 1, "duplicate activity id must not create a second follow");
}

#[tokio::test]
async fn test_remote_undo_follow_removes_follower() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let remote = server.create_remote_actor("alice", "remote.example.com").await;

    let follow_uri = format!("https://remote.example.com/activities/{}", Uuid::new_v4());
    let follow_body = serde_json::to_vec(&json!({
        "id": follow_uri,
        "type": "Follow",
        "actor": remote.actor_uri,
        "object": "https://test.example.com/users/testuser"
    }))
    .unwrap();
    let follow_response = server
        .signed_post("/users/testuser/inbox", &follow_body, &remote.public_key_id, common::TEST_PRIVATE_KEY)
        .await;
    assert_eq!(follow_response.status(), 200);
    assert_eq!(
        server.state.store.list_accepted_followers(ActorRef::Local(account.id)).await.unwrap().len(),
        1
    );

    let undo_body = serde_json::to_vec(&json!({
        "id": format!("https://remote.example.com/activities/{}", Uuid::new_v4()),
        "type": "Undo",
        "actor": remote.actor_uri,
        "object": {
            "id": follow_uri,
            "type": "Follow"
        }
    }))
    .unwrap();
    let undo_response = server
        .signed_post("/users/testuser/inbox", &undo_body, &remote.public_key_id, common::TEST_PRIVATE_KEY)
        .await;
    assert_eq!(undo_response.status(), 200);

    assert_eq!(
        server.state.store.list_accepted_followers(ActorRef::Local(account.id)).await.unwrap().len(),
        0
    );
}

#[tokio::test]
async fn test_remote_like_increments_note_like_count() {
    let server = TestServer::new().await;
    let account = server.create_test_account().await;
    let remote = server.create_remote_actor("alice", "remote.example.com").await;

    let note_uri = format!("{}/users/testuser/notes/{}", server.state.config.server.base_url(), Uuid::new_v4());
    server
        .state
        .store
        .insert_note(NewNote {
            id: Uuid::new_v4(),
            object_uri: note_uri.clone(),
            created_by: account.id.to_string(),
            message: "likeable".to_string(),
            content_html: "<p>likeable</p>".to_string(),
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

    let body = serde_json::to_vec(&json!({
        "id": format!("https://remote.example.com/activities/{}", Uuid::new_v4()),
        "type": "Like",
        "actor": remote.actor_uri,
        "object": note_uri
    }))
    .unwrap();

    let response = server
        .signed_post("/users/testuser/inbox", &body, &remote.public_key_id, common::TEST_PRIVATE_KEY)
        .await;
    assert_eq!(response.status(), 200);

    let note = server.state.store.get_note_by_uri(&note_uri).await.unwrap().unwrap();
    assert_eq!(note.like_count, 1);
}

#[tokio::test]
async fn test_delivery_task_reschedules_with_backoff_on_failure() {
    use stegodon_federation::data::{backoff_for_attempt, NewDeliveryTask};

    let server = TestServer::new().await;
    let now = Utc::now();

    server
        .state
        .store
        .enqueue_delivery_task(NewDeliveryTask {
            id: Uuid::new_v4(),
            target_inbox: "https://down.example.com/inbox".to_string(),
            body_bytes: b"{}".to_vec(),
            headers_json: "[]".to_string(),
            key_id: "https://test.example.com/users/testuser#main-key".to_string(),
            private_key_pem: common::TEST_PRIVATE_KEY.to_string(),
            created_at: now,
        })
        .await
        .unwrap();

    let reserved = server
        .state
        .store
        .reserve_due_delivery_tasks(10, now, now + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert_eq!(reserved.len(), 1);
    let task = &reserved[0];
    assert_eq!(task.attempt, 0);

    let next_attempt = task.attempt + 1;
    let delay = backoff_for_attempt(next_attempt);
    assert_eq!(delay, 30); // BACKOFF_SCHEDULE_SECS[1]

    server
        .state
        .store
        .reschedule_delivery_task(
            task.id,
            next_attempt,
            now + chrono::Duration::seconds(delay),
            "connection refused",
        )
        .await
        .unwrap();

    // Not due yet: still within the backoff window.
    let still_reserved = server
        .state
        .store
        .reserve_due_delivery_tasks(10, now + chrono::Duration::seconds(1), now + chrono::Duration::minutes(5))
        .await
        .unwrap();
    assert!(still_reserved.is_empty());

    // Due once the backoff window has elapsed.
    let due_later = server
        .state
        .store
        .reserve_due_delivery_tasks(
            10,
            now + chrono::Duration::seconds(delay + 1),
            now + chrono::Duration::minutes(5),
        )
        .await
        .unwrap();
    assert_eq!(due_later.len(), 1);
    assert_eq!(due_later[0].attempt, 1);
    assert_eq!(due_later[0].last_error.as_deref(), Some("connection refused"));
}

#[tokio::test]
async fn test_webfinger_for_local_user() {
    let server = TestServer::new().await;
    server.create_test_account().await;

    let response = server
        .client
        .get(&server.url("/.well-known/webfinger?resource=acct:testuser@test.example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["subject"], "acct:testuser@test.example.com");
}
