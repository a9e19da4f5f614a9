//! Outbox builder (C5).
//!
//! Constructs outgoing activities with correct addressing, content HTML,
//! and tags, persists the `ActivityRecord`, and enqueues `DeliveryTask`s.
//! The `builder` submodule is grounded on the teacher's
//! `delivery.rs::builder` (same JSON shape per activity type); addressing
//! and the delivery-set computation are new, per the visibility rules and
//! shared-inbox preference this core requires.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::Clock;
use crate::data::{NewDeliveryTask, Store};
use crate::error::AppError;
use crate::federation::actor_resolver::ActorResolver;
use crate::federation::content::Tag;

pub const PUBLIC_COLLECTION: &str = "https://www.w3.org/ns/activitystreams#Public";

/// Resolved recipient set for a single outgoing activity: every inbox to
/// deliver to, preferring a peer's `sharedInbox` whenever at least two
/// resolved recipients on the same domain advertise one (the already-decided
/// reading of "preferring sharedInbox where present and where multiple
/// recipients share it").
pub async fn resolve_delivery_inboxes(
    resolver: &ActorResolver,
    recipient_actor_uris: &[String],
) -> Result<Vec<String>, AppError> {
    let mut per_domain: std::collections::HashMap<String, Vec<(String, Option<String>)>> =
        std::collections::HashMap::new();

    for actor_uri in recipient_actor_uris {
        if actor_uri == PUBLIC_COLLECTION {
            continue;
        }
        let actor = match resolver.resolve_actor_by_uri(actor_uri).await {
            Ok(a) => a,
            Err(_) => continue,
        };
        per_domain
            .entry(actor.domain.clone())
            .or_default()
            .push((actor.inbox_uri.clone(), actor.shared_inbox_uri.clone()));
    }

    let mut inboxes = HashSet::new();
    for (_, recipients) in per_domain {
        if recipients.len() >= 2 {
            if let Some(shared) = recipients.iter().find_map(|(_, shared)| shared.clone()) {
                inboxes.insert(shared);
                continue;
            }
        }
        for (inbox, _) in recipients {
            inboxes.insert(inbox);
        }
    }

    Ok(inboxes.into_iter().collect())
}

/// Dereference a followers collection to individual remote follower actor
/// URIs, for building the addressing/delivery set of a `public`/`unlisted`/
/// `followers` post. Local followers never receive federation deliveries
/// (they read the timeline directly, not via inbox delivery).
pub async fn remote_follower_actor_uris(
    store: &dyn Store,
    local_account_id: Uuid,
) -> Result<Vec<String>, AppError> {
    let followers = store
        .list_accepted_followers(crate::data::ActorRef::Local(local_account_id))
        .await?;

    let mut actor_uris = Vec::new();
    for follow in followers {
        let follower = follow.follower();
        if follower.is_local() {
            continue;
        }
        if let Some(actor) = store.get_remote_actor_by_id(follower.id()).await? {
            actor_uris.push(actor.actor_uri);
        }
    }
    Ok(actor_uris)
}

/// Persist the activity record and enqueue delivery tasks for each resolved
/// inbox. Called after a `builder::*` function produces the activity JSON.
pub async fn publish(
    store: &dyn Store,
    clock: &dyn Clock,
    activity: &Value,
    activity_type: &str,
    actor_uri: &str,
    object_uri: Option<&str>,
    inboxes: Vec<String>,
    private_key_pem: &str,
    key_id: &str,
) -> Result<(), AppError> {
    let activity_uri = activity
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Internal(anyhow::anyhow!("activity missing id")))?
        .to_string();

    let now = clock.now();
    store
        .insert_activity_record(crate::data::ActivityRecord {
            activity_uri,
            activity_type: activity_type.to_string(),
            actor_uri: actor_uri.to_string(),
            object_uri: object_uri.map(str::to_string),
            in_reply_to_uri: None,
            received_at: now,
            raw_json: serde_json::to_string(activity)
                .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
            from_relay: false,
        })
        .await?;

    let body = serde_json::to_vec(activity).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
    // `Date`/`Signature`/`Digest` are NOT computed here: the delivery worker
    // (C6) signs fresh on every attempt, since a retry can land hours after
    // enqueue and a stale `Date` would fall outside the verifier's skew
    // window (see signature::MAX_DATE_SKEW_SECONDS).
    let headers = vec![(
        "Content-Type".to_string(),
        "application/activity+json".to_string(),
    )];
    let headers_json =
        serde_json::to_string(&headers).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;

    for inbox in inboxes {
        store
            .enqueue_delivery_task(NewDeliveryTask {
                id: Uuid::new_v4(),
                target_inbox: inbox,
                body_bytes: body.clone(),
                headers_json: headers_json.clone(),
                key_id: key_id.to_string(),
                private_key_pem: private_key_pem.to_string(),
                created_at: now,
            })
            .await?;
        crate::metrics::ACTIVITYPUB_ACTIVITIES_SENT
            .with_label_values(&[activity_type])
            .inc();
    }

    Ok(())
}

/// Expand `to`/`cc` entries into concrete actor URIs for inbox resolution:
/// the `Public` collection carries no inbox, and the followers collection
/// is dereferenced to each remote follower's actor URI.
async fn expand_recipients(
    store: &dyn Store,
    actor_uri: &str,
    local_account_id: Uuid,
    to: &[String],
    cc: &[String],
) -> Result<Vec<String>, AppError> {
    let followers_uri = format!("{actor_uri}/followers");
    let mut expanded = Vec::new();
    let mut needs_followers = false;

    for entry in to.iter().chain(cc.iter()) {
        if entry == PUBLIC_COLLECTION {
            continue;
        }
        if entry == &followers_uri {
            needs_followers = true;
            continue;
        }
        expanded.push(entry.clone());
    }

    if needs_followers {
        expanded.extend(remote_follower_actor_uris(store, local_account_id).await?);
    }

    Ok(expanded)
}

/// Addressing for a local post, per visibility.
pub fn audience_for_visibility(actor_uri: &str, visibility: &str) -> (Vec<String>, Vec<String>) {
    let followers = format!("{actor_uri}/followers");
    match visibility {
        "public" => (vec![PUBLIC_COLLECTION.to_string()], vec![followers]),
        "unlisted" => (vec![followers], vec![PUBLIC_COLLECTION.to_string()]),
        "followers" => (vec![followers], Vec::new()),
        "direct" => (Vec::new(), Vec::new()),
        _ => (vec![PUBLIC_COLLECTION.to_string()], vec![followers]),
    }
}

/// Shared context builder for built activities; adds the `Hashtag` term
/// when any hashtag tags are present, per the wire format the discovery
/// endpoints advertise.
fn context_for_tags(tags: &[Tag]) -> Value {
    let has_hashtag = tags.iter().any(|t| matches!(t, Tag::Hashtag { .. }));
    if has_hashtag {
        serde_json::json!([
            "https://www.w3.org/ns/activitystreams",
            { "Hashtag": "as:Hashtag" }
        ])
    } else {
        serde_json::json!("https://www.w3.org/ns/activitystreams")
    }
}

pub mod builder {
    use super::*;

    #[allow(clippy::too_many_arguments)]
    pub fn note(
        id: &str,
        attributed_to: &str,
        content_html: &str,
        published: &DateTime<Utc>,
        in_reply_to: Option<&str>,
        sensitive: bool,
        content_warning: Option<&str>,
        tags: &[Tag],
        to: &[String],
        cc: &[String],
    ) -> Value {
        let mut object = serde_json::json!({
            "type": "Note",
            "id": id,
            "attributedTo": attributed_to,
            "content": content_html,
            "published": published.to_rfc3339(),
            "to": to,
            "cc": cc,
            "sensitive": sensitive,
            "tag": tags.iter().map(Tag::to_json).collect::<Vec<_>>(),
        });
        if let Some(in_reply_to) = in_reply_to {
            object["inReplyTo"] = serde_json::json!(in_reply_to);
        }
        if let Some(cw) = content_warning {
            object["summary"] = serde_json::json!(cw);
        }
        object
    }

    pub fn create(
        id: &str,
        actor: &str,
        note: Value,
        tags: &[Tag],
        to: &[String],
        cc: &[String],
        published: &DateTime<Utc>,
    ) -> Value {
        serde_json::json!({
            "@context": context_for_tags(tags),
            "type": "Create",
            "id": id,
            "actor": actor,
            "object": note,
            "to": to,
            "cc": cc,
            "published": published.to_rfc3339(),
        })
    }

    pub fn update_note(
        id: &str,
        actor: &str,
        note: Value,
        tags: &[Tag],
        to: &[String],
        cc: &[String],
        updated: &DateTime<Utc>,
    ) -> Value {
        let mut note = note;
        note["updated"] = serde_json::json!(updated.to_rfc3339());
        serde_json::json!({
            "@context": context_for_tags(tags),
            "type": "Update",
            "id": id,
            "actor": actor,
            "object": note,
            "to": to,
            "cc": cc,
            "published": updated.to_rfc3339(),
        })
    }

    pub fn delete_note(id: &str, actor: &str, object_uri: &str, to: &[String], cc: &[String]) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Delete",
            "id": id,
            "actor": actor,
            "object": {
                "type": "Tombstone",
                "id": object_uri,
            },
            "to": to,
            "cc": cc,
        })
    }

    pub fn follow(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Follow",
            "id": id,
            "actor": actor,
            "object": object,
        })
    }

    pub fn accept(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Accept",
            "id": id,
            "actor": actor,
            "object": object,
        })
    }

    pub fn undo(id: &str, actor: &str, object: Value) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Undo",
            "id": id,
            "actor": actor,
            "object": object,
        })
    }

    pub fn like(id: &str, actor: &str, object: &str) -> Value {
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Like",
            "id": id,
            "actor": actor,
            "object": object,
        })
    }
}

/// Wrap a local account's private key / key id for publishing, threaded
/// through by the caller (the TUI/CLI collaborator the spec treats as
/// external) rather than looked up here.
pub struct LocalSigner<'a> {
    pub actor_uri: &'a str,
    pub key_id: &'a str,
    pub private_key_pem: &'a str,
}

/// Build, persist, and enqueue a `Create(Note)` for a freshly authored
/// local note. `parent_author_inbox` is the reply parent's inbox if remote,
/// added to `cc` per spec.
#[allow(clippy::too_many_arguments)]
pub async fn publish_create_note(
    store: &dyn Store,
    clock: &dyn Clock,
    resolver: &ActorResolver,
    signer: &LocalSigner<'_>,
    local_account_id: Uuid,
    note_object_uri: &str,
    content_html: &str,
    visibility: &str,
    in_reply_to_uri: Option<&str>,
    parent_author_inbox: Option<&str>,
    sensitive: bool,
    content_warning: Option<&str>,
    tags: &[Tag],
) -> Result<(), AppError> {
    let now = clock.now();
    let (mut to, mut cc) = audience_for_visibility(signer.actor_uri, visibility);

    let mention_actor_uris: Vec<String> = tags
        .iter()
        .filter_map(|t| match t {
            Tag::Mention { href, .. } => Some(href.clone()),
            _ => None,
        })
        .collect();

    if visibility == "direct" {
        to.extend(mention_actor_uris.iter().cloned());
    } else {
        cc.extend(mention_actor_uris.iter().cloned());
    }

    if let Some(parent_inbox) = parent_author_inbox {
        if !cc.contains(&parent_inbox.to_string()) {
            cc.push(parent_inbox.to_string());
        }
    }

    let activity_uri = format!("{}/activities/{}", signer.actor_uri, Uuid::new_v4());
    let note = builder::note(
        note_object_uri,
        signer.actor_uri,
        content_html,
        &now,
        in_reply_to_uri,
        sensitive,
        content_warning,
        tags,
        &to,
        &cc,
    );
    let activity = builder::create(&activity_uri, signer.actor_uri, note, tags, &to, &cc, &now);

    let inboxes =
        resolve_delivery_inboxes(resolver, &expand_recipients(store, signer.actor_uri, local_account_id, &to, &cc).await?)
            .await?;

    publish(
        store,
        clock,
        &activity,
        "Create",
        signer.actor_uri,
        Some(note_object_uri),
        inboxes,
        signer.private_key_pem,
        signer.key_id,
    )
    .await
}

/// Build, persist, and enqueue an `Accept(Follow)` in response to an
/// inbound Follow, addressed to the follower's inbox only.
pub async fn publish_accept_follow(
    store: &dyn Store,
    clock: &dyn Clock,
    signer: &LocalSigner<'_>,
    follow_activity_uri: &str,
    follower_inbox: &str,
) -> Result<(), AppError> {
    let activity_uri = format!("{}/activities/{}", signer.actor_uri, Uuid::new_v4());
    let activity = builder::accept(
        &activity_uri,
        signer.actor_uri,
        serde_json::json!({ "type": "Follow", "id": follow_activity_uri }),
    );
    publish(
        store,
        clock,
        &activity,
        "Accept",
        signer.actor_uri,
        None,
        vec![follower_inbox.to_string()],
        signer.private_key_pem,
        signer.key_id,
    )
    .await
}

/// Build, persist, and enqueue a `Follow` (used both for a user-initiated
/// follow and for relay subscription, C8).
pub async fn publish_follow(
    store: &dyn Store,
    clock: &dyn Clock,
    signer: &LocalSigner<'_>,
    target_actor_uri: &str,
    target_inbox: &str,
) -> Result<String, AppError> {
    let activity_uri = format!("{}/activities/{}", signer.actor_uri, Uuid::new_v4());
    let activity = builder::follow(&activity_uri, signer.actor_uri, target_actor_uri);
    publish(
        store,
        clock,
        &activity,
        "Follow",
        signer.actor_uri,
        Some(target_actor_uri),
        vec![target_inbox.to_string()],
        signer.private_key_pem,
        signer.key_id,
    )
    .await?;
    Ok(activity_uri)
}

/// Build, persist, and enqueue an `Undo(Follow)`.
pub async fn publish_undo_follow(
    store: &dyn Store,
    clock: &dyn Clock,
    signer: &LocalSigner<'_>,
    follow_activity_uri: &str,
    target_actor_uri: &str,
    target_inbox: &str,
) -> Result<(), AppError> {
    let activity_uri = format!("{}/activities/{}", signer.actor_uri, Uuid::new_v4());
    let activity = builder::undo(
        &activity_uri,
        signer.actor_uri,
        serde_json::json!({ "type": "Follow", "id": follow_activity_uri, "object": target_actor_uri }),
    );
    publish(
        store,
        clock,
        &activity,
        "Undo",
        signer.actor_uri,
        None,
        vec![target_inbox.to_string()],
        signer.private_key_pem,
        signer.key_id,
    )
    .await
}

/// Build, persist, and enqueue a `Like`.
pub async fn publish_like(
    store: &dyn Store,
    clock: &dyn Clock,
    signer: &LocalSigner<'_>,
    note_uri: &str,
    note_author_inbox: &str,
) -> Result<String, AppError> {
    let activity_uri = format!("{}/activities/{}", signer.actor_uri, Uuid::new_v4());
    let activity = builder::like(&activity_uri, signer.actor_uri, note_uri);
    publish(
        store,
        clock,
        &activity,
        "Like",
        signer.actor_uri,
        Some(note_uri),
        vec![note_author_inbox.to_string()],
        signer.private_key_pem,
        signer.key_id,
    )
    .await?;
    Ok(activity_uri)
}

/// Build, persist, and enqueue an `Undo(Like)`.
pub async fn publish_undo_like(
    store: &dyn Store,
    clock: &dyn Clock,
    signer: &LocalSigner<'_>,
    like_activity_uri: &str,
    note_uri: &str,
    note_author_inbox: &str,
) -> Result<(), AppError> {
    let activity_uri = format!("{}/activities/{}", signer.actor_uri, Uuid::new_v4());
    let activity = builder::undo(
        &activity_uri,
        signer.actor_uri,
        serde_json::json!({ "type": "Like", "id": like_activity_uri, "object": note_uri }),
    );
    publish(
        store,
        clock,
        &activity,
        "Undo",
        signer.actor_uri,
        None,
        vec![note_author_inbox.to_string()],
        signer.private_key_pem,
        signer.key_id,
    )
    .await
}

/// Build, persist, and enqueue a `Delete(Tombstone)` for a removed note.
pub async fn publish_delete_note(
    store: &dyn Store,
    clock: &dyn Clock,
    resolver: &ActorResolver,
    signer: &LocalSigner<'_>,
    local_account_id: Uuid,
    note_object_uri: &str,
    visibility: &str,
) -> Result<(), AppError> {
    let (to, cc) = audience_for_visibility(signer.actor_uri, visibility);
    let activity_uri = format!("{}/activities/{}", signer.actor_uri, Uuid::new_v4());
    let activity = builder::delete_note(&activity_uri, signer.actor_uri, note_object_uri, &to, &cc);

    let recipients = expand_recipients(store, signer.actor_uri, local_account_id, &to, &cc).await?;
    let inboxes = resolve_delivery_inboxes(resolver, &recipients).await?;

    publish(
        store,
        clock,
        &activity,
        "Delete",
        signer.actor_uri,
        Some(note_object_uri),
        inboxes,
        signer.private_key_pem,
        signer.key_id,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_for_visibility_matches_spec_table() {
        let actor = "https://self.example/users/alice";
        assert_eq!(
            audience_for_visibility(actor, "public"),
            (vec![PUBLIC_COLLECTION.to_string()], vec![format!("{actor}/followers")])
        );
        assert_eq!(
            audience_for_visibility(actor, "unlisted"),
            (vec![format!("{actor}/followers")], vec![PUBLIC_COLLECTION.to_string()])
        );
        assert_eq!(audience_for_visibility(actor, "followers"), (vec![format!("{actor}/followers")], vec![]));
        assert_eq!(audience_for_visibility(actor, "direct"), (vec![], vec![]));
    }

    #[test]
    fn context_adds_hashtag_term_only_when_present() {
        let no_tags = context_for_tags(&[]);
        assert_eq!(no_tags, serde_json::json!("https://www.w3.org/ns/activitystreams"));

        let with_hashtag = context_for_tags(&[Tag::Hashtag {
            name: "rust".into(),
            href: "https://self.example/tags/rust".into(),
        }]);
        assert!(with_hashtag.is_array());
    }

    #[test]
    fn delete_note_builder_wraps_tombstone() {
        let activity = builder::delete_note(
            "https://self.example/activities/1",
            "https://self.example/users/alice",
            "https://self.example/notes/1",
            &[PUBLIC_COLLECTION.to_string()],
            &[],
        );
        assert_eq!(activity["object"]["type"], "Tombstone");
        assert_eq!(activity["object"]["id"], "https://self.example/notes/1");
    }
}
