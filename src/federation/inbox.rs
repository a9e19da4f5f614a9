//! Inbox pipeline (C4).
//!
//! Parses, authenticates (by the caller, via C1), authorizes, deduplicates,
//! and dispatches incoming activities to per-type handlers, maintaining
//! denormalized counters. Grounded on the teacher's `activity.rs`
//! (`ActivityProcessor`, the activity-type enum, the address-matching
//! helpers `parse_account_address`/`follow_addresses_match`), redesigned
//! for multi-account local actors and polymorphic `ActorRef`s.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::data::{
    ActivityRecord, ActorRef, NewFollow, NewNote, NewNotification, NoteAuthor, NotificationKind,
    Store,
};
use crate::error::AppError;
use crate::federation::actor_resolver::ActorResolver;
use crate::federation::content::sanitize_remote_html;
use crate::federation::outbox::{self, LocalSigner};
use crate::metrics::ACTIVITYPUB_ACTIVITIES_RECEIVED;

/// Maximum inbox request body size; larger bodies are rejected with `413`
/// before reaching this pipeline.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Ancestor-walk depth cap for reply-counter recomputation, bounding work
/// on adversarial reply chains.
pub const MAX_ANCESTOR_WALK_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActivityType {
    Create,
    Update,
    Delete,
    Follow,
    Accept,
    Undo,
    Like,
    Announce,
}

impl ActivityType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "Create" => Some(Self::Create),
            "Update" => Some(Self::Update),
            "Delete" => Some(Self::Delete),
            "Follow" => Some(Self::Follow),
            "Accept" => Some(Self::Accept),
            "Undo" => Some(Self::Undo),
            "Like" => Some(Self::Like),
            "Announce" => Some(Self::Announce),
            _ => None,
        }
    }
}

pub struct InboxProcessor {
    store: Arc<dyn Store>,
    resolver: Arc<ActorResolver>,
    clock: Arc<dyn Clock>,
    /// This node's public base URL, e.g. `https://stegodon.example`, used to
    /// build local actor URIs (`{base_url}/users/{username}`).
    base_url: String,
}

fn object_id_str(object: &serde_json::Value) -> Option<String> {
    object
        .as_str()
        .map(str::to_string)
        .or_else(|| object.get("id").and_then(|v| v.as_str()).map(str::to_string))
}

fn domain_of(uri: &str) -> String {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

impl InboxProcessor {
    pub fn new(
        store: Arc<dyn Store>,
        resolver: Arc<ActorResolver>,
        clock: Arc<dyn Clock>,
        base_url: String,
    ) -> Self {
        Self { store, resolver, clock, base_url }
    }

    /// Entry point: `activity` is the parsed JSON-LD body; `signer_actor_uri`
    /// is the actor identity the HTTP Signature verified (may be a relay
    /// acting on another actor's behalf; see step 4).
    pub async fn process(&self, activity: serde_json::Value, signer_actor_uri: &str) -> Result<(), AppError> {
        let activity_uri = activity
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::BadRequest("activity missing id".to_string()))?
            .to_string();

        let type_str = activity
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::BadRequest("activity missing type".to_string()))?;

        let activity_type = match ActivityType::parse(type_str) {
            Some(t) => t,
            None => {
                ACTIVITYPUB_ACTIVITIES_RECEIVED.with_label_values(&[type_str, "ignored"]).inc();
                return Ok(());
            }
        };

        let activity_actor = activity
            .get("actor")
            .and_then(|v| object_id_str(v))
            .unwrap_or_else(|| signer_actor_uri.to_string());

        if self.store.activity_exists(&activity_uri).await? {
            ACTIVITYPUB_ACTIVITIES_RECEIVED.with_label_values(&[type_str, "duplicate"]).inc();
            return Ok(());
        }

        let relay = self.store.get_relay_by_domain(&domain_of(signer_actor_uri)).await?;
        let from_relay = relay.as_ref().is_some_and(|r| r.state == "active" || r.state == "paused");

        if matches!(activity_type, ActivityType::Undo | ActivityType::Delete | ActivityType::Update)
            && activity_actor != signer_actor_uri
            && !from_relay
        {
            return Err(AppError::Unauthorized);
        }

        let outcome = match activity_type {
            ActivityType::Follow => self.handle_follow(&activity, &activity_uri, &activity_actor).await,
            ActivityType::Accept => self.handle_accept(&activity).await,
            ActivityType::Undo => self.handle_undo(&activity, &activity_actor).await,
            ActivityType::Create => {
                self.handle_create(&activity, &activity_uri, &activity_actor, from_relay).await
            }
            ActivityType::Update => self.handle_update(&activity, &activity_actor).await,
            ActivityType::Delete => self.handle_delete(&activity, &activity_actor).await,
            ActivityType::Like => self.handle_like(&activity, &activity_uri, &activity_actor).await,
            ActivityType::Announce => {
                self.handle_announce(&activity, &activity_uri, &activity_actor, relay.as_ref()).await
            }
        };

        match &outcome {
            Ok(()) => {
                ACTIVITYPUB_ACTIVITIES_RECEIVED.with_label_values(&[type_str, "accepted"]).inc();
            }
            Err(_) => {
                ACTIVITYPUB_ACTIVITIES_RECEIVED.with_label_values(&[type_str, "rejected"]).inc();
            }
        }
        outcome?;

        self.store
            .insert_activity_record(ActivityRecord {
                activity_uri,
                activity_type: type_str.to_string(),
                actor_uri: activity_actor,
                object_uri: activity.get("object").and_then(object_id_str),
                in_reply_to_uri: activity
                    .get("object")
                    .and_then(|o| o.get("inReplyTo"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
                received_at: self.clock.now(),
                raw_json: serde_json::to_string(&activity)
                    .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
                from_relay,
            })
            .await?;

        Ok(())
    }

    /// `Follow(local actor)`: target must be local and not the follower
    /// itself. Creates the Follow row accepted, enqueues Accept(Follow),
    /// and raises a follow notification.
    async fn handle_follow(
        &self,
        activity: &serde_json::Value,
        activity_uri: &str,
        follower_actor_uri: &str,
    ) -> Result<(), AppError> {
        let target_uri = activity
            .get("object")
            .and_then(object_id_str)
            .ok_or_else(|| AppError::BadRequest("Follow missing object".to_string()))?;

        let target_username = local_username_from_actor_uri(&target_uri)
            .ok_or_else(|| AppError::BadRequest("Follow target is not a local actor".to_string()))?;
        let target_account = self
            .store
            .get_account_by_username(&target_username)
            .await?
            .ok_or(AppError::NotFound)?;

        let follower = self.resolver.resolve_actor_by_uri(follower_actor_uri).await?;
        if follower.actor_uri == target_uri {
            return Err(AppError::BadRequest("self-follow not allowed".to_string()));
        }

        let now = self.clock.now();
        let inserted = self
            .store
            .insert_follow_if_absent(NewFollow {
                id: Uuid::new_v4(),
                follower: ActorRef::Remote(follower.id),
                target: ActorRef::Local(target_account.id),
                state: "accepted",
                activity_uri: activity_uri.to_string(),
                created_at: now,
            })
            .await?;

        if inserted.is_none() {
            return Ok(());
        }

        self.store
            .insert_notification(NewNotification {
                id: Uuid::new_v4(),
                account_id: target_account.id,
                kind: NotificationKind::Follow,
                actor: ActorRef::Remote(follower.id),
                note_preview: None,
                created_at: now,
            })
            .await?;

        let signer = LocalSigner {
            actor_uri: &target_uri,
            key_id: &format!("{target_uri}#main-key"),
            private_key_pem: &target_account.signing_private_key,
        };
        outbox::publish_accept_follow(
            self.store.as_ref(),
            self.clock.as_ref(),
            &signer,
            activity_uri,
            &follower.inbox_uri,
        )
        .await
    }

    /// `Accept(Follow)`: transitions a matching pending outgoing Follow to
    /// accepted, or, if the `Follow` was a relay subscription rather than
    /// an account's, activates the matching `RelaySubscription`.
    async fn handle_accept(&self, activity: &serde_json::Value) -> Result<(), AppError> {
        let follow_uri = activity
            .get("object")
            .and_then(object_id_str)
            .ok_or_else(|| AppError::BadRequest("Accept missing object".to_string()))?;
        let matched_follow = self.store.accept_follow(&follow_uri).await?;
        if !matched_follow {
            crate::federation::relay::handle_accept(self.store.as_ref(), &follow_uri).await?;
        }
        Ok(())
    }

    /// `Undo(Follow)`: signer must have authored the Follow being undone.
    async fn handle_undo(&self, activity: &serde_json::Value, signer_actor_uri: &str) -> Result<(), AppError> {
        let object = activity.get("object").ok_or_else(|| AppError::BadRequest("Undo missing object".to_string()))?;
        let inner_type = object.get("type").and_then(|v| v.as_str());

        if inner_type == Some("Follow") || inner_type.is_none() {
            let follow_uri = object
                .get("id")
                .and_then(|v| v.as_str())
                .or_else(|| object.as_str())
                .ok_or_else(|| AppError::BadRequest("Undo(Follow) missing id".to_string()))?;

            let follow = self
                .store
                .get_follow_by_activity_uri(follow_uri)
                .await?
                .ok_or(AppError::NotFound)?;

            let follower = follow.follower();
            let signer = self.resolver_actor_uri_for(follower).await?;
            if signer != signer_actor_uri {
                return Err(AppError::Unauthorized);
            }
            self.store.delete_follow(follow.follower(), follow.target()).await?;
            return Ok(());
        }

        if inner_type == Some("Like") {
            let like_uri = object
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AppError::BadRequest("Undo(Like) missing id".to_string()))?;
            if let Some(like) = self.store.delete_like_by_activity_uri(like_uri).await? {
                self.store.recompute_like_count(&like.note_uri).await?;
            }
            return Ok(());
        }

        Ok(())
    }

    async fn resolver_actor_uri_for(&self, actor: ActorRef) -> Result<String, AppError> {
        match actor {
            ActorRef::Local(id) => {
                let account = self.store.get_account_by_id(id).await?.ok_or(AppError::NotFound)?;
                Ok(self.local_actor_uri(&account.username))
            }
            ActorRef::Remote(id) => {
                let remote = self.store.get_remote_actor_by_id(id).await?.ok_or(AppError::NotFound)?;
                Ok(remote.actor_uri)
            }
        }
    }

    /// `Create(Note)`: accepted when the sender is followed, the note
    /// replies to a local note, or it arrives from a subscribed relay.
    async fn handle_create(
        &self,
        activity: &serde_json::Value,
        _activity_uri: &str,
        actor_uri: &str,
        from_relay: bool,
    ) -> Result<(), AppError> {
        let object = activity
            .get("object")
            .ok_or_else(|| AppError::BadRequest("Create missing object".to_string()))?;
        let object_type = object.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if object_type != "Note" {
            return Ok(());
        }

        let object_uri = object
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::BadRequest("Note missing id".to_string()))?
            .to_string();

        let in_reply_to_uri =
            object.get("inReplyTo").and_then(|v| v.as_str()).map(str::to_string);

        let parent_is_local = match &in_reply_to_uri {
            Some(uri) => self.store.get_note_by_uri(uri).await?.is_some(),
            None => false,
        };

        let actor = self.resolver.resolve_actor_by_uri(actor_uri).await?;
        let is_followed = self.any_local_account_follows(actor.id).await?;

        if !is_followed && !parent_is_local && !from_relay {
            return Ok(());
        }

        let content = object
            .get("content")
            .and_then(|v| v.as_str())
            .map(sanitize_remote_html)
            .unwrap_or_default();
        let message = strip_html_tags(&content);
        let created_at = object
            .get("published")
            .and_then(|v| v.as_str())
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(|| self.clock.now());
        let visibility = infer_visibility(object, &actor.actor_uri);
        let sensitive = object.get("sensitive").and_then(|v| v.as_bool()).unwrap_or(false);
        let content_warning = object.get("summary").and_then(|v| v.as_str()).map(str::to_string);

        let existing = self.store.get_note_by_uri(&object_uri).await?;
        if existing.is_none() {
            self.store
                .insert_note(NewNote {
                    id: Uuid::new_v4(),
                    object_uri: object_uri.clone(),
                    created_by: NoteAuthor::Remote(format!("@{}@{}", actor.username, actor.domain)).to_column(),
                    message,
                    content_html: content,
                    created_at,
                    in_reply_to_uri: in_reply_to_uri.clone(),
                    visibility,
                    sensitive,
                    content_warning,
                    from_relay,
                    raw_json: Some(
                        serde_json::to_string(activity).map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?,
                    ),
                })
                .await?;
        }

        if let Some(parent_uri) = &in_reply_to_uri {
            self.store.recompute_reply_counters(parent_uri).await?;
            if let Some(parent) = self.store.get_note_by_uri(parent_uri).await? {
                if let NoteAuthor::Local(account_id) = NoteAuthor::from_column(&parent.created_by) {
                    self.store
                        .insert_notification(NewNotification {
                            id: Uuid::new_v4(),
                            account_id,
                            kind: NotificationKind::Reply,
                            actor: ActorRef::Remote(actor.id),
                            note_preview: Some(truncate_preview(&parent.message)),
                            created_at: self.clock.now(),
                        })
                        .await?;
                }
            }
        }

        for mentioned in mentioned_local_usernames(object) {
            if let Some(account) = self.store.get_account_by_username(&mentioned).await? {
                self.store
                    .insert_notification(NewNotification {
                        id: Uuid::new_v4(),
                        account_id: account.id,
                        kind: NotificationKind::Mention,
                        actor: ActorRef::Remote(actor.id),
                        note_preview: Some(truncate_preview(&object_uri)),
                        created_at: self.clock.now(),
                    })
                    .await?;
            }
        }

        Ok(())
    }

    async fn any_local_account_follows(&self, remote_actor_id: Uuid) -> Result<bool, AppError> {
        let followers = self.store.list_accepted_followers(ActorRef::Remote(remote_actor_id)).await?;
        Ok(followers.iter().any(|f| f.follower().is_local()))
    }

    /// `Update(Note)` / `Update(Person)`: sender must own the note, or be
    /// the actor whose profile is being refreshed.
    async fn handle_update(&self, activity: &serde_json::Value, actor_uri: &str) -> Result<(), AppError> {
        let object = activity
            .get("object")
            .ok_or_else(|| AppError::BadRequest("Update missing object".to_string()))?;
        let object_type = object.get("type").and_then(|v| v.as_str()).unwrap_or("");

        if object_type == "Person" {
            self.resolver.resolve_actor_by_uri(actor_uri).await?;
            return Ok(());
        }

        if object_type == "Note" {
            let object_uri = object
                .get("id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| AppError::BadRequest("Note missing id".to_string()))?;
            let existing = self.store.get_note_by_uri(object_uri).await?.ok_or(AppError::NotFound)?;
            if existing.created_by != format_remote_created_by(actor_uri) {
                return Err(AppError::Unauthorized);
            }
            let content = object
                .get("content")
                .and_then(|v| v.as_str())
                .map(sanitize_remote_html)
                .unwrap_or_default();
            self.store
                .update_note(
                    object_uri,
                    crate::data::NoteUpdate {
                        message: strip_html_tags(&content),
                        content_html: content,
                        sensitive: object.get("sensitive").and_then(|v| v.as_bool()).unwrap_or(false),
                        content_warning: object.get("summary").and_then(|v| v.as_str()).map(str::to_string),
                    },
                )
                .await?;
        }

        Ok(())
    }

    /// `Delete(Note)` / `Delete(Actor)`: sender must own the target, or it
    /// must be a Tombstone of a note they authored.
    async fn handle_delete(&self, activity: &serde_json::Value, actor_uri: &str) -> Result<(), AppError> {
        let object = activity
            .get("object")
            .ok_or_else(|| AppError::BadRequest("Delete missing object".to_string()))?;

        let target_uri = object
            .as_str()
            .map(str::to_string)
            .or_else(|| object.get("id").and_then(|v| v.as_str()).map(str::to_string));

        let Some(target_uri) = target_uri else {
            return Ok(());
        };

        if target_uri == actor_uri {
            if let Some(actor) = self.resolver.resolve_actor_by_uri(actor_uri).await.ok() {
                self.store.delete_follows_referencing(ActorRef::Remote(actor.id)).await?;
                self.store.delete_remote_actor(actor.id).await?;
            }
            return Ok(());
        }

        if let Some(note) = self.store.get_note_by_uri(&target_uri).await? {
            if note.created_by == format_remote_created_by(actor_uri) {
                self.store.delete_note(&target_uri).await?;
                if let Some(parent_uri) = &note.in_reply_to_uri {
                    self.store.recompute_reply_counters(parent_uri).await?;
                }
            } else {
                return Err(AppError::Unauthorized);
            }
        }

        Ok(())
    }

    /// `Like`: actor need not already be known (it's resolved on demand).
    async fn handle_like(
        &self,
        activity: &serde_json::Value,
        activity_uri: &str,
        actor_uri: &str,
    ) -> Result<(), AppError> {
        let note_uri = activity
            .get("object")
            .and_then(object_id_str)
            .ok_or_else(|| AppError::BadRequest("Like missing object".to_string()))?;
        let note = self.store.get_note_by_uri(&note_uri).await?.ok_or(AppError::NotFound)?;
        let actor = self.resolver.resolve_actor_by_uri(actor_uri).await?;

        let inserted = self
            .store
            .insert_like_if_absent(
                Uuid::new_v4(),
                ActorRef::Remote(actor.id),
                &note_uri,
                activity_uri,
                self.clock.now(),
            )
            .await?;

        if inserted.is_some() {
            self.store.recompute_like_count(&note_uri).await?;
            if let NoteAuthor::Local(account_id) = NoteAuthor::from_column(&note.created_by) {
                self.store
                    .insert_notification(NewNotification {
                        id: Uuid::new_v4(),
                        account_id,
                        kind: NotificationKind::Like,
                        actor: ActorRef::Remote(actor.id),
                        note_preview: Some(truncate_preview(&note.message)),
                        created_at: self.clock.now(),
                    })
                    .await?;
            }
        }

        Ok(())
    }

    /// `Announce`: a paused relay's forwarded activity is logged only (the
    /// `ActivityRecord` insert in `process` covers that); an active relay's
    /// embedded object is treated as `Create(Note)`.
    async fn handle_announce(
        &self,
        activity: &serde_json::Value,
        activity_uri: &str,
        actor_uri: &str,
        relay: Option<&crate::data::RelaySubscription>,
    ) -> Result<(), AppError> {
        let Some(relay) = relay else {
            return Ok(());
        };

        if relay.state == "paused" {
            return Ok(());
        }

        let Some(object) = activity.get("object") else {
            return Ok(());
        };
        if !object.is_object() {
            return Ok(());
        }

        let embedded_create = serde_json::json!({
            "id": activity.get("id").cloned().unwrap_or_default(),
            "type": "Create",
            "actor": object.get("attributedTo").cloned().unwrap_or_else(|| serde_json::json!(actor_uri)),
            "object": object,
        });

        let embedded_actor = embedded_create
            .get("actor")
            .and_then(object_id_str)
            .unwrap_or_else(|| actor_uri.to_string());

        self.handle_create(&embedded_create, activity_uri, &embedded_actor, true).await
    }

    fn local_actor_uri(&self, username: &str) -> String {
        format!("{}/users/{username}", self.base_url)
    }
}

/// Extract `username` from a local actor URI of the form
/// `https://<domain>/users/<username>`, independent of which configured
/// domain is in play (the caller already knows the URI targets this node).
fn local_username_from_actor_uri(uri: &str) -> Option<String> {
    let path = url::Url::parse(uri).ok()?;
    let mut segments = path.path_segments()?;
    let first = segments.next()?;
    if !first.eq_ignore_ascii_case("users") {
        return None;
    }
    segments.next().map(str::to_string)
}

fn format_remote_created_by(actor_uri: &str) -> String {
    let (username, domain) = split_actor_address(actor_uri);
    format!("@{username}@{domain}")
}

fn split_actor_address(actor_uri: &str) -> (String, String) {
    let parsed = url::Url::parse(actor_uri).ok();
    let domain = parsed.as_ref().and_then(|u| u.host_str()).unwrap_or_default().to_string();
    let username = parsed
        .as_ref()
        .and_then(|u| u.path_segments())
        .and_then(|mut s| s.next_back())
        .unwrap_or_default()
        .to_string();
    (username, domain)
}

fn infer_visibility(object: &serde_json::Value, actor_uri: &str) -> String {
    let to: Vec<String> = object
        .get("to")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    let cc: Vec<String> = object
        .get("cc")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();

    const PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
    let followers_uri = format!("{actor_uri}/followers");

    if to.iter().any(|v| v == PUBLIC) {
        "public".to_string()
    } else if cc.iter().any(|v| v == PUBLIC) {
        "unlisted".to_string()
    } else if to.iter().any(|v| v == &followers_uri) {
        "followers".to_string()
    } else {
        "direct".to_string()
    }
}

fn mentioned_local_usernames(object: &serde_json::Value) -> Vec<String> {
    object
        .get("tag")
        .and_then(|v| v.as_array())
        .map(|tags| {
            tags.iter()
                .filter(|t| t.get("type").and_then(|v| v.as_str()) == Some("Mention"))
                .filter_map(|t| t.get("href").and_then(|v| v.as_str()))
                .filter_map(local_username_from_actor_uri)
                .collect()
        })
        .unwrap_or_default()
}

fn strip_html_tags(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}

fn truncate_preview(s: &str) -> String {
    const MAX: usize = 140;
    if s.len() <= MAX {
        s.to_string()
    } else {
        format!("{}…", &s[..MAX])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_username_from_actor_uri_parses_users_path() {
        assert_eq!(
            local_username_from_actor_uri("https://self.example/users/alice"),
            Some("alice".to_string())
        );
        assert_eq!(local_username_from_actor_uri("https://self.example/notes/1"), None);
    }

    #[test]
    fn infer_visibility_reads_to_cc() {
        let actor = "https://self.example/users/alice";
        let public = serde_json::json!({
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "cc": [format!("{actor}/followers")],
        });
        assert_eq!(infer_visibility(&public, actor), "public");

        let direct = serde_json::json!({ "to": ["https://peer/users/bob"], "cc": [] });
        assert_eq!(infer_visibility(&direct, actor), "direct");
    }

    #[test]
    fn strip_html_tags_removes_markup_only() {
        assert_eq!(strip_html_tags("<p>hello <b>world</b></p>"), "hello world");
    }
}
