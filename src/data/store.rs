//! Abstract object store.
//!
//! The federation core never touches SQL directly outside of this module's
//! concrete implementation (`sqlite_store`); every component (C4 inbox, C5
//! outbox, C6 delivery, C7 discovery, C8 relay) depends on the `Store` trait
//! so it can be exercised against an in-memory fake in unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::data::models::{
    Account, ActivityRecord, ActorRef, Boost, DeliveryTask, Follow, Like, Note, Notification,
    NotificationKind, RelaySubscription, RemoteActor,
};
use crate::error::AppError;

/// A newly observed remote actor, upserted by key or URI fetch.
#[derive(Debug, Clone)]
pub struct RemoteActorUpsert {
    pub actor_uri: String,
    pub username: String,
    pub domain: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    pub inbox_uri: String,
    pub shared_inbox_uri: Option<String>,
    pub followers_uri: Option<String>,
    pub public_key_id: String,
    pub public_key_pem: String,
}

/// Fields needed to insert a locally- or remotely-authored note.
#[derive(Debug, Clone)]
pub struct NewNote {
    pub id: Uuid,
    pub object_uri: String,
    pub created_by: String,
    pub message: String,
    pub content_html: String,
    pub created_at: DateTime<Utc>,
    pub in_reply_to_uri: Option<String>,
    pub visibility: String,
    pub sensitive: bool,
    pub content_warning: Option<String>,
    pub from_relay: bool,
    pub raw_json: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NoteUpdate {
    pub message: String,
    pub content_html: String,
    pub sensitive: bool,
    pub content_warning: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewFollow {
    pub id: Uuid,
    pub follower: ActorRef,
    pub target: ActorRef,
    pub state: &'static str,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDeliveryTask {
    pub id: Uuid,
    pub target_inbox: String,
    pub body_bytes: Vec<u8>,
    pub headers_json: String,
    pub key_id: String,
    pub private_key_pem: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: NotificationKind,
    pub actor: ActorRef,
    pub note_preview: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    // --- Accounts --------------------------------------------------------
    async fn get_account_by_id(&self, id: Uuid) -> Result<Option<Account>, AppError>;
    async fn get_account_by_username(&self, username: &str) -> Result<Option<Account>, AppError>;
    async fn get_account_by_ssh_key(
        &self,
        ssh_public_key_sha256: &str,
    ) -> Result<Option<Account>, AppError>;
    async fn create_account(&self, account: &Account) -> Result<(), AppError>;
    async fn count_accounts(&self) -> Result<i64, AppError>;
    async fn count_local_notes(&self) -> Result<i64, AppError>;
    /// Distinct local accounts that authored at least one note since `since`.
    async fn count_active_accounts(&self, since: DateTime<Utc>) -> Result<i64, AppError>;

    // --- Remote actors -----------------------------------------------------
    async fn get_remote_actor_by_uri(
        &self,
        actor_uri: &str,
    ) -> Result<Option<RemoteActor>, AppError>;
    async fn get_remote_actor_by_id(&self, id: Uuid) -> Result<Option<RemoteActor>, AppError>;
    async fn get_remote_actor_by_key_id(
        &self,
        public_key_id: &str,
    ) -> Result<Option<RemoteActor>, AppError>;
    async fn upsert_remote_actor(
        &self,
        upsert: RemoteActorUpsert,
        now: DateTime<Utc>,
    ) -> Result<RemoteActor, AppError>;
    async fn delete_remote_actor(&self, id: Uuid) -> Result<(), AppError>;

    // --- Notes --------------------------------------------------------------
    async fn get_note_by_uri(&self, object_uri: &str) -> Result<Option<Note>, AppError>;
    async fn insert_note(&self, note: NewNote) -> Result<Note, AppError>;
    async fn update_note(&self, object_uri: &str, update: NoteUpdate) -> Result<(), AppError>;
    async fn delete_note(&self, object_uri: &str) -> Result<bool, AppError>;
    /// Recompute `reply_count` for `object_uri` from the authoritative rows
    /// that reference it, inside the same transaction as the triggering
    /// insert/delete. Caps ancestor-walk depth to bound adversarial chains.
    async fn recompute_reply_counters(&self, from_object_uri: &str) -> Result<(), AppError>;
    async fn recompute_like_count(&self, note_uri: &str) -> Result<(), AppError>;
    async fn recompute_boost_count(&self, note_uri: &str) -> Result<(), AppError>;

    // --- Follows --------------------------------------------------------------
    async fn get_follow(
        &self,
        follower: ActorRef,
        target: ActorRef,
    ) -> Result<Option<Follow>, AppError>;
    async fn get_follow_by_activity_uri(
        &self,
        activity_uri: &str,
    ) -> Result<Option<Follow>, AppError>;
    /// Insert unless a row already exists for `(follower, target)`; returns
    /// `None` if one already existed.
    async fn insert_follow_if_absent(&self, follow: NewFollow) -> Result<Option<Follow>, AppError>;
    async fn accept_follow(&self, activity_uri: &str) -> Result<bool, AppError>;
    async fn delete_follow(&self, follower: ActorRef, target: ActorRef) -> Result<bool, AppError>;
    async fn delete_follows_referencing(&self, actor: ActorRef) -> Result<(), AppError>;
    /// All `accepted` followers of `target`, for dereferencing a followers
    /// collection into a delivery/addressing set.
    async fn list_accepted_followers(&self, target: ActorRef) -> Result<Vec<Follow>, AppError>;
    /// All `accepted` follows where `follower` is the subject, for rendering
    /// its following collection.
    async fn list_accepted_following(&self, follower: ActorRef) -> Result<Vec<Follow>, AppError>;

    // --- Outbox collection (C7) ------------------------------------------------
    /// Most recent public notes authored by a local account, for the first
    /// page of its outbox collection.
    async fn list_outbox_notes(&self, account_id: Uuid, limit: i64) -> Result<Vec<Note>, AppError>;

    // --- Likes / Boosts --------------------------------------------------------
    async fn insert_like_if_absent(
        &self,
        id: Uuid,
        actor: ActorRef,
        note_uri: &str,
        activity_uri: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Like>, AppError>;
    async fn delete_like_by_activity_uri(&self, activity_uri: &str) -> Result<Option<Like>, AppError>;
    async fn insert_boost_if_absent(
        &self,
        id: Uuid,
        actor: ActorRef,
        note_uri: &str,
        activity_uri: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Boost>, AppError>;
    async fn delete_boost_by_activity_uri(&self, activity_uri: &str)
    -> Result<Option<Boost>, AppError>;

    // --- Activity records (dedup ledger) -----------------------------------
    async fn activity_exists(&self, activity_uri: &str) -> Result<bool, AppError>;
    async fn insert_activity_record(&self, record: ActivityRecord) -> Result<bool, AppError>;

    // --- Delivery queue (C6) -------------------------------------------------
    async fn enqueue_delivery_task(&self, task: NewDeliveryTask) -> Result<(), AppError>;
    /// Atomically reserve up to `limit` due tasks, marking them reserved
    /// until `reserved_until` so concurrent workers don't double-process.
    async fn reserve_due_delivery_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        reserved_until: DateTime<Utc>,
    ) -> Result<Vec<DeliveryTask>, AppError>;
    async fn delete_delivery_task(&self, id: Uuid) -> Result<(), AppError>;
    async fn reschedule_delivery_task(
        &self,
        id: Uuid,
        attempt: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), AppError>;

    // --- Relays (C8) ----------------------------------------------------------
    async fn get_relay_by_domain(&self, domain: &str) -> Result<Option<RelaySubscription>, AppError>;
    /// Looks up a relay by the outgoing `Follow(#Public)` activity URI that
    /// established the subscription, used to match an inbound `Accept`
    /// that isn't tied to a `Follow` row.
    async fn get_relay_by_follow_uri(&self, follow_uri: &str) -> Result<Option<RelaySubscription>, AppError>;
    async fn list_relays(&self) -> Result<Vec<RelaySubscription>, AppError>;
    async fn insert_relay_subscription(
        &self,
        relay: RelaySubscription,
    ) -> Result<(), AppError>;
    async fn set_relay_state(&self, domain: &str, state: &str) -> Result<(), AppError>;
    async fn delete_relay(&self, domain: &str) -> Result<(), AppError>;

    // --- Notifications --------------------------------------------------------
    async fn insert_notification(&self, notification: NewNotification) -> Result<(), AppError>;
}
