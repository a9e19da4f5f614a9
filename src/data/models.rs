//! Data models
//!
//! Rust structs representing database entities in the federation core's
//! object store. All models use UUID for IDs and chrono for timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// ID Types
// =============================================================================

/// Reference to an actor that may be local (an `Account`) or remote (a
/// `RemoteActor`). Modeled as a discriminated union, never a single
/// polymorphic UUID, so every caller handles both cases explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRef {
    Local(Uuid),
    Remote(Uuid),
}

impl ActorRef {
    pub fn is_local(&self) -> bool {
        matches!(self, ActorRef::Local(_))
    }

    pub fn id(&self) -> Uuid {
        match self {
            ActorRef::Local(id) | ActorRef::Remote(id) => *id,
        }
    }

    /// Reconstruct from the `(is_local, id)` column pair used by every
    /// polymorphic-actor table (`follows`, `likes`, `boosts`,
    /// `notifications`).
    pub fn from_columns(is_local: bool, id: Uuid) -> Self {
        if is_local {
            ActorRef::Local(id)
        } else {
            ActorRef::Remote(id)
        }
    }
}

// =============================================================================
// Account (local user)
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Account {
    pub id: Uuid,
    pub username: String,
    pub ssh_public_key_sha256: String,
    pub created_at: DateTime<Utc>,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    /// PKCS#8 PEM, RSA 2048+
    pub signing_private_key: String,
    /// PKIX PEM
    pub signing_public_key: String,
    pub is_admin: bool,
    pub is_muted: bool,
    pub is_banned: bool,
    pub last_ip: Option<String>,
    pub first_time_login: bool,
}

// =============================================================================
// RemoteActor
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RemoteActor {
    pub id: Uuid,
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
    pub fetched_at: DateTime<Utc>,
}

impl RemoteActor {
    pub const TTL_HOURS: i64 = 24;

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.fetched_at) > chrono::Duration::hours(Self::TTL_HOURS)
    }
}

// =============================================================================
// Note
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    Followers,
    Direct,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Unlisted => "unlisted",
            Visibility::Followers => "followers",
            Visibility::Direct => "direct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "public" => Some(Visibility::Public),
            "unlisted" => Some(Visibility::Unlisted),
            "followers" => Some(Visibility::Followers),
            "direct" => Some(Visibility::Direct),
            _ => None,
        }
    }
}

/// A note (post). `created_by` holds either a local `Account.id` rendered as
/// a UUID string, or a remote `"@user@domain"` descriptor, matching the two
/// shapes notes can be authored under.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Note {
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
    pub reply_count: i64,
    pub like_count: i64,
    pub boost_count: i64,
    pub from_relay: bool,
    pub raw_json: Option<String>,
}

/// Author reference for a `Note.created_by` column: either a local account id
/// or a remote `user@domain` descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteAuthor {
    Local(Uuid),
    Remote(String),
}

impl NoteAuthor {
    pub fn to_column(&self) -> String {
        match self {
            NoteAuthor::Local(id) => id.to_string(),
            NoteAuthor::Remote(addr) => addr.clone(),
        }
    }

    pub fn from_column(s: &str) -> Self {
        match Uuid::parse_str(s) {
            Ok(id) => NoteAuthor::Local(id),
            Err(_) => NoteAuthor::Remote(s.to_string()),
        }
    }
}

// =============================================================================
// Follow
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowState {
    Pending,
    Accepted,
}

impl FollowState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowState::Pending => "pending",
            FollowState::Accepted => "accepted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(FollowState::Pending),
            "accepted" => Some(FollowState::Accepted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Follow {
    pub id: Uuid,
    pub follower_id: Uuid,
    pub is_local_follower: bool,
    pub target_id: Uuid,
    pub is_local_target: bool,
    pub state: String,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

impl Follow {
    pub fn follower(&self) -> ActorRef {
        ActorRef::from_columns(self.is_local_follower, self.follower_id)
    }

    pub fn target(&self) -> ActorRef {
        ActorRef::from_columns(self.is_local_target, self.target_id)
    }
}

// =============================================================================
// Like / Boost
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Like {
    pub id: Uuid,
    pub actor_is_local: bool,
    pub actor_id: Uuid,
    pub note_uri: String,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

impl Like {
    pub fn actor(&self) -> ActorRef {
        ActorRef::from_columns(self.actor_is_local, self.actor_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Boost {
    pub id: Uuid,
    pub actor_is_local: bool,
    pub actor_id: Uuid,
    pub note_uri: String,
    pub activity_uri: String,
    pub created_at: DateTime<Utc>,
}

impl Boost {
    pub fn actor(&self) -> ActorRef {
        ActorRef::from_columns(self.actor_is_local, self.actor_id)
    }
}

// =============================================================================
// ActivityRecord
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ActivityRecord {
    pub activity_uri: String,
    pub activity_type: String,
    pub actor_uri: String,
    pub object_uri: Option<String>,
    pub in_reply_to_uri: Option<String>,
    pub received_at: DateTime<Utc>,
    pub raw_json: String,
    pub from_relay: bool,
}

// =============================================================================
// DeliveryTask
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryTask {
    pub id: Uuid,
    pub target_inbox: String,
    pub body_bytes: Vec<u8>,
    /// JSON-encoded `Vec<(String, String)>` of headers to carry across
    /// attempts, excluding `Date`/`Signature`/`Digest` which are recomputed.
    pub headers_json: String,
    /// Signing identity carried with the task so a retry hours later signs
    /// a fresh `Date`, rather than replaying one that's aged out of the
    /// signature verifier's skew window.
    pub key_id: String,
    pub private_key_pem: String,
    pub attempt: i64,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub reserved_until: Option<DateTime<Utc>>,
}

/// Backoff schedule in seconds, clipped to 24h total retry window.
pub const BACKOFF_SCHEDULE_SECS: [i64; 8] = [10, 30, 120, 600, 1800, 7200, 21600, 86400];

pub fn backoff_for_attempt(attempt: i64) -> i64 {
    let idx = attempt.max(0) as usize;
    let capped = idx.min(BACKOFF_SCHEDULE_SECS.len() - 1);
    BACKOFF_SCHEDULE_SECS[capped]
}

// =============================================================================
// RelaySubscription
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Pending,
    Active,
    Paused,
    Failed,
}

impl RelayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayState::Pending => "pending",
            RelayState::Active => "active",
            RelayState::Paused => "paused",
            RelayState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RelayState::Pending),
            "active" => Some(RelayState::Active),
            "paused" => Some(RelayState::Paused),
            "failed" => Some(RelayState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct RelaySubscription {
    pub id: Uuid,
    pub relay_domain: String,
    pub follow_uri: String,
    pub inbox_uri: String,
    pub state: String,
    pub tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Notification
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Follow,
    Like,
    Mention,
    Reply,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Follow => "follow",
            NotificationKind::Like => "like",
            NotificationKind::Mention => "mention",
            NotificationKind::Reply => "reply",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: String,
    pub actor_is_local: bool,
    pub actor_id: Uuid,
    pub note_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl Notification {
    pub fn actor(&self) -> ActorRef {
        ActorRef::from_columns(self.actor_is_local, self.actor_id)
    }
}
