//! SQLite-backed implementation of [`Store`].
//!
//! Grounded on the teacher's `data/database.rs`: `BEGIN IMMEDIATE`/`COMMIT`/
//! `ROLLBACK` manual transactions guard every invariant-preserving write
//! (dedup-then-insert, counter recomputation), the way
//! `insert_follow_if_absent`/`insert_status_with_media_and_poll` do there.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use uuid::Uuid;

use super::models::{
    Account, ActivityRecord, ActorRef, Boost, DeliveryTask, Follow, FollowState, Like, Note,
    RelaySubscription, RemoteActor,
};
use super::store::{NewDeliveryTask, NewFollow, NewNote, NewNotification, NoteUpdate, RemoteActorUpsert, Store};
use crate::error::AppError;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::Database(sqlx::Error::Io(e)))?;
        }

        let connection_string = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&connection_string).await?;

        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            tracing::error!("migration failed: {e}");
            AppError::Internal(anyhow::anyhow!("migration failed: {e}"))
        })?;

        tracing::info!("federation store connected and migrated");
        Ok(Self { pool })
    }

    /// For tests. A plain `sqlite::memory:` URI hands out a fresh, empty
    /// database per pooled connection; capped to one connection so every
    /// caller shares the same in-memory database.
    pub async fn connect_in_memory() -> Result<Self, AppError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        sqlx::migrate!("./migrations").run(&pool).await.map_err(|e| {
            AppError::Internal(anyhow::anyhow!("migration failed: {e}"))
        })?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn recompute_reply_count_for(&self, conn: &mut sqlx::SqliteConnection, object_uri: &str) -> Result<(), AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM notes WHERE in_reply_to_uri = ?")
            .bind(object_uri)
            .fetch_one(&mut *conn)
            .await?;
        sqlx::query("UPDATE notes SET reply_count = ? WHERE object_uri = ?")
            .bind(count)
            .bind(object_uri)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

use sqlx::Pool;

#[async_trait]
impl Store for SqliteStore {
    async fn get_account_by_id(&self, id: Uuid) -> Result<Option<Account>, AppError> {
        let row = sqlx::query_as::<_, Account>("SELECT * FROM accounts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_account_by_username(&self, username: &str) -> Result<Option<Account>, AppError> {
        let row = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE username = ? COLLATE NOCASE",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_account_by_ssh_key(
        &self,
        ssh_public_key_sha256: &str,
    ) -> Result<Option<Account>, AppError> {
        let row = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE ssh_public_key_sha256 = ?",
        )
        .bind(ssh_public_key_sha256)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn create_account(&self, account: &Account) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO accounts (id, username, ssh_public_key_sha256, created_at,
             display_name, summary, avatar_url, signing_private_key, signing_public_key,
             is_admin, is_muted, is_banned, last_ip, first_time_login)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(account.id.to_string())
        .bind(&account.username)
        .bind(&account.ssh_public_key_sha256)
        .bind(account.created_at)
        .bind(&account.display_name)
        .bind(&account.summary)
        .bind(&account.avatar_url)
        .bind(&account.signing_private_key)
        .bind(&account.signing_public_key)
        .bind(account.is_admin)
        .bind(account.is_muted)
        .bind(account.is_banned)
        .bind(&account.last_ip)
        .bind(account.first_time_login)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_accounts(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM accounts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn count_local_notes(&self) -> Result<i64, AppError> {
        // local notes are those authored by an Account id, i.e. created_by
        // parses as a UUID rather than a "@user@domain" descriptor.
        let created_by: Vec<String> =
            sqlx::query_scalar("SELECT created_by FROM notes").fetch_all(&self.pool).await?;
        Ok(created_by
            .iter()
            .filter(|c| Uuid::parse_str(c).is_ok())
            .count() as i64)
    }

    async fn count_active_accounts(&self, since: DateTime<Utc>) -> Result<i64, AppError> {
        let created_by: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT created_by FROM notes WHERE created_at >= ?1")
                .bind(since)
                .fetch_all(&self.pool)
                .await?;
        Ok(created_by
            .iter()
            .filter(|c| Uuid::parse_str(c).is_ok())
            .count() as i64)
    }

    async fn get_remote_actor_by_uri(
        &self,
        actor_uri: &str,
    ) -> Result<Option<RemoteActor>, AppError> {
        let row = sqlx::query_as::<_, RemoteActor>(
            "SELECT * FROM remote_actors WHERE actor_uri = ?",
        )
        .bind(actor_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_remote_actor_by_id(&self, id: Uuid) -> Result<Option<RemoteActor>, AppError> {
        let row = sqlx::query_as::<_, RemoteActor>("SELECT * FROM remote_actors WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_remote_actor_by_key_id(
        &self,
        public_key_id: &str,
    ) -> Result<Option<RemoteActor>, AppError> {
        let row = sqlx::query_as::<_, RemoteActor>(
            "SELECT * FROM remote_actors WHERE public_key_id = ?",
        )
        .bind(public_key_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn upsert_remote_actor(
        &self,
        upsert: RemoteActorUpsert,
        now: DateTime<Utc>,
    ) -> Result<RemoteActor, AppError> {
        let existing = self.get_remote_actor_by_uri(&upsert.actor_uri).await?;
        let id = existing.as_ref().map(|a| a.id).unwrap_or_else(Uuid::new_v4);

        sqlx::query(
            "INSERT INTO remote_actors (id, actor_uri, username, domain, display_name, summary,
             avatar_url, inbox_uri, shared_inbox_uri, followers_uri, public_key_id,
             public_key_pem, fetched_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(actor_uri) DO UPDATE SET
               username = excluded.username,
               domain = excluded.domain,
               display_name = excluded.display_name,
               summary = excluded.summary,
               avatar_url = excluded.avatar_url,
               inbox_uri = excluded.inbox_uri,
               shared_inbox_uri = excluded.shared_inbox_uri,
               followers_uri = excluded.followers_uri,
               public_key_id = excluded.public_key_id,
               public_key_pem = excluded.public_key_pem,
               fetched_at = excluded.fetched_at",
        )
        .bind(id.to_string())
        .bind(&upsert.actor_uri)
        .bind(&upsert.username)
        .bind(&upsert.domain)
        .bind(&upsert.display_name)
        .bind(&upsert.summary)
        .bind(&upsert.avatar_url)
        .bind(&upsert.inbox_uri)
        .bind(&upsert.shared_inbox_uri)
        .bind(&upsert.followers_uri)
        .bind(&upsert.public_key_id)
        .bind(&upsert.public_key_pem)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_remote_actor_by_uri(&upsert.actor_uri)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("upsert did not persist actor")))
    }

    async fn delete_remote_actor(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM remote_actors WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_note_by_uri(&self, object_uri: &str) -> Result<Option<Note>, AppError> {
        let row = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE object_uri = ?")
            .bind(object_uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_note(&self, note: NewNote) -> Result<Note, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<(), AppError> = async {
            sqlx::query(
                "INSERT INTO notes (id, object_uri, created_by, message, content_html,
                 created_at, in_reply_to_uri, visibility, sensitive, content_warning,
                 reply_count, like_count, boost_count, from_relay, raw_json)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0, 0, ?, ?)",
            )
            .bind(note.id.to_string())
            .bind(&note.object_uri)
            .bind(&note.created_by)
            .bind(&note.message)
            .bind(&note.content_html)
            .bind(note.created_at)
            .bind(&note.in_reply_to_uri)
            .bind(&note.visibility)
            .bind(note.sensitive)
            .bind(&note.content_warning)
            .bind(note.from_relay)
            .bind(&note.raw_json)
            .execute(&mut *conn)
            .await?;

            if let Some(parent) = &note.in_reply_to_uri {
                self.recompute_reply_count_for(&mut conn, parent).await?;
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => sqlx::query("COMMIT").execute(&mut *conn).await.map(|_| ())?,
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                return Err(e);
            }
        }

        self.get_note_by_uri(&note.object_uri)
            .await?
            .ok_or_else(|| AppError::Internal(anyhow::anyhow!("insert did not persist note")))
    }

    async fn update_note(&self, object_uri: &str, update: NoteUpdate) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE notes SET message = ?, content_html = ?, sensitive = ?, content_warning = ?
             WHERE object_uri = ?",
        )
        .bind(&update.message)
        .bind(&update.content_html)
        .bind(update.sensitive)
        .bind(&update.content_warning)
        .bind(object_uri)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_note(&self, object_uri: &str) -> Result<bool, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<bool, AppError> = async {
            let existing = sqlx::query_as::<_, Note>("SELECT * FROM notes WHERE object_uri = ?")
                .bind(object_uri)
                .fetch_optional(&mut *conn)
                .await?;
            let Some(existing) = existing else {
                return Ok(false);
            };

            sqlx::query("DELETE FROM notes WHERE object_uri = ?")
                .bind(object_uri)
                .execute(&mut *conn)
                .await?;

            if let Some(parent) = &existing.in_reply_to_uri {
                self.recompute_reply_count_for(&mut conn, parent).await?;
            }
            Ok(true)
        }
        .await;

        match result {
            Ok(deleted) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(deleted)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn recompute_reply_counters(&self, from_object_uri: &str) -> Result<(), AppError> {
        let mut conn = self.pool.acquire().await?;
        let mut current = Some(from_object_uri.to_string());
        let mut depth = 0;
        // cap ancestor walk depth to bound work on adversarial reply chains
        while let Some(uri) = current.take() {
            if depth >= 64 {
                break;
            }
            self.recompute_reply_count_for(&mut conn, &uri).await?;
            let parent: Option<String> =
                sqlx::query_scalar("SELECT in_reply_to_uri FROM notes WHERE object_uri = ?")
                    .bind(&uri)
                    .fetch_optional(&mut *conn)
                    .await?
                    .flatten();
            current = parent;
            depth += 1;
        }
        Ok(())
    }

    async fn recompute_like_count(&self, note_uri: &str) -> Result<(), AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE note_uri = ?")
            .bind(note_uri)
            .fetch_one(&self.pool)
            .await?;
        sqlx::query("UPDATE notes SET like_count = ? WHERE object_uri = ?")
            .bind(count)
            .bind(note_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recompute_boost_count(&self, note_uri: &str) -> Result<(), AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM boosts WHERE note_uri = ?")
            .bind(note_uri)
            .fetch_one(&self.pool)
            .await?;
        sqlx::query("UPDATE notes SET boost_count = ? WHERE object_uri = ?")
            .bind(count)
            .bind(note_uri)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_follow(
        &self,
        follower: ActorRef,
        target: ActorRef,
    ) -> Result<Option<Follow>, AppError> {
        let row = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE follower_id = ? AND is_local_follower = ?
             AND target_id = ? AND is_local_target = ?",
        )
        .bind(follower.id().to_string())
        .bind(follower.is_local())
        .bind(target.id().to_string())
        .bind(target.is_local())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_follow_by_activity_uri(
        &self,
        activity_uri: &str,
    ) -> Result<Option<Follow>, AppError> {
        let row = sqlx::query_as::<_, Follow>("SELECT * FROM follows WHERE activity_uri = ?")
            .bind(activity_uri)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn insert_follow_if_absent(&self, follow: NewFollow) -> Result<Option<Follow>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Option<Follow>, AppError> = async {
            let existing: Option<i64> = sqlx::query_scalar(
                "SELECT 1 FROM follows WHERE follower_id = ? AND is_local_follower = ?
                 AND target_id = ? AND is_local_target = ?",
            )
            .bind(follow.follower.id().to_string())
            .bind(follow.follower.is_local())
            .bind(follow.target.id().to_string())
            .bind(follow.target.is_local())
            .fetch_optional(&mut *conn)
            .await?;

            if existing.is_some() {
                return Ok(None);
            }

            sqlx::query(
                "INSERT INTO follows (id, follower_id, is_local_follower, target_id,
                 is_local_target, state, activity_uri, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(follow.id.to_string())
            .bind(follow.follower.id().to_string())
            .bind(follow.follower.is_local())
            .bind(follow.target.id().to_string())
            .bind(follow.target.is_local())
            .bind(follow.state)
            .bind(&follow.activity_uri)
            .bind(follow.created_at)
            .execute(&mut *conn)
            .await?;

            let row = sqlx::query_as::<_, Follow>("SELECT * FROM follows WHERE id = ?")
                .bind(follow.id.to_string())
                .fetch_one(&mut *conn)
                .await?;
            Ok(Some(row))
        }
        .await;

        match result {
            Ok(inserted) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(inserted)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn accept_follow(&self, activity_uri: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE follows SET state = ? WHERE activity_uri = ? AND state = ?",
        )
        .bind(FollowState::Accepted.as_str())
        .bind(activity_uri)
        .bind(FollowState::Pending.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_follow(&self, follower: ActorRef, target: ActorRef) -> Result<bool, AppError> {
        let result = sqlx::query(
            "DELETE FROM follows WHERE follower_id = ? AND is_local_follower = ?
             AND target_id = ? AND is_local_target = ?",
        )
        .bind(follower.id().to_string())
        .bind(follower.is_local())
        .bind(target.id().to_string())
        .bind(target.is_local())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_follows_referencing(&self, actor: ActorRef) -> Result<(), AppError> {
        sqlx::query(
            "DELETE FROM follows WHERE (follower_id = ? AND is_local_follower = ?)
             OR (target_id = ? AND is_local_target = ?)",
        )
        .bind(actor.id().to_string())
        .bind(actor.is_local())
        .bind(actor.id().to_string())
        .bind(actor.is_local())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_accepted_followers(&self, target: ActorRef) -> Result<Vec<Follow>, AppError> {
        let rows = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE target_id = ? AND is_local_target = ? AND state = 'accepted'",
        )
        .bind(target.id().to_string())
        .bind(target.is_local())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_accepted_following(&self, follower: ActorRef) -> Result<Vec<Follow>, AppError> {
        let rows = sqlx::query_as::<_, Follow>(
            "SELECT * FROM follows WHERE follower_id = ? AND is_local_follower = ? AND state = 'accepted'",
        )
        .bind(follower.id().to_string())
        .bind(follower.is_local())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_outbox_notes(&self, account_id: Uuid, limit: i64) -> Result<Vec<Note>, AppError> {
        let rows = sqlx::query_as::<_, Note>(
            "SELECT * FROM notes WHERE created_by = ? AND visibility = 'public'
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(account_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_like_if_absent(
        &self,
        id: Uuid,
        actor: ActorRef,
        note_uri: &str,
        activity_uri: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Like>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Option<Like>, AppError> = async {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM likes WHERE activity_uri = ?")
                    .bind(activity_uri)
                    .fetch_optional(&mut *conn)
                    .await?;
            if existing.is_some() {
                return Ok(None);
            }

            sqlx::query(
                "INSERT INTO likes (id, actor_is_local, actor_id, note_uri, activity_uri, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(actor.is_local())
            .bind(actor.id().to_string())
            .bind(note_uri)
            .bind(activity_uri)
            .bind(created_at)
            .execute(&mut *conn)
            .await?;

            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE note_uri = ?")
                .bind(note_uri)
                .fetch_one(&mut *conn)
                .await?;
            sqlx::query("UPDATE notes SET like_count = ? WHERE object_uri = ?")
                .bind(count)
                .bind(note_uri)
                .execute(&mut *conn)
                .await?;

            let row = sqlx::query_as::<_, Like>("SELECT * FROM likes WHERE activity_uri = ?")
                .bind(activity_uri)
                .fetch_one(&mut *conn)
                .await?;
            Ok(Some(row))
        }
        .await;

        match result {
            Ok(v) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(v)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn delete_like_by_activity_uri(&self, activity_uri: &str) -> Result<Option<Like>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Option<Like>, AppError> = async {
            let existing = sqlx::query_as::<_, Like>("SELECT * FROM likes WHERE activity_uri = ?")
                .bind(activity_uri)
                .fetch_optional(&mut *conn)
                .await?;
            let Some(existing) = existing else {
                return Ok(None);
            };

            sqlx::query("DELETE FROM likes WHERE activity_uri = ?")
                .bind(activity_uri)
                .execute(&mut *conn)
                .await?;

            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM likes WHERE note_uri = ?")
                    .bind(&existing.note_uri)
                    .fetch_one(&mut *conn)
                    .await?;
            sqlx::query("UPDATE notes SET like_count = ? WHERE object_uri = ?")
                .bind(count)
                .bind(&existing.note_uri)
                .execute(&mut *conn)
                .await?;

            Ok(Some(existing))
        }
        .await;

        match result {
            Ok(v) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(v)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn insert_boost_if_absent(
        &self,
        id: Uuid,
        actor: ActorRef,
        note_uri: &str,
        activity_uri: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Option<Boost>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Option<Boost>, AppError> = async {
            let existing: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM boosts WHERE activity_uri = ?")
                    .bind(activity_uri)
                    .fetch_optional(&mut *conn)
                    .await?;
            if existing.is_some() {
                return Ok(None);
            }

            sqlx::query(
                "INSERT INTO boosts (id, actor_is_local, actor_id, note_uri, activity_uri, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(actor.is_local())
            .bind(actor.id().to_string())
            .bind(note_uri)
            .bind(activity_uri)
            .bind(created_at)
            .execute(&mut *conn)
            .await?;

            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM boosts WHERE note_uri = ?")
                .bind(note_uri)
                .fetch_one(&mut *conn)
                .await?;
            sqlx::query("UPDATE notes SET boost_count = ? WHERE object_uri = ?")
                .bind(count)
                .bind(note_uri)
                .execute(&mut *conn)
                .await?;

            let row = sqlx::query_as::<_, Boost>("SELECT * FROM boosts WHERE activity_uri = ?")
                .bind(activity_uri)
                .fetch_one(&mut *conn)
                .await?;
            Ok(Some(row))
        }
        .await;

        match result {
            Ok(v) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(v)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn delete_boost_by_activity_uri(
        &self,
        activity_uri: &str,
    ) -> Result<Option<Boost>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Option<Boost>, AppError> = async {
            let existing = sqlx::query_as::<_, Boost>("SELECT * FROM boosts WHERE activity_uri = ?")
                .bind(activity_uri)
                .fetch_optional(&mut *conn)
                .await?;
            let Some(existing) = existing else {
                return Ok(None);
            };

            sqlx::query("DELETE FROM boosts WHERE activity_uri = ?")
                .bind(activity_uri)
                .execute(&mut *conn)
                .await?;

            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM boosts WHERE note_uri = ?")
                    .bind(&existing.note_uri)
                    .fetch_one(&mut *conn)
                    .await?;
            sqlx::query("UPDATE notes SET boost_count = ? WHERE object_uri = ?")
                .bind(count)
                .bind(&existing.note_uri)
                .execute(&mut *conn)
                .await?;

            Ok(Some(existing))
        }
        .await;

        match result {
            Ok(v) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(v)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn activity_exists(&self, activity_uri: &str) -> Result<bool, AppError> {
        let exists: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM activity_records WHERE activity_uri = ?")
                .bind(activity_uri)
                .fetch_optional(&self.pool)
                .await?;
        Ok(exists.is_some())
    }

    async fn insert_activity_record(&self, record: ActivityRecord) -> Result<bool, AppError> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO activity_records (activity_uri, activity_type, actor_uri,
             object_uri, in_reply_to_uri, received_at, raw_json, from_relay)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.activity_uri)
        .bind(&record.activity_type)
        .bind(&record.actor_uri)
        .bind(&record.object_uri)
        .bind(&record.in_reply_to_uri)
        .bind(record.received_at)
        .bind(&record.raw_json)
        .bind(record.from_relay)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn enqueue_delivery_task(&self, task: NewDeliveryTask) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO delivery_tasks (id, target_inbox, body_bytes, headers_json, key_id,
             private_key_pem, attempt, next_attempt_at, last_error, created_at, reserved_until)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, NULL, ?, NULL)",
        )
        .bind(task.id.to_string())
        .bind(&task.target_inbox)
        .bind(&task.body_bytes)
        .bind(&task.headers_json)
        .bind(&task.key_id)
        .bind(&task.private_key_pem)
        .bind(task.created_at)
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reserve_due_delivery_tasks(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        reserved_until: DateTime<Utc>,
    ) -> Result<Vec<DeliveryTask>, AppError> {
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result: Result<Vec<DeliveryTask>, AppError> = async {
            let due = sqlx::query_as::<_, DeliveryTask>(
                "SELECT * FROM delivery_tasks
                 WHERE next_attempt_at <= ? AND (reserved_until IS NULL OR reserved_until <= ?)
                 ORDER BY next_attempt_at ASC LIMIT ?",
            )
            .bind(now)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;

            for task in &due {
                sqlx::query("UPDATE delivery_tasks SET reserved_until = ? WHERE id = ?")
                    .bind(reserved_until)
                    .bind(task.id.to_string())
                    .execute(&mut *conn)
                    .await?;
            }

            Ok(due)
        }
        .await;

        match result {
            Ok(tasks) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(tasks)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(e)
            }
        }
    }

    async fn delete_delivery_task(&self, id: Uuid) -> Result<(), AppError> {
        sqlx::query("DELETE FROM delivery_tasks WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reschedule_delivery_task(
        &self,
        id: Uuid,
        attempt: i64,
        next_attempt_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE delivery_tasks SET attempt = ?, next_attempt_at = ?, last_error = ?,
             reserved_until = NULL WHERE id = ?",
        )
        .bind(attempt)
        .bind(next_attempt_at)
        .bind(last_error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_relay_by_domain(&self, domain: &str) -> Result<Option<RelaySubscription>, AppError> {
        let row = sqlx::query_as::<_, RelaySubscription>(
            "SELECT * FROM relay_subscriptions WHERE relay_domain = ?",
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_relay_by_follow_uri(&self, follow_uri: &str) -> Result<Option<RelaySubscription>, AppError> {
        let row = sqlx::query_as::<_, RelaySubscription>(
            "SELECT * FROM relay_subscriptions WHERE follow_uri = ?",
        )
        .bind(follow_uri)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_relays(&self) -> Result<Vec<RelaySubscription>, AppError> {
        let rows = sqlx::query_as::<_, RelaySubscription>(
            "SELECT * FROM relay_subscriptions ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn insert_relay_subscription(&self, relay: RelaySubscription) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO relay_subscriptions (id, relay_domain, follow_uri, inbox_uri, state, tag, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(relay.id.to_string())
        .bind(&relay.relay_domain)
        .bind(&relay.follow_uri)
        .bind(&relay.inbox_uri)
        .bind(&relay.state)
        .bind(&relay.tag)
        .bind(relay.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_relay_state(&self, domain: &str, state: &str) -> Result<(), AppError> {
        sqlx::query("UPDATE relay_subscriptions SET state = ? WHERE relay_domain = ?")
            .bind(state)
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_relay(&self, domain: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM relay_subscriptions WHERE relay_domain = ?")
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_notification(&self, notification: NewNotification) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO notifications (id, account_id, kind, actor_is_local, actor_id,
             note_preview, created_at, read)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(notification.id.to_string())
        .bind(notification.account_id.to_string())
        .bind(notification.kind.as_str())
        .bind(notification.actor.is_local())
        .bind(notification.actor.id().to_string())
        .bind(&notification.note_preview)
        .bind(notification.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::store::NewNote;

    async fn test_store() -> SqliteStore {
        SqliteStore::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn inserting_duplicate_follow_is_a_noop() {
        let store = test_store().await;
        let follower = ActorRef::Remote(Uuid::new_v4());
        let target = ActorRef::Local(Uuid::new_v4());
        let now = Utc::now();

        let first = store
            .insert_follow_if_absent(NewFollow {
                id: Uuid::new_v4(),
                follower,
                target,
                state: "pending",
                activity_uri: "https://peer/activities/1".into(),
                created_at: now,
            })
            .await
            .unwrap();
        assert!(first.is_some());

        let second = store
            .insert_follow_if_absent(NewFollow {
                id: Uuid::new_v4(),
                follower,
                target,
                state: "pending",
                activity_uri: "https://peer/activities/2".into(),
                created_at: now,
            })
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn reply_count_recomputes_after_delete() {
        let store = test_store().await;
        let now = Utc::now();

        let parent = store
            .insert_note(NewNote {
                id: Uuid::new_v4(),
                object_uri: "https://self/notes/parent".into(),
                created_by: Uuid::new_v4().to_string(),
                message: "parent".into(),
                content_html: "<p>parent</p>".into(),
                created_at: now,
                in_reply_to_uri: None,
                visibility: "public".into(),
                sensitive: false,
                content_warning: None,
                from_relay: false,
                raw_json: None,
            })
            .await
            .unwrap();

        let child = store
            .insert_note(NewNote {
                id: Uuid::new_v4(),
                object_uri: "https://peer/notes/child".into(),
                created_by: "@bob@peer".into(),
                message: "child".into(),
                content_html: "<p>child</p>".into(),
                created_at: now,
                in_reply_to_uri: Some(parent.object_uri.clone()),
                visibility: "public".into(),
                sensitive: false,
                content_warning: None,
                from_relay: false,
                raw_json: None,
            })
            .await
            .unwrap();

        let parent_after_insert = store.get_note_by_uri(&parent.object_uri).await.unwrap().unwrap();
        assert_eq!(parent_after_insert.reply_count, 1);

        store.delete_note(&child.object_uri).await.unwrap();
        let parent_after_delete = store.get_note_by_uri(&parent.object_uri).await.unwrap().unwrap();
        assert_eq!(parent_after_delete.reply_count, 0);
    }
}
