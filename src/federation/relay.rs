//! Relay subsystem (C8).
//!
//! A relay is an ActivityPub actor that re-broadcasts `Create` activities
//! from its followers to its followers; subscribing is a `Follow(#Public)`
//! and the relay's `Accept` (or failure to ever arrive) drives the state
//! machine `pending → active | failed`, `active ↔ paused`, any → deleted.
//! No teacher analogue exists (the teacher is single-user with no relay
//! concept); grounded in the Follow-state-machine shape the teacher uses
//! in `activity.rs::handle_accept`/`handle_undo`, adapted to a
//! `RelaySubscription` row rather than a `Follow` row since the subscriber
//! is the server itself, not an account.

use uuid::Uuid;

use crate::clock::Clock;
use crate::data::{RelaySubscription, Store};
use crate::error::AppError;
use crate::federation::outbox::{self, LocalSigner};
use crate::metrics::RELAY_SUBSCRIPTIONS;

/// Begin a relay subscription: inserts a `pending` row and sends
/// `Follow(#Public)` to the relay's inbox. The subscription transitions to
/// `active` when/if the relay's `Accept` is observed by the inbox pipeline.
pub async fn subscribe(
    store: &dyn Store,
    clock: &dyn Clock,
    signer: &LocalSigner<'_>,
    relay_domain: &str,
    relay_inbox_uri: &str,
    tag: Option<&str>,
) -> Result<(), AppError> {
    if store.get_relay_by_domain(relay_domain).await?.is_some() {
        return Err(AppError::Conflict(format!("already subscribed to relay {relay_domain}")));
    }

    let follow_uri =
        outbox::publish_follow(store, clock, signer, outbox::PUBLIC_COLLECTION, relay_inbox_uri).await?;

    store
        .insert_relay_subscription(RelaySubscription {
            id: Uuid::new_v4(),
            relay_domain: relay_domain.to_string(),
            follow_uri,
            inbox_uri: relay_inbox_uri.to_string(),
            state: "pending".to_string(),
            tag: tag.map(str::to_string),
            created_at: clock.now(),
        })
        .await?;

    refresh_gauge(store).await;
    Ok(())
}

/// Called by the inbox pipeline when an `Accept` arrives whose object
/// matches a pending relay's `follow_uri`. Returns `true` if it matched and
/// the relay was activated.
pub async fn handle_accept(store: &dyn Store, follow_uri: &str) -> Result<bool, AppError> {
    let Some(relay) = store.get_relay_by_follow_uri(follow_uri).await? else {
        return Ok(false);
    };
    store.set_relay_state(&relay.relay_domain, "active").await?;
    refresh_gauge(store).await;
    Ok(true)
}

/// Marks a relay `active` as `paused`: its Announces are still accepted
/// (and logged as `ActivityRecord`s) but their embedded objects are no
/// longer materialized as notes.
pub async fn pause(store: &dyn Store, relay_domain: &str) -> Result<(), AppError> {
    let relay = store.get_relay_by_domain(relay_domain).await?.ok_or(AppError::NotFound)?;
    if relay.state != "active" {
        return Err(AppError::BadRequest("relay is not active".to_string()));
    }
    store.set_relay_state(relay_domain, "paused").await?;
    refresh_gauge(store).await;
    Ok(())
}

/// Resumes a `paused` relay back to `active`.
pub async fn resume(store: &dyn Store, relay_domain: &str) -> Result<(), AppError> {
    let relay = store.get_relay_by_domain(relay_domain).await?.ok_or(AppError::NotFound)?;
    if relay.state != "paused" {
        return Err(AppError::BadRequest("relay is not paused".to_string()));
    }
    store.set_relay_state(relay_domain, "active").await?;
    refresh_gauge(store).await;
    Ok(())
}

/// Marks a relay `failed`, e.g. after its subscribing `Follow` permanently
/// fails delivery or its `Accept` never arrives within the admin's
/// patience window.
pub async fn mark_failed(store: &dyn Store, relay_domain: &str) -> Result<(), AppError> {
    store.set_relay_state(relay_domain, "failed").await?;
    refresh_gauge(store).await;
    Ok(())
}

/// Tears down a subscription: sends `Undo(Follow)` to the relay, then
/// deletes the row regardless of delivery outcome (the relay will stop
/// receiving anything addressed to it once the row is gone either way).
pub async fn unsubscribe(
    store: &dyn Store,
    clock: &dyn Clock,
    signer: &LocalSigner<'_>,
    relay_domain: &str,
) -> Result<(), AppError> {
    let relay = store.get_relay_by_domain(relay_domain).await?.ok_or(AppError::NotFound)?;

    outbox::publish_undo_follow(
        store,
        clock,
        signer,
        &relay.follow_uri,
        outbox::PUBLIC_COLLECTION,
        &relay.inbox_uri,
    )
    .await?;

    store.delete_relay(relay_domain).await?;
    refresh_gauge(store).await;
    Ok(())
}

async fn refresh_gauge(store: &dyn Store) {
    let Ok(relays) = store.list_relays().await else {
        return;
    };
    for state in ["pending", "active", "paused", "failed"] {
        let count = relays.iter().filter(|r| r.state == state).count() as i64;
        RELAY_SUBSCRIPTIONS.with_label_values(&[state]).set(count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_states_are_the_documented_set() {
        let states = ["pending", "active", "paused", "failed"];
        assert_eq!(states.len(), 4);
    }
}
