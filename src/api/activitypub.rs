//! ActivityPub endpoints
//!
//! - Actor profile (content-negotiated between the TUI's own HTML and
//!   `application/activity+json`)
//! - Personal and shared inbox (C4 entry point)
//! - Outbox, followers, following collections (C5/C7)
//! - Note dereference, for peers fetching a reply's parent

use axum::body::Bytes;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::{
    Router,
    extract::{Path, State},
    routing::{get, post},
};
use http::HeaderMap;

use crate::AppState;
use crate::data::{ActorRef, NoteAuthor};
use crate::error::AppError;
use crate::federation::inbox::MAX_BODY_BYTES;
use crate::federation::outbox;
use crate::federation::rate_limit::extract_domain;
use crate::federation::signature;
use crate::metrics::{
    FEDERATION_REQUEST_DURATION_SECONDS, FEDERATION_REQUESTS_TOTAL, HTTP_REQUEST_DURATION_SECONDS,
    HTTP_REQUESTS_TOTAL,
};

/// Create ActivityPub router
///
/// Routes:
/// - GET /users/:username - Actor profile
/// - POST /users/:username/inbox - Personal inbox
/// - POST /inbox - Shared inbox
/// - GET /users/:username/outbox - Outbox
/// - GET /users/:username/followers - Followers collection
/// - GET /users/:username/following - Following collection
/// - GET /notes/:id - Note object (dereferenceable reply-parent target)
pub fn activitypub_router() -> Router<AppState> {
    Router::new()
        .route("/users/:username", get(actor))
        .route("/users/:username/inbox", post(inbox))
        .route("/inbox", post(shared_inbox))
        .route("/users/:username/outbox", get(outbox_collection))
        .route("/users/:username/followers", get(followers))
        .route("/users/:username/following", get(following))
        .route("/notes/:id", get(note))
}

/// The page size for outbox/followers/following collections.
/// Pagination beyond the first page is a documented non-goal; callers that
/// need the full set should page WebFinger/actor lookups instead.
const PAGE_SIZE: i64 = 20;

fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("anonymous")
        .to_string()
}

async fn rate_limit(state: &AppState, key: &str) -> Result<(), AppError> {
    state.rate_limiter_global.check_and_increment(key).await?;
    state.rate_limiter_activitypub.check_and_increment(key).await
}

/// `true` if the `Accept` header's first recognized media type is
/// `text/html`; `false` (JSON) otherwise, including when the header is
/// absent or carries only unrecognized types.
fn wants_html(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    for entry in value.split(',') {
        let media_type = entry.split(';').next().unwrap_or("").trim();
        match media_type {
            "text/html" => return true,
            "application/activity+json" | "application/ld+json" | "application/json" => {
                return false;
            }
            _ => continue,
        }
    }
    false
}

/// GET /users/:username
///
/// `Accept: text/html` redirects to the TUI/web profile route; every other
/// (or absent) `Accept` returns the ActivityPub Actor document.
async fn actor(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&["GET", "/users/:username"])
        .start_timer();
    rate_limit(&state, &client_key(&headers)).await?;

    let account = state
        .store
        .get_account_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    if wants_html(&headers) {
        let location = format!("/u/{}", account.username);
        return Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response());
    }

    let base_url = state.config.server.base_url();
    let actor_url = format!("{}/users/{}", base_url, account.username);

    let doc = serde_json::json!({
        "@context": [
            "https://www.w3.org/ns/activitystreams",
            "https://w3id.org/security/v1"
        ],
        "type": "Person",
        "id": actor_url,
        "preferredUsername": account.username,
        "name": account.display_name.unwrap_or_else(|| account.username.clone()),
        "summary": account.summary.unwrap_or_default(),
        "inbox": format!("{}/inbox", actor_url),
        "outbox": format!("{}/outbox", actor_url),
        "followers": format!("{}/followers", actor_url),
        "following": format!("{}/following", actor_url),
        "endpoints": {
            "sharedInbox": format!("{}/inbox", base_url)
        },
        "url": actor_url,
        "publicKey": {
            "id": format!("{}#main-key", actor_url),
            "owner": actor_url,
            "publicKeyPem": account.signing_public_key
        },
        "icon": account.avatar_url.map(|url| serde_json::json!({
            "type": "Image",
            "url": url
        }))
    });

    HTTP_REQUESTS_TOTAL
        .with_label_values(&["GET", "/users/:username", "200"])
        .inc();

    Ok(Json(doc).into_response())
}

/// POST /users/:username/inbox
///
/// # Steps
/// 1. Reject bodies over [`MAX_BODY_BYTES`] with `413`
/// 2. Verify HTTP Signature (C1) against the resolved signer's key (C2),
///    retrying once with a forced key refresh on failure (key rotation)
/// 3. Hand the parsed activity to the inbox pipeline (C4)
async fn inbox(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if body.len() > MAX_BODY_BYTES {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    let path = format!("/users/{username}/inbox");
    match handle_inbox(&state, Some(&username), &path, &headers, &body).await {
        Ok(()) => {
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["POST", "/users/:username/inbox", "200"])
                .inc();
            StatusCode::OK.into_response()
        }
        Err(e) => e.into_response(),
    }
}

/// POST /inbox
///
/// Shared inbox: one delivery for activities addressed to multiple local
/// followers, routed by the inbox pipeline rather than by username.
async fn shared_inbox(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if body.len() > MAX_BODY_BYTES {
        return StatusCode::PAYLOAD_TOO_LARGE.into_response();
    }

    match handle_inbox(&state, None, "/inbox", &headers, &body).await {
        Ok(()) => {
            HTTP_REQUESTS_TOTAL
                .with_label_values(&["POST", "/inbox", "200"])
                .inc();
            StatusCode::OK.into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn handle_inbox(
    state: &AppState,
    username: Option<&str>,
    path: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), AppError> {
    let _timer = HTTP_REQUEST_DURATION_SECONDS.with_label_values(&["POST", path]).start_timer();
    let _fed_timer = FEDERATION_REQUEST_DURATION_SECONDS.with_label_values(&["inbound"]).start_timer();

    if let Some(username) = username {
        state
            .store
            .get_account_by_username(username)
            .await?
            .ok_or(AppError::NotFound)?;
    }

    let signature_header = headers
        .get("signature")
        .ok_or(AppError::SigInvalid)?
        .to_str()
        .map_err(|_| AppError::SigInvalid)?;
    let parsed = signature::parse_signature_header(signature_header)?;

    rate_limit(state, &extract_domain(&parsed.key_id)).await?;

    let (actor, public_key_pem) = state.resolver.key_for_key_id(&parsed.key_id, false).await?;

    if signature::verify_signature("POST", path, headers, Some(body), &public_key_pem, state.clock.as_ref())
        .is_err()
    {
        // The cached key may be stale after a rotation on the peer's side;
        // refetch once and retry before failing closed.
        let (actor, public_key_pem) = state.resolver.key_for_key_id(&parsed.key_id, true).await?;
        signature::verify_signature("POST", path, headers, Some(body), &public_key_pem, state.clock.as_ref())?;
        FEDERATION_REQUESTS_TOTAL.with_label_values(&["inbound", "accepted"]).inc();
        return dispatch_activity(state, body, &actor.actor_uri).await;
    }

    FEDERATION_REQUESTS_TOTAL.with_label_values(&["inbound", "accepted"]).inc();
    dispatch_activity(state, body, &actor.actor_uri).await
}

async fn dispatch_activity(state: &AppState, body: &[u8], signer_actor_uri: &str) -> Result<(), AppError> {
    let activity: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| AppError::BadRequest(format!("invalid JSON: {e}")))?;
    state.inbox_processor.process(activity, signer_actor_uri).await
}

/// Resolve a polymorphic actor reference to the actor URI used for
/// collection items (`followers`/`following` entries).
async fn actor_ref_uri(state: &AppState, actor: ActorRef) -> Result<Option<String>, AppError> {
    match actor {
        ActorRef::Local(id) => Ok(state
            .store
            .get_account_by_id(id)
            .await?
            .map(|account| format!("{}/users/{}", state.config.server.base_url(), account.username))),
        ActorRef::Remote(id) => Ok(state.store.get_remote_actor_by_id(id).await?.map(|a| a.actor_uri)),
    }
}

/// GET /users/:username/outbox
///
/// First page of the account's public `OrderedCollection`, most recent
/// notes first. Pagination beyond the first page is a non-goal.
async fn outbox_collection(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    rate_limit(&state, &client_key(&headers)).await?;
    let account = state
        .store
        .get_account_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let base_url = state.config.server.base_url();
    let actor_url = format!("{}/users/{}", base_url, account.username);
    let outbox_url = format!("{}/outbox", actor_url);

    let notes = state.store.list_outbox_notes(account.id, PAGE_SIZE).await?;
    let items: Vec<serde_json::Value> = notes
        .iter()
        .map(|note| {
            let (to, cc) = outbox::audience_for_visibility(&actor_url, &note.visibility);
            let note_json = outbox::builder::note(
                &note.object_uri,
                &actor_url,
                &note.content_html,
                &note.created_at,
                note.in_reply_to_uri.as_deref(),
                note.sensitive,
                note.content_warning.as_deref(),
                &[],
                &to,
                &cc,
            );
            outbox::builder::create(
                &format!("{}/activity", note.object_uri),
                &actor_url,
                note_json,
                &[],
                &to,
                &cc,
                &note.created_at,
            )
        })
        .collect();

    Ok(Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": outbox_url,
        "totalItems": items.len(),
        "orderedItems": items
    })))
}

/// GET /notes/:id
///
/// Dereferences a locally-synthesized note URI so peers can fetch a reply's
/// parent. 404s for unknown ids and for notes authored remotely (those live
/// at their origin server, never here).
async fn note(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    rate_limit(&state, &client_key(&headers)).await?;

    let base_url = state.config.server.base_url();
    let object_uri = format!("{}/notes/{}", base_url, id);

    let note = state.store.get_note_by_uri(&object_uri).await?.ok_or(AppError::NotFound)?;
    let NoteAuthor::Local(author_id) = NoteAuthor::from_column(&note.created_by) else {
        return Err(AppError::NotFound);
    };
    let account = state.store.get_account_by_id(author_id).await?.ok_or(AppError::NotFound)?;
    let actor_url = format!("{}/users/{}", base_url, account.username);

    let (to, cc) = outbox::audience_for_visibility(&actor_url, &note.visibility);
    let mut note_json = outbox::builder::note(
        &note.object_uri,
        &actor_url,
        &note.content_html,
        &note.created_at,
        note.in_reply_to_uri.as_deref(),
        note.sensitive,
        note.content_warning.as_deref(),
        &[],
        &to,
        &cc,
    );
    note_json["@context"] = serde_json::json!("https://www.w3.org/ns/activitystreams");

    HTTP_REQUESTS_TOTAL.with_label_values(&["GET", "/notes/:id", "200"]).inc();
    Ok(Json(note_json))
}

/// GET /users/:username/followers
async fn followers(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    rate_limit(&state, &client_key(&headers)).await?;
    let account = state
        .store
        .get_account_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let follows = state.store.list_accepted_followers(ActorRef::Local(account.id)).await?;
    let mut items = Vec::with_capacity(follows.len());
    for follow in follows {
        if let Some(uri) = actor_ref_uri(&state, follow.follower()).await? {
            items.push(uri);
        }
    }

    let base_url = state.config.server.base_url();
    let followers_url = format!("{}/users/{}/followers", base_url, account.username);

    Ok(Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": followers_url,
        "totalItems": items.len(),
        "orderedItems": items
    })))
}

/// GET /users/:username/following
async fn following(
    State(state): State<AppState>,
    Path(username): Path<String>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    rate_limit(&state, &client_key(&headers)).await?;
    let account = state
        .store
        .get_account_by_username(&username)
        .await?
        .ok_or(AppError::NotFound)?;

    let follows = state.store.list_accepted_following(ActorRef::Local(account.id)).await?;
    let mut items = Vec::with_capacity(follows.len());
    for follow in follows {
        if let Some(uri) = actor_ref_uri(&state, follow.target()).await? {
            items.push(uri);
        }
    }

    let base_url = state.config.server.base_url();
    let following_url = format!("{}/users/{}/following", base_url, account.username);

    Ok(Json(serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "OrderedCollection",
        "id": following_url,
        "totalItems": items.len(),
        "orderedItems": items
    })))
}
