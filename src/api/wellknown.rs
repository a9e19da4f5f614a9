//! Well-known endpoints
//!
//! - /.well-known/webfinger
//! - /.well-known/nodeinfo
//! - /.well-known/host-meta
//! - /nodeinfo/2.0, /nodeinfo/2.1

use axum::{
    Router,
    extract::{Path, Query, State},
    response::Json,
    routing::get,
};
use serde::Deserialize;

use crate::AppState;
use crate::error::AppError;
use crate::federation::actor_resolver;

/// Create well-known router
///
/// Routes:
/// - GET /.well-known/webfinger
/// - GET /.well-known/nodeinfo
/// - GET /.well-known/host-meta
/// - GET /nodeinfo/:version
pub fn wellknown_router() -> Router<AppState> {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger))
        .route("/.well-known/nodeinfo", get(nodeinfo_links))
        .route("/.well-known/host-meta", get(host_meta))
        .route("/nodeinfo/:version", get(nodeinfo))
}

/// WebFinger query parameters
#[derive(Debug, Deserialize)]
struct WebFingerQuery {
    resource: String,
}

/// GET /.well-known/webfinger
///
/// Responds to WebFinger queries for local accounts.
///
/// Query: ?resource=acct:user@domain
async fn webfinger(
    State(state): State<AppState>,
    Query(query): Query<WebFingerQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let resource = &query.resource;

    let acct = resource
        .strip_prefix("acct:")
        .ok_or_else(|| AppError::BadRequest("resource must start with 'acct:'".to_string()))?;

    let (username, domain) = acct
        .split_once('@')
        .ok_or_else(|| AppError::BadRequest("invalid acct format".to_string()))?;

    if domain != state.config.server.domain {
        return Err(AppError::NotFound);
    }

    state
        .store
        .get_account_by_username(username)
        .await?
        .ok_or(AppError::NotFound)?;

    let jrd = actor_resolver::generate_webfinger_response(username, domain);
    let links: Vec<serde_json::Value> = jrd
        .links
        .iter()
        .map(|l| {
            serde_json::json!({
                "rel": l.rel,
                "type": l.link_type,
                "href": l.href,
            })
        })
        .collect();

    Ok(Json(serde_json::json!({
        "subject": jrd.subject,
        "aliases": jrd.aliases,
        "links": links,
    })))
}

/// GET /.well-known/nodeinfo
///
/// Returns links to the supported nodeinfo documents.
async fn nodeinfo_links(State(state): State<AppState>) -> Json<serde_json::Value> {
    let base_url = state.config.server.base_url();
    Json(serde_json::json!({
        "links": [
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": format!("{}/nodeinfo/2.0", base_url)
            },
            {
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.1",
                "href": format!("{}/nodeinfo/2.1", base_url)
            }
        ]
    }))
}

/// GET /nodeinfo/:version
///
/// Returns a NodeInfo document. Supports `2.0` and `2.1`; any other value
/// is a 404 since this node doesn't advertise a schema link for it.
async fn nodeinfo(
    State(state): State<AppState>,
    Path(version): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    if version != "2.0" && version != "2.1" {
        return Err(AppError::NotFound);
    }

    let total_users = state.store.count_accounts().await?;
    let local_posts = state.store.count_local_notes().await?;
    let now = state.clock.now();
    let active_month = state.store.count_active_accounts(now - chrono::Duration::days(30)).await?;
    let active_halfyear = state.store.count_active_accounts(now - chrono::Duration::days(180)).await?;

    let mut software = serde_json::json!({
        "name": "stegodon",
        "version": env!("CARGO_PKG_VERSION"),
    });
    if version == "2.1" {
        software["repository"] = serde_json::json!(env!("CARGO_PKG_REPOSITORY"));
    }

    Ok(Json(serde_json::json!({
        "version": version,
        "software": software,
        "protocols": ["activitypub"],
        "services": {
            "inbound": [],
            "outbound": []
        },
        "openRegistrations": state.config.registration.mode == crate::config::RegistrationMode::Open,
        "usage": {
            "users": {
                "total": total_users,
                "activeMonth": active_month,
                "activeHalfyear": active_halfyear
            },
            "localPosts": local_posts
        },
        "metadata": {
            "nodeName": state.config.instance.title,
            "nodeDescription": state.config.instance.description,
        }
    })))
}

/// GET /.well-known/host-meta
///
/// Returns host-meta XML for WebFinger discovery.
async fn host_meta(State(state): State<AppState>) -> impl axum::response::IntoResponse {
    let base_url = state.config.server.base_url();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<XRD xmlns="http://docs.oasis-open.org/ns/xri/xrd-1.0">
  <Link rel="lrdd" template="{}/.well-known/webfinger?resource={{uri}}"/>
</XRD>"#,
        base_url
    );

    ([("Content-Type", "application/xrd+xml")], xml)
}
