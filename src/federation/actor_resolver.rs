//! Key & actor resolver (C2).
//!
//! Fetches remote actors by URI and by `acct:` address (WebFinger), caches
//! them in the object store with a 24h TTL, and resolves a signing key by
//! `keyId`. Grounded on the teacher's `key_cache.rs` (TTL-cache shape) and
//! `webfinger.rs` (stubbed operations, implemented here for real).

use serde::Deserialize;
use std::sync::Arc;

use crate::clock::Clock;
use crate::data::{RemoteActor, RemoteActorUpsert, Store};
use crate::error::AppError;

pub struct ActorResolver {
    store: Arc<dyn Store>,
    http_client: Arc<reqwest::Client>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct WebFingerResult {
    pub subject: String,
    pub actor_uri: String,
    pub profile_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebFingerResponse {
    pub subject: String,
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    pub link_type: Option<String>,
    pub href: Option<String>,
    pub template: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ParsedActor {
    pub id: String,
    pub username: String,
    pub display_name: Option<String>,
    pub summary: Option<String>,
    pub avatar_url: Option<String>,
    pub inbox: String,
    pub shared_inbox: Option<String>,
    pub followers: Option<String>,
    pub public_key_id: String,
    pub public_key_pem: String,
    pub public_key_owner: String,
}

impl ActorResolver {
    pub fn new(store: Arc<dyn Store>, http_client: Arc<reqwest::Client>, clock: Arc<dyn Clock>) -> Self {
        Self { store, http_client, clock }
    }

    /// `ResolveActorByURI` — fetch (if absent or past TTL), parse, upsert.
    pub async fn resolve_actor_by_uri(&self, uri: &str) -> Result<RemoteActor, AppError> {
        if let Some(existing) = self.store.get_remote_actor_by_uri(uri).await? {
            if !existing.is_stale(self.clock.now()) {
                return Ok(existing);
            }
        }
        self.fetch_and_upsert(uri).await
    }

    async fn fetch_and_upsert(&self, uri: &str) -> Result<RemoteActor, AppError> {
        let actor_json = fetch_actor(uri, &self.http_client).await?;
        let parsed = parse_actor(&actor_json)?;

        // RemoteActor invariant: `public_key_id` must resolve to this actor,
        // verified at fetch time — reject a key claimed by someone else.
        if parsed.public_key_owner != parsed.id {
            return Err(AppError::Federation(format!(
                "publicKey.owner {} does not match actor id {}",
                parsed.public_key_owner, parsed.id
            )));
        }

        let domain = url::Url::parse(&parsed.id)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .ok_or_else(|| AppError::Federation("actor id has no host".to_string()))?;

        let upsert = RemoteActorUpsert {
            actor_uri: parsed.id.clone(),
            username: parsed.username,
            domain,
            display_name: parsed.display_name,
            summary: parsed.summary,
            avatar_url: parsed.avatar_url,
            inbox_uri: parsed.inbox,
            shared_inbox_uri: parsed.shared_inbox,
            followers_uri: parsed.followers,
            public_key_id: parsed.public_key_id,
            public_key_pem: parsed.public_key_pem,
        };

        self.store.upsert_remote_actor(upsert, self.clock.now()).await
    }

    /// `ResolveActorByAcct` — WebFinger lookup then `ResolveActorByURI`.
    pub async fn resolve_actor_by_acct(&self, address: &str) -> Result<RemoteActor, AppError> {
        let result = resolve_webfinger(address, &self.http_client).await?;
        self.resolve_actor_by_uri(&result.actor_uri).await
    }

    /// `KeyForKeyId` — strip fragment, resolve actor, assert the key belongs
    /// to it, return PEM. Stale cache entries are re-fetched only when the
    /// caller signals a prior verification failure (key rotation), never on
    /// every lookup, to avoid thrash.
    pub async fn key_for_key_id(
        &self,
        key_id: &str,
        force_refresh: bool,
    ) -> Result<(RemoteActor, String), AppError> {
        let actor_uri = super::signature::extract_actor_uri_from_key_id(key_id);

        let actor = if force_refresh {
            self.fetch_and_upsert(actor_uri).await?
        } else {
            self.resolve_actor_by_uri(actor_uri).await?
        };

        if actor.public_key_id != key_id {
            return Err(AppError::SigKeyUnavailable(format!(
                "keyId {key_id} does not belong to actor {actor_uri}"
            )));
        }

        let pem = actor.public_key_pem.clone();
        Ok((actor, pem))
    }
}

/// `GET <actor_uri>` with `Accept: application/activity+json`.
pub async fn fetch_actor(
    actor_uri: &str,
    http_client: &reqwest::Client,
) -> Result<serde_json::Value, AppError> {
    let response = http_client
        .get(actor_uri)
        .header("Accept", "application/activity+json")
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("failed to fetch actor: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "failed to fetch actor: HTTP {}",
            response.status()
        )));
    }

    response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("failed to parse actor: {e}")))
}

pub fn parse_actor(actor: &serde_json::Value) -> Result<ParsedActor, AppError> {
    let id = actor
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Federation("actor missing id".to_string()))?
        .to_string();

    let username = actor
        .get("preferredUsername")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();

    let display_name = actor.get("name").and_then(|v| v.as_str()).map(str::to_string);
    let summary = actor.get("summary").and_then(|v| v.as_str()).map(str::to_string);
    let avatar_url = actor
        .get("icon")
        .and_then(|icon| icon.get("url"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let inbox = actor
        .get("inbox")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Federation("actor missing inbox".to_string()))?
        .to_string();

    let shared_inbox = actor
        .get("endpoints")
        .and_then(|e| e.get("sharedInbox"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let followers = actor.get("followers").and_then(|v| v.as_str()).map(str::to_string);

    let public_key = actor
        .get("publicKey")
        .ok_or_else(|| AppError::Federation("actor missing publicKey".to_string()))?;

    let public_key_id = public_key
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Federation("publicKey missing id".to_string()))?
        .to_string();

    let public_key_pem = public_key
        .get("publicKeyPem")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Federation("publicKey missing publicKeyPem".to_string()))?
        .to_string();

    let public_key_owner = public_key
        .get("owner")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::Federation("publicKey missing owner".to_string()))?
        .to_string();

    Ok(ParsedActor {
        id,
        username,
        display_name,
        summary,
        avatar_url,
        inbox,
        shared_inbox,
        followers,
        public_key_id,
        public_key_pem,
        public_key_owner,
    })
}

/// `GET https://<domain>/.well-known/webfinger?resource=acct:user@domain`,
/// follow the `self` link of type `application/activity+json`.
pub async fn resolve_webfinger(
    address: &str,
    http_client: &reqwest::Client,
) -> Result<WebFingerResult, AppError> {
    let (_user, domain) = address
        .split_once('@')
        .ok_or_else(|| AppError::BadRequest(format!("invalid acct address: {address}")))?;

    let url = format!(
        "https://{domain}/.well-known/webfinger?resource=acct:{address}",
    );

    let response = http_client
        .get(&url)
        .header("Accept", "application/jrd+json")
        .send()
        .await
        .map_err(|e| AppError::Federation(format!("webfinger request failed: {e}")))?;

    if !response.status().is_success() {
        return Err(AppError::Federation(format!(
            "webfinger request failed: HTTP {}",
            response.status()
        )));
    }

    let jrd: WebFingerResponse = response
        .json()
        .await
        .map_err(|e| AppError::Federation(format!("invalid webfinger response: {e}")))?;

    let self_link = jrd
        .links
        .iter()
        .find(|l| l.rel == "self" && l.link_type.as_deref() == Some("application/activity+json"))
        .ok_or_else(|| AppError::Federation("webfinger response has no self link".to_string()))?;

    let actor_uri = self_link
        .href
        .clone()
        .ok_or_else(|| AppError::Federation("self link missing href".to_string()))?;

    let profile_url = jrd
        .links
        .iter()
        .find(|l| l.rel == "http://webfinger.net/rel/profile-page")
        .and_then(|l| l.href.clone());

    Ok(WebFingerResult {
        subject: jrd.subject,
        actor_uri,
        profile_url,
    })
}

/// Build the JRD response for a local account's WebFinger lookup.
pub fn generate_webfinger_response(username: &str, domain: &str) -> WebFingerResponse {
    let actor_uri = format!("https://{domain}/users/{username}");
    WebFingerResponse {
        subject: format!("acct:{username}@{domain}"),
        aliases: Some(vec![actor_uri.clone()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor_uri),
                template: None,
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(format!("https://{domain}/u/{username}")),
                template: None,
            },
        ],
    }
}
