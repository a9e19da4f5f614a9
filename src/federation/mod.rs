//! ActivityPub federation core.
//!
//! - `signature` — HTTP Signatures, sign/verify (C1)
//! - `actor_resolver` — remote actor + WebFinger resolution, key lookup (C2)
//! - `content` — outbound content rendering, remote HTML sanitization
//! - `inbox` — inbound activity dispatch (C4)
//! - `outbox` — outgoing activity construction and addressing (C5)
//! - `delivery` — durable delivery worker (C6)
//! - `rate_limit` — per-key token bucket for inbound HTTP
//! - `relay` — relay subscription state machine (C8)

pub mod actor_resolver;
pub mod content;
pub mod delivery;
pub mod inbox;
pub mod outbox;
pub mod rate_limit;
pub mod relay;
pub mod signature;

pub use actor_resolver::ActorResolver;
pub use content::{MentionResolver, RenderedContent, Tag, render_local_content, sanitize_remote_html};
pub use delivery::DeliveryWorker;
pub use inbox::InboxProcessor;
pub use outbox::LocalSigner;
pub use rate_limit::{RateLimitStats, RateLimiter, extract_domain};
pub use signature::{sign_request, verify_signature};
