//! Outbound content rendering and remote content sanitization.
//!
//! Local notes are authored as plain text with a small markdown-link
//! convention; this module turns that into the HTML and `tag` array the
//! outbox builder (C5) attaches to a `Create`/`Update` activity. Remote
//! content is never rendered here, only sanitized with `ammonia`, the way
//! the teacher's `activity.rs::sanitize_remote_html` does it.

use once_cell::sync::Lazy;
use regex::Regex;

static MARKDOWN_LINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[([^\]]+)\]\((https?://[^\s)]+)\)").expect("valid regex"));

static BARE_URL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://[^\s<]+").expect("valid regex"));

static HASHTAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"#([a-zA-Z][a-zA-Z0-9_]*)").expect("valid regex"));

static MENTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([a-zA-Z0-9_]+)@([a-zA-Z0-9.-]+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq)]
pub enum Tag {
    Hashtag { name: String, href: String },
    Mention { name: String, href: String },
}

impl Tag {
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Tag::Hashtag { name, href } => serde_json::json!({
                "type": "Hashtag",
                "name": format!("#{name}"),
                "href": href,
            }),
            Tag::Mention { name, href } => serde_json::json!({
                "type": "Mention",
                "name": name,
                "href": href,
            }),
        }
    }
}

/// A resolver from `@user@domain` to the actor URI to link/address, used so
/// mentions render as a real `u-url` link and get added to the recipient
/// list. Returns `None` for addresses that don't resolve to a known actor,
/// in which case the text is left unlinkified.
pub trait MentionResolver {
    fn resolve(&self, user: &str, domain: &str) -> Option<String>;
}

pub struct RenderedContent {
    pub html: String,
    pub tags: Vec<Tag>,
}

/// Build the `content` HTML and `tag` array for a locally-authored message,
/// per the literal templates:
/// hashtag: `<a href="<domain>/tags/<tag>" class="hashtag" rel="tag">#<span>tag</span></a>`
/// mention: `<span class="h-card"><a href="<actor>" class="u-url mention">@<span>user</span></a></span>`
pub fn render_local_content(
    message: &str,
    local_domain: &str,
    mentions: &dyn MentionResolver,
) -> RenderedContent {
    let mut tags = Vec::new();

    let escaped = html_escape(message);

    let with_links = MARKDOWN_LINK_RE.replace_all(&escaped, |caps: &regex::Captures| {
        format!(r#"<a href="{}">{}</a>"#, &caps[2], &caps[1])
    });

    let with_bare_urls = linkify_bare_urls(&with_links);

    let with_mentions = MENTION_RE.replace_all(&with_bare_urls, |caps: &regex::Captures| {
        let user = &caps[1];
        let domain = &caps[2];
        match mentions.resolve(user, domain) {
            Some(actor_uri) => {
                tags.push(Tag::Mention {
                    name: format!("@{user}@{domain}"),
                    href: actor_uri.clone(),
                });
                format!(
                    r#"<span class="h-card"><a href="{actor_uri}" class="u-url mention">@<span>{user}</span></a></span>"#
                )
            }
            None => caps[0].to_string(),
        }
    });

    let with_hashtags = HASHTAG_RE.replace_all(&with_mentions, |caps: &regex::Captures| {
        let tag = &caps[1];
        let href = format!("{local_domain}/tags/{}", tag.to_lowercase());
        tags.push(Tag::Hashtag { name: tag.to_lowercase(), href: href.clone() });
        format!(r#"<a href="{href}" class="hashtag" rel="tag">#<span>{tag}</span></a>"#)
    });

    RenderedContent { html: format!("<p>{with_hashtags}</p>"), tags }
}

fn linkify_bare_urls(input: &str) -> std::borrow::Cow<'_, str> {
    BARE_URL_RE.replace_all(input, |caps: &regex::Captures| {
        let url = &caps[0];
        format!(r#"<a href="{url}">{url}</a>"#)
    })
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Sanitize HTML received from a remote actor before storing/displaying it.
pub fn sanitize_remote_html(content: &str) -> String {
    ammonia::clean(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoMentions;
    impl MentionResolver for NoMentions {
        fn resolve(&self, _user: &str, _domain: &str) -> Option<String> {
            None
        }
    }

    struct FixedMention(String);
    impl MentionResolver for FixedMention {
        fn resolve(&self, _user: &str, _domain: &str) -> Option<String> {
            Some(self.0.clone())
        }
    }

    #[test]
    fn renders_hashtags() {
        let rendered = render_local_content("hello #rust world", "https://self.example", &NoMentions);
        assert!(rendered.html.contains(r#"<a href="https://self.example/tags/rust" class="hashtag" rel="tag">#<span>rust</span></a>"#));
        assert_eq!(rendered.tags, vec![Tag::Hashtag {
            name: "rust".to_string(),
            href: "https://self.example/tags/rust".to_string(),
        }]);
    }

    #[test]
    fn renders_mentions_when_resolvable() {
        let resolver = FixedMention("https://peer.example/users/bob".to_string());
        let rendered = render_local_content("hey @bob@peer.example", "https://self.example", &resolver);
        assert!(rendered.html.contains(r#"<span class="h-card"><a href="https://peer.example/users/bob" class="u-url mention">@<span>bob</span></a></span>"#));
        assert_eq!(rendered.tags.len(), 1);
    }

    #[test]
    fn leaves_unresolvable_mention_as_text() {
        let rendered = render_local_content("hey @bob@peer.example", "https://self.example", &NoMentions);
        assert!(rendered.html.contains("@bob@peer.example"));
        assert!(rendered.tags.is_empty());
    }

    #[test]
    fn converts_markdown_links() {
        let rendered =
            render_local_content("see [this](https://example.com/a)", "https://self.example", &NoMentions);
        assert!(rendered.html.contains(r#"<a href="https://example.com/a">this</a>"#));
    }

    #[test]
    fn linkifies_bare_urls() {
        let rendered = render_local_content("see https://example.com/a", "https://self.example", &NoMentions);
        assert!(rendered.html.contains(r#"<a href="https://example.com/a">https://example.com/a</a>"#));
    }

    #[test]
    fn escapes_html_in_plain_text() {
        let rendered = render_local_content("<script>alert(1)</script>", "https://self.example", &NoMentions);
        assert!(!rendered.html.contains("<script>"));
        assert!(rendered.html.contains("&lt;script&gt;"));
    }
}
