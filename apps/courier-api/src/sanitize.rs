//! Outbound content sanitization.
//!
//! Every broadcast-class payload passes through here before it reaches the
//! registry. Stateless; strict mode strips all markup, non-strict mode keeps
//! a fixed allow-list of formatting tags while removing the dangerous rest.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

/// URL schemes that are never allowed to leave the server.
const SCHEME_DENYLIST: [&str; 4] = ["javascript:", "data:", "vbscript:", "file:"];

/// Schemes a link field may carry. Relative paths and fragments are also
/// accepted.
const SCHEME_ALLOWLIST: [&str; 4] = ["http://", "https://", "ftp://", "mailto:"];

/// Structural and formatting tags that non-strict mode leaves untouched.
const ALLOWED_TAGS: [&str; 22] = [
    "a", "b", "i", "u", "em", "strong", "p", "br", "hr", "ul", "ol", "li", "h1", "h2", "h3", "h4",
    "blockquote", "code", "pre", "span", "div", "img",
];

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("valid regex"));

static SCRIPT_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b[^>]*>.*?(</script\s*>|\z)").expect("valid regex")
});

static STYLE_BLOCK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<style\b[^>]*>.*?(</style\s*>|\z)").expect("valid regex")
});

static EVENT_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\son[a-z]+\s*=\s*("[^"]*"|'[^']*'|[^\s>]+)"#).expect("valid regex")
});

static UNSAFE_SCHEME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(javascript|data|vbscript|file)\s*:").expect("valid regex")
});

static TAG_FILTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"</?([a-zA-Z][a-zA-Z0-9]*)\b[^>]*>").expect("valid regex")
});

static ENTITY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&(#[xX]?[0-9a-fA-F]+|[a-zA-Z]+);").expect("valid regex")
});

/// Sanitize a text field. Strict mode strips every tag and decodes HTML
/// entities back to literal characters; non-strict mode keeps allow-listed
/// formatting tags and removes script/style blocks, inline event handlers,
/// and unsafe URL schemes.
pub fn sanitize(text: &str, strict: bool) -> String {
    if strict {
        sanitize_strict(text)
    } else {
        sanitize_rich(text)
    }
}

fn sanitize_strict(text: &str) -> String {
    // Decoding can expose fresh markup ("&lt;script&gt;" becomes a real
    // tag), so strip and decode alternately until the text stops changing.
    // Every rewrite shortens the string, so this terminates.
    let mut current = text.to_string();
    loop {
        let stripped = TAG_RE.replace_all(&current, "");
        let next = decode_entities(&stripped);
        if next == current {
            return next;
        }
        current = next;
    }
}

fn sanitize_rich(text: &str) -> String {
    let out = SCRIPT_BLOCK_RE.replace_all(text, "");
    let out = STYLE_BLOCK_RE.replace_all(&out, "");
    let out = EVENT_ATTR_RE.replace_all(&out, "");
    let out = UNSAFE_SCHEME_RE.replace_all(&out, "");
    TAG_FILTER_RE
        .replace_all(&out, |caps: &Captures| {
            let name = caps[1].to_lowercase();
            if ALLOWED_TAGS.contains(&name.as_str()) {
                caps[0].to_string()
            } else {
                String::new()
            }
        })
        .into_owned()
}

fn decode_entities(text: &str) -> String {
    ENTITY_RE
        .replace_all(text, |caps: &Captures| {
            let body = &caps[1];
            let decoded = if let Some(hex) = body.strip_prefix("#x").or_else(|| body.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok().and_then(char::from_u32)
            } else if let Some(dec) = body.strip_prefix('#') {
                dec.parse::<u32>().ok().and_then(char::from_u32)
            } else {
                match body {
                    "amp" => Some('&'),
                    "lt" => Some('<'),
                    "gt" => Some('>'),
                    "quot" => Some('"'),
                    "apos" => Some('\''),
                    "nbsp" => Some(' '),
                    _ => None,
                }
            };
            match decoded {
                Some(c) => c.to_string(),
                // Unknown entity: leave it as written.
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Whether a link field is allowed to leave the server as-is.
///
/// Rejects the scheme denylist (with embedded whitespace collapsed, so
/// "java\tscript:" does not slip through), accepts relative paths,
/// fragments, and the scheme allow-list.
pub fn is_url_safe(url: &str) -> bool {
    let compact: String = url
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_lowercase();

    if compact.is_empty() {
        return false;
    }
    if SCHEME_DENYLIST.iter().any(|s| compact.starts_with(s)) {
        return false;
    }
    if compact.starts_with('/') || compact.starts_with('#') {
        return true;
    }
    if SCHEME_ALLOWLIST.iter().any(|s| compact.starts_with(s)) {
        return true;
    }
    // Bare relative path: safe only if nothing scheme-like precedes the
    // first path separator.
    let head = compact.split(['/', '?', '#']).next().unwrap_or("");
    !head.contains(':')
}

/// An announcement payload as composed in the back office.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnouncementContent {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<String>,
}

/// Sanitize an announcement for broadcast: strict on the title and summary,
/// non-strict on the rich content body. An unsafe link is nulled rather
/// than rejected so the rest of the payload still delivers.
pub fn sanitize_announcement(mut announcement: AnnouncementContent) -> AnnouncementContent {
    announcement.title = sanitize(&announcement.title, true);
    announcement.summary = announcement.summary.map(|s| sanitize(&s, true));
    announcement.content = sanitize(&announcement.content, false);
    announcement.link = announcement.link.filter(|l| is_url_safe(l));
    announcement
}
