use std::fmt;

use chrono::{DateTime, Utc};

/// Backend user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(pub i64);

/// Backend channel / group id (numeric), in bare form as used by `t.me/c/` links.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub i64);

/// Textual prefix the Bot API puts in front of channel and supergroup ids.
const BOT_API_CHANNEL_PREFIX: &str = "-100";

impl ChannelId {
    /// Accepts both the bare id and the Bot API `-100<id>` form.
    pub fn from_bot_api(raw: i64) -> Self {
        Self(strip_channel_prefix(raw))
    }

    /// Bot API chat id. Basic groups (already negative) pass through.
    pub fn to_bot_api(self) -> i64 {
        if self.0 <= 0 {
            return self.0;
        }
        format!("{BOT_API_CHANNEL_PREFIX}{}", self.0)
            .parse()
            .unwrap_or(self.0)
    }
}

/// Drop a leading `-100` from a Bot API channel id; other ids are unchanged.
pub fn strip_channel_prefix(raw: i64) -> i64 {
    let text = raw.to_string();
    match text.strip_prefix(BOT_API_CHANNEL_PREFIX) {
        Some(rest) if !rest.is_empty() => rest.parse().unwrap_or(raw),
        _ => raw,
    }
}

/// Message id, unique within one channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub i32);

/// A stable reference to a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
}

/// Opaque capability value that must accompany a numeric id on backend calls.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccessToken(pub i64);

impl AccessToken {
    /// Self-derived stand-in used when the real token is unknown.
    pub fn placeholder_for(id: i64) -> Self {
        Self(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenOrigin {
    /// Handed out by the backend during resolution, crawl or monitor.
    Resolved,
    /// Derived from the numeric id; the backend may reject it.
    Placeholder,
}

/// How a user or channel is referred to in config and commands.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PeerRef {
    Id(i64),
    Handle(String),
}

impl PeerRef {
    /// Numeric strings become ids (Bot API channel ids lose their `-100`),
    /// anything else a normalized handle.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        if let Ok(id) = trimmed.parse::<i64>() {
            return Some(PeerRef::Id(strip_channel_prefix(id)));
        }
        let handle = normalize_handle(trimmed);
        if handle.is_empty() {
            None
        } else {
            Some(PeerRef::Handle(handle))
        }
    }

    /// Label used in file names and summaries.
    pub fn label(&self) -> String {
        match self {
            PeerRef::Id(id) => id.to_string(),
            PeerRef::Handle(h) => h.clone(),
        }
    }
}

impl fmt::Display for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRef::Id(id) => write!(f, "{id}"),
            PeerRef::Handle(h) => write!(f, "@{h}"),
        }
    }
}

/// Canonical comparison form of a handle: no `@`, no link prefix, lowercase.
pub fn normalize_handle(raw: &str) -> String {
    let mut s = raw.trim();
    for prefix in ["https://", "http://"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
        }
    }
    if let Some(rest) = s.strip_prefix("t.me/") {
        s = rest;
    }
    s.trim_start_matches('@')
        .trim_end_matches('/')
        .to_lowercase()
}

/// A resolved user or channel identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub id: i64,
    pub handle: Option<String>,
    pub token: AccessToken,
    pub origin: TokenOrigin,
}

impl Identity {
    pub fn resolved(id: i64, handle: Option<String>, token: AccessToken) -> Self {
        Self {
            id,
            handle,
            token,
            origin: TokenOrigin::Resolved,
        }
    }

    pub fn placeholder(id: i64) -> Self {
        Self {
            id,
            handle: None,
            token: AccessToken::placeholder_for(id),
            origin: TokenOrigin::Placeholder,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.origin == TokenOrigin::Placeholder
    }

    /// Adopt a backend-issued token. Returns true when anything changed.
    pub fn upgrade_token(&mut self, token: AccessToken) -> bool {
        if self.origin == TokenOrigin::Resolved && self.token == token {
            return false;
        }
        self.token = token;
        self.origin = TokenOrigin::Resolved;
        true
    }
}

/// Channel (or group) as known to this process. Fields fill in lazily.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: ChannelId,
    pub handle: Option<String>,
    pub token: AccessToken,
    pub title: String,
    pub member_count: u32,
    pub admin_handles: Vec<String>,
    pub first_contact: Option<DateTime<Utc>>,
}

impl ChannelRef {
    pub fn new(id: ChannelId, handle: Option<String>, token: AccessToken) -> Self {
        Self {
            id,
            handle,
            token,
            title: String::new(),
            member_count: 0,
            admin_handles: Vec::new(),
            first_contact: None,
        }
    }

    /// Title if known, otherwise the handle or numeric id.
    pub fn display_name(&self) -> String {
        if !self.title.is_empty() {
            return self.title.clone();
        }
        match &self.handle {
            Some(h) => format!("@{h}"),
            None => self.id.0.to_string(),
        }
    }

    pub fn link(&self) -> String {
        match &self.handle {
            Some(h) if !h.is_empty() => format!("https://t.me/{h}"),
            _ => format!(
                "https://t.me/c/{}",
                strip_channel_prefix(self.id.0).abs()
            ),
        }
    }

    pub fn permalink(&self, message_id: MessageId) -> String {
        format!("{}/{}", self.link(), message_id.0)
    }
}

/// An archived or live message. Unique by `(channel_id, message_id)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel_id: ChannelId,
    pub channel_title: String,
    pub channel_handle: Option<String>,
    pub message_id: MessageId,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub permalink: String,
    pub has_media: bool,
}
