use chrono::{DateTime, Utc};

use crate::domain::{AccessToken, ChannelId, MessageId, UserId};

/// Capabilities / feature flags of a gateway implementation.
#[derive(Clone, Copy, Debug)]
pub struct GatewayCapabilities {
    pub supports_history_search: bool,
    pub supports_member_scan: bool,
    pub supports_chunked_upload: bool,
    pub max_message_len: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthState {
    Authorized,
    Unauthorized { reason: String },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    User,
    Channel,
}

/// One hit of a handle lookup. A lookup may return several.
#[derive(Clone, Debug)]
pub struct PeerCandidate {
    pub kind: PeerKind,
    pub id: i64,
    pub handle: Option<String>,
    pub token: AccessToken,
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ChannelInfo {
    pub id: ChannelId,
    pub handle: Option<String>,
    pub title: String,
    pub is_public: bool,
}

#[derive(Clone, Debug)]
pub struct MemberInfo {
    pub user_id: UserId,
    pub handle: Option<String>,
    pub token: AccessToken,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

/// One page of a "messages from user X in channel Y" search.
#[derive(Clone, Debug)]
pub struct SearchRequest {
    pub channel: ChannelId,
    pub channel_token: AccessToken,
    pub from_user: UserId,
    pub user_token: AccessToken,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Clone, Debug)]
pub struct RawMessage {
    pub id: MessageId,
    pub date: DateTime<Utc>,
    pub text: String,
    pub has_media: bool,
    pub sender: Option<UserId>,
    /// Token for `sender` as seen by the backend, when it hands one out.
    pub sender_token: Option<AccessToken>,
}

/// Backend-side handle of an attachment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRef {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
}

/// Parts uploaded under one transfer id, ready to be bound to a message.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    pub transfer_id: i64,
    pub parts: u32,
    pub file_name: String,
    pub total_bytes: u64,
}

/// A new post in some channel or group the session can see.
#[derive(Clone, Debug)]
pub struct InboundPost {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub sender: Option<UserId>,
    pub sender_token: Option<AccessToken>,
    pub date: DateTime<Utc>,
    pub text: String,
    pub media: Option<MediaRef>,
    /// Source disallows forwarding / saving.
    pub is_protected: bool,
}

#[derive(Clone, Debug)]
pub struct UserStatusEvent {
    pub user_id: UserId,
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Push update delivered by the session.
#[derive(Clone, Debug)]
pub enum PushEvent {
    NewPost(InboundPost),
    UserStatus(UserStatusEvent),
    Other,
}
