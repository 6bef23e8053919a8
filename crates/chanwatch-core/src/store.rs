use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    domain::{ChannelId, Message, MessageId, UserId},
    filter::{FilterRule, ValidRule, Verdict},
    Result,
};

/// Durable mirror of a message plus the verdict it was handled with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageRecord {
    pub channel_id: ChannelId,
    pub message_id: MessageId,
    pub title: String,
    pub username: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: String,
    pub url: String,
    pub verdict: Verdict,
}

impl MessageRecord {
    pub fn from_message(msg: &Message, verdict: Verdict) -> Self {
        Self {
            channel_id: msg.channel_id,
            message_id: msg.message_id,
            title: msg.channel_title.clone(),
            username: msg.channel_handle.clone(),
            timestamp: msg.timestamp,
            body: msg.body.clone(),
            url: msg.permalink.clone(),
            verdict,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelMetadataRecord {
    pub channel_id: ChannelId,
    pub title: String,
    pub username: Option<String>,
    pub member_count: u32,
    pub is_public: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitoredUser {
    pub user_id: UserId,
    pub handle: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusUpdate {
    pub user_id: UserId,
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Durable state: dedup of handled messages, channel metadata cache, filter
/// rules, monitored users and their status history.
///
/// Every method touches one logical entity and is atomic on its own.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert unless `(channel_id, message_id)` already exists.
    /// Returns `false` for a duplicate; that is not an error.
    async fn save_message(&self, record: &MessageRecord) -> Result<bool>;
    async fn get_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<MessageRecord>>;
    async fn count_messages(&self) -> Result<u64>;

    async fn save_channel_metadata(&self, record: &ChannelMetadataRecord) -> Result<()>;
    async fn get_channel_metadata(&self, channel: ChannelId)
        -> Result<Option<ChannelMetadataRecord>>;

    async fn add_filter(&self, rule: &ValidRule) -> Result<FilterRule>;
    async fn list_filters(&self) -> Result<Vec<FilterRule>>;
    async fn active_filters(&self) -> Result<Vec<FilterRule>>;
    /// `Error::NotFound` when no rule has this id.
    async fn set_filter_enabled(&self, id: i64, enabled: bool) -> Result<()>;

    async fn add_monitored_user(&self, user: &MonitoredUser) -> Result<()>;
    async fn remove_monitored_user(&self, user: UserId) -> Result<bool>;
    async fn monitored_users(&self) -> Result<Vec<MonitoredUser>>;

    async fn append_status(&self, update: &StatusUpdate) -> Result<()>;
    /// Newest first.
    async fn status_history(&self, user: UserId, limit: usize) -> Result<Vec<StatusUpdate>>;
}
