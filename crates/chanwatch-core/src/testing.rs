//! In-memory fakes for the gateway and store ports.
//!
//! Compiled for this crate's tests and, behind the `testing` feature, for
//! other workspace crates' tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{normalize_handle, AccessToken, ChannelId, MessageId, MessageRef, UserId},
    errors::Error,
    filter::{FilterRule, ValidRule},
    gateway::{
        AuthState, ChannelInfo, GatewayCapabilities, MediaRef, MemberInfo, PeerCandidate,
        PeerKind, PushEvent, RawMessage, SearchRequest, SessionGateway, UploadedFile,
    },
    store::{ChannelMetadataRecord, MessageRecord, MonitoredUser, StatusUpdate, Store},
    Result,
};

enum ScriptedPage {
    Page(Vec<RawMessage>),
    Fail(String),
}

#[derive(Default)]
pub struct FakeGateway {
    unauthorized: Mutex<bool>,
    reject_placeholders: Mutex<bool>,
    candidates: Mutex<HashMap<String, Vec<PeerCandidate>>>,
    channels: Mutex<HashMap<i64, ChannelInfo>>,
    member_counts: Mutex<HashMap<i64, u32>>,
    admins: Mutex<HashMap<i64, Vec<MemberInfo>>>,
    members: Mutex<HashMap<i64, Vec<MemberInfo>>>,
    failing: Mutex<HashSet<i64>>,
    pages: Mutex<HashMap<i64, VecDeque<ScriptedPage>>>,
    media: Mutex<HashMap<String, Vec<u8>>>,
    events: Mutex<Vec<PushEvent>>,

    next_id: Mutex<i32>,
    sent_texts: Mutex<Vec<(ChannelId, String)>>,
    sent_media: Mutex<Vec<(ChannelId, UploadedFile, String)>>,
    uploads: Mutex<Vec<(i64, u32, Vec<u8>)>>,
    aborted: Mutex<Vec<i64>>,
    fail_send_media: Mutex<bool>,

    search_calls: AtomicUsize,
    member_calls: AtomicUsize,
    download_calls: AtomicUsize,
}

impl FakeGateway {
    pub fn set_authorized(&self, yes: bool) {
        *self.unauthorized.lock().unwrap() = !yes;
    }

    /// Reject any call whose channel token equals the channel id.
    pub fn reject_placeholder_tokens(&self) {
        *self.reject_placeholders.lock().unwrap() = true;
    }

    pub fn add_candidate(&self, lookup: &str, candidate: PeerCandidate) {
        self.candidates
            .lock()
            .unwrap()
            .entry(normalize_handle(lookup))
            .or_default()
            .push(candidate);
    }

    /// Register a channel; with a handle it also becomes resolvable, using
    /// its id as the token.
    pub fn add_channel(&self, id: i64, handle: Option<&str>, title: &str, member_count: u32) {
        self.channels.lock().unwrap().insert(
            id,
            ChannelInfo {
                id: ChannelId(id),
                handle: handle.map(str::to_string),
                title: title.to_string(),
                is_public: handle.is_some(),
            },
        );
        self.member_counts.lock().unwrap().insert(id, member_count);
        if let Some(h) = handle {
            self.add_candidate(
                h,
                PeerCandidate {
                    kind: PeerKind::Channel,
                    id,
                    handle: Some(h.to_string()),
                    token: AccessToken(id),
                    title: Some(title.to_string()),
                    first_name: None,
                    last_name: None,
                },
            );
        }
    }

    pub fn set_admins(&self, channel: ChannelId, admins: Vec<MemberInfo>) {
        self.admins.lock().unwrap().insert(channel.0, admins);
    }

    pub fn set_members(&self, channel: ChannelId, members: Vec<MemberInfo>) {
        self.members.lock().unwrap().insert(channel.0, members);
    }

    pub fn fail_channel(&self, channel: ChannelId) {
        self.failing.lock().unwrap().insert(channel.0);
    }

    pub fn push_search_page(&self, channel: ChannelId, page: Vec<RawMessage>) {
        self.pages
            .lock()
            .unwrap()
            .entry(channel.0)
            .or_default()
            .push_back(ScriptedPage::Page(page));
    }

    pub fn push_search_error(&self, channel: ChannelId, reason: &str) {
        self.pages
            .lock()
            .unwrap()
            .entry(channel.0)
            .or_default()
            .push_back(ScriptedPage::Fail(reason.to_string()));
    }

    pub fn set_media(&self, file_id: &str, bytes: Vec<u8>) {
        self.media
            .lock()
            .unwrap()
            .insert(file_id.to_string(), bytes);
    }

    pub fn fail_send_media(&self) {
        *self.fail_send_media.lock().unwrap() = true;
    }

    pub fn queue_event(&self, ev: PushEvent) {
        self.events.lock().unwrap().push(ev);
    }

    pub fn sent_texts(&self) -> Vec<(ChannelId, String)> {
        self.sent_texts.lock().unwrap().clone()
    }

    pub fn sent_media(&self) -> Vec<(ChannelId, UploadedFile, String)> {
        self.sent_media.lock().unwrap().clone()
    }

    pub fn uploads(&self) -> Vec<(i64, u32, Vec<u8>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn aborted_uploads(&self) -> Vec<i64> {
        self.aborted.lock().unwrap().clone()
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    pub fn member_calls(&self) -> usize {
        self.member_calls.load(Ordering::SeqCst)
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    fn check(&self, channel: ChannelId, token: AccessToken) -> Result<()> {
        if *self.reject_placeholders.lock().unwrap() && token.0 == channel.0 {
            return Err(Error::TokenRejected(channel.0));
        }
        if self.failing.lock().unwrap().contains(&channel.0) {
            return Err(Error::Transport(format!("channel {} unavailable", channel.0)));
        }
        Ok(())
    }

    fn alloc(&self, channel: ChannelId) -> MessageRef {
        let mut guard = self.next_id.lock().unwrap();
        *guard += 1;
        MessageRef {
            channel_id: channel,
            message_id: MessageId(*guard),
        }
    }
}

#[async_trait]
impl SessionGateway for FakeGateway {
    fn capabilities(&self) -> GatewayCapabilities {
        GatewayCapabilities {
            supports_history_search: true,
            supports_member_scan: true,
            supports_chunked_upload: true,
            max_message_len: 4096,
        }
    }

    async fn auth_state(&self) -> Result<AuthState> {
        if *self.unauthorized.lock().unwrap() {
            return Ok(AuthState::Unauthorized {
                reason: "no session".to_string(),
            });
        }
        Ok(AuthState::Authorized)
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Vec<PeerCandidate>> {
        Ok(self
            .candidates
            .lock()
            .unwrap()
            .get(&normalize_handle(handle))
            .cloned()
            .unwrap_or_default())
    }

    async fn channel_info(&self, channel: ChannelId, token: AccessToken) -> Result<ChannelInfo> {
        self.check(channel, token)?;
        self.channels
            .lock()
            .unwrap()
            .get(&channel.0)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("channel {}", channel.0)))
    }

    async fn member_count(&self, channel: ChannelId, token: AccessToken) -> Result<u32> {
        self.check(channel, token)?;
        self.member_counts
            .lock()
            .unwrap()
            .get(&channel.0)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("channel {}", channel.0)))
    }

    async fn admins(&self, channel: ChannelId, token: AccessToken) -> Result<Vec<MemberInfo>> {
        self.check(channel, token)?;
        if !self.channels.lock().unwrap().contains_key(&channel.0) {
            return Err(Error::NotFound(format!("channel {}", channel.0)));
        }
        Ok(self
            .admins
            .lock()
            .unwrap()
            .get(&channel.0)
            .cloned()
            .unwrap_or_default())
    }

    async fn members(
        &self,
        channel: ChannelId,
        token: AccessToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MemberInfo>> {
        self.member_calls.fetch_add(1, Ordering::SeqCst);
        self.check(channel, token)?;
        let all = self
            .members
            .lock()
            .unwrap()
            .get(&channel.0)
            .cloned()
            .unwrap_or_default();
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn search_messages(&self, req: &SearchRequest) -> Result<Vec<RawMessage>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        self.check(req.channel, req.channel_token)?;
        let next = self
            .pages
            .lock()
            .unwrap()
            .get_mut(&req.channel.0)
            .and_then(VecDeque::pop_front);
        match next {
            Some(ScriptedPage::Page(page)) => Ok(page),
            Some(ScriptedPage::Fail(reason)) => Err(Error::Transport(reason)),
            None => Ok(Vec::new()),
        }
    }

    async fn download_chunk(
        &self,
        media: &MediaRef,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        let store = self.media.lock().unwrap();
        let bytes = store
            .get(&media.file_id)
            .ok_or_else(|| Error::Transport(format!("no such file {}", media.file_id)))?;
        let start = (offset as usize).min(bytes.len());
        let end = (start + limit).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    async fn upload_part(&self, transfer_id: i64, part: u32, bytes: Vec<u8>) -> Result<()> {
        self.uploads.lock().unwrap().push((transfer_id, part, bytes));
        Ok(())
    }

    async fn abort_upload(&self, transfer_id: i64) -> Result<()> {
        self.aborted.lock().unwrap().push(transfer_id);
        Ok(())
    }

    async fn send_text(&self, dest: ChannelId, text: &str) -> Result<MessageRef> {
        self.sent_texts
            .lock()
            .unwrap()
            .push((dest, text.to_string()));
        Ok(self.alloc(dest))
    }

    async fn send_media(
        &self,
        dest: ChannelId,
        file: UploadedFile,
        caption: &str,
    ) -> Result<MessageRef> {
        if *self.fail_send_media.lock().unwrap() {
            return Err(Error::Transport("media rejected".to_string()));
        }
        self.sent_media
            .lock()
            .unwrap()
            .push((dest, file, caption.to_string()));
        Ok(self.alloc(dest))
    }

    async fn pump_updates(
        &self,
        tx: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let events: Vec<PushEvent> = std::mem::take(&mut *self.events.lock().unwrap());
        for ev in events {
            if cancel.is_cancelled() {
                break;
            }
            if tx.send(ev).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeStore {
    messages: Mutex<Vec<MessageRecord>>,
    metadata: Mutex<HashMap<i64, ChannelMetadataRecord>>,
    filters: Mutex<Vec<FilterRule>>,
    users: Mutex<Vec<MonitoredUser>>,
    statuses: Mutex<Vec<StatusUpdate>>,
}

impl FakeStore {
    pub fn message(&self, channel: ChannelId, message: MessageId) -> Option<MessageRecord> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.channel_id == channel && m.message_id == message)
            .cloned()
    }

    pub fn message_count(&self) -> usize {
        self.messages.lock().unwrap().len()
    }
}

#[async_trait]
impl Store for FakeStore {
    async fn save_message(&self, record: &MessageRecord) -> Result<bool> {
        let mut messages = self.messages.lock().unwrap();
        if messages
            .iter()
            .any(|m| m.channel_id == record.channel_id && m.message_id == record.message_id)
        {
            return Ok(false);
        }
        messages.push(record.clone());
        Ok(true)
    }

    async fn get_message(
        &self,
        channel: ChannelId,
        message: MessageId,
    ) -> Result<Option<MessageRecord>> {
        Ok(self.message(channel, message))
    }

    async fn count_messages(&self) -> Result<u64> {
        Ok(self.message_count() as u64)
    }

    async fn save_channel_metadata(&self, record: &ChannelMetadataRecord) -> Result<()> {
        self.metadata
            .lock()
            .unwrap()
            .insert(record.channel_id.0, record.clone());
        Ok(())
    }

    async fn get_channel_metadata(
        &self,
        channel: ChannelId,
    ) -> Result<Option<ChannelMetadataRecord>> {
        Ok(self.metadata.lock().unwrap().get(&channel.0).cloned())
    }

    async fn add_filter(&self, rule: &ValidRule) -> Result<FilterRule> {
        let mut filters = self.filters.lock().unwrap();
        let id = filters.iter().map(|f| f.id).max().unwrap_or(0) + 1;
        let stored = rule.clone().into_rule(id);
        filters.push(stored.clone());
        Ok(stored)
    }

    async fn list_filters(&self) -> Result<Vec<FilterRule>> {
        Ok(self.filters.lock().unwrap().clone())
    }

    async fn active_filters(&self) -> Result<Vec<FilterRule>> {
        Ok(self
            .filters
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.enabled)
            .cloned()
            .collect())
    }

    async fn set_filter_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        let mut filters = self.filters.lock().unwrap();
        let rule = filters
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| Error::NotFound(format!("filter {id}")))?;
        rule.enabled = enabled;
        Ok(())
    }

    async fn add_monitored_user(&self, user: &MonitoredUser) -> Result<()> {
        let mut users = self.users.lock().unwrap();
        users.retain(|u| u.user_id != user.user_id);
        users.push(user.clone());
        Ok(())
    }

    async fn remove_monitored_user(&self, user: UserId) -> Result<bool> {
        let mut users = self.users.lock().unwrap();
        let before = users.len();
        users.retain(|u| u.user_id != user);
        Ok(users.len() != before)
    }

    async fn monitored_users(&self) -> Result<Vec<MonitoredUser>> {
        Ok(self.users.lock().unwrap().clone())
    }

    async fn append_status(&self, update: &StatusUpdate) -> Result<()> {
        self.statuses.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn status_history(&self, user: UserId, limit: usize) -> Result<Vec<StatusUpdate>> {
        let mut out: Vec<StatusUpdate> = self
            .statuses
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|s| s.user_id == user)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.at.cmp(&a.at));
        out.truncate(limit);
        Ok(out)
    }
}
