//! MTProto user-session adapter (grammers).
//!
//! A logged-in user account can do everything the core asks of a session:
//! sender-filtered history search, member paging, chunked transfers and live
//! updates. Peer access hashes serve as the core's access tokens; channels
//! the session has only seen by id are looked up in its dialog list.

use std::{
    collections::HashMap,
    future::Future,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use grammers_client::{
    types::{media::Uploaded, Chat, Media},
    Client, Config as ClientConfig, InitParams, InputMessage, Update,
};
use grammers_mtsender::InvocationError;
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

mod convert;
mod login;
mod rpc;
mod upload;

pub use login::LoginPrompt;

use chanwatch_core::{
    config::UserSessionConfig,
    domain::{AccessToken, ChannelId, MessageId, MessageRef, UserId},
    errors::Error,
    gateway::{
        AuthState, ChannelInfo, GatewayCapabilities, InboundPost, MediaRef, MemberInfo,
        PeerCandidate, PushEvent, RawMessage, SearchRequest, SessionGateway, UploadedFile,
        UserStatusEvent,
    },
    Result,
};

use convert::MediaCache;
use upload::UploadLedger;

const MAX_CAPTION_LEN: usize = 1024;
const MAX_RETRIES: usize = 1;
const ADMIN_PAGE: i32 = 200;
const MAX_DIALOGS: usize = 2000;
const UPDATE_BACKOFF: Duration = Duration::from_secs(3);

pub struct UserGateway {
    client: Client,
    session_path: PathBuf,
    /// core channel id -> packed peer with access hash.
    peers: Mutex<HashMap<i64, PackedChat>>,
    media: Mutex<MediaCache>,
    uploads: Mutex<UploadLedger>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn chats_of(res: tl::enums::messages::Chats) -> Vec<tl::enums::Chat> {
    match res {
        tl::enums::messages::Chats::Chats(c) => c.chats,
        tl::enums::messages::Chats::Slice(c) => c.chats,
    }
}

impl UserGateway {
    /// Open (or create) the session file and connect. Logging in is separate.
    pub async fn connect(cfg: &UserSessionConfig) -> Result<Self> {
        let session = Session::load_file_or_create(&cfg.session_path)?;
        let client = Client::connect(ClientConfig {
            session,
            api_id: cfg.api_id,
            api_hash: cfg.api_hash.clone(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| Error::Transport(format!("mtproto connect failed: {e}")))?;
        tracing::info!(session = %cfg.session_path.display(), "mtproto session connected");

        Ok(Self {
            client,
            session_path: cfg.session_path.clone(),
            peers: Mutex::new(HashMap::new()),
            media: Mutex::new(MediaCache::default()),
            uploads: Mutex::new(UploadLedger::default()),
        })
    }

    pub fn session_path(&self) -> &Path {
        &self.session_path
    }

    pub fn save_session(&self) -> Result<()> {
        self.client.session().save_to_file(&self.session_path)?;
        Ok(())
    }

    async fn call<T, Fut>(
        &self,
        peer: Option<i64>,
        mut op: impl FnMut() -> Fut + Send,
    ) -> Result<T>
    where
        Fut: Future<Output = std::result::Result<T, InvocationError>> + Send,
    {
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match rpc::flood_wait(&e) {
                    Some(wait) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        tracing::warn!(wait_secs = wait.as_secs(), "flood wait; retrying");
                        sleep(wait).await;
                    }
                    _ => return Err(rpc::map_invocation(e, peer)),
                },
            }
        }
    }

    fn remember(&self, chat: &Chat) {
        let packed = chat.pack();
        if matches!(packed.ty, PackedType::User | PackedType::Bot) {
            return;
        }
        lock(&self.peers).insert(convert::core_id(&packed), packed);
    }

    fn cached_peer(&self, channel: ChannelId) -> Option<PackedChat> {
        lock(&self.peers).get(&channel.0).cloned()
    }

    async fn load_dialogs(&self) -> Result<()> {
        let mut dialogs = self.client.iter_dialogs();
        let mut seen = 0usize;
        while let Some(dialog) = dialogs
            .next()
            .await
            .map_err(|e| rpc::map_invocation(e, None))?
        {
            self.remember(dialog.chat());
            seen += 1;
            if seen >= MAX_DIALOGS {
                break;
            }
        }
        tracing::debug!(dialogs = seen, "peer cache refreshed from dialogs");
        Ok(())
    }

    /// Access hash for `channel`. A token equal to the id is a placeholder,
    /// so the dialog list is consulted instead.
    async fn channel_hash(&self, channel: ChannelId, token: AccessToken) -> Result<i64> {
        if channel.0 < 0 {
            return Ok(0);
        }
        if let Some(hash) = self.cached_peer(channel).and_then(|p| p.access_hash) {
            return Ok(hash);
        }
        if token.0 != channel.0 {
            return Ok(token.0);
        }
        self.load_dialogs().await?;
        self.cached_peer(channel)
            .and_then(|p| p.access_hash)
            .ok_or(Error::TokenRejected(channel.0))
    }

    async fn packed(&self, channel: ChannelId) -> Result<PackedChat> {
        if channel.0 < 0 {
            return Ok(PackedChat {
                ty: PackedType::Chat,
                id: -channel.0,
                access_hash: None,
            });
        }
        if let Some(packed) = self.cached_peer(channel) {
            return Ok(packed);
        }
        self.load_dialogs().await?;
        self.cached_peer(channel).ok_or_else(|| {
            Error::NotFound(format!("channel {} is not in the dialog list", channel.0))
        })
    }

    async fn participants(
        &self,
        channel: ChannelId,
        token: AccessToken,
        filter: tl::enums::ChannelParticipantsFilter,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MemberInfo>> {
        if channel.0 < 0 {
            return Err(Error::Unsupported(
                "member listing of basic groups".to_string(),
            ));
        }
        let hash = self.channel_hash(channel, token).await?;
        let req = tl::functions::channels::GetParticipants {
            channel: convert::input_channel(channel, hash),
            filter,
            offset: i32::try_from(offset).unwrap_or(i32::MAX),
            limit: i32::try_from(limit).unwrap_or(i32::MAX),
            hash: 0,
        };
        let res = self.call(Some(channel.0), || self.client.invoke(&req)).await?;
        Ok(match res {
            tl::enums::channels::ChannelParticipants::Participants(p) => {
                convert::members_of(&p.users)
            }
            tl::enums::channels::ChannelParticipants::NotModified => Vec::new(),
        })
    }

    async fn media_for(&self, key: &str) -> Result<Media> {
        let cached = lock(&self.media).get(key);
        if let Some(media) = cached {
            return Ok(media);
        }
        let (chat, msg) = convert::parse_media_key(key)
            .ok_or_else(|| Error::NotFound(format!("unknown media reference {key:?}")))?;
        let packed = self.packed(ChannelId(chat)).await?;
        let ids = [msg];
        let found = self
            .call(Some(chat), || self.client.get_messages_by_id(packed, &ids))
            .await?;
        let media = found
            .into_iter()
            .flatten()
            .find_map(|m| m.media())
            .ok_or_else(|| Error::NotFound(format!("message {key} has no media")))?;
        lock(&self.media).insert(key.to_string(), media.clone());
        Ok(media)
    }

    fn post_event(&self, msg: &grammers_client::types::Message) -> Option<PushEvent> {
        if msg.outgoing() {
            return None;
        }
        let chat = msg.chat();
        if matches!(chat, Chat::User(_)) {
            return None;
        }
        self.remember(&chat);
        let channel_id = convert::core_id(&chat.pack());

        let (sender, sender_token) = match msg.sender() {
            Some(user @ Chat::User(_)) => {
                let packed = user.pack();
                (Some(UserId(packed.id)), packed.access_hash.map(AccessToken))
            }
            _ => (None, None),
        };

        let media = msg.media().and_then(|m| {
            let key = convert::media_key(channel_id, msg.id());
            let media_ref = convert::media_ref(key.clone(), &m)?;
            lock(&self.media).insert(key, m);
            Some(media_ref)
        });

        Some(PushEvent::NewPost(InboundPost {
            channel_id: ChannelId(channel_id),
            message_id: MessageId(msg.id()),
            sender,
            sender_token,
            date: msg.date(),
            text: msg.text().to_string(),
            media,
            is_protected: convert::is_protected_chat(&chat),
        }))
    }
}

fn status_event(update: &tl::enums::Update) -> Option<PushEvent> {
    let tl::enums::Update::UserStatus(u) = update else {
        return None;
    };
    let (status, at) = convert::status_label(&u.status);
    Some(PushEvent::UserStatus(UserStatusEvent {
        user_id: UserId(u.user_id),
        status: status.to_string(),
        at: at.unwrap_or_else(Utc::now),
    }))
}

#[async_trait]
impl SessionGateway for UserGateway {
    fn capabilities(&self) -> GatewayCapabilities {
        GatewayCapabilities {
            supports_history_search: true,
            supports_member_scan: true,
            supports_chunked_upload: true,
            max_message_len: 4096,
        }
    }

    async fn auth_state(&self) -> Result<AuthState> {
        let authorized = self
            .call(None, || self.client.is_authorized())
            .await?;
        if authorized {
            Ok(AuthState::Authorized)
        } else {
            Ok(AuthState::Unauthorized {
                reason: format!(
                    "no login in {}; run `chanwatch login` first",
                    self.session_path.display()
                ),
            })
        }
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Vec<PeerCandidate>> {
        match self
            .call(None, || self.client.resolve_username(handle))
            .await
        {
            Ok(Some(chat)) => {
                self.remember(&chat);
                Ok(vec![convert::chat_candidate(&chat)])
            }
            Ok(None) | Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn channel_info(&self, channel: ChannelId, token: AccessToken) -> Result<ChannelInfo> {
        let chats = if channel.0 < 0 {
            let req = tl::functions::messages::GetChats {
                id: vec![-channel.0],
            };
            chats_of(self.call(Some(channel.0), || self.client.invoke(&req)).await?)
        } else {
            let hash = self.channel_hash(channel, token).await?;
            let req = tl::functions::channels::GetChannels {
                id: vec![convert::input_channel(channel, hash)],
            };
            chats_of(self.call(Some(channel.0), || self.client.invoke(&req)).await?)
        };

        for chat in chats {
            match chat {
                tl::enums::Chat::Channel(ch) if ch.id == channel.0 => {
                    let packed = convert::packed_channel(&ch);
                    lock(&self.peers).insert(ch.id, packed);
                    return Ok(ChannelInfo {
                        id: channel,
                        is_public: ch.username.is_some(),
                        handle: ch.username,
                        title: ch.title,
                    });
                }
                tl::enums::Chat::Chat(c) if c.id == -channel.0 => {
                    return Ok(ChannelInfo {
                        id: channel,
                        handle: None,
                        title: c.title,
                        is_public: false,
                    });
                }
                _ => {}
            }
        }
        Err(Error::NotFound(format!("channel {}", channel.0)))
    }

    async fn member_count(&self, channel: ChannelId, token: AccessToken) -> Result<u32> {
        let full = if channel.0 < 0 {
            let req = tl::functions::messages::GetFullChat {
                chat_id: -channel.0,
            };
            self.call(Some(channel.0), || self.client.invoke(&req)).await?
        } else {
            let hash = self.channel_hash(channel, token).await?;
            let req = tl::functions::channels::GetFullChannel {
                channel: convert::input_channel(channel, hash),
            };
            self.call(Some(channel.0), || self.client.invoke(&req)).await?
        };
        let tl::enums::messages::ChatFull::Full(full) = full;
        let count = match full.full_chat {
            tl::enums::ChatFull::ChannelFull(cf) => cf.participants_count.unwrap_or(0),
            tl::enums::ChatFull::Full(cf) => match cf.participants {
                tl::enums::ChatParticipants::Participants(p) => {
                    i32::try_from(p.participants.len()).unwrap_or(i32::MAX)
                }
                tl::enums::ChatParticipants::Forbidden(_) => 0,
            },
        };
        Ok(u32::try_from(count).unwrap_or(0))
    }

    async fn admins(&self, channel: ChannelId, token: AccessToken) -> Result<Vec<MemberInfo>> {
        self.participants(
            channel,
            token,
            tl::enums::ChannelParticipantsFilter::ChannelParticipantsAdmins,
            0,
            ADMIN_PAGE as usize,
        )
        .await
    }

    async fn members(
        &self,
        channel: ChannelId,
        token: AccessToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MemberInfo>> {
        self.participants(
            channel,
            token,
            tl::enums::ChannelParticipantsFilter::ChannelParticipantsRecent,
            offset,
            limit,
        )
        .await
    }

    async fn search_messages(&self, req: &SearchRequest) -> Result<Vec<RawMessage>> {
        let hash = self.channel_hash(req.channel, req.channel_token).await?;
        let search = tl::functions::messages::Search {
            peer: convert::input_peer(req.channel, hash),
            q: String::new(),
            from_id: Some(convert::input_user(req.from_user, req.user_token)),
            saved_peer_id: None,
            saved_reaction: None,
            top_msg_id: None,
            filter: tl::enums::MessagesFilter::InputMessagesFilterEmpty,
            min_date: 0,
            max_date: 0,
            offset_id: 0,
            add_offset: i32::try_from(req.offset).unwrap_or(i32::MAX),
            limit: i32::try_from(req.limit).unwrap_or(i32::MAX),
            max_id: 0,
            min_id: 0,
            hash: 0,
        };

        // The channel hash is settled above; a rejection here is the user's token.
        let res = self
            .call(Some(req.from_user.0), || self.client.invoke(&search))
            .await?;
        let (messages, users) = match res {
            tl::enums::messages::Messages::Messages(m) => (m.messages, m.users),
            tl::enums::messages::Messages::Slice(m) => (m.messages, m.users),
            tl::enums::messages::Messages::ChannelMessages(m) => (m.messages, m.users),
            tl::enums::messages::Messages::NotModified(_) => (Vec::new(), Vec::new()),
        };
        Ok(convert::raw_messages(messages, &users))
    }

    async fn download_chunk(
        &self,
        media: &MediaRef,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (chunk, skip) = upload::chunk_geometry(offset, limit)?;
        let item = self.media_for(&media.file_id).await?;

        let mut download = self
            .client
            .iter_download(&grammers_client::types::Downloadable::Media(item))
            .chunk_size(chunk)
            .skip_chunks(skip);
        match download.next().await {
            Ok(Some(bytes)) => Ok(bytes),
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(rpc::map_invocation(e, None)),
        }
    }

    async fn upload_part(&self, transfer_id: i64, part: u32, bytes: Vec<u8>) -> Result<()> {
        lock(&self.uploads).record(transfer_id, bytes.len())?;
        let req = tl::functions::upload::SaveFilePart {
            file_id: transfer_id,
            file_part: i32::try_from(part).unwrap_or(i32::MAX),
            bytes,
        };
        let stored = self.call(None, || self.client.invoke(&req)).await?;
        if !stored {
            return Err(Error::Transport(format!(
                "transfer {transfer_id}: part {part} not stored"
            )));
        }
        Ok(())
    }

    async fn abort_upload(&self, transfer_id: i64) -> Result<()> {
        lock(&self.uploads).forget(transfer_id);
        Ok(())
    }

    async fn send_text(&self, dest: ChannelId, text: &str) -> Result<MessageRef> {
        let packed = self.packed(dest).await?;
        let sent = self
            .call(Some(dest.0), || {
                self.client
                    .send_message(packed, InputMessage::text(text.to_string()))
            })
            .await?;
        Ok(MessageRef {
            channel_id: dest,
            message_id: MessageId(sent.id()),
        })
    }

    async fn send_media(
        &self,
        dest: ChannelId,
        file: UploadedFile,
        caption: &str,
    ) -> Result<MessageRef> {
        lock(&self.uploads).forget(file.transfer_id);
        upload::check_small_file(&file)?;
        let packed = self.packed(dest).await?;

        let inline_caption = caption.chars().count() <= MAX_CAPTION_LEN;
        let input = tl::enums::InputFile::File(tl::types::InputFile {
            id: file.transfer_id,
            parts: i32::try_from(file.parts).unwrap_or(i32::MAX),
            name: file.file_name.clone(),
            md5_checksum: String::new(),
        });
        let text = if inline_caption { caption } else { "" };

        let sent = self
            .call(Some(dest.0), || {
                let message = InputMessage::text(text).document(Uploaded::from_raw(input.clone()));
                self.client.send_message(packed, message)
            })
            .await?;

        if !inline_caption {
            self.send_text(dest, caption).await?;
        }
        Ok(MessageRef {
            channel_id: dest,
            message_id: MessageId(sent.id()),
        })
    }

    async fn pump_updates(
        &self,
        tx: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.client.next_update() => res,
            };

            let event = match next {
                Ok(Update::NewMessage(msg)) => self.post_event(&msg),
                Ok(Update::Raw(raw)) => status_event(&raw),
                Ok(_) => None,
                Err(e) => {
                    let err = rpc::map_invocation(e, None);
                    if err.is_run_fatal() {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "update stream failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = sleep(UPDATE_BACKOFF) => {}
                    }
                    None
                }
            };

            if let Some(event) = event {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }

        if let Err(e) = self.save_session() {
            tracing::warn!(error = %e, "session state not saved");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_user_status_updates_become_events() {
        let update = tl::enums::Update::UserStatus(tl::types::UpdateUserStatus {
            user_id: 7,
            status: tl::enums::UserStatus::Offline(tl::types::UserStatusOffline {
                was_online: 1_700_000_000,
            }),
        });
        let Some(PushEvent::UserStatus(ev)) = status_event(&update) else {
            panic!("expected a status event");
        };
        assert_eq!(ev.user_id, UserId(7));
        assert_eq!(ev.status, "offline");
        assert_eq!(ev.at.timestamp(), 1_700_000_000);

        let other = tl::enums::Update::UserStatus(tl::types::UpdateUserStatus {
            user_id: 8,
            status: tl::enums::UserStatus::Empty,
        });
        assert!(matches!(
            status_event(&other),
            Some(PushEvent::UserStatus(UserStatusEvent { ref status, .. })) if status == "unknown"
        ));
    }
}
