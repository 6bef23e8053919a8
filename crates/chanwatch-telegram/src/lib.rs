//! Telegram adapter (teloxide).
//!
//! This crate implements the `chanwatch-core` SessionGateway over the Telegram
//! Bot API. A bot session cannot search history or page through members, so
//! it only serves monitor mode; crawling needs the user-session gateway.
//!
//! Channel ids cross this boundary in bare form; the Bot API `-100` prefix is
//! added on the way out and stripped on the way in.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{header::RANGE, StatusCode};
use teloxide::{
    payloads::setters::*,
    prelude::*,
    types::{InputFile, Recipient},
    ApiError, RequestError,
};
use tokio::{sync::mpsc, time::sleep};
use tokio_util::sync::CancellationToken;

mod convert;

use chanwatch_core::{
    domain::{AccessToken, ChannelId, MessageId, MessageRef, UserId},
    errors::Error,
    gateway::{
        AuthState, ChannelInfo, GatewayCapabilities, MediaRef, MemberInfo, PeerCandidate,
        PushEvent, RawMessage, SearchRequest, SessionGateway, UploadedFile,
    },
    Result,
};

const MAX_CAPTION_LEN: usize = 1024;
const POLL_TIMEOUT_SECS: u32 = 30;
const POLL_BACKOFF: Duration = Duration::from_secs(3);
const FILE_PATH_CACHE: usize = 256;

/// Bounded file_id -> getFile path map; oldest entries go first.
#[derive(Default)]
struct FilePaths {
    paths: HashMap<String, String>,
    order: VecDeque<String>,
}

impl FilePaths {
    fn get(&self, file_id: &str) -> Option<String> {
        self.paths.get(file_id).cloned()
    }

    fn insert(&mut self, file_id: String, path: String) {
        if self.paths.insert(file_id.clone(), path).is_none() {
            self.order.push_back(file_id);
        }
        while self.order.len() > FILE_PATH_CACHE {
            if let Some(old) = self.order.pop_front() {
                self.paths.remove(&old);
            }
        }
    }

    fn len(&self) -> usize {
        self.paths.len()
    }
}

pub struct BotGateway {
    bot: Bot,
    http: reqwest::Client,
    file_paths: Mutex<FilePaths>,
    /// transfer id -> (part, bytes), assembled on send_media.
    uploads: Mutex<HashMap<i64, Vec<(u32, Vec<u8>)>>>,
}

impl BotGateway {
    pub fn new(bot: Bot) -> Self {
        Self {
            bot,
            http: reqwest::Client::new(),
            file_paths: Mutex::new(FilePaths::default()),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_token(token: &str) -> Self {
        Self::new(Bot::new(token))
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(channel: ChannelId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(channel.to_bot_api())
    }

    fn map_err(e: RequestError) -> Error {
        match e {
            RequestError::Api(ApiError::ChatNotFound) => {
                Error::NotFound("telegram: chat not found".to_string())
            }
            RequestError::Api(ApiError::InvalidToken) => {
                Error::Auth("telegram: bot token rejected".to_string())
            }
            other => Error::Transport(format!("telegram error: {other}")),
        }
    }

    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => match e {
                    RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                        attempts += 1;
                        sleep(d.duration()).await;
                        continue;
                    }
                    other => return Err(Self::map_err(other)),
                },
            }
        }
    }

    async fn file_path(&self, file_id: &str) -> Result<String> {
        let cached = lock(&self.file_paths).get(file_id);
        if let Some(path) = cached {
            return Ok(path);
        }
        let file = self
            .with_retry(|| self.bot.get_file(file_id.to_string()))
            .await?;
        lock(&self.file_paths).insert(file_id.to_string(), file.path.clone());
        Ok(file.path)
    }

    fn take_upload(&self, file: &UploadedFile) -> Result<Vec<u8>> {
        let mut parts = lock(&self.uploads)
            .remove(&file.transfer_id)
            .ok_or_else(|| {
                Error::Transport(format!("no parts uploaded for transfer {}", file.transfer_id))
            })?;
        parts.sort_by_key(|(part, _)| *part);
        if parts.len() != file.parts as usize {
            return Err(Error::Transport(format!(
                "transfer {}: expected {} parts, have {}",
                file.transfer_id,
                file.parts,
                parts.len()
            )));
        }
        Ok(parts.into_iter().flat_map(|(_, bytes)| bytes).collect())
    }

    fn message_ref(dest: ChannelId, msg: &Message) -> MessageRef {
        MessageRef {
            channel_id: dest,
            message_id: MessageId(msg.id.0),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn range_header(offset: u64, limit: usize) -> String {
    let last = offset + (limit as u64).saturating_sub(1);
    format!("bytes={offset}-{last}")
}

/// Servers that ignore Range answer 200 with the whole file.
fn window(body: &[u8], offset: u64, limit: usize) -> Vec<u8> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(body.len());
    let end = start.saturating_add(limit).min(body.len());
    body[start..end].to_vec()
}

#[async_trait]
impl SessionGateway for BotGateway {
    fn capabilities(&self) -> GatewayCapabilities {
        GatewayCapabilities {
            supports_history_search: false,
            supports_member_scan: false,
            supports_chunked_upload: true,
            max_message_len: 4096,
        }
    }

    async fn auth_state(&self) -> Result<AuthState> {
        match self.with_retry(|| self.bot.get_me()).await {
            Ok(me) => {
                tracing::info!(bot = %me.username(), "telegram session authorized");
                Ok(AuthState::Authorized)
            }
            Err(Error::Auth(reason)) => Ok(AuthState::Unauthorized { reason }),
            Err(e) => Err(e),
        }
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Vec<PeerCandidate>> {
        let recipient = Recipient::ChannelUsername(format!("@{handle}"));
        match self
            .with_retry(|| self.bot.get_chat(recipient.clone()))
            .await
        {
            Ok(chat) => Ok(vec![convert::chat_candidate(&chat)]),
            Err(Error::NotFound(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    async fn channel_info(&self, channel: ChannelId, _token: AccessToken) -> Result<ChannelInfo> {
        let chat = self
            .with_retry(|| self.bot.get_chat(Self::tg_chat(channel)))
            .await?;
        let handle = chat.username().map(str::to_string);
        Ok(ChannelInfo {
            id: channel,
            is_public: handle.is_some(),
            handle,
            title: chat.title().unwrap_or_default().to_string(),
        })
    }

    async fn member_count(&self, channel: ChannelId, _token: AccessToken) -> Result<u32> {
        self.with_retry(|| self.bot.get_chat_member_count(Self::tg_chat(channel)))
            .await
    }

    async fn admins(&self, channel: ChannelId, _token: AccessToken) -> Result<Vec<MemberInfo>> {
        let members = self
            .with_retry(|| self.bot.get_chat_administrators(Self::tg_chat(channel)))
            .await?;
        Ok(members
            .into_iter()
            .map(|m| {
                let id = m.user.id.0 as i64;
                MemberInfo {
                    user_id: UserId(id),
                    handle: m.user.username.clone(),
                    token: convert::token_for(id),
                    first_name: Some(m.user.first_name.clone()),
                    last_name: m.user.last_name.clone(),
                }
            })
            .collect())
    }

    async fn members(
        &self,
        _channel: ChannelId,
        _token: AccessToken,
        _offset: usize,
        _limit: usize,
    ) -> Result<Vec<MemberInfo>> {
        Err(Error::Unsupported(
            "bot sessions cannot list channel members".to_string(),
        ))
    }

    async fn search_messages(&self, _req: &SearchRequest) -> Result<Vec<RawMessage>> {
        Err(Error::Unsupported(
            "bot sessions cannot search message history".to_string(),
        ))
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
        let path = self.file_path(&media.file_id).await?;
        let mut url = self.bot.api_url();
        url.set_path(&format!("file/bot{}/{}", self.bot.token(), path));

        let resp = self
            .http
            .get(url)
            .header(RANGE, range_header(offset, limit))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("media download failed: {}", e.without_url())))?;

        let status = resp.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Error::Transport(format!("media download failed: HTTP {status}")));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("media download failed: {}", e.without_url())))?;

        if status == StatusCode::PARTIAL_CONTENT {
            Ok(window(&body, 0, limit))
        } else {
            Ok(window(&body, offset, limit))
        }
    }

    async fn upload_part(&self, transfer_id: i64, part: u32, bytes: Vec<u8>) -> Result<()> {
        lock(&self.uploads)
            .entry(transfer_id)
            .or_default()
            .push((part, bytes));
        Ok(())
    }

    async fn abort_upload(&self, transfer_id: i64) -> Result<()> {
        if lock(&self.uploads).remove(&transfer_id).is_some() {
            tracing::debug!(transfer_id, "buffered upload dropped");
        }
        Ok(())
    }

    async fn send_text(&self, dest: ChannelId, text: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| self.bot.send_message(Self::tg_chat(dest), text.to_string()))
            .await?;
        Ok(Self::message_ref(dest, &msg))
    }

    async fn send_media(
        &self,
        dest: ChannelId,
        file: UploadedFile,
        caption: &str,
    ) -> Result<MessageRef> {
        let bytes = self.take_upload(&file)?;
        let input = InputFile::memory(bytes).file_name(file.file_name.clone());
        let inline_caption = caption.chars().count() <= MAX_CAPTION_LEN;

        let msg = self
            .with_retry(|| {
                let req = self.bot.send_document(Self::tg_chat(dest), input.clone());
                if inline_caption && !caption.is_empty() {
                    req.caption(caption.to_string())
                } else {
                    req
                }
            })
            .await?;

        if !inline_caption {
            self.send_text(dest, caption).await?;
        }
        Ok(Self::message_ref(dest, &msg))
    }

    async fn pump_updates(
        &self,
        tx: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut offset: i32 = 0;
        loop {
            let request = self
                .bot
                .get_updates()
                .offset(offset)
                .timeout(POLL_TIMEOUT_SECS);

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                res = request.send() => res,
            };

            match polled {
                Ok(updates) => {
                    for update in updates {
                        offset = update.id.as_offset();
                        let event = convert::update_to_event(update);
                        if matches!(event, PushEvent::Other) {
                            continue;
                        }
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                Err(RequestError::RetryAfter(d)) => sleep(d.duration()).await,
                Err(e) => {
                    let err = Self::map_err(e);
                    if err.is_run_fatal() {
                        return Err(err);
                    }
                    tracing::warn!(error = %err, "polling for updates failed; retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = sleep(POLL_BACKOFF) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_not_found_is_a_resolution_failure() {
        let err = BotGateway::map_err(RequestError::Api(ApiError::ChatNotFound));
        assert!(matches!(err, Error::NotFound(_)));

        let err = BotGateway::map_err(RequestError::Api(ApiError::InvalidToken));
        assert!(err.is_run_fatal());
    }

    #[test]
    fn range_covers_exactly_one_chunk() {
        assert_eq!(range_header(0, 512), "bytes=0-511");
        assert_eq!(range_header(1024, 1), "bytes=1024-1024");
    }

    #[test]
    fn full_body_is_windowed_to_the_requested_chunk() {
        let body: Vec<u8> = (0u8..10).collect();
        assert_eq!(window(&body, 4, 3), vec![4, 5, 6]);
        assert_eq!(window(&body, 8, 5), vec![8, 9]);
        assert!(window(&body, 20, 5).is_empty());
    }

    #[tokio::test]
    async fn parts_are_reassembled_in_order() {
        let gw = BotGateway::from_token("123:fake");
        gw.upload_part(9, 1, vec![3, 4]).await.unwrap();
        gw.upload_part(9, 0, vec![1, 2]).await.unwrap();

        let file = UploadedFile {
            transfer_id: 9,
            parts: 2,
            file_name: "a.bin".to_string(),
            total_bytes: 4,
        };
        assert_eq!(gw.take_upload(&file).unwrap(), vec![1, 2, 3, 4]);
        assert!(gw.take_upload(&file).is_err());
    }

    #[tokio::test]
    async fn missing_parts_are_rejected() {
        let gw = BotGateway::from_token("123:fake");
        gw.upload_part(3, 0, vec![1]).await.unwrap();
        let file = UploadedFile {
            transfer_id: 3,
            parts: 2,
            file_name: "a.bin".to_string(),
            total_bytes: 2,
        };
        assert!(matches!(gw.take_upload(&file), Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn aborted_transfer_frees_its_parts() {
        let gw = BotGateway::from_token("123:fake");
        gw.upload_part(5, 0, vec![1; 64]).await.unwrap();
        gw.upload_part(6, 0, vec![2; 64]).await.unwrap();

        gw.abort_upload(5).await.unwrap();

        let pending = lock(&gw.uploads);
        assert!(!pending.contains_key(&5));
        assert!(pending.contains_key(&6));
    }

    #[test]
    fn file_path_cache_is_bounded() {
        let mut cache = FilePaths::default();
        for i in 0..(FILE_PATH_CACHE + 10) {
            cache.insert(format!("f{i}"), format!("docs/{i}"));
        }
        assert_eq!(cache.len(), FILE_PATH_CACHE);
        assert!(cache.get("f0").is_none());
        assert_eq!(
            cache.get(&format!("f{}", FILE_PATH_CACHE + 9)).as_deref(),
            Some(format!("docs/{}", FILE_PATH_CACHE + 9).as_str())
        );
    }

    #[test]
    fn channel_ids_gain_the_bot_api_prefix() {
        assert_eq!(BotGateway::tg_chat(ChannelId(1987654321)).0, -1001987654321);
        assert_eq!(BotGateway::tg_chat(ChannelId(-4521)).0, -4521);
    }

    #[test]
    fn bot_sessions_do_not_claim_history_search() {
        let caps = BotGateway::from_token("123:fake").capabilities();
        assert!(!caps.supports_history_search);
        assert!(!caps.supports_member_scan);
        assert!(caps.supports_chunked_upload);
    }
}
