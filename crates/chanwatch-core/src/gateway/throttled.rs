use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{AccessToken, ChannelId, MessageRef},
    gateway::{
        port::SessionGateway,
        types::{
            AuthState, ChannelInfo, GatewayCapabilities, MediaRef, MemberInfo, PeerCandidate,
            PushEvent, RawMessage, SearchRequest, UploadedFile,
        },
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between any two outbound sends.
    pub global_min_interval: Duration,
    /// Minimum spacing between sends to the same destination.
    pub per_dest_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40),
            per_dest_min_interval: Duration::from_millis(1050),
        }
    }
}

/// Next free send slot for the whole session and for each target channel.
///
/// Backends flood-limit both overall and per chat, so a send to a target
/// waits for the later of the two slots.
#[derive(Debug)]
struct SendPacer {
    cfg: ThrottleConfig,
    session_slot: Instant,
    target_slots: HashMap<ChannelId, Instant>,
}

impl SendPacer {
    fn new(cfg: ThrottleConfig, now: Instant) -> Self {
        Self {
            cfg,
            session_slot: now,
            target_slots: HashMap::new(),
        }
    }

    /// Book the next slot at or after `now`; returns how long to wait for it.
    fn book(&mut self, target: Option<ChannelId>, now: Instant) -> Duration {
        let mut slot = self.session_slot.max(now);
        if let Some(target) = target {
            if let Some(t) = self.target_slots.get(&target) {
                slot = slot.max(*t);
            }
            self.target_slots
                .insert(target, slot + self.cfg.per_dest_min_interval);
        }
        self.session_slot = slot + self.cfg.global_min_interval;
        slot.saturating_duration_since(now)
    }
}

/// SessionGateway decorator that paces outbound traffic.
///
/// Forwarded posts and relayed media are spaced per target channel and across
/// the session; upload parts only share the session slot. Reads (search,
/// member pages, downloads) pass straight through since the crawl path
/// already sleeps between pages.
pub struct ThrottledGateway {
    inner: Arc<dyn SessionGateway>,
    pacer: Mutex<SendPacer>,
}

impl ThrottledGateway {
    pub fn new(inner: Arc<dyn SessionGateway>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            pacer: Mutex::new(SendPacer::new(cfg, Instant::now())),
        }
    }

    async fn wait_for_slot(&self, target: Option<ChannelId>) {
        let wait = self.pacer.lock().await.book(target, Instant::now());
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl SessionGateway for ThrottledGateway {
    fn capabilities(&self) -> GatewayCapabilities {
        self.inner.capabilities()
    }

    async fn auth_state(&self) -> Result<AuthState> {
        self.inner.auth_state().await
    }

    async fn resolve_handle(&self, handle: &str) -> Result<Vec<PeerCandidate>> {
        self.inner.resolve_handle(handle).await
    }

    async fn channel_info(&self, channel: ChannelId, token: AccessToken) -> Result<ChannelInfo> {
        self.inner.channel_info(channel, token).await
    }

    async fn member_count(&self, channel: ChannelId, token: AccessToken) -> Result<u32> {
        self.inner.member_count(channel, token).await
    }

    async fn admins(&self, channel: ChannelId, token: AccessToken) -> Result<Vec<MemberInfo>> {
        self.inner.admins(channel, token).await
    }

    async fn members(
        &self,
        channel: ChannelId,
        token: AccessToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MemberInfo>> {
        self.inner.members(channel, token, offset, limit).await
    }

    async fn search_messages(&self, req: &SearchRequest) -> Result<Vec<RawMessage>> {
        self.inner.search_messages(req).await
    }

    async fn download_chunk(
        &self,
        media: &MediaRef,
        offset: u64,
        limit: usize,
    ) -> Result<Vec<u8>> {
        self.inner.download_chunk(media, offset, limit).await
    }

    async fn upload_part(&self, transfer_id: i64, part: u32, bytes: Vec<u8>) -> Result<()> {
        // Parts are not tied to a target yet.
        self.wait_for_slot(None).await;
        self.inner.upload_part(transfer_id, part, bytes).await
    }

    async fn abort_upload(&self, transfer_id: i64) -> Result<()> {
        self.inner.abort_upload(transfer_id).await
    }

    async fn send_text(&self, dest: ChannelId, text: &str) -> Result<MessageRef> {
        self.wait_for_slot(Some(dest)).await;
        self.inner.send_text(dest, text).await
    }

    async fn send_media(
        &self,
        dest: ChannelId,
        file: UploadedFile,
        caption: &str,
    ) -> Result<MessageRef> {
        self.wait_for_slot(Some(dest)).await;
        self.inner.send_media(dest, file, caption).await
    }

    async fn pump_updates(
        &self,
        tx: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.inner.pump_updates(tx, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGateway;

    fn pacer() -> (SendPacer, Instant) {
        let now = Instant::now();
        let cfg = ThrottleConfig {
            global_min_interval: Duration::from_millis(40),
            per_dest_min_interval: Duration::from_secs(1),
        };
        (SendPacer::new(cfg, now), now)
    }

    #[test]
    fn same_target_waits_for_its_own_slot() {
        let (mut pacer, now) = pacer();
        assert!(pacer.book(Some(ChannelId(200)), now).is_zero());
        assert_eq!(
            pacer.book(Some(ChannelId(200)), now),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn other_targets_only_share_the_session_slot() {
        let (mut pacer, now) = pacer();
        pacer.book(Some(ChannelId(200)), now);
        assert_eq!(
            pacer.book(Some(ChannelId(300)), now),
            Duration::from_millis(40)
        );
        assert_eq!(pacer.book(None, now), Duration::from_millis(80));
    }

    #[test]
    fn elapsed_slots_cost_nothing() {
        let (mut pacer, now) = pacer();
        pacer.book(Some(ChannelId(200)), now);
        let later = now + Duration::from_secs(5);
        assert!(pacer.book(Some(ChannelId(200)), later).is_zero());
    }

    #[tokio::test]
    async fn sends_pass_through() {
        let fake = Arc::new(FakeGateway::default());
        let throttled = ThrottledGateway::new(
            fake.clone(),
            ThrottleConfig {
                global_min_interval: Duration::ZERO,
                per_dest_min_interval: Duration::ZERO,
            },
        );

        throttled.send_text(ChannelId(200), "one").await.unwrap();
        throttled.send_text(ChannelId(300), "two").await.unwrap();

        let sent = fake.sent_texts();
        assert_eq!(
            sent,
            vec![
                (ChannelId(200), "one".to_string()),
                (ChannelId(300), "two".to_string())
            ]
        );
    }
}
