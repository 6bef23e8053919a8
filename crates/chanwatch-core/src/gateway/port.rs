use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    domain::{AccessToken, ChannelId, MessageRef},
    gateway::types::{
        AuthState, ChannelInfo, GatewayCapabilities, MediaRef, MemberInfo, PeerCandidate,
        PushEvent, RawMessage, SearchRequest, UploadedFile,
    },
    Result,
};

/// The single authenticated session to the messaging backend.
///
/// Every backend call goes through this port. Adapters declare what they can
/// do via [`GatewayCapabilities`]; calls outside that set fail with
/// `Error::Unsupported`.
#[async_trait]
pub trait SessionGateway: Send + Sync {
    fn capabilities(&self) -> GatewayCapabilities;

    async fn auth_state(&self) -> Result<AuthState>;

    /// All peers whose handle may match `handle`. Callers do the exact matching.
    async fn resolve_handle(&self, handle: &str) -> Result<Vec<PeerCandidate>>;

    async fn channel_info(&self, channel: ChannelId, token: AccessToken) -> Result<ChannelInfo>;
    async fn member_count(&self, channel: ChannelId, token: AccessToken) -> Result<u32>;
    async fn admins(&self, channel: ChannelId, token: AccessToken) -> Result<Vec<MemberInfo>>;
    async fn members(
        &self,
        channel: ChannelId,
        token: AccessToken,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<MemberInfo>>;

    async fn search_messages(&self, req: &SearchRequest) -> Result<Vec<RawMessage>>;

    /// Read at most `limit` bytes starting at `offset`. Fewer bytes means end of file.
    async fn download_chunk(&self, media: &MediaRef, offset: u64, limit: usize)
        -> Result<Vec<u8>>;
    async fn upload_part(&self, transfer_id: i64, part: u32, bytes: Vec<u8>) -> Result<()>;
    /// Release whatever was buffered for a transfer that will never be sent.
    async fn abort_upload(&self, transfer_id: i64) -> Result<()>;

    async fn send_text(&self, dest: ChannelId, text: &str) -> Result<MessageRef>;
    async fn send_media(
        &self,
        dest: ChannelId,
        file: UploadedFile,
        caption: &str,
    ) -> Result<MessageRef>;

    /// Push updates into `tx` until `cancel` fires or the session ends.
    async fn pump_updates(
        &self,
        tx: mpsc::Sender<PushEvent>,
        cancel: CancellationToken,
    ) -> Result<()>;
}
