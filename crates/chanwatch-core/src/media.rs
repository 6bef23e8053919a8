use std::sync::Arc;

use crate::{
    domain::{ChannelId, MessageRef},
    errors::Error,
    gateway::{MediaRef, SessionGateway, UploadedFile},
    Result,
};

/// Appended to text sent in place of media the source does not allow forwarding.
pub const PROTECTED_MARKER: &str = "[Protected Content]";

#[derive(Clone, Copy, Debug)]
pub struct MediaConfig {
    pub chunk_size: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 512 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    Relayed {
        message: MessageRef,
        parts: u32,
        bytes: u64,
    },
    /// Protected source: only the text went out.
    TextOnly { message: MessageRef },
}

/// Moves one attachment from a source message onto an outgoing message.
pub struct MediaRelay {
    gateway: Arc<dyn SessionGateway>,
    cfg: MediaConfig,
}

impl MediaRelay {
    pub fn new(gateway: Arc<dyn SessionGateway>, cfg: MediaConfig) -> Self {
        Self { gateway, cfg }
    }

    /// Relay `media` to `dest` with `caption`.
    ///
    /// Protected sources are never downloaded. Any failure mid-transfer aborts
    /// the relay and releases the parts uploaded so far; the caller decides on
    /// a text fallback.
    pub async fn relay(
        &self,
        media: &MediaRef,
        dest: ChannelId,
        caption: &str,
        is_protected: bool,
    ) -> Result<RelayOutcome> {
        if is_protected {
            let message = self.gateway.send_text(dest, &with_marker(caption)).await?;
            return Ok(RelayOutcome::TextOnly { message });
        }

        let transfer_id: i64 = rand::random();
        match self.transfer(media, dest, caption, transfer_id).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if let Err(abort) = self.gateway.abort_upload(transfer_id).await {
                    tracing::warn!(transfer_id, error = %abort, "upload abort failed");
                }
                Err(e)
            }
        }
    }

    async fn transfer(
        &self,
        media: &MediaRef,
        dest: ChannelId,
        caption: &str,
        transfer_id: i64,
    ) -> Result<RelayOutcome> {
        let chunk_size = self.cfg.chunk_size.max(1);
        let mut offset: u64 = 0;
        let mut parts: u32 = 0;

        loop {
            let chunk = self
                .gateway
                .download_chunk(media, offset, chunk_size)
                .await?;
            let len = chunk.len();
            if len > 0 {
                self.gateway.upload_part(transfer_id, parts, chunk).await?;
                parts += 1;
                offset += len as u64;
            }
            if len < chunk_size {
                break;
            }
        }

        if offset == 0 {
            return Err(Error::Transport(format!(
                "media {} downloaded empty",
                media.file_id
            )));
        }

        tracing::debug!(transfer_id, parts, bytes = offset, "media transferred");

        let file = UploadedFile {
            transfer_id,
            parts,
            file_name: media
                .file_name
                .clone()
                .unwrap_or_else(|| "file".to_string()),
            total_bytes: offset,
        };
        let message = self.gateway.send_media(dest, file, caption).await?;
        Ok(RelayOutcome::Relayed {
            message,
            parts,
            bytes: offset,
        })
    }
}

/// `text` with the protection marker present exactly once.
pub fn with_marker(text: &str) -> String {
    if text.contains(PROTECTED_MARKER) {
        text.to_string()
    } else if text.is_empty() {
        PROTECTED_MARKER.to_string()
    } else {
        format!("{text}\n\n{PROTECTED_MARKER}")
    }
}
