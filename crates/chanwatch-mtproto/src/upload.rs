//! Transfer bookkeeping for `upload.saveFilePart` uploads.

use std::collections::HashMap;

use chanwatch_core::{errors::Error, gateway::UploadedFile, Result};

/// Files above this need `saveBigFilePart`, which wants the part count up
/// front; the relay streams without knowing it, so they are refused.
pub(crate) const SMALL_FILE_LIMIT: u64 = 10 * 1024 * 1024;

const MIN_CHUNK: usize = 4096;
const MAX_CHUNK: usize = 512 * 1024;

/// Bytes sent so far per open transfer.
#[derive(Default)]
pub(crate) struct UploadLedger {
    sent: HashMap<i64, u64>,
}

impl UploadLedger {
    pub(crate) fn record(&mut self, transfer_id: i64, len: usize) -> Result<()> {
        let total = self.sent.entry(transfer_id).or_default();
        *total += len as u64;
        if *total > SMALL_FILE_LIMIT {
            self.sent.remove(&transfer_id);
            return Err(Error::Unsupported(format!(
                "transfer {transfer_id} exceeds the {} MiB upload limit",
                SMALL_FILE_LIMIT / (1024 * 1024)
            )));
        }
        Ok(())
    }

    pub(crate) fn forget(&mut self, transfer_id: i64) {
        if self.sent.remove(&transfer_id).is_some() {
            tracing::debug!(transfer_id, "upload bookkeeping dropped");
        }
    }

    #[cfg(test)]
    pub(crate) fn open_transfers(&self) -> usize {
        self.sent.len()
    }
}

pub(crate) fn check_small_file(file: &UploadedFile) -> Result<()> {
    if file.total_bytes > SMALL_FILE_LIMIT {
        return Err(Error::Unsupported(format!(
            "{} is {} bytes; only files up to {} bytes can be relayed",
            file.file_name, file.total_bytes, SMALL_FILE_LIMIT
        )));
    }
    Ok(())
}

/// `upload.getFile` wants 4 KiB-aligned chunks of at most 512 KiB, read at
/// multiples of the chunk size. Returns (chunk size, chunks to skip).
pub(crate) fn chunk_geometry(offset: u64, limit: usize) -> Result<(i32, i32)> {
    if !(MIN_CHUNK..=MAX_CHUNK).contains(&limit) || limit % MIN_CHUNK != 0 {
        return Err(Error::Unsupported(format!(
            "download chunk of {limit} bytes; use a multiple of {MIN_CHUNK} up to {MAX_CHUNK}"
        )));
    }
    if offset % limit as u64 != 0 {
        return Err(Error::Unsupported(format!(
            "download offset {offset} is not a multiple of the chunk size {limit}"
        )));
    }
    let skip = i32::try_from(offset / limit as u64)
        .map_err(|_| Error::Unsupported(format!("download offset {offset} too large")))?;
    Ok((limit as i32, skip))
}
