//! Packs regular files into archive slots.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::bundle::FileRecorder;
use crate::descriptor::FileDescriptor;
use crate::error::{ComposeError, Result};
use crate::slot_pool::ArchiveSlot;
use crate::stats::ComposeStats;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Serializes one file as header + body into an archive slot.
pub struct FilePacker {
    recorder: Arc<dyn FileRecorder>,
    stats: Arc<ComposeStats>,
}

impl FilePacker {
    /// Create a packer recording into `recorder`.
    pub fn new(recorder: Arc<dyn FileRecorder>, stats: Arc<ComposeStats>) -> Self {
        Self { recorder, stats }
    }

    /// Write `descriptor` into `slot`. Exactly `header.size` bytes are archived;
    /// bytes appended after discovery are ignored, a file that shrank is an error.
    pub async fn pack(&self, descriptor: &FileDescriptor, slot: &mut ArchiveSlot) -> Result<()> {
        let header = &descriptor.header;
        let mut file = tokio::fs::File::open(&descriptor.path)
            .await
            .map_err(|e| ComposeError::io(&descriptor.path, e))?;

        slot.write_header(header)?;
        let mut remaining = header.size;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        while remaining > 0 {
            let want = remaining.min(buf.len() as u64) as usize;
            let n = file
                .read(&mut buf[..want])
                .await
                .map_err(|e| ComposeError::io(&descriptor.path, e))?;
            if n == 0 {
                return Err(ComposeError::Pack {
                    name: header.name.clone(),
                    reason: format!("file shrank: {} of {} bytes missing", remaining, header.size),
                });
            }
            slot.write_body(&buf[..n])?;
            remaining -= n as u64;
        }

        self.recorder.add_file(header, descriptor.is_incremented);
        self.stats.record_packed();
        debug!(file = %header.name, archive = slot.name(), size = header.size, "Packed file");
        Ok(())
    }
}
