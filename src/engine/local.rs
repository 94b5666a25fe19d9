//! Local Component
//!
//! File-backed local storage plus the worker that serves it. All local I/O
//! funnels through the single send queue, so the file handle needs no
//! positioned-read support; a mutex-guarded seek-then-transfer is enough.

use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;
use tracing::{error, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{Command, OpStatus};

use super::request::{RequestKind, LOCAL};
use super::Ctx;

const ZERO_CHUNK: usize = 64 * 1024;

/// The file or device backing the local replica
pub struct LocalComponent {
    file: Mutex<File>,
}

impl LocalComponent {
    /// Open an existing backing file, validating it covers the media size
    pub async fn open(path: &Path, media_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| Error::Config(format!("unable to open {}: {}", path.display(), e)))?;
        let len = file.metadata().await?.len();
        if len < media_size {
            return Err(Error::Config(format!(
                "backing file {} holds {} bytes, media size is {}",
                path.display(),
                len,
                media_size
            )));
        }
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    /// Create a zero-filled backing file of the full media size
    pub async fn create_image(path: &Path, media_size: u64) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(|e| Error::Config(format!("unable to create {}: {}", path.display(), e)))?;
        file.set_len(media_size).await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.read_exact(buf).await?;
        Ok(())
    }

    pub async fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(buf).await?;
        Ok(())
    }

    /// Discard a span by writing zeroes over it
    pub async fn zero(&self, offset: u64, length: u64) -> Result<()> {
        let zeroes = [0u8; ZERO_CHUNK];
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut remaining = length as usize;
        while remaining > 0 {
            let n = remaining.min(ZERO_CHUNK);
            file.write_all(&zeroes[..n]).await?;
            remaining -= n;
        }
        Ok(())
    }

    pub async fn flush(&self) -> Result<()> {
        self.file.lock().await.sync_all().await?;
        Ok(())
    }
}

/// Serve queued requests against the local component
pub async fn local_send_worker(ctx: Arc<Ctx>) -> Result<()> {
    loop {
        let req = ctx.queues.local_send.pop().await;
        let desc = req.desc();

        let outcome = match desc.cmd {
            Command::Read => {
                let mut data = req.data().lock().await;
                ctx.local
                    .read(desc.offset, &mut data[..desc.length as usize])
                    .await
            }
            Command::Write => {
                let data = req.data().lock().await;
                ctx.local
                    .write(desc.offset, &data[..desc.length as usize])
                    .await
            }
            Command::Delete => ctx.local.zero(desc.offset, desc.length).await,
            Command::Flush => ctx.local.flush().await,
        };

        match outcome {
            Ok(()) => {
                trace!(seq = desc.seq, request = %desc.describe(), "local request done");
                req.set_error(LOCAL, OpStatus::Ok);
            }
            Err(err) => {
                error!(error = %err, request = %desc.describe(), "local request failed");
                req.set_error(LOCAL, OpStatus::IoError);
                // An external read still has a second chance: hand it to the
                // remote component instead of completing it. The countdown
                // stays armed for the remote attempt.
                if desc.cmd == Command::Read && matches!(desc.kind, RequestKind::External { .. })
                {
                    warn!(seq = desc.seq, "rerouting failed read to remote");
                    ctx.queues.remote_send.push(req);
                    continue;
                }
            }
        }

        ctx.route_done(req);
    }
}
