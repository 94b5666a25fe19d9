//! Resynchronizer
//!
//! Walks the dirty extent map after a reconnect and copies every dirty
//! extent from the authoritative component to the stale one, one extent at a
//! time. Each copy is a read request followed by a write request issued on
//! the same pooled record; sync requests hold a sync range lock so external
//! writes never interleave with a half-copied extent.
//!
//! When a full pass leaves the link up, the generation counters are
//! equalized on both sides and the pair is back in sync.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metadata::SyncSource;
use crate::protocol::{Command, Message};
use crate::rangelock::LockSet;

use super::request::{IoRequest, OpDesc, RequestKind, LOCAL, REMOTE};
use super::Ctx;

/// Wait for reconnect triggers and run resynchronization passes
pub async fn resync_worker(ctx: Arc<Ctx>) -> Result<()> {
    loop {
        ctx.resync_wakeup.notified().await;
        if !ctx.link.is_connected() {
            continue;
        }
        run_pass(&ctx).await?;
    }
}

/// Outcome of one extent copy
enum CopyOutcome {
    Done,
    /// Skipped because of a component error; the extent stays dirty
    Skipped,
    /// The link went away; abandon the pass
    LinkLost,
}

async fn run_pass(ctx: &Ctx) -> Result<()> {
    let ndirty = ctx.extents.ndirty();
    let source = ctx.metadata.sync_source();

    if ndirty == 0 {
        // Nothing to copy; the handshake alone proved the pair in sync.
        if source != SyncSource::Undefined {
            finish_pass(ctx).await?;
        }
        return Ok(());
    }

    info!(ndirty, ?source, "resynchronization started");
    ctx.extents.rewind();

    let req = ctx.pool.acquire().await;
    let mut copied = 0usize;
    let mut complete = true;

    while let Some(ext) = ctx.extents.next_dirty() {
        if !ctx.link.is_connected() {
            complete = false;
            break;
        }

        ctx.locks.lock(LockSet::Sync, ext.offset, ext.length).await;
        let outcome = copy_extent(ctx, &req, source, ext.offset, ext.length).await;
        ctx.locks.unlock(LockSet::Sync, ext.offset, ext.length);

        match outcome {
            CopyOutcome::Done => {
                ctx.extents.extent_complete(ext.index)?;
                copied += 1;
                debug!(extent = ext.index, "extent resynchronized");
            }
            CopyOutcome::Skipped => {
                complete = false;
            }
            CopyOutcome::LinkLost => {
                complete = false;
                break;
            }
        }
    }
    ctx.pool.release(req);

    if complete && ctx.link.is_connected() {
        info!(copied, "resynchronization complete");
        finish_pass(ctx).await?;
    } else {
        info!(copied, "resynchronization interrupted, will resume on reconnect");
    }
    Ok(())
}

/// Copy one extent between the components, authoritative side first
async fn copy_extent(
    ctx: &Ctx,
    req: &Arc<IoRequest>,
    source: SyncSource,
    offset: u64,
    length: u64,
) -> CopyOutcome {
    // Phase one: read from the component that holds good data. Leftover
    // dirty bits with no direction mean our own copy is authoritative.
    let read_remote = source == SyncSource::Secondary;
    let desc = OpDesc {
        kind: RequestKind::Sync,
        cmd: Command::Read,
        seq: ctx.next_seq(),
        offset,
        length,
    };
    req.populate(desc);
    req.arm(1);
    if read_remote {
        ctx.queues.remote_send.push(req.clone());
    } else {
        ctx.queues.local_send.push(req.clone());
    }
    let done = ctx.queues.sync_done.pop().await;
    debug_assert!(Arc::ptr_eq(&done, req));

    let read_status = req.error(if read_remote { REMOTE } else { LOCAL });
    if !read_status.is_ok() {
        if read_remote {
            warn!(offset, length, ?read_status, "remote read failed during resync");
            return CopyOutcome::LinkLost;
        }
        error!(offset, length, ?read_status, "unable to read resync data locally");
        return CopyOutcome::Skipped;
    }

    // Phase two: write the same span to the stale component.
    let desc = OpDesc {
        kind: RequestKind::Sync,
        cmd: Command::Write,
        seq: ctx.next_seq(),
        offset,
        length,
    };
    req.populate(desc);
    req.arm(1);
    if read_remote {
        ctx.queues.local_send.push(req.clone());
    } else {
        ctx.queues.remote_send.push(req.clone());
    }
    let done = ctx.queues.sync_done.pop().await;
    debug_assert!(Arc::ptr_eq(&done, req));

    let write_status = req.error(if read_remote { LOCAL } else { REMOTE });
    if !write_status.is_ok() {
        if read_remote {
            error!(offset, length, ?write_status, "unable to write resync data locally");
            return CopyOutcome::Skipped;
        }
        warn!(offset, length, ?write_status, "remote write failed during resync");
        return CopyOutcome::LinkLost;
    }

    CopyOutcome::Done
}

/// Equalize the generation counters and tell the peer the pass finished
async fn finish_pass(ctx: &Ctx) -> Result<()> {
    let peer = match ctx.metadata.seen_peer() {
        Some(peer) => peer,
        None => return Ok(()),
    };
    ctx.metadata.equalize(peer)?;

    let local_gen = ctx.metadata.counters().local_gen;
    // Fire and forget: a lost notification only costs the peer one
    // redundant resync decision on the next handshake.
    if let Err(err) = ctx.link.send(&Message::SyncDone { local_gen }, None).await {
        warn!(error = %err, "unable to announce sync completion");
    }

    Ok(())
}
