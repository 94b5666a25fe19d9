//! Completion Reporter
//!
//! Joins the per-component outcomes of finished external requests, settles
//! the extent map and range locks for writes, reports the result back
//! through the gateway and returns the record to the pool.
//!
//! A write that succeeded locally but missed the remote still completes
//! successfully; its extents are pinned dirty so the resynchronizer recopies
//! them once the peer is back.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::Result;
use crate::gateway::GatewayCompletion;
use crate::protocol::Command;
use crate::rangelock::LockSet;

use super::request::{RequestKind, REMOTE};
use super::Ctx;

pub async fn done_worker(ctx: Arc<Ctx>) -> Result<()> {
    loop {
        let req = ctx.queues.done.pop().await;
        let desc = req.desc();
        let status = req.aggregate();

        if desc.cmd == Command::Write {
            if !status.is_ok() {
                // Neither component proved it holds the data; the extents
                // stay dirty until a resynchronization settles them.
                ctx.extents.mark_needs_resync(desc.offset, desc.length)?;
            } else if !req.error(REMOTE).is_ok() {
                debug!(request = %desc.describe(), "remote missed a write, pinning extents");
                ctx.extents.mark_needs_resync(desc.offset, desc.length)?;
                // The first such write while the peer is away advances our
                // generation: we now hold data the peer has never seen.
                if ctx.metadata.bump_local_gen_if_synced()? {
                    tracing::info!(
                        local_gen = ctx.metadata.counters().local_gen,
                        "write missed the remote, local generation bumped"
                    );
                }
            }
            // Cleared bits stay in memory; the on-disk image only ever lags
            // on the safe side.
            ctx.extents.write_complete(desc.offset, desc.length);
            ctx.locks.unlock(LockSet::Regular, desc.offset, desc.length);
        }

        let op_id = match desc.kind {
            RequestKind::External { op_id } => op_id,
            // Sync requests complete on their own queue and never get here.
            RequestKind::Sync => {
                debug_assert!(false, "sync request on the done queue");
                continue;
            }
        };

        let data = if desc.cmd == Command::Read && status.is_ok() {
            let data = req.data().lock().await;
            Some(data[..desc.length as usize].to_vec())
        } else {
            None
        };

        trace!(seq = desc.seq, op_id, ?status, request = %desc.describe(), "request complete");
        ctx.gateway
            .complete(GatewayCompletion {
                op_id,
                status,
                data,
            })
            .await?;

        ctx.pool.release(req);
    }
}
