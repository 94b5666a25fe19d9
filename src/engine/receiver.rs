//! Gateway Receiver
//!
//! Pulls operations off the gateway, validates them against the media
//! geometry and fans them out to the component send queues. Writes take a
//! regular range lock and dirty their extents on stable storage before any
//! component sees the request.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, trace, warn};

use crate::error::{Error, Result};
use crate::gateway::{GatewayCompletion, GatewayOp};
use crate::metadata::SyncSource;
use crate::protocol::{Command, OpStatus};
use crate::rangelock::LockSet;

use super::request::{OpDesc, RequestKind};
use super::Ctx;

/// Why an operation was refused before entering the engine
fn validate(ctx: &Ctx, op: &GatewayOp) -> std::result::Result<(), String> {
    if op.cmd == Command::Flush {
        return Ok(());
    }
    if op.length == 0 {
        return Err("zero-length span".into());
    }
    if op.length > ctx.config.engine.max_io_size {
        return Err(format!(
            "span of {} bytes exceeds the {}-byte limit",
            op.length, ctx.config.engine.max_io_size
        ));
    }
    // The pooled buffer is reused; a short payload would dispatch whatever
    // bytes its previous occupant left behind.
    if op.cmd == Command::Write && op.data.len() as u64 != op.length {
        return Err(format!(
            "write payload of {} bytes does not match declared length {}",
            op.data.len(),
            op.length
        ));
    }
    let media_size = ctx.config.resource.media_size;
    match op.offset.checked_add(op.length) {
        Some(end) if end <= media_size => Ok(()),
        _ => Err(format!(
            "span [{}, {}+{}) outside media of {} bytes",
            op.offset, op.offset, op.length, media_size
        )),
    }
}

/// Accept gateway operations until the gateway closes or shutdown is
/// signalled. An operation already fetched is always dispatched, so its
/// completion is never lost to the shutdown.
pub async fn gateway_recv_worker(ctx: Arc<Ctx>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown requested, gateway receiver exiting");
                return Ok(());
            }
            next = ctx.gateway.next_op() => next,
        };
        let op = match next {
            Ok(op) => op,
            Err(Error::GatewayClosed) => {
                info!("gateway closed, receiver exiting");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if let Err(reason) = validate(&ctx, &op) {
            warn!(op_id = op.id, cmd = op.cmd.name(), %reason, "rejected request");
            ctx.gateway
                .complete(GatewayCompletion {
                    op_id: op.id,
                    status: OpStatus::Invalid,
                    data: None,
                })
                .await?;
            continue;
        }

        let req = ctx.pool.acquire().await;
        let desc = OpDesc {
            kind: RequestKind::External { op_id: op.id },
            cmd: op.cmd,
            seq: ctx.next_seq(),
            offset: op.offset,
            length: op.length,
        };
        req.populate(desc);
        trace!(seq = desc.seq, request = %desc.describe(), "accepted request");

        match op.cmd {
            Command::Read => {
                // One component serves the read: whichever side is
                // authoritative for data not yet proven in sync. The local
                // sender still reroutes to the remote on a local failure.
                req.arm(1);
                if ctx.metadata.sync_source() == SyncSource::Secondary {
                    ctx.queues.remote_send.push(req);
                } else {
                    ctx.queues.local_send.push(req);
                }
            }
            Command::Write => {
                {
                    let mut data = req.data().lock().await;
                    data[..op.data.len()].copy_from_slice(&op.data);
                }

                ctx.locks
                    .lock(LockSet::Regular, desc.offset, desc.length)
                    .await;
                // Dirty bits reach disk before either component is touched.
                ctx.extents.write_start(desc.offset, desc.length)?;

                req.arm(2);
                ctx.queues.local_send.push(req.clone());
                ctx.queues.remote_send.push(req);
            }
            Command::Delete | Command::Flush => {
                req.arm(2);
                ctx.queues.local_send.push(req.clone());
                ctx.queues.remote_send.push(req);
            }
        }
    }
}
