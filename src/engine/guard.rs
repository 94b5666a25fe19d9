//! Connection Guard
//!
//! Owns the life cycle of the link to the secondary: dial, handshake,
//! counter exchange, dirty-map merge, install. Retries at a fixed interval
//! while the peer is away and wakes immediately when an established link
//! drops. A split-brain verdict from the counter exchange is fatal.

use std::sync::Arc;

use rand::RngCore;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metadata::{resolve_sync_source, GenCounters};
use crate::protocol::{self, Message};

use super::Ctx;

pub async fn guard_worker(ctx: Arc<Ctx>) -> Result<()> {
    loop {
        if !ctx.link.is_connected() {
            match establish(&ctx).await {
                Ok(()) => {}
                Err(err @ Error::SplitBrain { .. }) => {
                    // Neither side's data can be declared authoritative;
                    // refusing to run beats silently overwriting one copy.
                    return Err(err);
                }
                Err(err) => {
                    debug!(error = %err, address = %ctx.config.remote.address,
                        "connection attempt failed");
                }
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(ctx.config.reconnect_interval()) => {}
            _ = ctx.link_down.notified() => {}
        }
    }
}

/// Dial the secondary, run the handshake and install the connection
async fn establish(ctx: &Ctx) -> Result<()> {
    let address = ctx.config.remote.address.clone();
    let deadline = ctx.config.connect_timeout();

    let stream = timeout(deadline, TcpStream::connect(&address))
        .await
        .map_err(|_| Error::ConnectionTimeout(address.clone()))?
        .map_err(|e| Error::ConnectionFailed {
            address: address.clone(),
            reason: e.to_string(),
        })?;

    let stream = timeout(deadline, handshake(ctx, stream, &address))
        .await
        .map_err(|_| Error::ConnectionTimeout(address.clone()))??;

    ctx.link.install(stream).await?;
    info!(%address, sync_source = ?ctx.metadata.sync_source(), "remote link up");

    // Permit-storing wakeup: the resynchronizer picks it up even if it is
    // mid-pass right now.
    ctx.resync_wakeup.notify_one();
    Ok(())
}

async fn handshake(ctx: &Ctx, mut stream: TcpStream, address: &str) -> Result<TcpStream> {
    let mut token = vec![0u8; 16];
    rand::thread_rng().fill_bytes(&mut token);

    let ours = ctx.metadata.counters();
    let request = Message::HandshakeRequest {
        resource: ctx.config.resource.name.clone(),
        token: token.clone(),
        resource_id: Some(ctx.metadata.ensure_resource_id()?),
        local_gen: ours.local_gen,
        peer_gen: ours.peer_gen,
        media_size: ctx.config.resource.media_size,
        extent_size: ctx.config.resource.extent_size,
    };
    protocol::write_message(&mut stream, &request, None).await?;

    let response = protocol::read_message(&mut stream).await?;
    let (peer_token, resource_id, theirs, media_size, extent_size, dirty_map, error) =
        match response {
            Message::HandshakeResponse {
                token,
                resource_id,
                local_gen,
                peer_gen,
                media_size,
                extent_size,
                dirty_map,
                error,
            } => (
                token,
                resource_id,
                GenCounters {
                    local_gen,
                    peer_gen,
                },
                media_size,
                extent_size,
                dirty_map,
                error,
            ),
            other => {
                return Err(Error::Protocol(format!(
                    "expected HandshakeResponse, got {}",
                    other.type_name()
                )))
            }
        };

    if peer_token != token {
        return Err(Error::Protocol("handshake token mismatch".into()));
    }
    if resource_id != ctx.metadata.ensure_resource_id()? {
        return Err(Error::HandshakeRejected {
            address: address.to_string(),
            reason: "resource id mismatch".into(),
        });
    }
    if media_size != ctx.config.resource.media_size
        || extent_size != ctx.config.resource.extent_size
    {
        return Err(Error::HandshakeRejected {
            address: address.to_string(),
            reason: format!(
                "geometry mismatch: peer has media {media_size}, extent {extent_size}"
            ),
        });
    }

    // Compare counters before honoring a rejection: both sides detect a
    // split brain from the same exchange, and it must stay fatal here even
    // when the peer refused to serve first.
    let source = resolve_sync_source(ours, theirs)?;

    if let Some(reason) = error {
        return Err(Error::HandshakeRejected {
            address: address.to_string(),
            reason,
        });
    }
    ctx.metadata.record_peer(theirs);
    ctx.metadata.set_sync_source(source)?;

    if let Some(image) = dirty_map {
        warn!(bytes = image.len(), "merging peer dirty map");
        ctx.extents.merge(&image)?;
    }

    Ok(stream)
}
