//! Remote Component
//!
//! The link to the secondary plus the two workers that drive it. The write
//! half sits behind an `RwLock` so concurrent senders share it with a read
//! lock while teardown takes the write lock and drops it, which closes the
//! socket and unblocks the receiver. The read half is handed to the receiver
//! worker through a channel and is owned by it for the life of the
//! connection.
//!
//! A request is parked on the reply queue before its frame goes out, so the
//! peer's reply can never race past its own request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, Command, Message, OpStatus};

use super::request::REMOTE;
use super::Ctx;

/// Shared handle to the secondary connection
pub struct RemoteLink {
    writer: RwLock<Option<Mutex<OwnedWriteHalf>>>,
    reader_tx: mpsc::Sender<OwnedReadHalf>,
    connected: AtomicBool,
}

impl RemoteLink {
    /// Create the link and the channel the receiver worker drains
    pub fn new() -> (Self, mpsc::Receiver<OwnedReadHalf>) {
        let (reader_tx, reader_rx) = mpsc::channel(1);
        (
            Self {
                writer: RwLock::new(None),
                reader_tx,
                connected: AtomicBool::new(false),
            },
            reader_rx,
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Install a freshly handshaken connection
    pub async fn install(&self, stream: TcpStream) -> Result<()> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        *self.writer.write().await = Some(Mutex::new(write_half));
        self.connected.store(true, Ordering::Release);
        self.reader_tx
            .send(read_half)
            .await
            .map_err(|_| Error::Internal("remote receiver worker is gone".into()))
    }

    /// Send one framed message over the link
    pub async fn send(&self, message: &Message, payload: Option<&[u8]>) -> Result<()> {
        let guard = self.writer.read().await;
        let writer = guard.as_ref().ok_or(Error::NotConnected)?;
        let mut writer = writer.lock().await;
        protocol::write_message(&mut *writer, message, payload).await
    }

    /// Drop the write half. Closing it makes the receiver's pending read
    /// fail, which finishes the teardown from that side.
    pub async fn teardown(&self) -> bool {
        self.connected.store(false, Ordering::Release);
        self.writer.write().await.take().is_some()
    }
}

/// Tear the link down and fail every request still waiting on a reply
pub async fn remote_close(ctx: &Ctx) {
    let was_up = ctx.link.teardown().await;
    for req in ctx.queues.remote_recv.drain() {
        req.set_error(REMOTE, OpStatus::NotConnected);
        ctx.route_done(req);
    }
    if was_up {
        info!("remote link down");
        ctx.link_down.notify_waiters();
    }
}

/// Forward queued requests to the secondary
pub async fn remote_send_worker(ctx: Arc<Ctx>) -> Result<()> {
    loop {
        let req = ctx.queues.remote_send.pop().await;
        let desc = req.desc();

        if !ctx.link.is_connected() {
            req.set_error(REMOTE, OpStatus::NotConnected);
            ctx.route_done(req);
            continue;
        }

        let message = Message::Request {
            seq: desc.seq,
            cmd: desc.cmd,
            offset: desc.offset,
            length: desc.length,
        };

        // Park before transmitting.
        ctx.queues.remote_recv.push(req.clone());

        let sent = if desc.cmd == Command::Write {
            let data = req.data().lock().await;
            ctx.link
                .send(&message, Some(&data[..desc.length as usize]))
                .await
        } else {
            ctx.link.send(&message, None).await
        };

        match sent {
            Ok(()) => trace!(seq = desc.seq, request = %desc.describe(), "sent to remote"),
            Err(err) => {
                warn!(error = %err, request = %desc.describe(), "remote send failed");
                // The receiver may have already drained it during teardown.
                if ctx.queues.remote_recv.remove(&req) {
                    req.set_error(REMOTE, OpStatus::NotConnected);
                    ctx.route_done(req);
                }
                remote_close(&ctx).await;
            }
        }
    }
}

/// Pair replies from the secondary with their parked requests
pub async fn remote_recv_worker(
    ctx: Arc<Ctx>,
    mut readers: mpsc::Receiver<OwnedReadHalf>,
) -> Result<()> {
    while let Some(mut reader) = readers.recv().await {
        debug!("remote receiver online");
        loop {
            let message = match protocol::read_message(&mut reader).await {
                Ok(message) => message,
                Err(err) => {
                    debug!(error = %err, "remote connection closed");
                    break;
                }
            };

            match message {
                Message::Reply {
                    seq,
                    status,
                    length,
                } => {
                    let req = match ctx
                        .queues
                        .remote_recv
                        .take_where(|parked| parked.desc().seq == seq)
                    {
                        Some(req) => req,
                        None => {
                            warn!(seq, "reply for unknown request");
                            if status.is_ok() && length > 0 {
                                // Skip the stray payload to stay framed.
                                let mut scratch = vec![0u8; length as usize];
                                if protocol::read_payload(&mut reader, &mut scratch, length)
                                    .await
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            continue;
                        }
                    };

                    let desc = req.desc();
                    let outcome = status;
                    if status.is_ok() && desc.cmd == Command::Read {
                        let mut data = req.data().lock().await;
                        if let Err(err) =
                            protocol::read_payload(&mut reader, &mut data, length).await
                        {
                            warn!(error = %err, seq, "truncated read payload");
                            drop(data);
                            req.set_error(REMOTE, OpStatus::NotConnected);
                            ctx.route_done(req);
                            break;
                        }
                    }

                    if !outcome.is_ok() {
                        warn!(seq, status = ?outcome, request = %desc.describe(),
                            "remote request failed");
                    }
                    req.set_error(REMOTE, outcome);
                    ctx.route_done(req);
                }
                other => {
                    warn!(message = other.type_name(), "unexpected message from secondary");
                }
            }
        }
        remote_close(&ctx).await;
    }
    Ok(())
}
