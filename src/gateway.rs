//! Block Gateway
//!
//! The gateway is where block operations enter and leave the engine. The
//! `BlockGateway` trait separates the engine from the transport: the socket
//! gateway serves one framed-protocol client at a time, while the channel
//! gateway embeds the engine behind a pair of in-process channels (and is
//! what the integration tests drive).

use async_trait::async_trait;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{self, Command, Message, OpStatus};

/// One block operation submitted through a gateway
#[derive(Debug, Clone)]
pub struct GatewayOp {
    /// Gateway-scoped identifier, echoed back on completion
    pub id: u64,
    pub cmd: Command,
    pub offset: u64,
    pub length: u64,
    /// Write payload; empty for reads, deletes and flushes
    pub data: Vec<u8>,
}

/// The completion report for one gateway operation
#[derive(Debug, Clone)]
pub struct GatewayCompletion {
    pub op_id: u64,
    pub status: OpStatus,
    /// Read payload, present only on a successful read
    pub data: Option<Vec<u8>>,
}

/// Source and sink of block operations
#[async_trait]
pub trait BlockGateway: Send + Sync {
    /// Wait for the next operation. `Error::GatewayClosed` means the gateway
    /// shut down cleanly; any other error is fatal to the engine.
    async fn next_op(&self) -> Result<GatewayOp>;

    /// Report a finished operation back to its submitter
    async fn complete(&self, completion: GatewayCompletion) -> Result<()>;
}

/// In-process gateway backed by channels
pub struct ChannelGateway {
    ops: Mutex<mpsc::Receiver<GatewayOp>>,
    completions: mpsc::Sender<GatewayCompletion>,
}

/// Client end of a [`ChannelGateway`]
pub struct ChannelGatewayHandle {
    pub ops: mpsc::Sender<GatewayOp>,
    pub completions: mpsc::Receiver<GatewayCompletion>,
}

impl ChannelGateway {
    pub fn new(capacity: usize) -> (Self, ChannelGatewayHandle) {
        let (op_tx, op_rx) = mpsc::channel(capacity);
        let (done_tx, done_rx) = mpsc::channel(capacity);
        (
            Self {
                ops: Mutex::new(op_rx),
                completions: done_tx,
            },
            ChannelGatewayHandle {
                ops: op_tx,
                completions: done_rx,
            },
        )
    }
}

#[async_trait]
impl BlockGateway for ChannelGateway {
    async fn next_op(&self) -> Result<GatewayOp> {
        self.ops
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::GatewayClosed)
    }

    async fn complete(&self, completion: GatewayCompletion) -> Result<()> {
        // A departed submitter is not an engine failure.
        if self.completions.send(completion).await.is_err() {
            debug!("completion dropped, gateway client gone");
        }
        Ok(())
    }
}

/// TCP gateway speaking the framed request protocol to one client at a time
pub struct SocketGateway {
    listener: TcpListener,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    max_io_size: u64,
}

impl SocketGateway {
    pub async fn bind(address: &str, max_io_size: u64) -> Result<Self> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| Error::Gateway(format!("failed to bind {address}: {e}")))?;
        info!(address, "gateway listening");
        Ok(Self {
            listener,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            max_io_size,
        })
    }

    async fn accept_client(&self) -> Result<()> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| Error::Gateway(format!("gateway accept failed: {e}")))?;
        stream.set_nodelay(true).ok();
        info!(%peer, "gateway client connected");

        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        Ok(())
    }

    async fn drop_client(&self) {
        self.reader.lock().await.take();
        self.writer.lock().await.take();
    }

    /// Read one request frame (plus write payload) from the current client
    async fn read_op(&self) -> Result<GatewayOp> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::NotConnected)?;

        let message = protocol::read_message(reader).await?;
        let (seq, cmd, offset, length) = match message {
            Message::Request {
                seq,
                cmd,
                offset,
                length,
            } => (seq, cmd, offset, length),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected {} on gateway connection",
                    other.type_name()
                )))
            }
        };

        if length > self.max_io_size {
            return Err(Error::Protocol(format!(
                "request of {length} bytes exceeds gateway limit of {}",
                self.max_io_size
            )));
        }

        let mut data = Vec::new();
        if cmd == Command::Write {
            data.resize(length as usize, 0);
            protocol::read_payload(reader, &mut data, length).await?;
        }

        Ok(GatewayOp {
            id: seq,
            cmd,
            offset,
            length,
            data,
        })
    }
}

#[async_trait]
impl BlockGateway for SocketGateway {
    async fn next_op(&self) -> Result<GatewayOp> {
        loop {
            if self.reader.lock().await.is_none() {
                self.accept_client().await?;
            }
            match self.read_op().await {
                Ok(op) => return Ok(op),
                Err(err) => {
                    // One broken client does not take the gateway down.
                    warn!(error = %err, "gateway client dropped");
                    self.drop_client().await;
                }
            }
        }
    }

    async fn complete(&self, completion: GatewayCompletion) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = match guard.as_mut() {
            Some(writer) => writer,
            // Client left before its completion; nothing to deliver.
            None => return Ok(()),
        };

        let payload = completion.data.as_deref();
        let reply = Message::Reply {
            seq: completion.op_id,
            status: completion.status,
            length: payload.map_or(0, |p| p.len() as u64),
        };

        if let Err(err) = protocol::write_message(writer, &reply, payload).await {
            // Drop only the write half; the receive side notices the dead
            // client on its next read and accepts a new one.
            warn!(error = %err, "gateway reply failed, dropping client");
            guard.take();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_channel_gateway_round_trip() {
        let (gateway, mut handle) = ChannelGateway::new(8);

        handle
            .ops
            .send(GatewayOp {
                id: 9,
                cmd: Command::Write,
                offset: 0,
                length: 4,
                data: b"data".to_vec(),
            })
            .await
            .unwrap();

        let op = gateway.next_op().await.unwrap();
        assert_eq!(op.id, 9);
        assert_eq!(op.cmd, Command::Write);

        gateway
            .complete(GatewayCompletion {
                op_id: op.id,
                status: OpStatus::Ok,
                data: None,
            })
            .await
            .unwrap();

        let done = handle.completions.recv().await.unwrap();
        assert_eq!(done.op_id, 9);
        assert!(done.status.is_ok());
    }

    #[tokio::test]
    async fn test_channel_gateway_closed() {
        let (gateway, handle) = ChannelGateway::new(1);
        drop(handle);
        assert!(matches!(
            gateway.next_op().await.unwrap_err(),
            Error::GatewayClosed
        ));
    }

    #[tokio::test]
    async fn test_socket_gateway_serves_client() {
        let gateway = SocketGateway::bind("127.0.0.1:0", 1024 * 1024)
            .await
            .unwrap();
        let address = gateway.listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(address).await.unwrap();
            let request = Message::Request {
                seq: 1,
                cmd: Command::Write,
                offset: 512,
                length: 4,
            };
            protocol::write_message(&mut stream, &request, Some(b"abcd"))
                .await
                .unwrap();
            protocol::read_message(&mut stream).await.unwrap()
        });

        let op = gateway.next_op().await.unwrap();
        assert_eq!(op.offset, 512);
        assert_eq!(op.data, b"abcd");

        gateway
            .complete(GatewayCompletion {
                op_id: op.id,
                status: OpStatus::Ok,
                data: None,
            })
            .await
            .unwrap();

        match client.await.unwrap() {
            Message::Reply { seq, status, .. } => {
                assert_eq!(seq, 1);
                assert!(status.is_ok());
            }
            other => panic!("wrong message type: {}", other.type_name()),
        }
    }
}
