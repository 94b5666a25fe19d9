//! Secondary Role
//!
//! The passive peer: accepts one replication connection at a time, answers
//! the handshake with its counters and applies the primary's requests to the
//! local backing file strictly in arrival order. The secondary never
//! initiates anything and keeps no dirty tracking of its own; replicated
//! writes are exactly as durable as the primary asked them to be.

use std::path::Path;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::BlocksyncConfig;
use crate::engine::local::LocalComponent;
use crate::error::{Error, Result};
use crate::metadata::{resolve_sync_source, GenCounters, MetadataStore};
use crate::protocol::{self, Command, Message, OpStatus};

pub struct Secondary {
    config: BlocksyncConfig,
    metadata: MetadataStore,
    local: LocalComponent,
}

impl Secondary {
    pub async fn new(config: BlocksyncConfig) -> Result<Self> {
        let metadata = MetadataStore::load(&config.metadata_path()).map_err(|e| {
            Error::Config(format!("{e}; initialize the resource first"))
        })?;
        let local =
            LocalComponent::open(&config.resource.data_path, config.resource.media_size).await?;
        Ok(Self {
            config,
            metadata,
            local,
        })
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listen = &self.config.remote.listen_address;
        let listener = TcpListener::bind(listen)
            .await
            .map_err(|e| Error::Config(format!("failed to bind {listen}: {e}")))?;
        info!(
            resource = %self.config.resource.name,
            address = %listen,
            "secondary listening"
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            info!(%peer, "primary connected");
            stream.set_nodelay(true).ok();

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                served = self.serve(stream) => {
                    match served {
                        Ok(()) => info!(%peer, "primary disconnected"),
                        Err(err) => warn!(%peer, error = %err, "replication connection failed"),
                    }
                }
            }
        }
    }

    /// Serve one replication connection to completion
    async fn serve(&self, mut stream: TcpStream) -> Result<()> {
        if !self.handshake(&mut stream).await? {
            return Ok(());
        }

        let mut buf = vec![0u8; self.config.buffer_size()];
        loop {
            let message = match protocol::read_message(&mut stream).await {
                Ok(message) => message,
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            match message {
                Message::Request {
                    seq,
                    cmd,
                    offset,
                    length,
                } => {
                    self.apply(&mut stream, &mut buf, seq, cmd, offset, length)
                        .await?;
                }
                Message::SyncDone { local_gen } => {
                    info!(peer_gen = local_gen, "peer announced sync completion");
                    self.metadata.record_sync_done(local_gen)?;
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected {} from primary",
                        other.type_name()
                    )))
                }
            }
        }
    }

    /// Validate the hello and answer it. Returns false when the connection
    /// was answered with a rejection and must be dropped.
    async fn handshake(&self, stream: &mut TcpStream) -> Result<bool> {
        let hello = protocol::read_message(stream).await?;
        let (resource, token, peer_id, theirs, media_size, extent_size) = match hello {
            Message::HandshakeRequest {
                resource,
                token,
                resource_id,
                local_gen,
                peer_gen,
                media_size,
                extent_size,
            } => (
                resource,
                token,
                resource_id,
                GenCounters {
                    local_gen,
                    peer_gen,
                },
                media_size,
                extent_size,
            ),
            other => {
                return Err(Error::Protocol(format!(
                    "expected HandshakeRequest, got {}",
                    other.type_name()
                )))
            }
        };

        let rejection = self.vet_peer(&resource, peer_id, theirs, media_size, extent_size);
        if let Err(ref err) = rejection {
            warn!(%resource, error = %err, "rejecting primary");
        }

        let ours = self.metadata.counters();
        let response = Message::HandshakeResponse {
            token,
            resource_id: self.metadata.resource_id().unwrap_or_default(),
            local_gen: ours.local_gen,
            peer_gen: ours.peer_gen,
            media_size: self.config.resource.media_size,
            extent_size: self.config.resource.extent_size,
            dirty_map: None,
            error: rejection.as_ref().err().map(|err| err.to_string()),
        };
        protocol::write_message(stream, &response, None).await?;

        if rejection.is_ok() {
            self.metadata.record_peer(theirs);
            debug!(local_gen = theirs.local_gen, peer_gen = theirs.peer_gen,
                "handshake accepted");
        }
        Ok(rejection.is_ok())
    }

    fn vet_peer(
        &self,
        resource: &str,
        peer_id: Option<uuid::Uuid>,
        theirs: GenCounters,
        media_size: u64,
        extent_size: u64,
    ) -> Result<()> {
        if resource != self.config.resource.name {
            return Err(Error::Protocol(format!(
                "unknown resource {resource:?}"
            )));
        }
        if media_size != self.config.resource.media_size
            || extent_size != self.config.resource.extent_size
        {
            return Err(Error::Protocol(format!(
                "geometry mismatch: peer has media {media_size}, extent {extent_size}"
            )));
        }
        match peer_id {
            Some(id) => self.metadata.adopt_resource_id(id)?,
            None => return Err(Error::Protocol("primary sent no resource id".into())),
        }
        // Split brain is detected on both sides; the primary refuses to run,
        // we refuse to serve.
        resolve_sync_source(theirs, self.metadata.counters())?;
        Ok(())
    }

    /// Apply one request and send its reply
    async fn apply(
        &self,
        stream: &mut TcpStream,
        buf: &mut Vec<u8>,
        seq: u64,
        cmd: Command,
        offset: u64,
        length: u64,
    ) -> Result<()> {
        if cmd != Command::Flush
            && (length as usize > buf.len()
                || offset
                    .checked_add(length)
                    .map_or(true, |end| end > self.config.resource.media_size))
        {
            // A malformed span is a protocol violation, not an I/O error;
            // the read side would desynchronize anyway.
            return Err(Error::Protocol(format!(
                "span [{offset}, {offset}+{length}) outside media"
            )));
        }

        if cmd == Command::Write {
            protocol::read_payload(stream, buf, length).await?;
        }

        let outcome = match cmd {
            Command::Read => self.local.read(offset, &mut buf[..length as usize]).await,
            Command::Write => self.local.write(offset, &buf[..length as usize]).await,
            Command::Delete => self.local.zero(offset, length).await,
            Command::Flush => self.local.flush().await,
        };

        let status = match outcome {
            Ok(()) => OpStatus::Ok,
            Err(err) => {
                warn!(seq, cmd = cmd.name(), offset, length, error = %err,
                    "request failed");
                OpStatus::IoError
            }
        };

        let payload = if cmd == Command::Read && status.is_ok() {
            Some(&buf[..length as usize])
        } else {
            None
        };
        let reply = Message::Reply {
            seq,
            status,
            length: payload.map_or(0, |p| p.len() as u64),
        };
        protocol::write_message(stream, &reply, payload).await
    }
}

/// Create the persisted state for a fresh resource: metadata document and
/// zero-filled backing image. Shared by both roles' `init` path.
pub async fn init_resource(config: &BlocksyncConfig, with_extent_map: bool) -> Result<()> {
    std::fs::create_dir_all(&config.resource.state_dir)?;
    MetadataStore::create(&config.metadata_path())?;
    if with_extent_map {
        crate::extentmap::ExtentMapStore::create(
            &config.extentmap_path(),
            config.resource.media_size,
            config.resource.extent_size,
        )?;
    }
    if !Path::new(&config.resource.data_path).exists() {
        LocalComponent::create_image(&config.resource.data_path, config.resource.media_size)
            .await?;
    }
    Ok(())
}
