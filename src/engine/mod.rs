//! Replication Engine
//!
//! The primary-side engine: a fixed pool of request records flowing between
//! single-purpose workers over hand-off queues. The gateway receiver fans
//! requests out to the local and remote components, the reporter joins the
//! outcomes, the guard keeps the remote link alive and the resynchronizer
//! repairs whatever the link outage left behind.

pub mod guard;
pub mod local;
pub mod pool;
pub mod queue;
pub mod receiver;
pub mod remote;
pub mod reporter;
pub mod request;
pub mod resync;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::BlocksyncConfig;
use crate::error::{Error, Result};
use crate::extentmap::ExtentMapStore;
use crate::gateway::BlockGateway;
use crate::metadata::MetadataStore;
use crate::rangelock::RangeLocks;

use local::LocalComponent;
use pool::RequestPool;
use queue::RequestQueue;
use remote::RemoteLink;
use request::IoRequest;

/// How long a shutting-down engine waits for accepted requests to finish
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// The hand-off queues between workers
pub struct Queues {
    /// Requests bound for the local component
    pub local_send: RequestQueue,
    /// Requests bound for the secondary
    pub remote_send: RequestQueue,
    /// Requests transmitted and awaiting a reply
    pub remote_recv: RequestQueue,
    /// Fully joined external requests awaiting completion reporting
    pub done: RequestQueue,
    /// Finished resynchronization requests
    pub sync_done: RequestQueue,
}

impl Queues {
    fn new() -> Self {
        Self {
            local_send: RequestQueue::new(),
            remote_send: RequestQueue::new(),
            remote_recv: RequestQueue::new(),
            done: RequestQueue::new(),
            sync_done: RequestQueue::new(),
        }
    }
}

/// Shared state every worker holds an `Arc` to
pub struct Ctx {
    pub config: BlocksyncConfig,
    pub pool: RequestPool,
    pub queues: Queues,
    pub locks: RangeLocks,
    pub metadata: MetadataStore,
    pub extents: ExtentMapStore,
    pub local: LocalComponent,
    pub link: RemoteLink,
    pub gateway: Arc<dyn BlockGateway>,
    /// Woken by teardown so the guard retries without waiting out its timer
    pub link_down: Notify,
    /// Woken by the guard after a successful handshake
    pub resync_wakeup: Notify,
    seq: AtomicU64,
}

impl Ctx {
    /// Next wire sequence number
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// A component finished its share of `req`; the last one routes the
    /// record to the reporter or, for sync requests, to the resynchronizer.
    pub fn route_done(&self, req: Arc<IoRequest>) {
        if req.complete_one() {
            if req.desc().kind.is_sync() {
                self.queues.sync_done.push(req);
            } else {
                self.queues.done.push(req);
            }
        }
    }
}

/// The assembled primary engine
pub struct Engine {
    ctx: Arc<Ctx>,
    readers: mpsc::Receiver<OwnedReadHalf>,
}

impl Engine {
    /// Open the persisted stores and the backing file; the resource must
    /// have been initialized beforehand.
    pub async fn new(config: BlocksyncConfig, gateway: Arc<dyn BlockGateway>) -> Result<Self> {
        let metadata = MetadataStore::load(&config.metadata_path()).map_err(|e| {
            Error::Config(format!("{e}; initialize the resource first"))
        })?;
        let extents = ExtentMapStore::load(
            &config.extentmap_path(),
            config.resource.media_size,
            config.resource.extent_size,
        )?;
        let local =
            LocalComponent::open(&config.resource.data_path, config.resource.media_size).await?;
        let (link, readers) = RemoteLink::new();
        let pool = RequestPool::new(config.engine.queue_depth, config.buffer_size());

        let ctx = Arc::new(Ctx {
            config,
            pool,
            queues: Queues::new(),
            locks: RangeLocks::new(),
            metadata,
            extents,
            local,
            link,
            gateway,
            link_down: Notify::new(),
            resync_wakeup: Notify::new(),
            seq: AtomicU64::new(1),
        });

        Ok(Self { ctx, readers })
    }

    pub fn context(&self) -> Arc<Ctx> {
        self.ctx.clone()
    }

    /// Run all workers until shutdown is signalled, the gateway drains or a
    /// worker fails fatally.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ctx = self.ctx;
        info!(
            resource = %ctx.config.resource.name,
            remote = %ctx.config.remote.address,
            queue_depth = ctx.pool.depth(),
            "engine starting"
        );

        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        workers.spawn(receiver::gateway_recv_worker(ctx.clone(), shutdown.clone()));
        workers.spawn(local::local_send_worker(ctx.clone()));
        workers.spawn(remote::remote_send_worker(ctx.clone()));
        workers.spawn(remote::remote_recv_worker(ctx.clone(), self.readers));
        workers.spawn(reporter::done_worker(ctx.clone()));
        workers.spawn(resync::resync_worker(ctx.clone()));
        workers.spawn(guard::guard_worker(ctx.clone()));

        let result = tokio::select! {
            _ = shutdown.changed() => {
                info!("shutdown requested");
                Ok(())
            }
            joined = workers.join_next() => match joined {
                Some(Ok(Ok(()))) => {
                    info!("gateway drained, engine stopping");
                    Ok(())
                }
                Some(Ok(Err(err))) => Err(err),
                Some(Err(err)) => Err(Error::Internal(format!("worker panicked: {err}"))),
                None => Ok(()),
            }
        };

        // The receiver stops fetching on its own shutdown signal; let the
        // remaining workers drain the pipeline so every accepted request
        // still reports a completion.
        if result.is_ok() {
            let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
                ctx.queues.local_send.wait_empty().await;
                ctx.queues.remote_send.wait_empty().await;
                ctx.queues.remote_recv.wait_empty().await;
                ctx.queues.done.wait_empty().await;
            })
            .await;
            if drained.is_err() {
                warn!("shutdown drain deadline passed with requests still queued");
            }
        }

        workers.abort_all();
        while workers.join_next().await.is_some() {}
        remote::remote_close(&ctx).await;
        // Push the final extent image out so a restart resynchronizes no
        // more than it has to.
        ctx.extents.commit()?;

        match &result {
            Ok(()) => info!("engine stopped"),
            Err(err) => tracing::error!(error = %err, "engine failed"),
        }
        result
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::gateway::ChannelGateway;
    use std::path::Path;

    pub fn config(dir: &Path) -> BlocksyncConfig {
        let mut config: BlocksyncConfig = toml::from_str(
            r#"
            [resource]
            name = "vol0"
            data_path = "unset"
            state_dir = "unset"
            media_size = 1048576
            extent_size = 65536

            [remote]
            address = "127.0.0.1:1"

            [engine]
            queue_depth = 8
            max_io_size = 65536
            "#,
        )
        .unwrap();
        config.resource.data_path = dir.join("vol0.img");
        config.resource.state_dir = dir.to_path_buf();
        config
    }

    /// Fully initialized context backed by temporary files, with a channel
    /// gateway whose client end is dropped.
    pub async fn ctx(dir: &Path) -> Arc<Ctx> {
        let config = config(dir);
        let metadata = MetadataStore::create(&config.metadata_path()).unwrap();
        let extents = ExtentMapStore::create(
            &config.extentmap_path(),
            config.resource.media_size,
            config.resource.extent_size,
        )
        .unwrap();
        LocalComponent::create_image(&config.resource.data_path, config.resource.media_size)
            .await
            .unwrap();
        let local = LocalComponent::open(&config.resource.data_path, config.resource.media_size)
            .await
            .unwrap();
        let (link, _readers) = RemoteLink::new();
        let pool = RequestPool::new(config.engine.queue_depth, config.buffer_size());
        let (gateway, _handle) = ChannelGateway::new(8);

        Arc::new(Ctx {
            config,
            pool,
            queues: Queues::new(),
            locks: RangeLocks::new(),
            metadata,
            extents,
            local,
            link,
            gateway: Arc::new(gateway),
            link_down: Notify::new(),
            resync_wakeup: Notify::new(),
            seq: AtomicU64::new(1),
        })
    }
}
