//! Blocksync - Synchronous Block-Level Replication Engine
//!
//! Blocksync keeps two copies of a block device in lockstep: a primary node
//! applies every write locally and mirrors it to a secondary node before the
//! submitter is told a flush succeeded. When the peer is unreachable the
//! primary keeps serving from its local copy, tracks the missed spans in a
//! persisted dirty extent map and resynchronizes exactly those extents once
//! the peer returns.
//!
//! # Architecture
//!
//! The primary is a set of single-purpose async workers joined by hand-off
//! queues over a fixed pool of request records. Requests enter through a
//! block gateway, fan out to the local and the remote component, and are
//! joined again by a completion reporter. A connection guard dials the
//! secondary and decides the resynchronization direction from a pair of
//! persisted generation counters; diverged histories on both sides are
//! refused as a split brain.

pub mod config;
pub mod engine;
pub mod error;
pub mod extentmap;
pub mod gateway;
pub mod metadata;
pub mod protocol;
pub mod rangelock;
pub mod secondary;

pub use config::BlocksyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::BlocksyncConfig;
    pub use crate::engine::Engine;
    pub use crate::error::{Error, Result};
    pub use crate::gateway::{BlockGateway, ChannelGateway, GatewayCompletion, GatewayOp, SocketGateway};
    pub use crate::metadata::{GenCounters, SyncSource};
    pub use crate::protocol::{Command, Message, OpStatus};
    pub use crate::secondary::Secondary;
}
