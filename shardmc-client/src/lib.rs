//! # shardmc Sync Client
//!
//! Purpose: Provide a blocking memcached client that shards keys across
//! servers and pools connections per server, over either the text or the
//! binary wire protocol.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse TCP connections per shard and bound how
//!    many are checked out at once.
//! 2. **Zero-Cost Abstractions**: The active codec is an enum, so the hot path
//!    stays monomorphic and inline-friendly.
//! 3. **Minimal Allocation**: Each connection reuses its own line and write buffers.
//! 4. **Protocol Clarity**: Both wire formats are encoded and parsed explicitly,
//!    reading value bodies by length, never by delimiter.
//!
//! ```no_run
//! use shardmc_client::{Client, Item};
//!
//! # fn main() -> shardmc_client::McResult<()> {
//! let client = Client::new(["127.0.0.1:11211", "127.0.0.1:11212"])?;
//! client.set(&mut Item::new("greeting", "hello").with_flags(1))?;
//! if let Some(item) = client.get("greeting")? {
//!     assert_eq!(item.value.as_ref(), b"hello");
//! }
//! # Ok(())
//! # }
//! ```

pub mod binary;
mod client;
pub mod clock;
mod config;
pub mod pool;
mod protocol;
pub mod shard;
pub mod text;

#[cfg(test)]
mod testing;

pub use client::Client;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    ClientConfig, ProtocolKind, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_ACTIVE_CONNS,
    DEFAULT_MAX_IDLE_CONNS, DEFAULT_SOCKET_TIMEOUT,
};
pub use pool::{Pool, PoolConfig, PoolStats, PooledConnection, Transport};
pub use protocol::{Codec, Protocol};
pub use shard::ShardedProtocol;
pub use shardmc_common::{validate_key, Item, McError, McResult, ServerStatus, MAX_KEY_LEN};
