//! # Sharded Protocol
//!
//! Purpose: Route single-key commands to the pool that owns the key and fan
//! multi-key fetches out across every shard that owns at least one key.
//!
//! ## Design Principles
//! 1. **Deterministic Routing**: A key always maps to the same shard for a given
//!    shard count. One shard skips hashing entirely.
//! 2. **Scoped Fan-Out**: One scoped thread per non-empty shard group, each with
//!    its own checked-out connection. Results land in per-shard slots and are
//!    merged only after every worker has joined.
//! 3. **All Or Nothing**: If any shard fails, the call fails with the error from
//!    the lowest-indexed failing shard and healthy results are dropped.
//! 4. **Taint On Suspicion**: A connection that produced a transport-class error
//!    (or an unsupported-command reply) is closed instead of pooled.

use std::collections::HashMap;
use std::panic;
use std::thread;

use tracing::{debug, trace};

use shardmc_common::{lookup, Item, McError, McResult};

use crate::pool::{Pool, PoolStats, Transport};
use crate::protocol::{Codec, Protocol};

/// 31-bit non-zero key hash.
///
/// The CRC32 of the key is reduced to its upper 15 bits with the low bit forced
/// on, so the result is never zero. Every hash is therefore odd: with an even
/// shard count only odd shard indices receive keys.
#[inline]
pub fn shard_hash(key: &[u8]) -> u32 {
    ((crc32fast::hash(key) >> 16) & 0x7fff) | 1
}

/// Shard owning `key` among `shard_count` shards.
#[inline]
pub fn shard_index(key: &[u8], shard_count: usize) -> usize {
    if shard_count <= 1 {
        return 0;
    }
    shard_hash(key) as usize % shard_count
}

/// One pool per server endpoint plus the active wire codec.
pub struct ShardedProtocol<T: Transport> {
    pools: Vec<Pool<T>>,
    protocol: Protocol,
}

impl<T: Transport> ShardedProtocol<T> {
    /// Builds a sharded protocol over `pools`, in server order.
    pub fn new(pools: Vec<Pool<T>>, protocol: Protocol) -> McResult<Self> {
        if pools.is_empty() {
            return Err(McError::InvalidConfig("at least one server is required".into()));
        }
        Ok(ShardedProtocol { pools, protocol })
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn shard_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pools(&self) -> &[Pool<T>] {
        &self.pools
    }

    pub fn shard_for(&self, key: &str) -> usize {
        shard_index(key.as_bytes(), self.pools.len())
    }

    /// Runs the store-class, arithmetic or delete command `command` for `item`
    /// on the shard that owns its key.
    pub fn store(&self, command: &str, item: &mut Item) -> McResult<()> {
        let op = lookup(command).ok_or(McError::OperationNotSupported)?;
        let shard = self.shard_for(&item.key);
        let mut conn = self.pools[shard].acquire()?;
        let result = self.protocol.store(&mut conn, op, item);
        if let Err(err) = &result {
            if err.taints_connection() {
                debug!(shard, command, error = %err, "discarding connection");
                conn.taint();
            }
        }
        result
    }

    /// Fetches `keys` (already validated and de-duplicated) from their shards.
    pub fn fetch(&self, keys: &[&str], with_cas: bool) -> McResult<HashMap<String, Item>> {
        let mut groups: Vec<Vec<&str>> = vec![Vec::new(); self.pools.len()];
        for key in keys {
            groups[self.shard_for(key)].push(*key);
        }
        let groups: Vec<(usize, Vec<&str>)> = groups
            .into_iter()
            .enumerate()
            .filter(|(_, group)| !group.is_empty())
            .collect();

        match groups.as_slice() {
            [] => Ok(HashMap::new()),
            [(shard, group)] => self.fetch_shard(*shard, group, with_cas),
            _ => self.fan_out(&groups, with_cas),
        }
    }

    fn fan_out(
        &self,
        groups: &[(usize, Vec<&str>)],
        with_cas: bool,
    ) -> McResult<HashMap<String, Item>> {
        let slots: Vec<McResult<HashMap<String, Item>>> = thread::scope(|scope| {
            let workers: Vec<_> = groups
                .iter()
                .map(|(shard, group)| {
                    trace!(shard, keys = group.len(), "spawning shard fetch");
                    scope.spawn(move || self.fetch_shard(*shard, group, with_cas))
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
                .collect()
        });

        let mut items = HashMap::new();
        for slot in slots {
            items.extend(slot?);
        }
        Ok(items)
    }

    fn fetch_shard(
        &self,
        shard: usize,
        keys: &[&str],
        with_cas: bool,
    ) -> McResult<HashMap<String, Item>> {
        let mut conn = self.pools[shard].acquire()?;
        let result = self.protocol.fetch(&mut conn, keys, with_cas);
        if let Err(err) = &result {
            if err.taints_connection() {
                debug!(shard, error = %err, "discarding connection");
                conn.taint();
            }
        }
        result
    }

    /// Closes every shard pool.
    pub fn close(&self) {
        for pool in &self.pools {
            pool.close();
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        self.pools.iter().map(Pool::stats).collect()
    }
}
