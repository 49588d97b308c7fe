//! # Synchronous Client API
//!
//! Purpose: Expose a compact, blocking memcached API over a set of sharded,
//! pooled server connections.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides routing, pooling and wire formats.
//! 2. **Fail Fast**: Keys are validated before any connection is checked out.
//! 3. **One Active Codec**: Exactly one protocol is live; switching rebuilds
//!    every shard pool.
//! 4. **Write-Back Items**: Store calls take `&mut Item` so the server's cas
//!    token or counter value can flow back to the caller.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use shardmc_common::{validate_key, Item, McError, McResult};

use crate::binary::ARITHMETIC_NO_CREATE;
use crate::clock::{Clock, SystemClock};
use crate::config::{ClientConfig, ProtocolKind};
use crate::pool::{DialFn, Pool, PoolStats};
use crate::protocol::Protocol;
use crate::shard::ShardedProtocol;
use crate::text::parse_decimal;

/// Sharded memcached client.
///
/// Each call checks out one connection per shard it touches, runs a single
/// exchange, and hands the connection back (or closes it if it is suspect).
pub struct Client {
    config: ClientConfig,
    clock: Arc<dyn Clock>,
    sharded: ShardedProtocol<TcpStream>,
}

impl Client {
    /// Creates a client for `servers` with default configuration.
    pub fn new<I, S>(servers: I) -> McResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_config(ClientConfig::new(servers))
    }

    /// Creates a client with a custom configuration.
    pub fn with_config(config: ClientConfig) -> McResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Creates a client whose pools measure idle time with `clock`.
    pub fn with_clock(config: ClientConfig, clock: Arc<dyn Clock>) -> McResult<Self> {
        config.validate()?;
        let sharded = build_sharded(&config, &clock)?;
        debug!(
            servers = config.servers.len(),
            protocol = %config.protocol,
            "client created"
        );
        Ok(Client {
            config,
            clock,
            sharded,
        })
    }

    /// Stores `item` unconditionally.
    ///
    /// Sent quietly when noreply is on, in which case server-side failures are
    /// not observed.
    pub fn set(&self, item: &mut Item) -> McResult<()> {
        let command = if self.config.noreply { "setq" } else { "set" };
        self.store(command, item)
    }

    /// Stores `item` only if its key is absent.
    pub fn add(&self, item: &mut Item) -> McResult<()> {
        self.store("add", item)
    }

    /// Stores `item` only if its key is present.
    pub fn replace(&self, item: &mut Item) -> McResult<()> {
        self.store("replace", item)
    }

    /// Stores `item` only if `item.cas` still matches the server's token.
    pub fn cas(&self, item: &mut Item) -> McResult<()> {
        self.store("cas", item)
    }

    /// Fetches one key. Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &str) -> McResult<Option<Item>> {
        self.fetch_one(key, false)
    }

    /// Like `get`, with the cas token populated.
    pub fn gets(&self, key: &str) -> McResult<Option<Item>> {
        self.fetch_one(key, true)
    }

    /// Fetches many keys in one round trip per shard.
    ///
    /// Duplicate keys are sent once. Missing keys are absent from the result.
    pub fn multi_get(&self, keys: &[&str]) -> McResult<HashMap<String, Item>> {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            validate_key(key)?;
            if seen.insert(*key) {
                unique.push(*key);
            }
        }
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        self.sharded.fetch(&unique, false)
    }

    /// Removes a key.
    pub fn delete(&self, key: &str) -> McResult<()> {
        validate_key(key)?;
        let command = if self.config.noreply { "deleteq" } else { "delete" };
        let mut item = Item::new(key, "");
        self.sharded.store(command, &mut item)
    }

    /// Adds `delta` to a decimal counter and returns the new value.
    ///
    /// Fails with `ItemNotFound` when the key is missing.
    pub fn increment(&self, key: &str, delta: u64) -> McResult<u64> {
        self.arithmetic("increment", key, delta)
    }

    /// Subtracts `delta` from a decimal counter, saturating at zero on the
    /// server, and returns the new value.
    pub fn decrement(&self, key: &str, delta: u64) -> McResult<u64> {
        self.arithmetic("decrement", key, delta)
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.sharded.protocol().kind()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// One snapshot per shard, in server order.
    pub fn pool_stats(&self) -> Vec<PoolStats> {
        self.sharded.stats()
    }

    /// Closes every shard pool. Later calls fail with `PoolClosed`.
    pub fn close(&self) {
        self.sharded.close();
    }

    pub fn set_noreply(&mut self, noreply: bool) {
        self.config.noreply = noreply;
    }

    /// Switches the wire protocol, replacing every shard pool.
    ///
    /// Connections checked out by in-flight calls are closed when released.
    pub fn set_protocol(&mut self, protocol: ProtocolKind) -> McResult<()> {
        let mut config = self.config.clone();
        config.protocol = protocol;
        let sharded = build_sharded(&config, &self.clock)?;
        let old = std::mem::replace(&mut self.sharded, sharded);
        old.close();
        self.config = config;
        info!(%protocol, "protocol switched");
        Ok(())
    }

    pub fn set_max_idle_conns(&mut self, max_idle_conns: usize) {
        self.config.max_idle_conns = max_idle_conns;
        for pool in self.sharded.pools() {
            pool.set_max_idle_conns(max_idle_conns);
        }
    }

    pub fn set_max_active_conns(&mut self, max_active_conns: usize) {
        self.config.max_active_conns = max_active_conns;
        for pool in self.sharded.pools() {
            pool.set_max_active_conns(max_active_conns);
        }
    }

    /// Sets the idle timeout. Values below the socket timeout are raised to it.
    pub fn set_idle_timeout(&mut self, idle_timeout: Duration) {
        let idle_timeout = idle_timeout.max(self.config.socket_timeout());
        self.config.idle_timeout_ms = duration_ms(idle_timeout);
        for pool in self.sharded.pools() {
            pool.set_idle_timeout(idle_timeout);
        }
    }

    /// Sets the per-operation deadline, raising the idle timeout if needed.
    pub fn set_socket_timeout(&mut self, socket_timeout: Duration) {
        self.config.socket_timeout_ms = duration_ms(socket_timeout);
        self.config.idle_timeout_ms = self.config.idle_timeout_ms.max(self.config.socket_timeout_ms);
        for pool in self.sharded.pools() {
            pool.set_socket_timeout(socket_timeout);
        }
    }

    fn store(&self, command: &str, item: &mut Item) -> McResult<()> {
        validate_key(&item.key)?;
        self.sharded.store(command, item)
    }

    fn fetch_one(&self, key: &str, with_cas: bool) -> McResult<Option<Item>> {
        validate_key(key)?;
        let mut items = self.sharded.fetch(&[key], with_cas)?;
        Ok(items.remove(key))
    }

    fn arithmetic(&self, command: &str, key: &str, delta: u64) -> McResult<u64> {
        validate_key(key)?;
        let mut item = Item::new(key, delta.to_string()).with_expiration(ARITHMETIC_NO_CREATE);
        self.sharded.store(command, &mut item)?;
        parse_decimal(&item.value)
            .ok_or_else(|| McError::invalid_response("counter value is not a decimal"))
    }
}

fn build_sharded(
    config: &ClientConfig,
    clock: &Arc<dyn Clock>,
) -> McResult<ShardedProtocol<TcpStream>> {
    let pool_config = config.pool_config();
    let pools = config
        .servers
        .iter()
        .map(|addr| {
            let dial = tcp_dialer(addr.clone(), config.connect_timeout());
            Pool::new(pool_config, dial, clock.clone())
        })
        .collect();
    ShardedProtocol::new(pools, Protocol::new(config.protocol))
}

/// Dials `addr` (resolved on every attempt) with TCP_NODELAY set.
fn tcp_dialer(addr: String, connect_timeout: Option<Duration>) -> DialFn<TcpStream> {
    Box::new(move || {
        let stream = connect_stream(&addr, connect_timeout)?;
        stream.set_nodelay(true)?;
        Ok(stream)
    })
}

fn connect_stream(addr: &str, connect_timeout: Option<Duration>) -> io::Result<TcpStream> {
    let Some(timeout) = connect_timeout else {
        return TcpStream::connect(addr);
    };
    let mut last_err = None;
    for sock_addr in addr.to_socket_addrs()? {
        match TcpStream::connect_timeout(&sock_addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{addr} did not resolve to any address"),
        )
    }))
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
