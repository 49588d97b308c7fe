//! # Connection Pool
//!
//! Purpose: Reuse server connections for one shard, bounding both the idle set
//! and the number of connections checked out at once.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded, oldest-first list of idle connections.
//! 2. **Minimal Locking**: Hold the mutex only for the bookkeeping decision; dialing,
//!    socket option calls and closing happen outside the lock.
//! 3. **Lazy Eviction**: Expired idle connections are closed on the next `acquire`,
//!    not by a background sweep.
//! 4. **RAII Checkout**: `PooledConnection` hands the connection back on drop, or
//!    closes it when it was marked tainted.
//!
//! ## Structure Overview
//!
//! ```text
//! Pool<T>
//!   └── inner: Arc<PoolInner<T>>
//!         ├── dial: DialFn<T>
//!         ├── clock: Arc<dyn Clock>
//!         └── state: Mutex<PoolState<T>>
//!               ├── config: PoolConfig
//!               ├── idle: VecDeque<IdleConn<T>>   (front = oldest)
//!               ├── active: usize
//!               └── closed: bool
//! ```

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::net::TcpStream;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use shardmc_common::{McError, McResult};

use crate::clock::Clock;

/// Byte stream a pool can manage.
///
/// Closing is dropping: a connection is closed when its transport is dropped.
pub trait Transport: Read + Write + Send {
    /// Applies the per-operation read/write deadline. `None` disables it.
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
}

impl Transport for TcpStream {
    fn set_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)?;
        self.set_write_timeout(timeout)
    }
}

/// Opens a new transport to the pool's server.
pub type DialFn<T> = Box<dyn Fn() -> io::Result<T> + Send + Sync>;

/// Limits and timeouts for one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Maximum idle connections kept for reuse.
    pub max_idle_conns: usize,
    /// Maximum connections checked out at the same time.
    pub max_active_conns: usize,
    /// Idle connections older than this are closed instead of reused.
    pub idle_timeout: Duration,
    /// Read/write deadline applied at checkout. Zero disables it.
    pub socket_timeout: Duration,
}

impl PoolConfig {
    /// Returns the config with `idle_timeout` raised to at least `socket_timeout`.
    pub fn normalized(mut self) -> Self {
        self.idle_timeout = self.idle_timeout.max(self.socket_timeout);
        self
    }
}

/// Point-in-time view of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub closed: bool,
}

/// Single server connection with reusable buffers.
///
/// The reader stays attached to the connection so bytes buffered past one
/// response are not lost before the next request.
pub struct Connection<T: Transport> {
    pub(crate) reader: BufReader<T>,
    pub(crate) line_buf: Vec<u8>,
    pub(crate) write_buf: BytesMut,
    opaque: u32,
}

impl<T: Transport> Connection<T> {
    pub fn new(stream: T) -> Self {
        Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: BytesMut::with_capacity(256),
            opaque: 0,
        }
    }

    /// Writes and flushes the pending request in `write_buf`.
    pub(crate) fn flush_request(&mut self) -> io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()
    }

    /// Reserves `count` consecutive request ids and returns the first.
    pub(crate) fn reserve_opaques(&mut self, count: u32) -> u32 {
        let base = self.opaque;
        self.opaque = self.opaque.wrapping_add(count);
        base
    }

    fn set_timeout(&self, timeout: Duration) -> io::Result<()> {
        let timeout = if timeout.is_zero() { None } else { Some(timeout) };
        self.reader.get_ref().set_timeout(timeout)
    }
}

struct IdleConn<T: Transport> {
    conn: Connection<T>,
    idle_since: Instant,
}

struct PoolState<T: Transport> {
    config: PoolConfig,
    idle: VecDeque<IdleConn<T>>,
    active: usize,
    closed: bool,
}

struct PoolInner<T: Transport> {
    dial: DialFn<T>,
    clock: Arc<dyn Clock>,
    state: Mutex<PoolState<T>>,
}

/// Connection pool handle for one shard.
pub struct Pool<T: Transport> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Transport> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> Pool<T> {
    /// Creates an empty pool. Connections are dialed lazily on `acquire`.
    pub fn new(config: PoolConfig, dial: DialFn<T>, clock: Arc<dyn Clock>) -> Self {
        let config = config.normalized();
        let state = PoolState {
            config,
            idle: VecDeque::with_capacity(config.max_idle_conns),
            active: 0,
            closed: false,
        };
        Pool {
            inner: Arc::new(PoolInner {
                dial,
                clock,
                state: Mutex::new(state),
            }),
        }
    }

    /// Checks out a connection.
    ///
    /// Expired idle connections are evicted first, oldest to newest, stopping at
    /// the first fresh one. The most recently idled survivor is reused; otherwise
    /// a new connection is dialed if the active ceiling allows it.
    pub fn acquire(&self) -> McResult<PooledConnection<T>> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(McError::PoolClosed);
        }

        let now = self.inner.clock.now();
        let idle_timeout = state.config.idle_timeout;
        let fresh_from = state
            .idle
            .iter()
            .position(|ic| now.saturating_duration_since(ic.idle_since) <= idle_timeout)
            .unwrap_or(state.idle.len());
        let expired: Vec<IdleConn<T>> = state.idle.drain(..fresh_from).collect();

        let reused = state.idle.pop_back().map(|ic| ic.conn);
        let exhausted = reused.is_none() && state.active >= state.config.max_active_conns;
        if !exhausted {
            state.active += 1;
        }
        let socket_timeout = state.config.socket_timeout;
        let (active, idle) = (state.active, state.idle.len());
        drop(state);

        if !expired.is_empty() {
            debug!(count = expired.len(), "evicting expired idle connections");
        }
        drop(expired);

        if exhausted {
            warn!(active, idle, "connection pool exhausted");
            return Err(McError::PoolExhausted);
        }

        let conn = match reused {
            Some(conn) => conn,
            None => match (self.inner.dial)() {
                Ok(stream) => {
                    debug!(active, "dialed new connection");
                    Connection::new(stream)
                }
                Err(err) => {
                    self.release_slot();
                    return Err(err.into());
                }
            },
        };

        let mut pooled = PooledConnection::new(self.inner.clone(), conn);
        if let Err(err) = pooled.set_timeout(socket_timeout) {
            pooled.taint();
            return Err(err.into());
        }
        Ok(pooled)
    }

    /// Marks the pool closed and closes every idle connection.
    ///
    /// Connections still checked out are closed when they are released.
    pub fn close(&self) {
        let mut state = self.inner.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let idle: Vec<IdleConn<T>> = state.idle.drain(..).collect();
        drop(state);
        debug!(count = idle.len(), "pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            idle: state.idle.len(),
            active: state.active,
            closed: state.closed,
        }
    }

    pub fn config(&self) -> PoolConfig {
        self.inner.state.lock().config
    }

    pub fn set_max_idle_conns(&self, max_idle_conns: usize) {
        self.inner.state.lock().config.max_idle_conns = max_idle_conns;
    }

    pub fn set_max_active_conns(&self, max_active_conns: usize) {
        self.inner.state.lock().config.max_active_conns = max_active_conns;
    }

    /// Sets the idle timeout, floored at the socket timeout.
    pub fn set_idle_timeout(&self, idle_timeout: Duration) {
        let mut state = self.inner.state.lock();
        state.config.idle_timeout = idle_timeout;
        state.config = state.config.normalized();
    }

    /// Sets the socket timeout; the idle timeout is raised to match if needed.
    pub fn set_socket_timeout(&self, socket_timeout: Duration) {
        let mut state = self.inner.state.lock();
        state.config.socket_timeout = socket_timeout;
        state.config = state.config.normalized();
    }

    fn release_slot(&self) {
        let mut state = self.inner.state.lock();
        state.active = state.active.saturating_sub(1);
    }
}

impl<T: Transport> PoolInner<T> {
    fn release(&self, conn: Connection<T>, tainted: bool) {
        let mut state = self.state.lock();
        state.active = state.active.saturating_sub(1);
        if !tainted && !state.closed && state.idle.len() < state.config.max_idle_conns {
            let idle_since = self.clock.now();
            state.idle.push_back(IdleConn { conn, idle_since });
            return;
        }
        let closed = state.closed;
        drop(state);
        trace!(tainted, closed, "closing released connection");
        drop(conn);
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection<T: Transport> {
    pool: Arc<PoolInner<T>>,
    conn: Option<Connection<T>>,
    tainted: bool,
}

impl<T: Transport> PooledConnection<T> {
    fn new(pool: Arc<PoolInner<T>>, conn: Connection<T>) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            tainted: false,
        }
    }

    /// Marks the connection unusable; it is closed instead of pooled on drop.
    pub fn taint(&mut self) {
        self.tainted = true;
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted
    }
}

impl<T: Transport> Deref for PooledConnection<T> {
    type Target = Connection<T>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection exists")
    }
}

impl<T: Transport> DerefMut for PooledConnection<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection exists")
    }
}

impl<T: Transport> Drop for PooledConnection<T> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.tainted);
        }
    }
}
