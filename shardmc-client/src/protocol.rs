//! # Protocol Dispatch
//!
//! Purpose: One capability contract (`store`, `fetch`) over the two wire
//! formats, resolved once per client instead of per call.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `TextCodec` and `BinaryCodec` implement `Codec`.
//! 2. **Static Dispatch**: `Protocol` is an enum, so the hot path is a `match`
//!    rather than a vtable call, and the generic transport stays monomorphic.
//! 3. **Connection-Scoped**: Codecs operate on a checked-out connection; they
//!    never touch the pool. Taint decisions are made by the caller.

use std::collections::HashMap;

use shardmc_common::{Item, McResult, Operation};

use crate::binary::BinaryCodec;
use crate::config::ProtocolKind;
use crate::pool::{Connection, Transport};
use crate::text::TextCodec;

/// Wire codec contract.
pub trait Codec {
    /// Sends one store-class, arithmetic or delete command for `item`.
    ///
    /// Quiet operations return as soon as the request is written. On success a
    /// codec may write server state back into `item` (cas token, counter value).
    fn store<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        op: &Operation,
        item: &mut Item,
    ) -> McResult<()>;

    /// Fetches `keys` from one server. Misses are absent from the result.
    fn fetch<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        keys: &[&str],
        with_cas: bool,
    ) -> McResult<HashMap<String, Item>>;
}

/// The active wire codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Text(TextCodec),
    Binary(BinaryCodec),
}

impl Protocol {
    pub fn new(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Text => Protocol::Text(TextCodec),
            ProtocolKind::Binary => Protocol::Binary(BinaryCodec),
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        match self {
            Protocol::Text(_) => ProtocolKind::Text,
            Protocol::Binary(_) => ProtocolKind::Binary,
        }
    }
}

impl Codec for Protocol {
    #[inline]
    fn store<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        op: &Operation,
        item: &mut Item,
    ) -> McResult<()> {
        match self {
            Protocol::Text(codec) => codec.store(conn, op, item),
            Protocol::Binary(codec) => codec.store(conn, op, item),
        }
    }

    #[inline]
    fn fetch<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        keys: &[&str],
        with_cas: bool,
    ) -> McResult<HashMap<String, Item>> {
        match self {
            Protocol::Text(codec) => codec.fetch(conn, keys, with_cas),
            Protocol::Binary(codec) => codec.fetch(conn, keys, with_cas),
        }
    }
}
