//! # Cache Item
//!
//! A stored cache entry as seen by the client. Callers build one before a
//! store; codecs fill one in on fetch (value, flags and cas, with the key
//! echoed back). It is a plain value and is never owned by a pool or codec.

use bytes::Bytes;

/// Cache entry exchanged with the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    /// Key, validated by the facade before any network access.
    pub key: String,
    /// Raw value bytes. For incr/decr this holds the ASCII decimal delta.
    pub value: Bytes,
    /// Expiration in seconds (or a unix timestamp, server semantics); 0 never expires.
    pub expiration: u32,
    /// Opaque client flags stored alongside the value.
    pub flags: u32,
    /// CAS token; 0 means "no token".
    pub cas: u64,
}

impl Item {
    /// Creates an item with zero flags, expiration and cas.
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            ..Item::default()
        }
    }

    /// Sets the client flags.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    /// Sets the expiration.
    pub fn with_expiration(mut self, expiration: u32) -> Self {
        self.expiration = expiration;
        self
    }

    /// Sets the CAS token used by conditional stores.
    pub fn with_cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }
}
