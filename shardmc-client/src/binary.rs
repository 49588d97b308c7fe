//! # Binary Protocol Codec
//!
//! Purpose: Frame memcached binary packets and read them back with exact,
//! length-driven reads.
//!
//! ## Design Principles
//! 1. **Fixed Header First**: Every response is read as a 24-byte header, then
//!    exactly `body_length` bytes, sliced into extras/key/value.
//! 2. **Opaque Correlation**: Each request carries a per-connection id in
//!    `opaque`. Replies with an unexpected id (late errors from quiet commands)
//!    are skipped rather than mistaken for the current reply.
//! 3. **Single Round Trip Multi-Get**: N-1 `getkq` requests plus one `getk`
//!    are pipelined; the non-quiet tail guarantees a terminating reply.
//! 4. **Stay In Sync**: A multi-get that hits a server error keeps draining
//!    until the terminal reply, so the connection can be reused.
//!
//! ## Header Layout
//!
//! ```text
//!  0 | magic:1 | opcode:1 | key_length:2               |
//!  4 | extras_length:1 | data_type:1 | status/vbucket:2 |
//!  8 | body_length:4                                   |
//! 12 | opaque:4                                        |
//! 16 | cas:8                                           |
//! 24 | extras | key | value                            |
//! ```
//!
//! All integers are big-endian; `body_length = extras + key + value`.

use std::collections::HashMap;
use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use shardmc_common::{Item, McError, McResult, Operation, ServerStatus, GETK, GETKQ};

use crate::pool::{Connection, Transport};
use crate::protocol::Codec;
use crate::text::parse_decimal;

/// Magic byte for request packets.
pub const REQUEST_MAGIC: u8 = 0x80;

/// Magic byte for response packets.
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Fixed header size for both directions.
pub const HEADER_SIZE: usize = 24;

/// Status code for a cache miss.
pub const STATUS_KEY_NOT_FOUND: u16 = 0x0001;

/// incr/decr expiration telling the server to fail on a missing key instead
/// of seeding it with the initial value.
pub const ARITHMETIC_NO_CREATE: u32 = 0xffff_ffff;

/// Upper bound on a response body accepted from the server.
const MAX_BODY_LEN: usize = (1 << 30) + 512;

/// 24-byte packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    /// Response status; vbucket id on requests (always zero here).
    pub status: u16,
    pub body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Request header for `opcode` with every other field zeroed.
    pub fn request(opcode: u8) -> Self {
        Header {
            magic: REQUEST_MAGIC,
            opcode,
            ..Header::default()
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extras_length);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status);
        buf.put_u32(self.body_length);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    pub fn decode(raw: &[u8; HEADER_SIZE]) -> Self {
        let mut buf = &raw[..];
        Header {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            key_length: buf.get_u16(),
            extras_length: buf.get_u8(),
            data_type: buf.get_u8(),
            status: buf.get_u16(),
            body_length: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        }
    }
}

/// A decoded response: header plus the body split into its three segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

/// Appends one request packet to `buf`, filling in the length fields.
pub fn encode_request(
    buf: &mut BytesMut,
    mut header: Header,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> McResult<()> {
    header.key_length = u16::try_from(key.len()).map_err(|_| McError::InvalidArguments)?;
    header.extras_length = u8::try_from(extras.len()).map_err(|_| McError::InvalidArguments)?;
    header.body_length = u32::try_from(extras.len() + key.len() + value.len())
        .map_err(|_| McError::InvalidArguments)?;

    buf.reserve(HEADER_SIZE + header.body_length as usize);
    header.encode(buf);
    buf.put_slice(extras);
    buf.put_slice(key);
    buf.put_slice(value);
    Ok(())
}

/// Reads one response packet: the fixed header, then exactly `body_length` bytes.
pub fn read_packet<R: Read>(reader: &mut R) -> McResult<Packet> {
    let mut raw = [0u8; HEADER_SIZE];
    reader.read_exact(&mut raw)?;
    let header = Header::decode(&raw);
    if header.magic != RESPONSE_MAGIC {
        return Err(McError::invalid_response(format!(
            "bad response magic {:#04x}",
            header.magic
        )));
    }

    let body_len = header.body_length as usize;
    let extras_len = header.extras_length as usize;
    let key_len = header.key_length as usize;
    if body_len > MAX_BODY_LEN || extras_len + key_len > body_len {
        return Err(McError::invalid_response(format!(
            "inconsistent body length {body_len} (extras {extras_len}, key {key_len})"
        )));
    }

    let mut body = BytesMut::zeroed(body_len);
    reader.read_exact(&mut body)?;
    let mut body = body.freeze();
    let extras = body.split_to(extras_len);
    let key = body.split_to(key_len);
    Ok(Packet {
        header,
        extras,
        key,
        value: body,
    })
}

/// Maps a non-zero status to its error. Zero maps to `None`.
pub fn status_error(status: u16) -> Option<McError> {
    let err = match status {
        0x0000 => return None,
        0x0001 => McError::ItemNotFound,
        0x0002 => McError::ItemExists,
        0x0003 => McError::Server(ServerStatus::ValueTooLarge),
        0x0004 => McError::InvalidArguments,
        0x0005 => McError::ItemNotStored,
        0x0006 => McError::Server(ServerStatus::NonNumericValue),
        0x0007 => McError::Server(ServerStatus::WrongVbucket),
        0x0008 => McError::Server(ServerStatus::AuthError),
        0x0009 => McError::Server(ServerStatus::AuthContinue),
        0x0081 => McError::Server(ServerStatus::UnknownCommand),
        0x0082 => McError::Server(ServerStatus::OutOfMemory),
        0x0083 => McError::Server(ServerStatus::NotSupported),
        0x0084 => McError::Server(ServerStatus::InternalError),
        0x0085 => McError::Server(ServerStatus::Busy),
        0x0086 => McError::Server(ServerStatus::TemporaryFailure),
        other => McError::UnknownStatus(other),
    };
    Some(err)
}

/// Memcached binary protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryCodec;

impl Codec for BinaryCodec {
    fn store<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        op: &Operation,
        item: &mut Item,
    ) -> McResult<()> {
        let mut header = Header::request(op.opcode);
        let mut extras = [0u8; 20];
        let empty: &[u8] = &[];
        let (extras_len, value): (usize, &[u8]) = if op.is_store() {
            if op.command == "cas" {
                header.cas = item.cas;
            }
            extras[..4].copy_from_slice(&item.flags.to_be_bytes());
            extras[4..8].copy_from_slice(&item.expiration.to_be_bytes());
            (8, item.value.as_ref())
        } else if op.is_arithmetic() {
            let delta = parse_decimal(&item.value).ok_or(McError::InvalidArguments)?;
            extras[..8].copy_from_slice(&delta.to_be_bytes());
            extras[16..20].copy_from_slice(&item.expiration.to_be_bytes());
            (20, empty)
        } else if op.command == "delete" {
            header.cas = item.cas;
            (0, empty)
        } else {
            return Err(McError::OperationNotSupported);
        };

        header.opaque = conn.reserve_opaques(1);
        conn.write_buf.clear();
        encode_request(
            &mut conn.write_buf,
            header,
            &extras[..extras_len],
            item.key.as_bytes(),
            value,
        )?;
        conn.flush_request()?;
        if op.quiet {
            return Ok(());
        }

        let packet = read_reply(conn, header.opaque)?;
        if let Some(err) = status_error(packet.header.status) {
            return Err(store_error(op, err));
        }
        item.cas = packet.header.cas;
        if op.is_arithmetic() {
            let counter: [u8; 8] = packet.value.as_ref().try_into().map_err(|_| {
                McError::invalid_response(format!(
                    "counter reply of {} bytes",
                    packet.value.len()
                ))
            })?;
            item.value = Bytes::from(u64::from_be_bytes(counter).to_string());
        }
        Ok(())
    }

    /// Binary replies always carry the cas token, so `with_cas` changes nothing.
    fn fetch<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        keys: &[&str],
        _with_cas: bool,
    ) -> McResult<HashMap<String, Item>> {
        let count = keys.len();
        if count == 0 {
            return Ok(HashMap::new());
        }
        let last = count - 1;
        let base = conn.reserve_opaques(count as u32);

        conn.write_buf.clear();
        for (idx, key) in keys.iter().enumerate() {
            let op = if idx == last { &GETK } else { &GETKQ };
            let mut header = Header::request(op.opcode);
            header.opaque = base.wrapping_add(idx as u32);
            encode_request(&mut conn.write_buf, header, &[], key.as_bytes(), &[])?;
        }
        conn.flush_request()?;

        let mut items = HashMap::with_capacity(count);
        let mut first_err = None;
        loop {
            let packet = read_packet(&mut conn.reader)?;
            let idx = packet.header.opaque.wrapping_sub(base) as usize;
            if idx >= count {
                trace!(opaque = packet.header.opaque, "discarding stale response");
                continue;
            }
            match status_error(packet.header.status) {
                None => {
                    let item = packet_item(packet, keys[idx])?;
                    items.insert(item.key.clone(), item);
                }
                Some(McError::ItemNotFound) => {}
                Some(err) => {
                    first_err.get_or_insert(err);
                }
            }
            if idx == last {
                break;
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(items),
        }
    }
}

/// Reads until the reply tagged with `opaque`, skipping stale ones.
fn read_reply<T: Transport>(conn: &mut Connection<T>, opaque: u32) -> McResult<Packet> {
    loop {
        let packet = read_packet(&mut conn.reader)?;
        if packet.header.opaque == opaque {
            return Ok(packet);
        }
        trace!(
            expected = opaque,
            got = packet.header.opaque,
            status = packet.header.status,
            "discarding stale response"
        );
    }
}

/// Binary servers report a failed `add` as exists and a failed `replace` as
/// not found; both are a not-stored outcome, as on the text protocol.
fn store_error(op: &Operation, err: McError) -> McError {
    match (op.command, err) {
        ("add", McError::ItemExists) | ("replace", McError::ItemNotFound) => {
            McError::ItemNotStored
        }
        (_, err) => err,
    }
}

fn packet_item(packet: Packet, requested: &str) -> McResult<Item> {
    let key = if packet.key.is_empty() {
        requested.to_owned()
    } else {
        String::from_utf8(packet.key.to_vec())
            .map_err(|_| McError::invalid_response("non-utf8 key in response"))?
    };
    let flags = match packet.extras.get(..4) {
        Some(raw) => u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        None => 0,
    };
    Ok(Item {
        key,
        value: packet.value,
        expiration: 0,
        flags,
        cas: packet.header.cas,
    })
}
