//! # Text Protocol Codec
//!
//! Purpose: Encode memcached ASCII commands and parse their replies without
//! over- or under-reading the stream.
//!
//! ## Design Principles
//! 1. **State-Free Parsing**: Each call writes one request and reads exactly its
//!    reply; nothing is carried between calls except the buffered reader.
//! 2. **Binary-Safe Values**: Value bodies are read as exactly `bytes + 2` raw
//!    bytes, never line-scanned, since a value may itself contain `\r\n`.
//! 3. **Bounded Lines**: Status and header lines are read through a length cap so
//!    an unexpected reply cannot make the reader consume an unbounded stream.
//! 4. **Buffer Reuse**: Requests are framed into the connection's write buffer.
//!
//! ## Wire Shapes
//!
//! ```text
//! set|add|replace <key> <flags> <exptime> <bytes> [noreply]\r\n<data>\r\n
//! cas <key> <flags> <exptime> <bytes> <cas unique>\r\n<data>\r\n
//! incr|decr <key> <delta> [noreply]\r\n
//! delete <key> [noreply]\r\n
//! get|gets <key>*\r\n
//!   -> (VALUE <key> <flags> <bytes> [<cas unique>]\r\n<data>\r\n)* END\r\n
//! ```

use std::collections::HashMap;
use std::io::{BufRead, Read};

use bytes::{BufMut, Bytes, BytesMut};

use shardmc_common::{Item, McError, McResult, Operation};

use crate::pool::{Connection, Transport};
use crate::protocol::Codec;

/// Longest store reply, `NOT_STORED\r\n`.
const MAX_STATUS_LINE: u64 = 12;

/// Counter reply: up to 20 digits plus CRLF.
const MAX_COUNTER_LINE: u64 = 22;

/// `VALUE ` + 250-byte key + three numeric fields, with headroom.
const MAX_VALUE_LINE: u64 = 512;

/// Upper bound on a single value body accepted from the server.
const MAX_VALUE_LEN: usize = 1 << 30;

/// Memcached ASCII protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextCodec;

impl Codec for TextCodec {
    fn store<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        op: &Operation,
        item: &mut Item,
    ) -> McResult<()> {
        if !(op.is_store() || op.is_arithmetic() || op.command == "delete") {
            return Err(McError::OperationNotSupported);
        }

        conn.write_buf.clear();
        encode_store(&mut conn.write_buf, op, item)?;
        conn.flush_request()?;
        if op.quiet {
            return Ok(());
        }

        let limit = if op.is_arithmetic() {
            MAX_COUNTER_LINE
        } else {
            MAX_STATUS_LINE
        };
        read_line(&mut conn.reader, &mut conn.line_buf, limit)?;
        check_store_reply(&conn.line_buf, op, item)
    }

    fn fetch<T: Transport>(
        &self,
        conn: &mut Connection<T>,
        keys: &[&str],
        with_cas: bool,
    ) -> McResult<HashMap<String, Item>> {
        let command: &[u8] = if with_cas { b"gets" } else { b"get" };
        conn.write_buf.clear();
        conn.write_buf.put_slice(command);
        for key in keys {
            conn.write_buf.put_u8(b' ');
            conn.write_buf.put_slice(key.as_bytes());
        }
        conn.write_buf.put_slice(b"\r\n");
        conn.flush_request()?;

        let mut items = HashMap::with_capacity(keys.len());
        loop {
            read_line(&mut conn.reader, &mut conn.line_buf, MAX_VALUE_LINE)?;
            match conn.line_buf.as_slice() {
                b"END" => return Ok(items),
                b"ERROR" => return Err(McError::OperationNotSupported),
                _ => {}
            }
            let header = parse_value_line(&conn.line_buf)?;
            let value = read_value(&mut conn.reader, header.len)?;
            let item = Item {
                key: header.key.clone(),
                value,
                expiration: 0,
                flags: header.flags,
                cas: header.cas.unwrap_or(0),
            };
            items.insert(header.key, item);
        }
    }
}

/// Parsed `VALUE` header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueLine {
    pub key: String,
    pub flags: u32,
    pub len: usize,
    pub cas: Option<u64>,
}

/// Scans a leading run of ASCII digits.
///
/// Returns the value and the number of bytes consumed, or `None` when `data`
/// does not start with a digit or the number overflows `u64`.
pub fn parse_uint(data: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut idx = 0;
    while idx < data.len() && data[idx].is_ascii_digit() {
        value = value
            .checked_mul(10)?
            .checked_add((data[idx] - b'0') as u64)?;
        idx += 1;
    }
    if idx == 0 {
        None
    } else {
        Some((value, idx))
    }
}

/// Parses `VALUE <key> <flags> <bytes> [<cas>]` (CRLF already stripped) in one pass.
pub fn parse_value_line(line: &[u8]) -> McResult<ValueLine> {
    let malformed = || {
        McError::invalid_response(format!(
            "malformed value line {:?}",
            String::from_utf8_lossy(line)
        ))
    };

    let rest = line.strip_prefix(b"VALUE ").ok_or_else(malformed)?;
    let key_len = rest.iter().position(|&b| b == b' ').ok_or_else(malformed)?;
    let key = std::str::from_utf8(&rest[..key_len])
        .map_err(|_| malformed())?
        .to_owned();
    let mut pos = key_len + 1;

    let (flags, n) = parse_uint(&rest[pos..]).ok_or_else(malformed)?;
    let flags = u32::try_from(flags).map_err(|_| malformed())?;
    pos = expect_space(rest, pos + n).ok_or_else(malformed)?;

    let (len, n) = parse_uint(&rest[pos..]).ok_or_else(malformed)?;
    let len = usize::try_from(len).map_err(|_| malformed())?;
    pos += n;

    let cas = if pos == rest.len() {
        None
    } else {
        pos = expect_space(rest, pos).ok_or_else(malformed)?;
        let (cas, n) = parse_uint(&rest[pos..]).ok_or_else(malformed)?;
        if pos + n != rest.len() {
            return Err(malformed());
        }
        Some(cas)
    };

    Ok(ValueLine {
        key,
        flags,
        len,
        cas,
    })
}

fn expect_space(data: &[u8], pos: usize) -> Option<usize> {
    (data.get(pos) == Some(&b' ')).then_some(pos + 1)
}

/// Parses `data` as a whole unsigned decimal number (no sign, no padding).
pub(crate) fn parse_decimal(data: &[u8]) -> Option<u64> {
    match parse_uint(data) {
        Some((value, n)) if n == data.len() => Some(value),
        _ => None,
    }
}

fn encode_store(buf: &mut BytesMut, op: &Operation, item: &Item) -> McResult<()> {
    if op.is_arithmetic() && parse_decimal(&item.value).is_none() {
        return Err(McError::InvalidArguments);
    }

    buf.put_slice(op.command.as_bytes());
    buf.put_u8(b' ');
    buf.put_slice(item.key.as_bytes());
    if op.is_store() {
        buf.put_u8(b' ');
        push_u64(buf, item.flags as u64);
        buf.put_u8(b' ');
        push_u64(buf, item.expiration as u64);
        buf.put_u8(b' ');
        push_u64(buf, item.value.len() as u64);
        if op.command == "cas" {
            buf.put_u8(b' ');
            push_u64(buf, item.cas);
        }
    } else if op.is_arithmetic() {
        buf.put_u8(b' ');
        buf.put_slice(&item.value);
    }
    if op.quiet {
        buf.put_slice(b" noreply");
    }
    buf.put_slice(b"\r\n");
    if op.is_store() {
        buf.put_slice(&item.value);
        buf.put_slice(b"\r\n");
    }
    Ok(())
}

fn check_store_reply(line: &[u8], op: &Operation, item: &mut Item) -> McResult<()> {
    match line {
        b"STORED" | b"DELETED" => Ok(()),
        b"NOT_STORED" => Err(McError::ItemNotStored),
        b"EXISTS" => Err(McError::ItemExists),
        b"NOT_FOUND" => Err(McError::ItemNotFound),
        b"ERROR" => Err(McError::OperationNotSupported),
        counter if op.is_arithmetic() && parse_decimal(counter).is_some() => {
            item.value = Bytes::copy_from_slice(counter);
            Ok(())
        }
        other => Err(McError::invalid_response(format!(
            "unrecognized response {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

/// Reads one CRLF-terminated line of at most `limit` bytes into `buf`, CRLF stripped.
fn read_line<R: BufRead>(reader: &mut R, buf: &mut Vec<u8>, limit: u64) -> McResult<()> {
    buf.clear();
    let bytes = reader.by_ref().take(limit).read_until(b'\n', buf)?;
    if bytes == 0 {
        return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
    }
    if !buf.ends_with(b"\r\n") {
        return Err(McError::invalid_response(format!(
            "unterminated response line {:?}",
            String::from_utf8_lossy(buf)
        )));
    }
    buf.truncate(buf.len() - 2);
    Ok(())
}

/// Reads exactly `len` value bytes plus the trailing CRLF.
fn read_value<R: Read>(reader: &mut R, len: usize) -> McResult<Bytes> {
    if len > MAX_VALUE_LEN {
        return Err(McError::invalid_response(format!("value length {len} too large")));
    }
    let mut body = vec![0u8; len + 2];
    reader.read_exact(&mut body)?;
    if &body[len..] != b"\r\n" {
        return Err(McError::invalid_response("value not terminated by CRLF"));
    }
    body.truncate(len);
    Ok(Bytes::from(body))
}

fn push_u64(out: &mut BytesMut, mut value: u64) {
    // Digits go into a stack buffer first to avoid a temporary String.
    let mut buf = [0u8; 20];
    let mut len = 0;
    if value == 0 {
        buf[0] = b'0';
        len = 1;
    } else {
        while value > 0 {
            buf[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
    }
    for idx in (0..len).rev() {
        out.put_u8(buf[idx]);
    }
}
