//! In-process fake memcached for integration tests.
//!
//! Speaks both wire protocols on the same port (a request starting with 0x80 is
//! binary) and keeps its own clock so expiration can be tested without sleeping.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Address nothing is listening on.
pub fn dead_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    listener.local_addr().expect("addr").to_string()
}

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
    expires_at: Option<Duration>,
}

enum Store {
    Set,
    Add,
    Replace,
    Cas(u64),
}

enum Outcome {
    Stored(u64),
    NotStored,
    Exists,
    NotFound,
}

enum Counter {
    Value(u64, u64),
    NotFound,
    NonNumeric,
}

#[derive(Default)]
struct State {
    items: Mutex<HashMap<String, Entry>>,
    next_cas: AtomicU64,
    now: Mutex<Duration>,
    connections: AtomicUsize,
    keys_seen: Mutex<Vec<String>>,
}

impl State {
    fn now(&self) -> Duration {
        *self.now.lock()
    }

    fn expiry(&self, expiration: u32) -> Option<Duration> {
        (expiration != 0).then(|| self.now() + Duration::from_secs(expiration as u64))
    }

    fn live(&self, items: &mut HashMap<String, Entry>, key: &str) -> Option<Entry> {
        let now = self.now();
        match items.get(key) {
            Some(entry) if entry.expires_at.is_some_and(|at| at <= now) => {
                items.remove(key);
                None
            }
            other => other.cloned(),
        }
    }

    fn get(&self, key: &str) -> Option<Entry> {
        self.keys_seen.lock().push(key.to_owned());
        let mut items = self.items.lock();
        self.live(&mut items, key)
    }

    fn store(&self, mode: Store, key: &str, value: Vec<u8>, flags: u32, expiration: u32) -> Outcome {
        self.keys_seen.lock().push(key.to_owned());
        let mut items = self.items.lock();
        let existing = self.live(&mut items, key);
        match (&mode, &existing) {
            (Store::Add, Some(_)) => return Outcome::NotStored,
            (Store::Replace, None) => return Outcome::NotStored,
            (Store::Cas(_), None) => return Outcome::NotFound,
            (Store::Cas(cas), Some(entry)) if entry.cas != *cas => return Outcome::Exists,
            _ => {}
        }
        let cas = self.next_cas.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = Entry {
            value,
            flags,
            cas,
            expires_at: self.expiry(expiration),
        };
        items.insert(key.to_owned(), entry);
        Outcome::Stored(cas)
    }

    fn delete(&self, key: &str) -> bool {
        self.keys_seen.lock().push(key.to_owned());
        let mut items = self.items.lock();
        self.live(&mut items, key).is_some() && items.remove(key).is_some()
    }

    fn arith(&self, key: &str, delta: u64, incr: bool, seed: Option<(u64, u32)>) -> Counter {
        self.keys_seen.lock().push(key.to_owned());
        let mut items = self.items.lock();
        let cas = self.next_cas.fetch_add(1, Ordering::SeqCst) + 1;
        let Some(mut entry) = self.live(&mut items, key) else {
            let Some((initial, expiration)) = seed else {
                return Counter::NotFound;
            };
            let entry = Entry {
                value: initial.to_string().into_bytes(),
                flags: 0,
                cas,
                expires_at: self.expiry(expiration),
            };
            items.insert(key.to_owned(), entry);
            return Counter::Value(initial, cas);
        };
        let Some(current) = std::str::from_utf8(&entry.value)
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        else {
            return Counter::NonNumeric;
        };
        let next = if incr {
            current.wrapping_add(delta)
        } else {
            current.saturating_sub(delta)
        };
        entry.value = next.to_string().into_bytes();
        entry.cas = cas;
        items.insert(key.to_owned(), entry);
        Counter::Value(next, cas)
    }
}

/// Fake memcached bound to an ephemeral localhost port.
pub struct FakeServer {
    addr: String,
    state: Arc<State>,
}

impl FakeServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        let state = Arc::new(State::default());

        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                shared.connections.fetch_add(1, Ordering::SeqCst);
                let state = shared.clone();
                thread::spawn(move || {
                    let _ = serve(&state, stream);
                });
            }
        });

        FakeServer { addr, state }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Every key this server was asked about, in arrival order.
    pub fn keys_seen(&self) -> Vec<String> {
        self.state.keys_seen.lock().clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state.items.lock().contains_key(key)
    }

    /// Moves the server's expiration clock forward.
    pub fn advance(&self, by: Duration) {
        *self.state.now.lock() += by;
    }
}

fn serve(state: &State, stream: TcpStream) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    loop {
        let first = match reader.fill_buf()? {
            [] => return Ok(()),
            buf => buf[0],
        };
        let reply = if first == 0x80 {
            binary_request(state, &mut reader)?
        } else {
            text_request(state, &mut reader)?
        };
        if !reply.is_empty() {
            writer.write_all(&reply)?;
            writer.flush()?;
        }
    }
}

fn text_request(state: &State, reader: &mut BufReader<TcpStream>) -> io::Result<Vec<u8>> {
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let parts: Vec<&str> = line.trim_end_matches("\r\n").split(' ').collect();
    let noreply = parts.last() == Some(&"noreply");
    let num = |idx: usize| parts.get(idx).and_then(|s| s.parse::<u64>().ok());

    let reply: Vec<u8> = match parts[0] {
        "get" | "gets" => {
            let mut out = Vec::new();
            for key in &parts[1..] {
                if let Some(entry) = state.get(key) {
                    let header = if parts[0] == "gets" {
                        format!("VALUE {key} {} {} {}\r\n", entry.flags, entry.value.len(), entry.cas)
                    } else {
                        format!("VALUE {key} {} {}\r\n", entry.flags, entry.value.len())
                    };
                    out.extend_from_slice(header.as_bytes());
                    out.extend_from_slice(&entry.value);
                    out.extend_from_slice(b"\r\n");
                }
            }
            out.extend_from_slice(b"END\r\n");
            out
        }
        cmd @ ("set" | "add" | "replace" | "cas") => {
            let (Some(flags), Some(exp), Some(len)) = (num(2), num(3), num(4)) else {
                return Ok(b"CLIENT_ERROR bad command line format\r\n".to_vec());
            };
            let mut body = vec![0u8; len as usize + 2];
            reader.read_exact(&mut body)?;
            body.truncate(len as usize);
            let mode = match cmd {
                "set" => Store::Set,
                "add" => Store::Add,
                "replace" => Store::Replace,
                _ => Store::Cas(num(5).unwrap_or(0)),
            };
            match state.store(mode, parts[1], body, flags as u32, exp as u32) {
                Outcome::Stored(_) => b"STORED\r\n".to_vec(),
                Outcome::NotStored => b"NOT_STORED\r\n".to_vec(),
                Outcome::Exists => b"EXISTS\r\n".to_vec(),
                Outcome::NotFound => b"NOT_FOUND\r\n".to_vec(),
            }
        }
        "delete" => {
            if state.delete(parts[1]) {
                b"DELETED\r\n".to_vec()
            } else {
                b"NOT_FOUND\r\n".to_vec()
            }
        }
        cmd @ ("incr" | "decr") => {
            let Some(delta) = num(2) else {
                return Ok(b"CLIENT_ERROR invalid numeric delta argument\r\n".to_vec());
            };
            match state.arith(parts[1], delta, cmd == "incr", None) {
                Counter::Value(value, _) => format!("{value}\r\n").into_bytes(),
                Counter::NotFound => b"NOT_FOUND\r\n".to_vec(),
                Counter::NonNumeric => b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n".to_vec(),
            }
        }
        _ => b"ERROR\r\n".to_vec(),
    };

    Ok(if noreply { Vec::new() } else { reply })
}

fn binary_request(state: &State, reader: &mut BufReader<TcpStream>) -> io::Result<Vec<u8>> {
    let mut header = [0u8; 24];
    reader.read_exact(&mut header)?;
    let opcode = header[1];
    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extras_len = header[4] as usize;
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let cas = u64::from_be_bytes(header[16..24].try_into().expect("cas"));

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;
    let extras = &body[..extras_len];
    let key = String::from_utf8_lossy(&body[extras_len..extras_len + key_len]).into_owned();
    let value = body[extras_len + key_len..].to_vec();

    let quiet = matches!(opcode, 0x09 | 0x0d | 0x11..=0x16);
    let reply = |status: u16, cas: u64, extras: &[u8], key: &[u8], value: &[u8]| {
        packet(opcode, status, opaque, cas, extras, key, value)
    };

    let out = match opcode {
        0x00 | 0x09 | 0x0c | 0x0d => {
            let with_key = matches!(opcode, 0x0c | 0x0d);
            let echoed: &[u8] = if with_key { key.as_bytes() } else { &[] };
            match state.get(&key) {
                Some(entry) => reply(0, entry.cas, &entry.flags.to_be_bytes(), echoed, &entry.value),
                None if quiet => Vec::new(),
                None => reply(0x0001, 0, &[], echoed, b"Not found"),
            }
        }
        0x01..=0x03 | 0x11..=0x13 => {
            let flags = u32::from_be_bytes(extras[..4].try_into().expect("flags"));
            let exp = u32::from_be_bytes(extras[4..8].try_into().expect("exp"));
            let mode = match opcode & 0x0f {
                0x01 if cas != 0 => Store::Cas(cas),
                0x01 => Store::Set,
                0x02 => Store::Add,
                _ => Store::Replace,
            };
            let is_add = opcode & 0x0f == 0x02;
            match state.store(mode, &key, value, flags, exp) {
                Outcome::Stored(_) if quiet => Vec::new(),
                Outcome::Stored(cas) => reply(0, cas, &[], &[], &[]),
                Outcome::NotStored if is_add => reply(0x0002, 0, &[], &[], b"Data exists for key."),
                Outcome::NotStored | Outcome::NotFound => reply(0x0001, 0, &[], &[], b"Not found"),
                Outcome::Exists => reply(0x0002, 0, &[], &[], b"Data exists for key."),
            }
        }
        0x04 | 0x14 => {
            if state.delete(&key) {
                if quiet {
                    Vec::new()
                } else {
                    reply(0, 0, &[], &[], &[])
                }
            } else {
                reply(0x0001, 0, &[], &[], b"Not found")
            }
        }
        0x05 | 0x06 | 0x15 | 0x16 => {
            let delta = u64::from_be_bytes(extras[..8].try_into().expect("delta"));
            let initial = u64::from_be_bytes(extras[8..16].try_into().expect("initial"));
            let exp = u32::from_be_bytes(extras[16..20].try_into().expect("exp"));
            let seed = (exp != 0xffff_ffff).then_some((initial, exp));
            match state.arith(&key, delta, opcode & 0x0f == 0x05, seed) {
                Counter::Value(_, _) if quiet => Vec::new(),
                Counter::Value(value, cas) => reply(0, cas, &[], &[], &value.to_be_bytes()),
                Counter::NotFound => reply(0x0001, 0, &[], &[], b"Not found"),
                Counter::NonNumeric => reply(0x0006, 0, &[], &[], b"Non-numeric server-side value for incr or decr"),
            }
        }
        _ => reply(0x0081, 0, &[], &[], b"Unknown command"),
    };
    Ok(out)
}

fn packet(opcode: u8, status: u16, opaque: u32, cas: u64, extras: &[u8], key: &[u8], value: &[u8]) -> Vec<u8> {
    let body_len = extras.len() + key.len() + value.len();
    let mut out = Vec::with_capacity(24 + body_len);
    out.push(0x81);
    out.push(opcode);
    out.extend_from_slice(&(key.len() as u16).to_be_bytes());
    out.push(extras.len() as u8);
    out.push(0);
    out.extend_from_slice(&status.to_be_bytes());
    out.extend_from_slice(&(body_len as u32).to_be_bytes());
    out.extend_from_slice(&opaque.to_be_bytes());
    out.extend_from_slice(&cas.to_be_bytes());
    out.extend_from_slice(extras);
    out.extend_from_slice(key);
    out.extend_from_slice(value);
    out
}
