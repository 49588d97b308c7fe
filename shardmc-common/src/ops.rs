//! # Operation Table
//!
//! Purpose: Map a command identifier ("set", "setq", "cas", "incrementq", ...)
//! to its wire behavior on both protocols.
//!
//! ## Notes
//! - `opcode` is only meaningful to the binary codec; the text codec uses
//!   `command` and `quiet`.
//! - `cas` shares the `set` opcode; the binary codec carries the token in the
//!   header instead of a separate command.
//! - Commands outside this table (append, prepend, stat, flush, ...) are
//!   rejected with `OperationNotSupported`.

/// Static descriptor for one command variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Operation {
    /// Binary protocol opcode.
    pub opcode: u8,
    /// Text protocol command word.
    pub command: &'static str,
    /// No-reply variant: the caller does not wait for a response.
    pub quiet: bool,
    /// The binary response echoes the key.
    pub with_key: bool,
}

impl Operation {
    const fn new(opcode: u8, command: &'static str, quiet: bool, with_key: bool) -> Self {
        Operation {
            opcode,
            command,
            quiet,
            with_key,
        }
    }

    /// True for commands that carry a value body (set, add, replace, cas).
    pub fn is_store(&self) -> bool {
        matches!(self.command, "set" | "add" | "replace" | "cas")
    }

    /// True for incr/decr.
    pub fn is_arithmetic(&self) -> bool {
        matches!(self.command, "incr" | "decr")
    }
}

pub const GET: Operation = Operation::new(0x00, "get", false, false);
pub const SET: Operation = Operation::new(0x01, "set", false, false);
pub const ADD: Operation = Operation::new(0x02, "add", false, false);
pub const REPLACE: Operation = Operation::new(0x03, "replace", false, false);
pub const DELETE: Operation = Operation::new(0x04, "delete", false, false);
pub const INCREMENT: Operation = Operation::new(0x05, "incr", false, false);
pub const DECREMENT: Operation = Operation::new(0x06, "decr", false, false);
pub const GETQ: Operation = Operation::new(0x09, "get", true, false);
pub const GETK: Operation = Operation::new(0x0c, "get", false, true);
pub const GETKQ: Operation = Operation::new(0x0d, "get", true, true);
pub const SETQ: Operation = Operation::new(0x11, "set", true, false);
pub const ADDQ: Operation = Operation::new(0x12, "add", true, false);
pub const REPLACEQ: Operation = Operation::new(0x13, "replace", true, false);
pub const DELETEQ: Operation = Operation::new(0x14, "delete", true, false);
pub const INCREMENTQ: Operation = Operation::new(0x15, "incr", true, false);
pub const DECREMENTQ: Operation = Operation::new(0x16, "decr", true, false);
pub const CAS: Operation = Operation::new(0x01, "cas", false, false);

static OPERATIONS: [(&str, Operation); 17] = [
    ("get", GET),
    ("set", SET),
    ("add", ADD),
    ("replace", REPLACE),
    ("delete", DELETE),
    ("increment", INCREMENT),
    ("decrement", DECREMENT),
    ("getq", GETQ),
    ("getk", GETK),
    ("getkq", GETKQ),
    ("setq", SETQ),
    ("addq", ADDQ),
    ("replaceq", REPLACEQ),
    ("deleteq", DELETEQ),
    ("incrementq", INCREMENTQ),
    ("decrementq", DECREMENTQ),
    ("cas", CAS),
];

/// Looks up a command identifier. Returns `None` for unsupported commands.
pub fn lookup(name: &str) -> Option<&'static Operation> {
    OPERATIONS
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, op)| op)
}
