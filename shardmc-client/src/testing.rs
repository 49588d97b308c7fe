//! In-memory transport for unit tests.

use std::io::{self, Cursor, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::pool::{Connection, Transport};

/// Duplex stream: reads come from a scripted buffer, writes are captured.
pub(crate) struct MockStream {
    input: Cursor<Vec<u8>>,
    output: Arc<Mutex<Vec<u8>>>,
    closed: Option<Arc<AtomicUsize>>,
}

impl MockStream {
    pub(crate) fn new(input: impl Into<Vec<u8>>) -> Self {
        MockStream {
            input: Cursor::new(input.into()),
            output: Arc::new(Mutex::new(Vec::new())),
            closed: None,
        }
    }

    pub(crate) fn with_close_counter(mut self, closed: Arc<AtomicUsize>) -> Self {
        self.closed = Some(closed);
        self
    }

    pub(crate) fn output(&self) -> Arc<Mutex<Vec<u8>>> {
        self.output.clone()
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.input.read(buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Transport for MockStream {
    fn set_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        if let Some(closed) = &self.closed {
            closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Builds a connection over scripted server bytes and returns the write capture.
pub(crate) fn scripted(input: impl Into<Vec<u8>>) -> (Connection<MockStream>, Arc<Mutex<Vec<u8>>>) {
    let stream = MockStream::new(input);
    let output = stream.output();
    (Connection::new(stream), output)
}
