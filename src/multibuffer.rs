//! Single-writer / many-reader replayable output log

use std::io;
use std::sync::{Arc, Condvar, Mutex};

use crate::errors::{OverseerError, Result};

// TODO: reduce lock contention if it becomes a bottleneck

/// Growable in-memory byte log that any number of readers can consume from
/// the beginning, each at its own pace.
///
/// The writer appends and broadcasts; a reader positioned at the end of the
/// log blocks until new bytes arrive or the buffer is closed. Readers created
/// after close still replay the full history.
pub struct MultiBuffer {
    state: Mutex<State>,
    data_ready: Condvar,
}

struct State {
    buf: Vec<u8>,
    closed: bool,
    // io::Error is not Clone; the terminal error is kept as (kind, message)
    // and re-materialized for every reader that drains the log
    err: Option<(io::ErrorKind, String)>,
}

impl MultiBuffer {
    /// Create an empty, open buffer
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                buf: Vec::new(),
                closed: false,
                err: None,
            }),
            data_ready: Condvar::new(),
        }
    }

    /// Append the given bytes and wake every waiting reader.
    ///
    /// Appending to a closed buffer fails with `ClosedBuffer`. An empty write
    /// succeeds as a no-op without waking anyone.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(OverseerError::ClosedBuffer);
        }

        state.buf.extend_from_slice(bytes);
        self.data_ready.notify_all();

        Ok(bytes.len())
    }

    /// Close the buffer without a terminal error
    pub fn close(&self) -> Result<()> {
        self.close_with_error(None)
    }

    /// Close the buffer, optionally recording a terminal error that readers
    /// will receive once their offset reaches the end of the log.
    ///
    /// Only the first close may record an error; closing an already-closed
    /// buffer fails with `ClosedBuffer` and leaves the recorded error intact.
    pub fn close_with_error(&self, err: Option<io::Error>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(OverseerError::ClosedBuffer);
        }

        if let Some(e) = err {
            state.err = Some((e.kind(), e.to_string()));
        }

        state.closed = true;
        self.data_ready.notify_all();

        Ok(())
    }

    /// Create a reader positioned at the first byte of the log.
    ///
    /// Allowed at any time, including after close.
    pub fn reader(self: &Arc<Self>) -> Reader {
        Reader {
            parent: Arc::clone(self),
            offset: 0,
        }
    }
}

impl Default for MultiBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reader over a [`MultiBuffer`], independent of every other reader.
///
/// `read` blocks while the buffer is open and fully consumed. After the
/// buffer is closed and drained, `read` returns `Ok(0)` or, if the buffer was
/// closed with an error, that terminal error.
pub struct Reader {
    parent: Arc<MultiBuffer>,
    offset: usize,
}

impl io::Read for Reader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }

        let mut state = self.parent.state.lock().unwrap();

        // Wait for IO if at the end of the log and the writer is still open;
        // re-check after every wake-up
        while self.offset >= state.buf.len() && !state.closed {
            state = self.parent.data_ready.wait(state).unwrap();
        }

        let available = &state.buf[self.offset..];
        let n = available.len().min(dst.len());
        dst[..n].copy_from_slice(&available[..n]);
        self.offset += n;

        if n == 0 {
            // Closed and drained: surface the terminal error, else clean EOF
            if let Some((kind, msg)) = &state.err {
                return Err(io::Error::new(*kind, msg.clone()));
            }
            return Ok(0);
        }

        Ok(n)
    }
}
