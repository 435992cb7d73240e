//! In-memory serial line
//!
//! [`VirtualSerial::pair`] returns the engine's end of the line (a
//! [`Transport`]) and a [`LineHandle`] for the test side. Bytes injected
//! through the handle become readable by the engine and raise its readiness
//! callback; bytes the engine writes collect in the handle's output.
//!
//! The line starts in blocking mode: reads wait for injected bytes and writes
//! wait for capacity until the engine switches it to non-blocking.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use cmux::{SigioCallback, Transport};

#[derive(Default)]
struct Line {
    to_mux: VecDeque<u8>,
    from_mux: Vec<u8>,
    /// Max bytes per engine read (None = unlimited)
    read_chunk: Option<usize>,
    /// Bytes the engine may still write (None = unlimited)
    write_capacity: Option<usize>,
    blocking: bool,
}

#[derive(Default)]
struct Shared {
    line: Mutex<Line>,
    /// Notified whenever input, write capacity or the blocking mode changes
    changed: Condvar,
    sigio: Mutex<Option<Arc<SigioCallback>>>,
}

impl Shared {
    fn line(&self) -> MutexGuard<'_, Line> {
        self.line.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait while `blocked` holds and the line is in blocking mode
    fn wait_while(&self, mut blocked: impl FnMut(&Line) -> bool) -> MutexGuard<'_, Line> {
        let line = self.line();
        self.changed
            .wait_while(line, |line| line.blocking && blocked(&*line))
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Invoke the readiness callback without holding any line lock
    fn signal(&self) {
        let callback = self
            .sigio
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Engine end of a virtual serial line
pub struct VirtualSerial {
    shared: Arc<Shared>,
}

impl VirtualSerial {
    /// Create a connected line
    pub fn pair() -> (VirtualSerial, LineHandle) {
        let shared = Arc::new(Shared::default());
        shared.line().blocking = true;
        (
            VirtualSerial {
                shared: shared.clone(),
            },
            LineHandle { shared },
        )
    }
}

impl Transport for VirtualSerial {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut line = self.shared.wait_while(|line| line.to_mux.is_empty());
        if line.to_mux.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let limit = line.read_chunk.unwrap_or(usize::MAX);
        let n = buf.len().min(limit).min(line.to_mux.len());
        for (dst, src) in buf.iter_mut().zip(line.to_mux.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut line = self
            .shared
            .wait_while(|line| line.write_capacity == Some(0));
        let n = match line.write_capacity {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(capacity) => {
                let n = buf.len().min(capacity);
                line.write_capacity = Some(capacity - n);
                n
            }
            None => buf.len(),
        };
        line.from_mux.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.shared.line().blocking = blocking;
        self.shared.changed.notify_all();
        Ok(())
    }

    fn sigio(&mut self, callback: SigioCallback) {
        *self
            .shared
            .sigio
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }
}

/// Test side of a virtual serial line
#[derive(Clone)]
pub struct LineHandle {
    shared: Arc<Shared>,
}

impl LineHandle {
    /// Make bytes readable by the engine and signal it
    pub fn inject(&self, bytes: &[u8]) {
        self.shared.line().to_mux.extend(bytes);
        self.shared.changed.notify_all();
        self.shared.signal();
    }

    /// Take everything the engine has written so far
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.shared.line().from_mux)
    }

    /// Bytes injected but not yet read by the engine
    pub fn unread(&self) -> usize {
        self.shared.line().to_mux.len()
    }

    /// Limit the bytes returned by each engine read
    pub fn set_read_chunk(&self, chunk: Option<usize>) {
        self.shared.line().read_chunk = chunk;
    }

    /// Limit how many more bytes the engine may write (`None` lifts the limit)
    ///
    /// Raising or lifting the limit signals the engine so a stalled write can
    /// continue.
    pub fn set_write_capacity(&self, capacity: Option<usize>) {
        self.shared.line().write_capacity = capacity;
        self.shared.changed.notify_all();
        if capacity != Some(0) {
            self.shared.signal();
        }
    }

    /// Whether the engine switched the line to blocking mode
    pub fn is_blocking(&self) -> bool {
        self.shared.line().blocking
    }

    /// Whether the engine registered a readiness callback
    pub fn has_sigio(&self) -> bool {
        self.shared
            .sigio
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}
