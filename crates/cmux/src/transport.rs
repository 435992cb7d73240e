//! Byte transports the multiplexer runs over
//!
//! The engine drives a [`Transport`] in non-blocking mode: reads and writes
//! return `WouldBlock` (or `Ok(0)` on read) when no progress is possible, and
//! the transport raises its readiness callback when data arrives or a stalled
//! write may proceed.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use serialport::SerialPort;
use tracing::{debug, info, warn};

/// Readiness callback registered by the engine
pub type SigioCallback = Box<dyn Fn() + Send + Sync>;

/// Byte-oriented, possibly non-blocking full-duplex stream
pub trait Transport: Send {
    /// Read available bytes; `Ok(0)` or `WouldBlock` means nothing is available
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as many bytes as possible; `WouldBlock` means none were accepted
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Switch between blocking and non-blocking operation
    fn set_blocking(&mut self, blocking: bool) -> io::Result<()>;

    /// Register the readiness callback
    ///
    /// The callback may be invoked from any thread and must not block.
    fn sigio(&mut self, callback: SigioCallback);
}

/// Serial port timeout, also the worker threads' shutdown latency
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bytes accepted by `write` but not yet handed to the port
const OUTBOUND_CAPACITY: usize = 1024;

/// Largest chunk the writer thread hands to the port at once
const WRITE_CHUNK: usize = 256;

/// State shared between the transport and its reader and writer threads
#[derive(Default)]
struct Link {
    inbound: Mutex<VecDeque<u8>>,
    readable: Condvar,
    outbound: Mutex<VecDeque<u8>>,
    /// Outbound gained data or space
    outbound_changed: Condvar,
    sigio: Mutex<Option<SigioCallback>>,
    write_stalled: AtomicBool,
    shutdown: AtomicBool,
}

impl Link {
    fn inbound(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.inbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn outbound(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn signal(&self) {
        let sigio = self.sigio.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(callback) = sigio.as_ref() {
            callback();
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

/// [`Transport`] over a `serialport` device
///
/// A reader thread queues received bytes and a writer thread drains a bounded
/// outbound queue into the port, so neither `read` nor `write` ever waits on
/// the device. `write` reports `WouldBlock` while the outbound queue is full.
pub struct SerialTransport {
    name: String,
    link: Arc<Link>,
    reader: Option<thread::JoinHandle<()>>,
    writer: Option<thread::JoinHandle<()>>,
    blocking: bool,
}

impl SerialTransport {
    /// Open a serial device
    pub fn open(port_name: &str, baud_rate: u32) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(POLL_INTERVAL)
            .open()?;
        info!("Opened {} at {} baud", port_name, baud_rate);
        Self::from_port(port_name.to_string(), port)
    }

    /// Wrap an already opened port
    pub fn from_port(name: String, port: Box<dyn SerialPort>) -> Result<Self, serialport::Error> {
        let reader = port.try_clone()?;
        Self::spawn(name, reader, port).map_err(serialport::Error::from)
    }

    /// Start the worker threads over a byte source and sink
    ///
    /// Both are expected to time out periodically (`TimedOut`/`WouldBlock`)
    /// rather than block forever.
    fn spawn<R, W>(name: String, reader: R, writer: W) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let link = Arc::new(Link::default());
        let reader = thread::Builder::new()
            .name(format!("cmux-rx {}", name))
            .spawn({
                let link = link.clone();
                let name = name.clone();
                move || reader_loop(name, reader, link)
            })?;
        let writer = thread::Builder::new()
            .name(format!("cmux-tx {}", name))
            .spawn({
                let link = link.clone();
                let name = name.clone();
                move || writer_loop(name, writer, link)
            })?;

        Ok(Self {
            name,
            link,
            reader: Some(reader),
            writer: Some(writer),
            blocking: true,
        })
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn is_idle(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn reader_loop<R: Read>(name: String, mut port: R, link: Arc<Link>) {
    let mut buffer = [0u8; 256];
    while !link.is_shutdown() {
        match port.read(&mut buffer) {
            Ok(0) => {}
            Ok(n) => {
                link.inbound().extend(&buffer[..n]);
                link.readable.notify_all();
                link.signal();
            }
            Err(e) if is_idle(&e) => {}
            Err(e) => {
                warn!("Error reading from {}: {}", name, e);
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
    debug!("Reader for {} stopped", name);
}

fn writer_loop<W: Write>(name: String, mut port: W, link: Arc<Link>) {
    let mut chunk = Vec::with_capacity(WRITE_CHUNK);
    while !link.is_shutdown() {
        {
            let mut outbound = link.outbound();
            if outbound.is_empty() {
                outbound = link
                    .outbound_changed
                    .wait_timeout(outbound, POLL_INTERVAL)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0;
            }
            let n = outbound.len().min(WRITE_CHUNK);
            chunk.clear();
            chunk.extend(outbound.drain(..n));
        }
        if chunk.is_empty() {
            continue;
        }

        // Space was freed: wake blocked writers and a stalled engine
        link.outbound_changed.notify_all();
        if link.write_stalled.swap(false, Ordering::AcqRel) {
            link.signal();
        }

        let mut rest = chunk.as_slice();
        while !rest.is_empty() && !link.is_shutdown() {
            match port.write(rest) {
                Ok(n) => rest = &rest[n..],
                Err(e) if is_idle(&e) => {}
                Err(e) => {
                    warn!("Error writing to {}, dropping {} bytes: {}", name, rest.len(), e);
                    break;
                }
            }
        }
    }
    debug!("Writer for {} stopped", name);
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inbound = self.link.inbound();
        if self.blocking {
            while inbound.is_empty() {
                inbound = self
                    .link
                    .readable
                    .wait(inbound)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        } else if inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let n = buf.len().min(inbound.len());
        for (dst, src) in buf.iter_mut().zip(inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut outbound = self.link.outbound();
        if self.blocking {
            while outbound.len() >= OUTBOUND_CAPACITY {
                outbound = self
                    .link
                    .outbound_changed
                    .wait(outbound)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }

        let space = OUTBOUND_CAPACITY.saturating_sub(outbound.len());
        if space == 0 {
            self.link.write_stalled.store(true, Ordering::Release);
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = space.min(buf.len());
        outbound.extend(&buf[..n]);
        drop(outbound);
        self.link.outbound_changed.notify_all();
        Ok(n)
    }

    fn set_blocking(&mut self, blocking: bool) -> io::Result<()> {
        self.blocking = blocking;
        Ok(())
    }

    fn sigio(&mut self, callback: SigioCallback) {
        *self
            .link
            .sigio
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
        if !self.link.inbound().is_empty() {
            self.link.signal();
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.link.shutdown.store(true, Ordering::Release);
        self.link.outbound_changed.notify_all();
        let current = thread::current().id();
        for worker in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            // Dropped from its own readiness callback: the thread exits on its own
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                warn!("Worker thread for {} panicked", self.name);
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Instant;

    const WAIT: Duration = Duration::from_secs(2);

    /// Byte source fed from the test; times out when nothing was sent
    struct FedReader(mpsc::Receiver<Vec<u8>>);

    impl Read for FedReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.recv_timeout(Duration::from_millis(10)) {
                Ok(data) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            }
        }
    }

    /// Sink that accepts one write per permit and times out otherwise
    struct GatedWriter {
        permits: mpsc::Receiver<()>,
        sink: Arc<Mutex<Vec<u8>>>,
    }

    impl Write for GatedWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.permits.recv_timeout(Duration::from_millis(10)) {
                Ok(()) => {
                    self.sink.lock().unwrap().extend_from_slice(buf);
                    Ok(buf.len())
                }
                Err(_) => Err(io::ErrorKind::TimedOut.into()),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Rig {
        transport: SerialTransport,
        data: mpsc::Sender<Vec<u8>>,
        permits: mpsc::Sender<()>,
        sink: Arc<Mutex<Vec<u8>>>,
    }

    fn rig() -> Rig {
        let (data, data_rx) = mpsc::channel();
        let (permits, permits_rx) = mpsc::channel();
        let sink = Arc::new(Mutex::new(Vec::new()));
        let writer = GatedWriter {
            permits: permits_rx,
            sink: sink.clone(),
        };
        let mut transport =
            SerialTransport::spawn("test".to_string(), FedReader(data_rx), writer).unwrap();
        transport.set_blocking(false).unwrap();
        Rig {
            transport,
            data,
            permits,
            sink,
        }
    }

    fn wait_for(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + WAIT;
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_received_bytes_signal_and_read() {
        let mut rig = rig();
        let (signal_tx, signal_rx) = mpsc::channel();
        rig.transport.sigio(Box::new(move || {
            let _ = signal_tx.send(());
        }));

        let mut buf = [0u8; 8];
        assert_eq!(
            rig.transport.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
        rig.data.send(b"AT".to_vec()).unwrap();
        signal_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(rig.transport.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"AT");
    }

    #[test]
    fn test_write_does_not_wait_for_port() {
        let mut rig = rig();
        let (signal_tx, signal_rx) = mpsc::channel();
        rig.transport.sigio(Box::new(move || {
            let _ = signal_tx.send(());
        }));

        // The port accepts nothing yet, so writes only fill the outbound queue
        let bytes: Vec<u8> = (0..4 * OUTBOUND_CAPACITY).map(|i| (i % 251) as u8).collect();
        let mut accepted = 0;
        loop {
            match rig.transport.write(&bytes[accepted..]) {
                Ok(n) => accepted += n,
                Err(e) => {
                    assert_eq!(e.kind(), io::ErrorKind::WouldBlock);
                    break;
                }
            }
        }
        assert!(accepted >= OUTBOUND_CAPACITY);
        assert!(accepted < bytes.len());

        // Draining the queue raises readiness for the stalled writer
        for _ in 0..64 {
            rig.permits.send(()).unwrap();
        }
        signal_rx.recv_timeout(WAIT).unwrap();
        wait_for(|| rig.sink.lock().unwrap().len() == accepted);
        assert_eq!(*rig.sink.lock().unwrap(), bytes[..accepted]);
    }

    #[test]
    fn test_drop_from_reader_callback() {
        let Rig {
            mut transport,
            data,
            ..
        } = rig();
        let slot = Arc::new(Mutex::new(None::<SerialTransport>));
        let (dropped_tx, dropped_rx) = mpsc::channel();

        transport.sigio(Box::new({
            let slot = slot.clone();
            move || {
                let owned = slot.lock().unwrap().take();
                if let Some(owned) = owned {
                    drop(owned);
                    let _ = dropped_tx.send(thread::current().name().map(String::from));
                }
            }
        }));
        *slot.lock().unwrap() = Some(transport);

        data.send(vec![0xF9]).unwrap();
        let thread_name = dropped_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(thread_name.as_deref(), Some("cmux-rx test"));
    }
}
