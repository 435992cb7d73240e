//! User-facing channel handles
//!
//! A [`DataChannel`] is returned by a successful DLCI establishment. Inside
//! its completion callback the engine lock is already held, so the callback
//! receives a [`ChannelIo`] to read and write through instead.

use std::cell::Cell;
use std::fmt;
use std::io;

use cmux_protocol::Dlci;

use crate::engine::MuxCore;
use crate::mux::Mux;

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a channel callback
pub(crate) struct CallbackGuard {
    outer: bool,
}

impl CallbackGuard {
    pub(crate) fn enter() -> Self {
        Self {
            outer: IN_CALLBACK.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        IN_CALLBACK.with(|flag| flag.set(self.outer));
    }
}

/// Panics when called from inside a channel callback
pub(crate) fn assert_outside_callback(operation: &str) {
    assert!(
        !IN_CALLBACK.with(Cell::get),
        "{} called from a channel callback; use the ChannelIo passed to the callback",
        operation
    );
}

/// Channel access handed to a completion callback
pub struct ChannelIo<'a> {
    core: &'a mut MuxCore,
    dlci: Dlci,
}

impl<'a> ChannelIo<'a> {
    pub(crate) fn new(core: &'a mut MuxCore, dlci: Dlci) -> Self {
        Self { core, dlci }
    }

    /// Channel the callback fired for
    pub fn dlci(&self) -> Dlci {
        self.dlci
    }

    /// Largest payload a single write carries
    pub fn mtu(&self) -> usize {
        self.core.mtu()
    }

    /// Whether received data is waiting for this channel
    pub fn has_data(&self) -> bool {
        self.core.has_pending_data(self.dlci)
    }

    /// Read received data; `WouldBlock` when nothing is waiting
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.user_read(self.dlci, buf)
    }

    /// Write up to one MTU; the frame goes out when the callback returns
    ///
    /// Returns 0 when TX is busy; the callback fires again once it frees up.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.core.user_write(self.dlci, data)
    }
}

/// Handle to an established user channel
#[derive(Clone)]
pub struct DataChannel {
    dlci: Dlci,
    mux: Mux,
}

impl DataChannel {
    pub(crate) fn new(dlci: Dlci, mux: Mux) -> Self {
        Self { dlci, mux }
    }

    /// Channel identifier
    pub fn dlci(&self) -> Dlci {
        self.dlci
    }

    /// Largest payload a single write carries
    pub fn mtu(&self) -> usize {
        assert_outside_callback("DataChannel::mtu");
        self.mux.shared().lock().mtu()
    }

    /// Send up to one MTU of `data` as a UIH frame
    ///
    /// Returns the number of bytes taken, or 0 when TX is busy. A refused
    /// writer's callback is invoked once TX frees up.
    pub fn write(&self, data: &[u8]) -> usize {
        assert_outside_callback("DataChannel::write");
        self.mux.shared().lock().user_write(self.dlci, data)
    }

    /// Read data received on this channel; `WouldBlock` when nothing is waiting
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        assert_outside_callback("DataChannel::read");
        self.mux.shared().lock().user_read(self.dlci, buf)
    }

    /// Register the completion callback
    ///
    /// Fired when data arrives for this channel and when a refused write can
    /// be retried. Runs with the engine locked: use the [`ChannelIo`] it is
    /// given, never this handle. Fires immediately if data is already waiting.
    pub fn sigio<F>(&self, callback: F)
    where
        F: FnMut(&mut ChannelIo<'_>) + Send + 'static,
    {
        assert_outside_callback("DataChannel::sigio");
        self.mux
            .shared()
            .lock()
            .set_callback(self.dlci, Box::new(callback));
    }

    /// Channels are byte streams without a position
    pub fn seek(&self, _pos: io::SeekFrom) -> ! {
        panic!("seek is not supported on DLCI {}", self.dlci)
    }

    /// Channels cannot be closed once established
    pub fn close(self) -> ! {
        panic!("close is not supported on DLCI {}", self.dlci)
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel").field("dlci", &self.dlci).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_nests_and_restores() {
        assert_outside_callback("outer");
        {
            let _outer = CallbackGuard::enter();
            assert!(IN_CALLBACK.with(Cell::get));
            {
                let _inner = CallbackGuard::enter();
            }
            assert!(IN_CALLBACK.with(Cell::get));
        }
        assert_outside_callback("after");
    }

    #[test]
    #[should_panic(expected = "called from a channel callback")]
    fn test_assert_inside_callback_panics() {
        let _guard = CallbackGuard::enter();
        assert_outside_callback("DataChannel::write");
    }
}
