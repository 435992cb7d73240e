//! Public multiplexer handle
//!
//! [`Mux`] is a cheap, cloneable handle to one engine. It wires the engine to
//! its transport and event queue and exposes establishment in two forms:
//! blocking (`mux_start`, `dlci_establish`) and non-blocking
//! (`request_mux_start`, `request_dlci_establish`), whose [`PendingEstablish`]
//! can be awaited or polled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use cmux_protocol::Dlci;
use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::channel::{assert_outside_callback, DataChannel};
use crate::config::MuxConfig;
use crate::engine::MuxCore;
use crate::error::MuxError;
use crate::events::MuxEvent;
use crate::queue::{EventId, EventQueue};
use crate::state::{EstablishStatus, EstablishTarget, Establishment, MuxStats};
use crate::transport::Transport;

pub(crate) struct Shared {
    core: Mutex<MuxCore>,
    queue: OnceLock<Arc<dyn EventQueue>>,
    /// A dispatch task is posted and has not started yet
    dispatch_posted: AtomicBool,
}

impl Shared {
    pub(crate) fn lock(&self) -> MutexGuard<'_, MuxCore> {
        match self.core.lock() {
            Ok(core) => core,
            Err(_) => panic!("multiplexer state poisoned by a panicking callback"),
        }
    }

    /// Post at most one dispatch task at a time
    fn schedule_dispatch(self: &Arc<Self>) {
        let Some(queue) = self.queue.get() else {
            return;
        };
        if self.dispatch_posted.swap(true, Ordering::AcqRel) {
            return;
        }
        let weak = Arc::downgrade(self);
        queue.call(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch();
            }
        }));
    }

    fn dispatch(&self) {
        self.dispatch_posted.store(false, Ordering::Release);
        self.lock().service();
    }
}

/// The engine's way back to its queue, held inside the core
#[derive(Clone)]
pub(crate) struct Scheduler {
    shared: Weak<Shared>,
}

impl Scheduler {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { shared: Weak::new() }
    }

    pub(crate) fn has_queue(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.queue.get().is_some())
    }

    pub(crate) fn dispatch(&self) {
        if let Some(shared) = self.shared.upgrade() {
            shared.schedule_dispatch();
        }
    }

    /// Arm a T1 timer tagged with `generation`
    pub(crate) fn call_in(&self, delay: Duration, generation: u64) -> Option<EventId> {
        let shared = self.shared.upgrade()?;
        let queue = shared.queue.get()?;
        let weak = self.shared.clone();
        Some(queue.call_in(
            delay,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.lock().on_timeout(generation);
                }
            }),
        ))
    }

    pub(crate) fn cancel(&self, id: EventId) {
        if let Some(queue) = self.shared.upgrade().as_ref().and_then(|s| s.queue.get()) {
            queue.cancel(id);
        }
    }
}

/// Handle to a multiplexer engine
#[derive(Clone)]
pub struct Mux {
    shared: Arc<Shared>,
}

impl Mux {
    /// Create an engine; attach a transport and an event queue before use
    pub fn new(config: MuxConfig) -> Result<Self, MuxError> {
        config.validate()?;
        let shared = Arc::new_cyclic(|weak| Shared {
            core: Mutex::new(MuxCore::new(
                config,
                Scheduler {
                    shared: weak.clone(),
                },
            )),
            queue: OnceLock::new(),
            dispatch_posted: AtomicBool::new(false),
        });
        Ok(Self { shared })
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Attach the serial transport (once)
    ///
    /// The transport is switched to non-blocking mode and its readiness
    /// callback is pointed at the engine.
    pub fn serial_attach<T>(&self, mut transport: T) -> Result<(), MuxError>
    where
        T: Transport + 'static,
    {
        assert_outside_callback("Mux::serial_attach");
        {
            let mut core = self.shared.lock();
            if core.has_transport() {
                return Err(MuxError::AlreadyAttached("serial transport"));
            }
            transport.set_blocking(false)?;
            let weak = Arc::downgrade(&self.shared);
            transport.sigio(Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.schedule_dispatch();
                }
            }));
            core.attach_transport(Box::new(transport));
        }
        debug!("Serial transport attached");
        self.shared.schedule_dispatch();
        Ok(())
    }

    /// Attach the event queue (once)
    pub fn eventqueue_attach(&self, queue: Arc<dyn EventQueue>) -> Result<(), MuxError> {
        self.shared
            .queue
            .set(queue)
            .map_err(|_| MuxError::AlreadyAttached("event queue"))?;
        debug!("Event queue attached");
        self.shared.schedule_dispatch();
        Ok(())
    }

    /// Start opening the control channel (DLCI 0) without waiting
    pub fn request_mux_start(&self) -> Result<PendingEstablish, MuxError> {
        assert_outside_callback("Mux::mux_start");
        let (reply, rx) = oneshot::channel();
        self.shared.lock().begin_mux_start(reply)?;
        info!("Opening multiplexer control channel");
        Ok(PendingEstablish {
            rx,
            target: EstablishTarget::Control,
            mux: self.clone(),
        })
    }

    /// Open the control channel, blocking until UA, DM or timeout
    ///
    /// Must not be called from an async runtime thread; use
    /// [`request_mux_start`](Self::request_mux_start) there.
    pub fn mux_start(&self) -> Result<EstablishStatus, MuxError> {
        Ok(self.request_mux_start()?.wait()?.status)
    }

    /// Start opening user channel `id` without waiting
    pub fn request_dlci_establish(&self, id: u8) -> Result<PendingEstablish, MuxError> {
        let dlci = Dlci::user(id).map_err(|_| MuxError::InvalidRange(id))?;
        assert_outside_callback("Mux::dlci_establish");
        let (reply, rx) = oneshot::channel();
        self.shared.lock().begin_dlci_establish(dlci, reply)?;
        info!("Opening DLCI {}", dlci);
        Ok(PendingEstablish {
            rx,
            target: EstablishTarget::Channel(dlci),
            mux: self.clone(),
        })
    }

    /// Open user channel `id`, blocking until UA, DM or timeout
    ///
    /// On success the result carries the channel handle.
    pub fn dlci_establish(&self, id: u8) -> Result<Establishment, MuxError> {
        self.request_dlci_establish(id)?.wait()
    }

    /// Handle to an already established channel
    ///
    /// Like every `Mux` method, this panics when called from a channel
    /// callback.
    pub fn channel(&self, id: u8) -> Option<DataChannel> {
        assert_outside_callback("Mux::channel");
        let dlci = Dlci::user(id).ok()?;
        self.shared
            .lock()
            .is_established(dlci)
            .then(|| DataChannel::new(dlci, self.clone()))
    }

    /// Established user channels in establishment order
    pub fn channels(&self) -> Vec<Dlci> {
        assert_outside_callback("Mux::channels");
        self.shared.lock().channels()
    }

    /// Whether the control channel is open
    pub fn is_open(&self) -> bool {
        assert_outside_callback("Mux::is_open");
        self.shared.lock().is_open()
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<MuxEvent> {
        assert_outside_callback("Mux::subscribe");
        self.shared.lock().subscribe()
    }

    /// Counter snapshot
    pub fn stats(&self) -> MuxStats {
        assert_outside_callback("Mux::stats");
        self.shared.lock().stats()
    }

    /// Active configuration
    pub fn config(&self) -> MuxConfig {
        assert_outside_callback("Mux::config");
        self.shared.lock().config().clone()
    }
}

impl std::fmt::Debug for Mux {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mux").finish_non_exhaustive()
    }
}

/// An establishment in flight
#[derive(Debug)]
pub struct PendingEstablish {
    rx: oneshot::Receiver<EstablishStatus>,
    target: EstablishTarget,
    mux: Mux,
}

impl PendingEstablish {
    /// What is being opened
    pub fn target(&self) -> EstablishTarget {
        self.target
    }

    /// Block until resolved
    ///
    /// Panics when called from an async runtime thread.
    pub fn wait(self) -> Result<Establishment, MuxError> {
        assert_outside_callback("PendingEstablish::wait");
        let status = self.rx.blocking_recv().map_err(|_| MuxError::Abandoned)?;
        Ok(establishment(status, self.target, &self.mux))
    }

    /// Wait asynchronously until resolved
    pub async fn resolved(self) -> Result<Establishment, MuxError> {
        let status = self.rx.await.map_err(|_| MuxError::Abandoned)?;
        Ok(establishment(status, self.target, &self.mux))
    }

    /// Check without blocking
    pub fn try_resolve(&mut self) -> Result<Option<Establishment>, MuxError> {
        match self.rx.try_recv() {
            Ok(status) => Ok(Some(establishment(status, self.target, &self.mux))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Closed) => Err(MuxError::Abandoned),
        }
    }
}

fn establishment(status: EstablishStatus, target: EstablishTarget, mux: &Mux) -> Establishment {
    let channel = match (status, target) {
        (EstablishStatus::Success, EstablishTarget::Channel(dlci)) => {
            Some(DataChannel::new(dlci, mux.clone()))
        }
        _ => None,
    };
    Establishment { status, channel }
}
