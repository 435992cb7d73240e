//! Multiplexer core state machine
//!
//! [`MuxCore`] owns every piece of mutable engine state and is only ever
//! touched through the `Mux` mutex. It is driven from three directions:
//!
//! - **Dispatch**: the event queue runs [`MuxCore::service`] after the
//!   transport signals readiness (drain RX, then push TX)
//! - **Timers**: T1 expiry runs [`MuxCore::on_timeout`]
//! - **User calls**: establishment requests and channel reads/writes
//!
//! Channel callbacks run with the lock held and receive a
//! [`ChannelIo`](crate::ChannelIo) instead of re-entering through the public
//! API.

use std::io;

use cmux_protocol::{Dlci, FrameHeader, FrameKind};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, trace, warn};

use crate::channel::{CallbackGuard, ChannelIo};
use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::events::{DropReason, MuxEvent};
use crate::mux::Scheduler;
use crate::registry::{ChannelCallback, ChannelRegistry};
use crate::rx::{RxContext, RxPoll};
use crate::state::{EstablishPhase, EstablishStatus, EstablishTarget, MuxStats};
use crate::transport::Transport;
use crate::tx::{TxContext, TxPoll, TxState};

pub(crate) struct MuxCore {
    config: MuxConfig,
    scheduler: Scheduler,
    transport: Option<Box<dyn Transport>>,
    tx: TxContext,
    rx: RxContext,
    registry: ChannelRegistry,
    mux_open: bool,
    phase: EstablishPhase,
    reply: Option<oneshot::Sender<EstablishStatus>>,
    /// A channel callback is on the stack
    in_callback: bool,
    /// Pending-writer callbacks are being served
    serving_writers: bool,
    /// UIH loaded by a callback, sent once the callback returns
    staged_write: bool,
    events: broadcast::Sender<MuxEvent>,
    stats: MuxStats,
}

impl MuxCore {
    pub(crate) fn new(config: MuxConfig, scheduler: Scheduler) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            tx: TxContext::new(config.tx_buffer_size),
            rx: RxContext::new(),
            registry: ChannelRegistry::new(config.channel_slots),
            config,
            scheduler,
            transport: None,
            mux_open: false,
            phase: EstablishPhase::Idle,
            reply: None,
            in_callback: false,
            serving_writers: false,
            staged_write: false,
            events,
            stats: MuxStats::default(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub(crate) fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub(crate) fn stats(&self) -> MuxStats {
        self.stats
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<MuxEvent> {
        self.events.subscribe()
    }

    pub(crate) fn is_open(&self) -> bool {
        self.mux_open
    }

    pub(crate) fn is_established(&self, dlci: Dlci) -> bool {
        self.registry.is_in_use(dlci)
    }

    pub(crate) fn channels(&self) -> Vec<Dlci> {
        self.registry.dlcis().collect()
    }

    pub(crate) fn mtu(&self) -> usize {
        self.tx.mtu()
    }

    pub(crate) fn has_transport(&self) -> bool {
        self.transport.is_some()
    }

    pub(crate) fn attach_transport(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
    }

    fn emit(&self, event: MuxEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Establishment requests
    // ========================================================================

    pub(crate) fn begin_mux_start(
        &mut self,
        reply: oneshot::Sender<EstablishStatus>,
    ) -> Result<(), MuxError> {
        self.check_attached()?;
        if self.mux_open {
            return Err(MuxError::AlreadyOpen);
        }
        if self.phase != EstablishPhase::Idle {
            return Err(MuxError::InProgress);
        }
        self.begin(EstablishTarget::Control, reply);
        Ok(())
    }

    pub(crate) fn begin_dlci_establish(
        &mut self,
        dlci: Dlci,
        reply: oneshot::Sender<EstablishStatus>,
    ) -> Result<(), MuxError> {
        self.check_attached()?;
        if !self.mux_open {
            return Err(MuxError::MuxNotOpen);
        }
        if self.registry.is_full() {
            return Err(MuxError::RegistryFull(self.registry.capacity()));
        }
        if self.registry.is_in_use(dlci) {
            return Err(MuxError::DlciInUse(dlci));
        }
        if self.phase != EstablishPhase::Idle {
            return Err(MuxError::InProgress);
        }
        self.begin(EstablishTarget::Channel(dlci), reply);
        Ok(())
    }

    fn check_attached(&self) -> Result<(), MuxError> {
        if self.transport.is_none() {
            return Err(MuxError::NotAttached("serial transport"));
        }
        if !self.scheduler.has_queue() {
            return Err(MuxError::NotAttached("event queue"));
        }
        Ok(())
    }

    fn begin(&mut self, target: EstablishTarget, reply: oneshot::Sender<EstablishStatus>) {
        self.reply = Some(reply);
        if self.tx.state == TxState::Idle {
            self.phase = EstablishPhase::Running(target);
            self.send_sabm(target.dlci());
        } else {
            debug!("TX busy, deferring SABM for DLCI {}", target.dlci());
            self.phase = EstablishPhase::Pending(target);
        }
    }

    fn send_sabm(&mut self, dlci: Dlci) {
        debug!("Sending SABM for DLCI {}", dlci);
        self.tx.load_control(FrameKind::Sabm, dlci);
        self.tx.retransmit_counter = self.config.retransmit_count;
        self.tx_enter(TxState::RetransmitEnqueue);
    }

    fn resolve(&mut self, status: EstablishStatus) {
        if let Some(reply) = self.reply.take() {
            if reply.send(status).is_err() {
                debug!("Establishment requester went away before {:?}", status);
            }
        }
    }

    fn running_target(&self) -> Option<EstablishTarget> {
        match self.phase {
            EstablishPhase::Running(target) => Some(target),
            _ => None,
        }
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Drain received frames, then push any outgoing frame
    pub(crate) fn service(&mut self) {
        self.rx_drain();
        if matches!(
            self.tx.state,
            TxState::RetransmitEnqueue | TxState::InternalResp | TxState::NoRetransmit
        ) {
            self.tx_write();
        }
    }

    fn rx_drain(&mut self) {
        loop {
            let Some(transport) = self.transport.as_deref_mut() else {
                return;
            };
            match self.rx.poll(transport) {
                RxPoll::Pending | RxPoll::Suspended => return,
                RxPoll::Dropped(reason) => self.record_drop(reason),
                RxPoll::Frame(header) => self.on_frame(header),
            }
        }
    }

    fn record_drop(&mut self, reason: DropReason) {
        self.stats.frames_dropped += 1;
        if reason == DropReason::BadFcs {
            self.stats.fcs_errors += 1;
        }
        debug!("Dropped frame: {:?}", reason);
        self.emit(MuxEvent::FrameDropped { reason });
    }

    // ========================================================================
    // Received frames
    // ========================================================================

    fn on_frame(&mut self, header: FrameHeader) {
        self.stats.frames_received += 1;
        trace!(
            "RX {} DLCI {} ({} bytes)",
            header.kind,
            header.dlci(),
            header.length
        );
        self.emit(MuxEvent::FrameReceived {
            kind: header.kind,
            dlci: header.dlci(),
            len: header.length,
        });

        match header.kind {
            FrameKind::Sabm | FrameKind::Disc => self.on_peer_request(&header),
            FrameKind::Ua => self.on_establish_response(&header, EstablishStatus::Success),
            FrameKind::Dm => self.on_establish_response(&header, EstablishStatus::Reject),
            FrameKind::Uih => self.on_uih(&header),
        }
    }

    /// SABM or DISC from the peer; only answered with DM
    fn on_peer_request(&mut self, header: &FrameHeader) {
        let dlci = header.dlci();
        let answer = !self.mux_open || (header.is_command_final() && !self.registry.is_in_use(dlci));
        if !answer {
            debug!("Ignoring {} for DLCI {}", header.kind, dlci);
            return;
        }
        if self.tx.state != TxState::Idle {
            self.record_drop(DropReason::TxBusy);
            return;
        }
        debug!("Answering {} for DLCI {} with DM", header.kind, dlci);
        self.tx.load_control(FrameKind::Dm, dlci);
        self.tx_enter(TxState::InternalResp);
    }

    /// UA or DM: honoured only as the final answer to our outstanding SABM
    fn on_establish_response(&mut self, header: &FrameHeader, status: EstablishStatus) {
        let awaited = self.tx.state == TxState::RetransmitDone
            && header.dlci() == self.tx.dlci()
            && header.is_command_final();
        let Some(target) = self.running_target().filter(|_| awaited) else {
            debug!("Ignoring unsolicited {} for DLCI {}", header.kind, header.dlci());
            return;
        };

        self.cancel_timer();
        self.phase = EstablishPhase::Idle;
        match (status, target) {
            (EstablishStatus::Success, EstablishTarget::Control) => {
                self.mux_open = true;
                info!("Multiplexer control channel open");
                self.emit(MuxEvent::MuxOpened);
            }
            (EstablishStatus::Success, EstablishTarget::Channel(dlci)) => {
                let slot = self.registry.append(dlci);
                info!("Opened DLCI {} (slot {})", dlci, slot);
                self.emit(MuxEvent::ChannelOpened { dlci });
            }
            (status, target) => {
                warn!("Peer rejected DLCI {}", target.dlci());
                self.emit(MuxEvent::EstablishFailed { target, status });
            }
        }
        self.resolve(status);
        self.tx_enter(TxState::Idle);
    }

    fn on_uih(&mut self, header: &FrameHeader) {
        let dlci = header.dlci();
        if header.length == 0 {
            trace!("Empty UIH on DLCI {}", dlci);
            return;
        }
        if !self.registry.is_in_use(dlci) {
            self.record_drop(DropReason::UnknownChannel(dlci));
            return;
        }
        self.rx.suspend(dlci);
        self.emit(MuxEvent::DataReady {
            dlci,
            len: header.length,
        });
        self.notify_channel(dlci);
    }

    // ========================================================================
    // Transmit pipeline
    // ========================================================================

    fn tx_enter(&mut self, state: TxState) {
        self.tx.state = state;
        match state {
            TxState::Idle => self.on_tx_idle(),
            TxState::RetransmitEnqueue | TxState::InternalResp | TxState::NoRetransmit => {
                self.tx_write()
            }
            TxState::RetransmitDone => {}
        }
    }

    fn tx_write(&mut self) {
        let Some(transport) = self.transport.as_deref_mut() else {
            return;
        };
        if self.tx.flush(transport) == TxPoll::Complete {
            self.on_tx_complete();
        }
    }

    fn on_tx_complete(&mut self) {
        let kind = self.tx.kind();
        let dlci = self.tx.dlci();
        let len = self.tx.frame().len();
        self.stats.frames_sent += 1;
        trace!("TX {:?} DLCI {} ({} bytes)", kind, dlci, len);
        if let Some(kind) = kind {
            self.emit(MuxEvent::FrameSent { kind, dlci, len });
        }

        match kind {
            Some(FrameKind::Sabm) => {
                self.arm_timer();
                self.tx_enter(TxState::RetransmitDone);
            }
            Some(FrameKind::Dm) | Some(FrameKind::Uih) => self.tx_enter(TxState::Idle),
            other => unreachable!("no post-transmit handling for {:?}", other),
        }
    }

    fn on_tx_idle(&mut self) {
        if let EstablishPhase::Pending(target) = self.phase {
            self.phase = EstablishPhase::Running(target);
            self.send_sabm(target.dlci());
        } else if !self.in_callback && !self.serving_writers {
            self.serve_pending_writers();
        }
    }

    /// Call back deferred writers, round-robin, while TX stays free
    fn serve_pending_writers(&mut self) {
        self.serving_writers = true;
        let slots = self.registry.capacity();
        while self.tx.state == TxState::Idle {
            let Some(index) = self.tx.pending.take_next(slots) else {
                break;
            };
            if let Some(dlci) = self.registry.dlci_at(index) {
                self.notify_channel(dlci);
            }
        }
        self.serving_writers = false;
    }

    // ========================================================================
    // Retransmission timer
    // ========================================================================

    fn arm_timer(&mut self) {
        self.tx.timer_generation = self.tx.timer_generation.wrapping_add(1);
        self.tx.timer = self
            .scheduler
            .call_in(self.config.t1_timeout(), self.tx.timer_generation);
        if self.tx.timer.is_none() {
            warn!("No event queue attached, T1 not armed");
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(id) = self.tx.timer.take() {
            self.scheduler.cancel(id);
        }
    }

    /// T1 expiry for the timer armed as `generation`
    pub(crate) fn on_timeout(&mut self, generation: u64) {
        if self.tx.timer.is_none()
            || generation != self.tx.timer_generation
            || self.tx.state != TxState::RetransmitDone
        {
            trace!("Ignoring stale T1 expiry {}", generation);
            return;
        }
        self.tx.timer = None;
        let dlci = self.tx.dlci();

        if self.tx.retransmit_counter > 0 {
            self.tx.retransmit_counter -= 1;
            self.stats.retransmissions += 1;
            debug!(
                "T1 expired, resending SABM for DLCI {} ({} left)",
                dlci, self.tx.retransmit_counter
            );
            self.emit(MuxEvent::Retransmit {
                dlci,
                remaining: self.tx.retransmit_counter,
            });
            self.tx.rewind();
            self.tx_enter(TxState::RetransmitEnqueue);
            return;
        }

        warn!("No answer to SABM for DLCI {}", dlci);
        self.stats.timeouts += 1;
        let target = self.running_target();
        self.phase = EstablishPhase::Idle;
        if let Some(target) = target {
            self.emit(MuxEvent::EstablishFailed {
                target,
                status: EstablishStatus::Timeout,
            });
        }
        self.resolve(EstablishStatus::Timeout);
        self.tx_enter(TxState::Idle);
    }

    // ========================================================================
    // Channel I/O
    // ========================================================================

    /// Queue `data` on `dlci`; returns the bytes accepted (0 = try again later)
    pub(crate) fn user_write(&mut self, dlci: Dlci, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let tx_free = self.tx.state == TxState::Idle && !self.staged_write;
        if tx_free {
            let accepted = self.tx.load_uih(dlci, data);
            if self.in_callback {
                self.staged_write = true;
            } else {
                self.tx_enter(TxState::NoRetransmit);
            }
            return accepted;
        }

        if let Some(slot) = self.registry.slot_of(dlci) {
            self.tx.pending.set(slot);
        }
        trace!("TX busy, deferring write on DLCI {}", dlci);
        0
    }

    /// Copy held payload for `dlci`; resumes reception once it is drained
    pub(crate) fn user_read(&mut self, dlci: Dlci, buf: &mut [u8]) -> io::Result<usize> {
        let Some(n) = self.rx.read_held(dlci, buf) else {
            return Err(io::ErrorKind::WouldBlock.into());
        };
        if self.rx.held_remaining() == 0 {
            trace!("DLCI {} drained, resuming RX", dlci);
            self.rx.resume();
            self.scheduler.dispatch();
        }
        Ok(n)
    }

    pub(crate) fn has_pending_data(&self, dlci: Dlci) -> bool {
        self.rx.held_for(dlci)
    }

    /// Bind a callback; fires at once if data is already waiting
    pub(crate) fn set_callback(&mut self, dlci: Dlci, callback: ChannelCallback) {
        if !self.registry.set_callback(dlci, callback) {
            warn!("Callback for DLCI {} not bound: channel not established", dlci);
            return;
        }
        if self.rx.held_for(dlci) && !self.in_callback {
            self.notify_channel(dlci);
        }
    }

    /// Run the channel's callback in callback context
    pub(crate) fn notify_channel(&mut self, dlci: Dlci) {
        let Some(mut callback) = self.registry.take_callback(dlci) else {
            trace!("No callback bound for DLCI {}", dlci);
            return;
        };
        let outer = std::mem::replace(&mut self.in_callback, true);
        {
            let _guard = CallbackGuard::enter();
            callback(&mut ChannelIo::new(self, dlci));
        }
        self.in_callback = outer;
        self.registry.restore_callback(dlci, callback);

        if !outer && self.staged_write {
            self.staged_write = false;
            self.tx_enter(TxState::NoRetransmit);
        }
    }
}
