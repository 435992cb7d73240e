//! Integration tests for the multiplexer engine
//!
//! These tests drive a real `Mux` over an in-memory serial line with a
//! scripted far end and a manually clocked event queue:
//! - Control channel and DLCI establishment (accept, reject, loss, timeout)
//! - Request validation (ranges, in-progress, exhausted registry)
//! - UIH transmit and receive, including single-buffer backpressure
//! - Deferred writers and callback-context staging
//! - Responses to peer-initiated SABM/DISC
//! - Receive robustness (FCS errors, flag fill, fragmented reads)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cmux::{
    DataChannel, Dlci, EstablishStatus, EstablishTarget, FrameKind, Mux, MuxConfig, MuxError,
    MuxEvent, PendingEstablish,
};
use cmux_protocol::{Address, Control, Frame, FLAG};
use cmux_sim::{LineHandle, ManualQueue, PeerPolicy, SimPeer, VirtualSerial};

// ============================================================================
// Helper Functions
// ============================================================================

mod helpers {
    use super::*;

    pub fn dlci(id: u8) -> Dlci {
        Dlci::new(id).unwrap()
    }

    pub fn t1() -> Duration {
        MuxConfig::default().t1_timeout()
    }

    /// Engine wired to a virtual line, a manual queue and a scripted peer
    pub struct Harness {
        pub mux: Mux,
        pub queue: Arc<ManualQueue>,
        pub peer: SimPeer,
        pub line: LineHandle,
    }

    pub fn harness() -> Harness {
        harness_with(MuxConfig::default())
    }

    pub fn harness_with(config: MuxConfig) -> Harness {
        let queue = Arc::new(ManualQueue::new());
        let (serial, line) = VirtualSerial::pair();
        let mux = Mux::new(config).unwrap();
        mux.eventqueue_attach(queue.clone()).unwrap();
        mux.serial_attach(serial).unwrap();
        Harness {
            mux,
            queue,
            peer: SimPeer::new(line.clone()),
            line,
        }
    }

    impl Harness {
        /// Let the peer answer and the engine react until both go quiet
        pub fn settle(&mut self) {
            loop {
                let decoded = self.peer.poll();
                let ran = self.queue.run_pending();
                if decoded == 0 && ran == 0 {
                    break;
                }
            }
        }

        /// Advance the virtual clock by one T1 period and settle
        pub fn expire_t1(&mut self) {
            self.queue.advance(t1());
            self.settle();
        }

        pub fn open_mux(&mut self) {
            let mut pending = self.mux.request_mux_start().unwrap();
            self.settle();
            let result = resolved(&mut pending);
            assert_eq!(result.status, EstablishStatus::Success);
        }

        pub fn open_channel(&mut self, id: u8) -> DataChannel {
            let mut pending = self.mux.request_dlci_establish(id).unwrap();
            self.settle();
            let result = resolved(&mut pending);
            assert_eq!(result.status, EstablishStatus::Success);
            result.channel.unwrap()
        }

        /// Open the control channel plus `ids`, then clear the peer's log
        pub fn open(&mut self, ids: &[u8]) -> Vec<DataChannel> {
            self.open_mux();
            let channels = ids.iter().map(|&id| self.open_channel(id)).collect();
            self.peer.take_received();
            channels
        }
    }

    pub fn resolved(pending: &mut PendingEstablish) -> cmux::Establishment {
        pending
            .try_resolve()
            .unwrap()
            .expect("establishment should have resolved")
    }

    pub fn unresolved(pending: &mut PendingEstablish) -> bool {
        pending.try_resolve().unwrap().is_none()
    }

    pub fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<MuxEvent>) -> Vec<MuxEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Read everything currently held for a channel
    pub fn read_all(channel: &DataChannel) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 16];
        while let Ok(n) = channel.read(&mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }
}

use helpers::*;

// ============================================================================
// Control Channel Establishment
// ============================================================================

mod mux_start_tests {
    use super::*;

    #[test]
    fn test_sends_sabm_and_opens_on_ua() {
        let mut h = harness();
        let mut pending = h.mux.request_mux_start().unwrap();
        assert_eq!(pending.target(), EstablishTarget::Control);
        assert_eq!(h.line.take_output(), [FLAG, 0x03, 0x3F, 0x01, 0x1C, FLAG]);
        assert!(unresolved(&mut pending));

        // UA for DLCI 0 with C/R and P/F set
        h.line.inject(&[FLAG, 0x03, 0x73, 0x01, 0xD7, FLAG]);
        h.queue.run_pending();

        let result = resolved(&mut pending);
        assert_eq!(result.status, EstablishStatus::Success);
        assert!(result.channel.is_none());
        assert!(h.mux.is_open());
        assert_eq!(h.queue.pending_timers(), 0);
    }

    #[test]
    fn test_rejected_with_dm() {
        let mut h = harness();
        h.peer.set_policy(Dlci::CONTROL, PeerPolicy::Reject);
        let mut pending = h.mux.request_mux_start().unwrap();
        h.settle();
        assert_eq!(resolved(&mut pending).status, EstablishStatus::Reject);
        assert!(!h.mux.is_open());

        // A fresh attempt is allowed after a rejection
        h.peer.set_policy(Dlci::CONTROL, PeerPolicy::Accept);
        h.open_mux();
        assert!(h.mux.is_open());
    }

    #[test]
    fn test_already_open() {
        let mut h = harness();
        h.open_mux();
        let err = h.mux.request_mux_start().unwrap_err();
        assert!(matches!(err, MuxError::AlreadyOpen));
        assert!(err.is_no_resource());
    }

    #[test]
    fn test_second_start_while_running() {
        let mut h = harness();
        h.peer.set_default_policy(PeerPolicy::Ignore);
        let _pending = h.mux.request_mux_start().unwrap();
        h.settle();
        assert!(matches!(
            h.mux.request_mux_start(),
            Err(MuxError::InProgress)
        ));
        assert_eq!(h.peer.sabm_count(Dlci::CONTROL), 1);
    }

    #[test]
    fn test_deferred_behind_dm_response() {
        let mut h = harness();

        // DM answering an early SABM, held half-written on the line
        h.line.set_write_capacity(Some(3));
        h.peer.send(&Frame::sabm(dlci(3)));
        h.queue.run_pending();

        let mut pending = h.mux.request_mux_start().unwrap();
        h.settle();
        assert!(unresolved(&mut pending));
        assert_eq!(h.peer.sabm_count(Dlci::CONTROL), 0);

        h.line.set_write_capacity(None);
        h.settle();
        assert_eq!(resolved(&mut pending).status, EstablishStatus::Success);
        assert!(h.mux.is_open());

        let kinds: Vec<_> = h
            .peer
            .received()
            .iter()
            .map(|f| f.kind().unwrap())
            .collect();
        assert_eq!(kinds, vec![FrameKind::Dm, FrameKind::Sabm]);
        assert_eq!(h.peer.received()[0], Frame::dm(dlci(3)));
    }

    #[test]
    fn test_requires_attachments() {
        let mux = Mux::new(MuxConfig::default()).unwrap();
        assert!(matches!(
            mux.request_mux_start(),
            Err(MuxError::NotAttached(_))
        ));

        let (serial, _line) = VirtualSerial::pair();
        mux.serial_attach(serial).unwrap();
        assert!(matches!(
            mux.request_mux_start(),
            Err(MuxError::NotAttached("event queue"))
        ));
    }

    #[test]
    fn test_attach_twice() {
        let h = harness();
        let (serial, _line) = VirtualSerial::pair();
        assert!(matches!(
            h.mux.serial_attach(serial),
            Err(MuxError::AlreadyAttached(_))
        ));
        assert!(matches!(
            h.mux.eventqueue_attach(Arc::new(ManualQueue::new())),
            Err(MuxError::AlreadyAttached(_))
        ));
    }

    #[test]
    fn test_attach_configures_transport() {
        let h = harness();
        assert!(!h.line.is_blocking());
        assert!(h.line.has_sigio());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = MuxConfig {
            channel_slots: 0,
            ..Default::default()
        };
        assert!(matches!(Mux::new(config), Err(MuxError::InvalidConfig(_))));
    }
}

// ============================================================================
// Retransmission and Timeout
// ============================================================================

mod retransmit_tests {
    use super::*;

    #[test]
    fn test_success_after_lost_sabms() {
        let mut h = harness();
        h.peer.set_policy(Dlci::CONTROL, PeerPolicy::IgnoreFirst(3));
        let mut pending = h.mux.request_mux_start().unwrap();
        h.settle();

        for sends in 2..=4 {
            assert!(unresolved(&mut pending));
            h.expire_t1();
            assert_eq!(h.peer.sabm_count(Dlci::CONTROL), sends);
        }

        assert_eq!(resolved(&mut pending).status, EstablishStatus::Success);
        assert!(h.mux.is_open());
        assert_eq!(h.mux.stats().retransmissions, 3);

        // Every resend is byte-identical to the first
        let original = Frame::sabm(Dlci::CONTROL);
        let sabms: Vec<_> = h
            .peer
            .received()
            .iter()
            .filter(|f| f.kind() == Ok(FrameKind::Sabm))
            .collect();
        assert_eq!(sabms.len(), 4);
        assert!(sabms.iter().all(|f| f.encode() == original.encode()));
    }

    #[test]
    fn test_exhaustion_times_out() {
        let mut h = harness();
        h.peer.set_default_policy(PeerPolicy::Ignore);
        let mut pending = h.mux.request_mux_start().unwrap();
        h.settle();

        for _ in 0..3 {
            h.expire_t1();
            assert!(unresolved(&mut pending));
        }
        assert_eq!(h.peer.sabm_count(Dlci::CONTROL), 4);

        h.expire_t1();
        assert_eq!(resolved(&mut pending).status, EstablishStatus::Timeout);
        assert_eq!(h.peer.sabm_count(Dlci::CONTROL), 4);
        assert!(!h.mux.is_open());
        assert_eq!(h.mux.stats().timeouts, 1);
        assert_eq!(h.queue.pending_timers(), 0);

        // Engine is idle again
        assert!(h.mux.request_mux_start().is_ok());
    }

    #[test]
    fn test_no_resend_before_t1() {
        let mut h = harness();
        h.peer.set_default_policy(PeerPolicy::Ignore);
        let _pending = h.mux.request_mux_start().unwrap();
        h.settle();
        h.queue.advance(t1() - Duration::from_millis(1));
        h.settle();
        assert_eq!(h.peer.sabm_count(Dlci::CONTROL), 1);
    }

    #[test]
    fn test_custom_retransmit_count() {
        let mut h = harness_with(MuxConfig {
            retransmit_count: 1,
            t1_timeout_ms: 50,
            ..Default::default()
        });
        h.peer.set_default_policy(PeerPolicy::Ignore);
        let mut pending = h.mux.request_mux_start().unwrap();
        h.settle();
        h.queue.advance(Duration::from_millis(50));
        h.settle();
        h.queue.advance(Duration::from_millis(50));
        h.settle();
        assert_eq!(resolved(&mut pending).status, EstablishStatus::Timeout);
        assert_eq!(h.peer.sabm_count(Dlci::CONTROL), 2);
    }

    #[test]
    fn test_timer_cancelled_on_answer() {
        let mut h = harness();
        h.open_mux();
        assert_eq!(h.queue.pending_timers(), 0);
        h.queue.advance(t1() * 10);
        h.settle();
        assert_eq!(h.peer.sabm_count(Dlci::CONTROL), 1);
        assert_eq!(h.mux.stats().retransmissions, 0);
    }

    #[test]
    fn test_mismatched_answers_ignored() {
        let mut h = harness();
        h.peer.set_default_policy(PeerPolicy::Ignore);
        let mut pending = h.mux.request_mux_start().unwrap();
        h.settle();

        // Wrong DLCI
        h.peer.send(&Frame::ua(dlci(1)));
        // P/F clear
        h.peer.send(&Frame::new(
            Address::new(Dlci::CONTROL, true),
            Control::new(FrameKind::Ua, false),
            Vec::new(),
        ));
        // C/R clear
        h.peer.send(&Frame::new(
            Address::new(Dlci::CONTROL, false),
            Control::new(FrameKind::Dm, true),
            Vec::new(),
        ));
        h.settle();
        assert!(unresolved(&mut pending));
        assert_eq!(h.mux.stats().frames_received, 3);

        h.peer.send(&Frame::ua(Dlci::CONTROL));
        h.settle();
        assert_eq!(resolved(&mut pending).status, EstablishStatus::Success);
    }
}

// ============================================================================
// DLCI Establishment
// ============================================================================

mod dlci_tests {
    use super::*;

    #[test]
    fn test_establish_returns_channel() {
        let mut h = harness();
        h.open_mux();
        let channel = h.open_channel(5);
        assert_eq!(channel.dlci(), dlci(5));
        assert_eq!(channel.mtu(), 25);
        assert_eq!(h.mux.channels(), vec![dlci(5)]);
        assert!(h.mux.channel(5).is_some());
        assert!(h.mux.channel(6).is_none());
    }

    #[test]
    fn test_invalid_range() {
        let h = harness();
        assert!(matches!(
            h.mux.request_dlci_establish(0),
            Err(MuxError::InvalidRange(0))
        ));
        assert!(matches!(
            h.mux.request_dlci_establish(64),
            Err(MuxError::InvalidRange(64))
        ));
    }

    #[test]
    fn test_requires_open_mux() {
        let h = harness();
        assert!(matches!(
            h.mux.request_dlci_establish(1),
            Err(MuxError::MuxNotOpen)
        ));
    }

    #[test]
    fn test_rejected() {
        let mut h = harness();
        h.open_mux();
        h.peer.set_policy(dlci(7), PeerPolicy::Reject);
        let mut pending = h.mux.request_dlci_establish(7).unwrap();
        h.settle();
        let result = resolved(&mut pending);
        assert_eq!(result.status, EstablishStatus::Reject);
        assert!(result.channel.is_none());
        assert!(h.mux.channels().is_empty());
    }

    #[test]
    fn test_second_request_in_progress() {
        let mut h = harness();
        h.open_mux();
        h.peer.set_policy(dlci(5), PeerPolicy::Ignore);
        let _first = h.mux.request_dlci_establish(5).unwrap();
        h.settle();

        assert!(matches!(
            h.mux.request_dlci_establish(5),
            Err(MuxError::InProgress)
        ));
        assert!(matches!(
            h.mux.request_dlci_establish(6),
            Err(MuxError::InProgress)
        ));
        h.settle();
        assert_eq!(h.peer.sabm_count(dlci(5)), 1);
        assert_eq!(h.peer.sabm_count(dlci(6)), 0);
    }

    #[test]
    fn test_dlci_in_use() {
        let mut h = harness();
        h.open(&[3]);
        let err = h.mux.request_dlci_establish(3).unwrap_err();
        assert!(matches!(err, MuxError::DlciInUse(d) if d == dlci(3)));
        assert!(err.is_no_resource());
    }

    #[test]
    fn test_registry_full() {
        let mut h = harness_with(MuxConfig {
            channel_slots: 2,
            ..Default::default()
        });
        h.open(&[1, 2]);
        let err = h.mux.request_dlci_establish(3).unwrap_err();
        assert!(matches!(err, MuxError::RegistryFull(2)));
        assert!(err.is_no_resource());
        assert_eq!(h.peer.sabm_count(dlci(3)), 0);
    }

    #[test]
    fn test_deferred_until_tx_idle() {
        let mut h = harness();
        let channels = h.open(&[1]);

        // Hold a UIH half-written on the line
        h.line.set_write_capacity(Some(3));
        assert_eq!(channels[0].write(b"abc"), 3);

        let mut pending = h.mux.request_dlci_establish(2).unwrap();
        h.settle();
        assert!(unresolved(&mut pending));
        assert_eq!(h.peer.sabm_count(dlci(2)), 0);

        h.line.set_write_capacity(None);
        h.settle();
        assert_eq!(resolved(&mut pending).status, EstablishStatus::Success);

        let kinds: Vec<_> = h
            .peer
            .received()
            .iter()
            .map(|f| f.kind().unwrap())
            .collect();
        assert_eq!(kinds, vec![FrameKind::Uih, FrameKind::Sabm]);
    }
}

// ============================================================================
// Channel Data
// ============================================================================

mod data_tests {
    use super::*;

    #[test]
    fn test_uih_round_trip() {
        let mut h = harness();
        let channels = h.open(&[5]);
        let channel = &channels[0];

        assert_eq!(channel.write(b"hi"), 2);
        let wire = h.line.take_output();
        assert_eq!(wire, [FLAG, 0x17, 0xEF, 0x05, b'h', b'i', 0xBA, FLAG]);

        h.line.inject(&wire);
        h.queue.run_pending();
        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"hi");
    }

    #[test]
    fn test_write_limits() {
        let mut h = harness();
        let channels = h.open(&[1]);
        assert_eq!(channels[0].write(b""), 0);
        assert_eq!(channels[0].write(&[0x55; 40]), 25);
        h.settle();
        assert_eq!(h.peer.payloads(dlci(1)), vec![vec![0x55; 25]]);
    }

    #[test]
    fn test_read_without_data_would_block() {
        let mut h = harness();
        let channels = h.open(&[1]);
        let mut buf = [0u8; 4];
        let err = channels[0].read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_single_buffer_backpressure() {
        let mut h = harness();
        let channels = h.open(&[1, 2]);
        h.peer.send_data(dlci(1), b"abc").unwrap();
        h.peer.send_data(dlci(2), b"def").unwrap();
        h.queue.run_pending();

        // Second frame stays on the line while channel 1 holds the buffer
        assert_eq!(h.line.unread(), 9);
        let mut buf = [0u8; 2];
        assert!(channels[1].read(&mut buf).is_err());

        assert_eq!(channels[0].read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"ab");
        h.queue.run_pending();
        assert_eq!(h.line.unread(), 9);

        assert_eq!(channels[0].read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], b'c');
        h.queue.run_pending();
        assert_eq!(h.line.unread(), 0);

        assert_eq!(read_all(&channels[1]), b"def");
        assert!(channels[0].read(&mut buf).is_err());
    }

    #[test]
    fn test_uih_for_unknown_channel_dropped() {
        let mut h = harness();
        let channels = h.open(&[1]);
        h.peer.send_data(dlci(9), b"lost").unwrap();
        h.peer.send_data(dlci(1), b"kept").unwrap();
        h.queue.run_pending();
        assert_eq!(read_all(&channels[0]), b"kept");
        assert_eq!(h.mux.stats().frames_dropped, 1);
    }

    #[test]
    fn test_empty_uih_ignored() {
        let mut h = harness();
        let channels = h.open(&[1]);
        h.peer.send_data(dlci(1), b"").unwrap();
        h.peer.send_data(dlci(1), b"x").unwrap();
        h.queue.run_pending();
        assert_eq!(read_all(&channels[0]), b"x");
    }

    #[test]
    fn test_partial_write_resumes() {
        let mut h = harness();
        let channels = h.open(&[2]);
        h.line.set_write_capacity(Some(2));
        assert_eq!(channels[0].write(b"hello"), 5);
        for _ in 0..5 {
            h.line.set_write_capacity(Some(2));
            h.queue.run_pending();
        }
        h.line.set_write_capacity(None);
        h.settle();
        assert_eq!(h.peer.payloads(dlci(2)), vec![b"hello".to_vec()]);
        // SABM 0, SABM 2, UIH
        assert_eq!(h.mux.stats().frames_sent, 3);
    }
}

// ============================================================================
// Callbacks
// ============================================================================

mod callback_tests {
    use super::*;

    #[test]
    fn test_callback_reads_arriving_data() {
        let mut h = harness();
        let channels = h.open(&[1]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channels[0].sigio(move |io| {
            let mut buf = [0u8; 32];
            while let Ok(n) = io.read(&mut buf) {
                if n == 0 {
                    break;
                }
                sink.lock().unwrap().extend_from_slice(&buf[..n]);
            }
        });

        h.peer.send_data(dlci(1), b"one").unwrap();
        h.peer.send_data(dlci(1), b"two").unwrap();
        h.queue.run_pending();
        assert_eq!(*seen.lock().unwrap(), b"onetwo");
    }

    #[test]
    fn test_sigio_fires_for_waiting_data() {
        let mut h = harness();
        let channels = h.open(&[1]);
        h.peer.send_data(dlci(1), b"early").unwrap();
        h.queue.run_pending();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        channels[0].sigio(move |io| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(io.has_data());
            let mut buf = [0u8; 8];
            assert_eq!(io.read(&mut buf).unwrap(), 5);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_write_is_sent_after_return() {
        let mut h = harness();
        let channels = h.open(&[4]);
        channels[0].sigio(|io| {
            let mut buf = [0u8; 32];
            let n = io.read(&mut buf).unwrap_or(0);
            if n > 0 {
                assert_eq!(io.write(&buf[..n]), n);
            }
        });
        h.peer.send_data(dlci(4), b"echo").unwrap();
        h.settle();
        assert_eq!(h.peer.payloads(dlci(4)), vec![b"echo".to_vec()]);
    }

    #[test]
    fn test_second_write_in_callback_is_deferred() {
        let mut h = harness();
        let channels = h.open(&[4]);
        let results = Arc::new(Mutex::new(Vec::new()));
        let log = results.clone();
        let mut queued: Vec<&'static [u8]> = vec![b"one", b"two"];
        channels[0].sigio(move |io| {
            let mut buf = [0u8; 8];
            let _ = io.read(&mut buf);
            while let Some(next) = queued.first() {
                let n = io.write(next);
                log.lock().unwrap().push(n);
                if n == 0 {
                    break;
                }
                queued.remove(0);
            }
        });

        h.peer.send_data(dlci(4), b"go").unwrap();
        h.settle();
        assert_eq!(
            h.peer.payloads(dlci(4)),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
        assert_eq!(*results.lock().unwrap(), vec![3, 0, 3]);
    }

    #[test]
    fn test_refused_writer_called_back() {
        let mut h = harness();
        let channels = h.open(&[1, 2]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        channels[1].sigio(move |io| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert_eq!(io.write(b"b"), 1);
        });

        h.line.set_write_capacity(Some(0));
        assert_eq!(channels[0].write(b"a"), 1);
        assert_eq!(channels[1].write(b"b"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        h.line.set_write_capacity(None);
        h.settle();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.peer.payloads(dlci(1)), vec![b"a".to_vec()]);
        assert_eq!(h.peer.payloads(dlci(2)), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_deferred_writers_served_in_slot_order() {
        let mut h = harness();
        let channels = h.open(&[1, 2, 3]);
        let order = Arc::new(Mutex::new(Vec::new()));
        for channel in &channels {
            let order = order.clone();
            let id = channel.dlci().get();
            channel.sigio(move |io| {
                order.lock().unwrap().push(id);
                io.write(&[b'0' + id]);
            });
        }

        h.line.set_write_capacity(Some(0));
        assert_eq!(channels[0].write(b"first"), 5);
        assert_eq!(channels[2].write(b"x"), 0);
        assert_eq!(channels[1].write(b"x"), 0);
        assert_eq!(channels[0].write(b"x"), 0);

        h.line.set_write_capacity(None);
        h.settle();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        let payloads: Vec<_> = h
            .peer
            .received()
            .iter()
            .map(|f| f.information.clone())
            .collect();
        assert_eq!(
            payloads,
            vec![b"first".to_vec(), b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
    }

    #[test]
    #[should_panic(expected = "called from a channel callback")]
    fn test_establish_from_callback_panics() {
        let mut h = harness();
        let channels = h.open(&[1]);
        let mux = h.mux.clone();
        channels[0].sigio(move |_io| {
            let _ = mux.request_dlci_establish(2);
        });
        h.peer.send_data(dlci(1), b"x").unwrap();
        h.queue.run_pending();
    }

    #[test]
    #[should_panic(expected = "Mux::is_open called from a channel callback")]
    fn test_mux_query_from_callback_panics() {
        let mut h = harness();
        let channels = h.open(&[1]);
        let mux = h.mux.clone();
        channels[0].sigio(move |io| {
            let mut buf = [0u8; 4];
            let _ = io.read(&mut buf);
            let _ = mux.is_open();
        });
        h.peer.send_data(dlci(1), b"x").unwrap();
        h.queue.run_pending();
    }

    #[test]
    #[should_panic(expected = "Mux::stats called from a channel callback")]
    fn test_mux_stats_from_callback_panics() {
        let mut h = harness();
        let channels = h.open(&[1]);
        let mux = h.mux.clone();
        channels[0].sigio(move |_io| {
            let _ = mux.stats();
        });
        h.peer.send_data(dlci(1), b"x").unwrap();
        h.queue.run_pending();
    }

    #[test]
    #[should_panic(expected = "DataChannel::mtu called from a channel callback")]
    fn test_mtu_from_callback_panics() {
        let mut h = harness();
        let channels = h.open(&[1]);
        let handle = channels[0].clone();
        channels[0].sigio(move |_io| {
            let _ = handle.mtu();
        });
        h.peer.send_data(dlci(1), b"x").unwrap();
        h.queue.run_pending();
    }

    #[test]
    #[should_panic(expected = "called from a channel callback")]
    fn test_channel_handle_from_callback_panics() {
        let mut h = harness();
        let channels = h.open(&[1]);
        let handle = channels[0].clone();
        channels[0].sigio(move |_io| {
            handle.write(b"nope");
        });
        h.peer.send_data(dlci(1), b"x").unwrap();
        h.queue.run_pending();
    }

    #[test]
    #[should_panic(expected = "close is not supported")]
    fn test_close_panics() {
        let mut h = harness();
        let mut channels = h.open(&[1]);
        channels.remove(0).close();
    }

    #[test]
    #[should_panic(expected = "seek is not supported")]
    fn test_seek_panics() {
        let mut h = harness();
        let channels = h.open(&[1]);
        channels[0].seek(std::io::SeekFrom::Start(0));
    }
}

// ============================================================================
// Peer-Initiated Frames
// ============================================================================

mod responder_tests {
    use super::*;

    #[test]
    fn test_sabm_before_open_answered_with_dm() {
        let mut h = harness();
        h.peer.send(&Frame::sabm(dlci(3)));
        h.settle();
        assert_eq!(h.peer.received(), &[Frame::dm(dlci(3))]);
    }

    #[test]
    fn test_disc_for_unknown_channel_answered_with_dm() {
        let mut h = harness();
        h.open(&[1]);
        h.peer.send(&Frame::disc(dlci(9)));
        h.settle();
        assert_eq!(h.peer.received(), &[Frame::dm(dlci(9))]);
    }

    #[test]
    fn test_disc_for_open_channel_ignored() {
        let mut h = harness();
        let channels = h.open(&[1]);
        h.peer.send(&Frame::disc(dlci(1)));
        h.settle();
        assert!(h.peer.received().is_empty());

        // Channel still usable
        assert_eq!(channels[0].write(b"ok"), 2);
    }

    #[test]
    fn test_disc_without_poll_ignored_when_open() {
        let mut h = harness();
        h.open(&[]);
        h.peer.send(&Frame::new(
            Address::new(dlci(9), true),
            Control::new(FrameKind::Disc, false),
            Vec::new(),
        ));
        h.settle();
        assert!(h.peer.received().is_empty());
    }

    #[test]
    fn test_response_dropped_while_tx_busy() {
        let mut h = harness();
        let channels = h.open(&[1]);
        h.line.set_write_capacity(Some(0));
        assert_eq!(channels[0].write(b"busy"), 4);
        h.peer.send(&Frame::disc(dlci(9)));
        h.queue.run_pending();

        h.line.set_write_capacity(None);
        h.settle();
        assert_eq!(h.peer.count(FrameKind::Dm), 0);
        assert_eq!(h.mux.stats().frames_dropped, 1);
    }
}

// ============================================================================
// Receive Robustness
// ============================================================================

mod rx_tests {
    use super::*;

    #[test]
    fn test_corrupt_fcs_dropped() {
        let mut h = harness();
        h.peer.set_default_policy(PeerPolicy::Ignore);
        let mut pending = h.mux.request_mux_start().unwrap();
        h.settle();

        let mut bad = Frame::ua(Dlci::CONTROL).encode();
        bad[4] ^= 0x01;
        h.peer.send_raw(&bad);
        h.settle();
        assert!(unresolved(&mut pending));
        assert_eq!(h.mux.stats().fcs_errors, 1);

        h.peer.send(&Frame::ua(Dlci::CONTROL));
        h.settle();
        assert_eq!(resolved(&mut pending).status, EstablishStatus::Success);
    }

    #[test]
    fn test_flag_fill_between_frames() {
        let mut h = harness();
        let channels = h.open(&[1]);
        h.peer.send_raw(&[FLAG, FLAG, FLAG]);
        h.peer.send_data(dlci(1), b"fill").unwrap();
        h.queue.run_pending();
        assert_eq!(read_all(&channels[0]), b"fill");
    }

    #[test]
    fn test_garbage_before_first_frame() {
        let mut h = harness();
        h.peer.send_raw(&[0x00, 0x42, 0x13]);
        h.open_mux();
        assert!(h.mux.is_open());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut h = harness();
        h.line.set_read_chunk(Some(1));
        let channels = h.open(&[1, 2]);
        h.peer.send_data(dlci(2), b"slow").unwrap();
        h.queue.run_pending();
        assert_eq!(read_all(&channels[1]), b"slow");
    }

    #[test]
    fn test_unsupported_type_dropped() {
        let mut h = harness();
        h.peer.send_raw(&[FLAG, 0x03, 0xAA, 0x01, 0xB9, FLAG]);
        h.settle();
        assert_eq!(h.mux.stats().frames_dropped, 1);
        assert!(h.peer.received().is_empty());
    }

    #[test]
    #[should_panic(expected = "multi-octet length")]
    fn test_multi_octet_length_panics() {
        let mut h = harness();
        h.peer.send_raw(&[FLAG, 0x07, 0xEF, 0x02]);
        h.queue.run_pending();
    }
}

// ============================================================================
// Events and Stats
// ============================================================================

mod event_tests {
    use super::*;

    #[test]
    fn test_establishment_events() {
        let mut h = harness();
        let mut rx = h.mux.subscribe();
        h.open(&[2]);
        let events = drain_events(&mut rx);

        assert!(matches!(
            events[0],
            MuxEvent::FrameSent { kind: FrameKind::Sabm, dlci, len: 6 } if dlci == Dlci::CONTROL
        ));
        assert!(events.iter().any(|e| matches!(e, MuxEvent::MuxOpened)));
        assert!(events
            .iter()
            .any(|e| matches!(e, MuxEvent::ChannelOpened { dlci } if *dlci == helpers::dlci(2))));

        let stats = h.mux.stats();
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.frames_received, 2);
    }

    #[test]
    fn test_failure_and_retransmit_events() {
        let mut h = harness();
        h.peer.set_default_policy(PeerPolicy::Ignore);
        let mut rx = h.mux.subscribe();
        let _pending = h.mux.request_mux_start().unwrap();
        h.settle();
        for _ in 0..4 {
            h.expire_t1();
        }
        let events = drain_events(&mut rx);
        let remaining: Vec<u8> = events
            .iter()
            .filter_map(|e| match e {
                MuxEvent::Retransmit { remaining, .. } => Some(*remaining),
                _ => None,
            })
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);
        assert!(events.iter().any(|e| matches!(
            e,
            MuxEvent::EstablishFailed {
                target: EstablishTarget::Control,
                status: EstablishStatus::Timeout
            }
        )));
    }

    #[test]
    fn test_data_ready_event() {
        let mut h = harness();
        let _channels = h.open(&[3]);
        let mut rx = h.mux.subscribe();
        h.peer.send_data(dlci(3), b"abc").unwrap();
        h.queue.run_pending();
        let events = drain_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, MuxEvent::DataReady { len: 3, .. })));
    }
}

// ============================================================================
// Tokio Event Queue
// ============================================================================

mod tokio_tests {
    use super::*;
    use cmux::TokioEventQueue;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn spawn_peer(line: LineHandle) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut peer = SimPeer::new(line);
            loop {
                peer.poll();
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_establish_async() {
        let (serial, line) = VirtualSerial::pair();
        let mux = Mux::new(MuxConfig::default()).unwrap();
        mux.eventqueue_attach(Arc::new(TokioEventQueue::current()))
            .unwrap();
        mux.serial_attach(serial).unwrap();
        let peer = spawn_peer(line);

        let opened = timeout(WAIT, mux.request_mux_start().unwrap().resolved())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(opened.status, EstablishStatus::Success);

        let channel = timeout(WAIT, mux.request_dlci_establish(1).unwrap().resolved())
            .await
            .unwrap()
            .unwrap()
            .channel
            .unwrap();
        assert_eq!(channel.dlci(), dlci(1));
        peer.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_calls_from_worker_thread() {
        let (serial, line) = VirtualSerial::pair();
        let mux = Mux::new(MuxConfig::default()).unwrap();
        mux.eventqueue_attach(Arc::new(TokioEventQueue::current()))
            .unwrap();
        mux.serial_attach(serial).unwrap();
        let peer = spawn_peer(line);

        let result = timeout(
            WAIT,
            tokio::task::spawn_blocking(move || {
                let status = mux.mux_start()?;
                let channel = mux.dlci_establish(2)?;
                Ok::<_, MuxError>((status, channel.status))
            }),
        )
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(result, (EstablishStatus::Success, EstablishStatus::Success));
        peer.abort();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_with_real_timers() {
        let (serial, _line) = VirtualSerial::pair();
        let mux = Mux::new(MuxConfig {
            t1_timeout_ms: 10,
            ..Default::default()
        })
        .unwrap();
        mux.eventqueue_attach(Arc::new(TokioEventQueue::current()))
            .unwrap();
        mux.serial_attach(serial).unwrap();

        let result = timeout(WAIT, mux.request_mux_start().unwrap().resolved())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, EstablishStatus::Timeout);
        assert_eq!(mux.stats().retransmissions, 3);
    }
}

// ============================================================================
// Property-Based Tests
// ============================================================================

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn payload() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 1..=127)
    }

    fn user_dlci() -> impl Strategy<Value = u8> {
        1u8..=63
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_received_payload_read_in_any_chunks(
            data in payload(),
            id in user_dlci(),
            chunk in 1usize..32,
        ) {
            let mut h = harness();
            let channels = h.open(&[id]);
            h.peer.send_data(dlci(id), &data).unwrap();
            h.queue.run_pending();

            let mut out = Vec::new();
            let mut buf = vec![0u8; chunk];
            while let Ok(n) = channels[0].read(&mut buf) {
                prop_assert!(n > 0);
                out.extend_from_slice(&buf[..n]);
            }
            prop_assert_eq!(out, data);
        }

        #[test]
        fn prop_write_sends_mtu_prefix(data in payload(), id in user_dlci()) {
            let mut h = harness();
            let channels = h.open(&[id]);
            let accepted = channels[0].write(&data);
            prop_assert_eq!(accepted, data.len().min(25));
            h.settle();
            prop_assert_eq!(h.peer.payloads(dlci(id)), vec![data[..accepted].to_vec()]);
        }
    }
}
