//! Host doubles for the platform collaborators.

use std::{cell::Cell, cell::RefCell, ops::Deref, vec::Vec};

use dot15d4_driver::{
    frame::FrameRef,
    radio::{Channel, RadioCore, ReqOriginator, TermLevel, TxParams},
    rsch::{SoftArbiter, TimeslotArbiter, TimeslotId, TimeslotPriority, TimeslotRequest},
    timer::{RadioDuration, RadioInstant, RadioTimerApi, SoftTimer},
};
use rand::{rngs::StdRng, SeedableRng};

use crate::{
    notification::{NotificationSink, RxError, TxDoneMetadata, TxError, TxFailedMetadata},
    Mac, Platform, TimerId,
};

/// A radio clock that only moves when told to.
#[derive(Default)]
pub struct TestClock(Cell<u64>);

impl TestClock {
    pub fn set(&self, us: u64) {
        self.0.set(us);
    }
}

impl RadioTimerApi for TestClock {
    fn now(&self) -> RadioInstant {
        RadioInstant::from_ticks(self.0.get())
    }
}

/// A software arbiter that records priority updates and can be told to
/// reject new requests.
pub struct TestArbiter {
    inner: SoftArbiter<4>,
    priority_updates: RefCell<Vec<(TimeslotId, TimeslotPriority)>>,
    pub accept_requests: Cell<bool>,
}

impl TestArbiter {
    pub fn priority_updates(&self) -> Vec<(TimeslotId, TimeslotPriority)> {
        self.priority_updates.borrow().clone()
    }
}

impl Default for TestArbiter {
    fn default() -> Self {
        Self {
            inner: SoftArbiter::new(),
            priority_updates: RefCell::new(Vec::new()),
            accept_requests: Cell::new(true),
        }
    }
}

impl Deref for TestArbiter {
    type Target = SoftArbiter<4>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl TimeslotArbiter for TestArbiter {
    fn request(&self, request: TimeslotRequest) -> bool {
        self.accept_requests.get() && self.inner.request(request)
    }

    fn cancel(&self, id: TimeslotId, handler: bool) -> bool {
        self.inner.cancel(id, handler)
    }

    fn update_priority(&self, id: TimeslotId, priority: TimeslotPriority) -> bool {
        self.priority_updates.borrow_mut().push((id, priority));
        self.inner.update_priority(id, priority)
    }

    fn time_to_start(&self, id: TimeslotId, now: RadioInstant) -> Option<RadioDuration> {
        self.inner.time_to_start(id, now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioRequest {
    Transmit {
        term_lvl: TermLevel,
        originator: ReqOriginator,
        frame: FrameRef,
        params: TxParams,
    },
    Receive {
        term_lvl: TermLevel,
        originator: ReqOriginator,
        window_id: u32,
    },
    ChannelUpdate(Channel),
    Sleep,
    AckTimeoutHandle(FrameRef),
}

/// A radio core recording every request.
pub struct TestRadio {
    requests: RefCell<Vec<RadioRequest>>,
    pub accept_transmit: Cell<bool>,
    pub accept_receive: Cell<bool>,
    pub accept_channel_update: Cell<bool>,
    pub accept_ack_timeout_handle: Cell<bool>,
    pub tx_end: Cell<u64>,
    pub rx_sof: Cell<u64>,
}

impl TestRadio {
    pub fn requests(&self) -> Vec<RadioRequest> {
        self.requests.borrow().clone()
    }

    fn record(&self, request: RadioRequest, accepted: &Cell<bool>) -> bool {
        self.requests.borrow_mut().push(request);
        accepted.get()
    }
}

impl Default for TestRadio {
    fn default() -> Self {
        Self {
            requests: RefCell::new(Vec::new()),
            accept_transmit: Cell::new(true),
            accept_receive: Cell::new(true),
            accept_channel_update: Cell::new(true),
            accept_ack_timeout_handle: Cell::new(true),
            tx_end: Cell::new(0),
            rx_sof: Cell::new(0),
        }
    }
}

impl RadioCore for TestRadio {
    fn request_transmit(
        &self,
        term_lvl: TermLevel,
        originator: ReqOriginator,
        frame: FrameRef,
        params: &TxParams,
    ) -> bool {
        let request = RadioRequest::Transmit {
            term_lvl,
            originator,
            frame,
            params: *params,
        };
        self.record(request, &self.accept_transmit)
    }

    fn request_receive(&self, term_lvl: TermLevel, originator: ReqOriginator, window_id: u32) -> bool {
        let request = RadioRequest::Receive {
            term_lvl,
            originator,
            window_id,
        };
        self.record(request, &self.accept_receive)
    }

    fn request_channel_update(&self, _originator: ReqOriginator, channel: Channel) -> bool {
        self.record(RadioRequest::ChannelUpdate(channel), &self.accept_channel_update)
    }

    fn request_sleep(&self, _term_lvl: TermLevel) -> bool {
        self.requests.borrow_mut().push(RadioRequest::Sleep);
        true
    }

    fn request_ack_timeout_handle(&self, frame: FrameRef) -> bool {
        self.record(
            RadioRequest::AckTimeoutHandle(frame),
            &self.accept_ack_timeout_handle,
        )
    }

    fn last_tx_end_timestamp(&self) -> RadioInstant {
        RadioInstant::from_ticks(self.tx_end.get())
    }

    fn last_rx_sof_timestamp(&self) -> RadioInstant {
        RadioInstant::from_ticks(self.rx_sof.get())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Transmitted(FrameRef),
    TransmitFailed(FrameRef, TxError),
    ReceiveFailed(RxError, u32, bool),
}

/// A notification sink recording every notification.
pub struct TestSink {
    notifications: RefCell<Vec<Notification>>,
    /// Whether reception outcomes are taken over by the upper layer.
    pub deliver: Cell<bool>,
}

impl TestSink {
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }

    pub fn clear(&self) {
        self.notifications.borrow_mut().clear();
    }

    fn record(&self, notification: Notification) {
        self.notifications.borrow_mut().push(notification);
    }
}

impl Default for TestSink {
    fn default() -> Self {
        Self {
            notifications: RefCell::new(Vec::new()),
            deliver: Cell::new(true),
        }
    }
}

impl NotificationSink for TestSink {
    fn transmitted(&self, frame: FrameRef, _metadata: &TxDoneMetadata) {
        self.record(Notification::Transmitted(frame));
    }

    fn transmit_failed(&self, frame: FrameRef, error: TxError, _metadata: &TxFailedMetadata) {
        self.record(Notification::TransmitFailed(frame, error));
    }

    fn receive_failed(&self, error: RxError, window_id: u32, allow_drop: bool) -> bool {
        self.record(Notification::ReceiveFailed(error, window_id, allow_drop));
        self.deliver.get()
    }
}

pub struct TestPlatform;

impl Platform for TestPlatform {
    type Clock = TestClock;
    type Timer = SoftTimer<TimerId, 8>;
    type Arbiter = TestArbiter;
    type Radio = TestRadio;
    type Sink = TestSink;
    type Rng = StdRng;
}

pub type TestMac = Mac<TestPlatform>;

pub fn mac() -> TestMac {
    let _ = env_logger::builder().is_test(true).try_init();
    Mac::new(
        TestClock::default(),
        SoftTimer::new(),
        TestArbiter::default(),
        TestRadio::default(),
        TestSink::default(),
        StdRng::seed_from_u64(0),
    )
}

/// Wraps raw PHR + PSDU bytes.
pub fn frame(bytes: &[u8]) -> FrameRef {
    FrameRef::new(Vec::leak(bytes.to_vec())).unwrap()
}

/// A 2006 data frame to a short address, without source address, padded
/// to `psdu_len` octets.
pub fn data_frame(dst: [u8; 2], ack: bool, psdu_len: u8) -> FrameRef {
    assert!(psdu_len >= 9);
    let fcf: u16 = 0b001 | (ack as u16) << 5 | 0b10 << 10 | 0b01 << 12;
    let mut bytes = vec![psdu_len];
    bytes.extend_from_slice(&fcf.to_le_bytes());
    bytes.extend_from_slice(&[0x2a, 0xcd, 0xab, dst[0], dst[1]]);
    bytes.resize(psdu_len as usize + 1, 0);
    frame(&bytes)
}

/// Advances the clock to `deadline_us`, granting due timeslots and firing
/// due timers in time order on the way.
pub fn run_until(mac: &TestMac, deadline_us: u64) {
    let deadline = RadioInstant::from_ticks(deadline_us);
    loop {
        let now = mac.clock().now();
        if let Some(request) = mac.rsch().pop_due(now) {
            mac.on_timeslot_started(request);
            continue;
        }
        if let Some(id) = mac.timer().pop_expired(now) {
            mac.on_timer_fired(id);
            continue;
        }

        let next = [mac.timer().next_expiry(), mac.rsch().next_trigger()]
            .into_iter()
            .flatten()
            .filter(|trigger| *trigger > now && *trigger <= deadline)
            .min();
        match next {
            Some(trigger) => mac.clock().set(trigger.ticks()),
            None => break,
        }
    }

    if mac.clock().now() < deadline {
        mac.clock().set(deadline_us);
    }
}
