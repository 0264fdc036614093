//! Delayed transmission and reception.
//!
//! Operations scheduled for an absolute radio time. Every operation occupies
//! a slot from a fixed pool for its lifetime:
//!
//! ```text
//!           registered              timeslot started
//! Stopped --------------> Pending -------------------> Ongoing
//!    ^                       |                            |
//!    +------- cancelled -----+---- done / timed out ------+
//! ```
//!
//! There is a single transmission slot and [`DELAYED_RX_SLOTS`] reception
//! slots. A reception slot stays `Ongoing` until its window times out or is
//! cancelled.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use dot15d4_driver::{
    constants::{rx_duration, CCA_DURATION, TURNAROUND_DURATION},
    frame::FrameRef,
    radio::{Channel, RadioCore, ReqOriginator, TermLevel, TxParams},
    rsch::{TimeslotArbiter, TimeslotId, TimeslotOp, TimeslotPriority, TimeslotRequest, TimeslotType},
    timer::{RadioDuration, RadioInstant, RadioTimerApi, TimerService},
};
use dot15d4_util::{
    debug,
    sync::{AtomicRepr, AtomicState},
    trace, warn,
};
use heapless::Deque;
use portable_atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::{
    const_config::DELAYED_RX_SLOTS,
    notification::{NotificationSink, RxError, TransmitAtMetadata, TxError, TxFailedMetadata},
    Mac, Platform, TimerId,
};

/// Time from the start of a delayed transmission timeslot until the first
/// bit is on air.
pub const TX_SETUP_DURATION: RadioDuration = RadioDuration::from_ticks(190);
/// Time from the start of a delayed reception timeslot until the receiver is
/// ready.
pub const RX_SETUP_DURATION: RadioDuration = RadioDuration::from_ticks(190);
/// Receiver ramp-up time.
pub const RX_RAMP_UP_DURATION: RadioDuration = RadioDuration::from_ticks(40);
/// Additional lead time of a transmission preceded by a CCA.
pub const CCA_LEAD_DURATION: RadioDuration = RadioDuration::from_ticks(
    RX_RAMP_UP_DURATION.ticks() + CCA_DURATION.ticks() + TURNAROUND_DURATION.ticks(),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayedOpState {
    Stopped,
    /// Registered with the arbiter.
    Pending,
    /// The timeslot started.
    Ongoing,
}

impl AtomicRepr for DelayedOpState {
    fn into_bits(self) -> u8 {
        self as u8
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => DelayedOpState::Stopped,
            1 => DelayedOpState::Pending,
            2 => DelayedOpState::Ongoing,
            _ => unreachable!(),
        }
    }
}

/// A slot of a delayed operation pool, carrying the payload of its kind of
/// operation.
pub(crate) struct DelayedSlot<Op> {
    pub(crate) state: AtomicState<DelayedOpState>,
    pub(crate) id: AtomicU32,
    pub(crate) op: Op,
}

impl<Op> DelayedSlot<Op> {
    fn new(op: Op) -> Self {
        Self {
            state: AtomicState::new(DelayedOpState::Stopped),
            id: AtomicU32::new(TimeslotId::INVALID.0),
            op,
        }
    }

    fn id(&self) -> TimeslotId {
        TimeslotId(self.id.load(Ordering::Acquire))
    }

    fn is_active(&self) -> bool {
        self.state.load() != DelayedOpState::Stopped
    }

    /// Returns the slot to the pool.
    fn reset(&self) {
        self.id.store(TimeslotId::INVALID.0, Ordering::Release);
        self.state.store(DelayedOpState::Stopped);
    }
}

pub(crate) struct TxOp {
    data: Mutex<Cell<Option<(FrameRef, TxParams)>>>,
}

/// The frame whose reception started inside a reception window.
struct ExtensionFrame {
    sof: AtomicU64,
    psdu_len: AtomicU8,
    ack_requested: AtomicBool,
}

pub(crate) struct RxOp {
    channel: AtomicState<Channel>,
    timeout_us: AtomicU64,
    /// Expiry of the window timeout.
    trigger: AtomicU64,
    extension: ExtensionFrame,
}

impl RxOp {
    fn new() -> Self {
        Self {
            channel: AtomicState::new(Channel::_11),
            timeout_us: AtomicU64::new(0),
            trigger: AtomicU64::new(0),
            extension: ExtensionFrame {
                sof: AtomicU64::new(0),
                psdu_len: AtomicU8::new(0),
                ack_requested: AtomicBool::new(false),
            },
        }
    }

    fn clear_extension(&self) {
        self.extension.psdu_len.store(0, Ordering::Release);
    }
}

pub(crate) struct DelayedTrx {
    pub(crate) tx: DelayedSlot<TxOp>,
    pub(crate) rx: [DelayedSlot<RxOp>; DELAYED_RX_SLOTS],
    /// Slots waiting for the outcome of their reception request, in request
    /// order.
    rx_queue: Mutex<RefCell<Deque<u8, DELAYED_RX_SLOTS>>>,
}

impl DelayedTrx {
    pub(crate) fn new() -> Self {
        Self {
            tx: DelayedSlot::new(TxOp {
                data: Mutex::new(Cell::new(None)),
            }),
            rx: core::array::from_fn(|_| DelayedSlot::new(RxOp::new())),
            rx_queue: Mutex::new(RefCell::new(Deque::new())),
        }
    }

    /// Finds the active reception slot registered as `id`.
    fn rx_slot(&self, id: TimeslotId) -> Option<usize> {
        self.rx
            .iter()
            .position(|slot| slot.is_active() && slot.id() == id)
    }

    fn take_tx_data(&self) -> Option<(FrameRef, TxParams)> {
        critical_section::with(|cs| self.tx.op.data.borrow(cs).take())
    }

    fn enqueue_result(&self, index: usize) -> bool {
        critical_section::with(|cs| {
            self.rx_queue
                .borrow_ref_mut(cs)
                .push_back(index as u8)
                .is_ok()
        })
    }

    fn dequeue_result(&self) -> Option<usize> {
        critical_section::with(|cs| self.rx_queue.borrow_ref_mut(cs).pop_front())
            .map(usize::from)
    }

    /// Drops the entry of `index` while keeping the order of the others.
    fn withdraw_result(&self, index: usize) {
        critical_section::with(|cs| {
            let mut queue = self.rx_queue.borrow_ref_mut(cs);
            for _ in 0..queue.len() {
                if let Some(queued) = queue.pop_front() {
                    if usize::from(queued) != index {
                        // Cannot fail, an entry was just taken out.
                        let _ = queue.push_back(queued);
                    }
                }
            }
        })
    }
}

impl<P: Platform> Mac<P> {
    /// Schedules the transmission of `frame` so that its first bit is on air
    /// at `tx_time`.
    ///
    /// Returns `false` if a delayed transmission is already scheduled or the
    /// arbiter rejected the timeslot. Otherwise exactly one transmission
    /// outcome will be notified, unless the transmission is cancelled.
    pub fn transmit_at(
        &self,
        frame: FrameRef,
        tx_time: RadioInstant,
        metadata: &TransmitAtMetadata,
    ) -> bool {
        let slot = &self.delayed_trx.tx;
        if !slot.state.cas(DelayedOpState::Stopped, DelayedOpState::Pending) {
            debug!("delayed tx: slot busy");
            return false;
        }

        let params = TxParams {
            frame_props: metadata.frame_props,
            tx_power: metadata.tx_power.unwrap_or(self.pib.tx_power()),
            channel: metadata.channel.unwrap_or(self.pib.channel()),
            cca: metadata.cca,
            immediate: true,
        };
        critical_section::with(|cs| slot.op.data.borrow(cs).set(Some((frame, params))));
        slot.id.store(TimeslotId::DELAYED_TX.0, Ordering::Release);

        let mut lead = TX_SETUP_DURATION;
        if metadata.cca {
            lead = lead + CCA_LEAD_DURATION;
        }
        let trigger = tx_time
            .checked_sub_duration(lead)
            .unwrap_or(RadioInstant::from_ticks(0));

        let accepted = self.rsch.request(TimeslotRequest {
            id: TimeslotId::DELAYED_TX,
            op: TimeslotOp::DelayedTx,
            trigger,
            priority: TimeslotPriority::Tx,
            kind: TimeslotType::Precise,
        });
        if !accepted {
            warn!("delayed tx: timeslot rejected");
            self.delayed_trx.take_tx_data();
            slot.reset();
        }
        accepted
    }

    pub(crate) fn delayed_tx_timeslot_started(&self) {
        let slot = &self.delayed_trx.tx;
        if !slot.state.cas(DelayedOpState::Pending, DelayedOpState::Ongoing) {
            self.rsch.cancel(TimeslotId::DELAYED_TX, true);
            return;
        }

        let Some((frame, params)) = self.delayed_trx.take_tx_data() else {
            // Safety: The data is set before entering `Pending` and only
            //         taken when leaving it.
            unreachable!()
        };

        let accepted = self.transmit_request(
            TermLevel::Ieee802154,
            ReqOriginator::DelayedTrx,
            frame,
            &params,
        );
        self.rsch.cancel(TimeslotId::DELAYED_TX, true);
        slot.reset();

        if !accepted {
            debug!("delayed tx: transmission rejected");
            let metadata = TxFailedMetadata {
                frame_props: params.frame_props,
            };
            self.on_tx_failed(frame, TxError::TimeslotDenied, &metadata);
        }
    }

    /// Cancels the scheduled delayed transmission.
    ///
    /// Returns `true` if the transmission was cancelled before its timeslot
    /// started. Nothing is notified for a cancelled transmission.
    pub fn transmit_at_cancel(&self) -> bool {
        let slot = &self.delayed_trx.tx;
        if slot.state.load() != DelayedOpState::Pending {
            return false;
        }
        if !self.rsch.cancel(TimeslotId::DELAYED_TX, false) {
            // Lost the race against the timeslot start.
            return false;
        }
        self.delayed_trx.take_tx_data();
        slot.reset();
        true
    }

    /// Schedules a reception window opening at `rx_time` on `channel`.
    ///
    /// The window closes `timeout` after the receiver was started, unless a
    /// frame is still being received. Returns `false` if `id` is already in
    /// use or reserved, if no slot is free or if the arbiter rejected the
    /// timeslot.
    pub fn receive_at(
        &self,
        rx_time: RadioInstant,
        timeout: RadioDuration,
        channel: Channel,
        id: u32,
    ) -> bool {
        let id = TimeslotId(id);
        if id.is_reserved() {
            return false;
        }
        if self.delayed_trx.rx_slot(id).is_some() {
            debug!("delayed rx: window {} already scheduled", id.0);
            return false;
        }

        let Some((index, slot)) = self
            .delayed_trx
            .rx
            .iter()
            .enumerate()
            .find(|(_, slot)| slot.state.cas(DelayedOpState::Stopped, DelayedOpState::Pending))
        else {
            debug!("delayed rx: no free slot");
            return false;
        };

        slot.op.channel.store(channel);
        slot.op.timeout_us.store(timeout.ticks(), Ordering::Relaxed);
        slot.op.clear_extension();
        slot.id.store(id.0, Ordering::Release);

        let trigger = rx_time
            .checked_sub_duration(RX_SETUP_DURATION)
            .unwrap_or(RadioInstant::from_ticks(0));
        let accepted = self.rsch.request(TimeslotRequest {
            id,
            op: TimeslotOp::DelayedRx,
            trigger,
            priority: TimeslotPriority::IdleListening,
            kind: TimeslotType::Precise,
        });
        if !accepted {
            warn!("delayed rx: timeslot rejected");
            slot.reset();
            return false;
        }

        trace!("delayed rx: window {} in slot {}", id.0, index);
        true
    }

    pub(crate) fn delayed_rx_timeslot_started(&self, id: TimeslotId) {
        let Some(index) = self.delayed_trx.rx_slot(id) else {
            self.rsch.cancel(id, true);
            return;
        };
        let slot = &self.delayed_trx.rx[index];
        if !slot.state.cas(DelayedOpState::Pending, DelayedOpState::Ongoing) {
            self.rsch.cancel(id, true);
            return;
        }

        let channel = slot.op.channel.load();
        if channel != self.pib.channel() {
            self.pib.set_channel(channel);
            if !self
                .radio
                .request_channel_update(ReqOriginator::DelayedTrx, channel)
            {
                debug!("delayed rx: channel update rejected");
                self.rsch.cancel(id, true);
                self.delayed_rx_finish(index, RxError::DelayedTimeslotDenied, false);
                return;
            }
        }

        if !self.delayed_trx.enqueue_result(index) {
            warn!("delayed rx: result queue full");
            self.rsch.cancel(id, true);
            self.delayed_rx_finish(index, RxError::DelayedTimeslotDenied, false);
            return;
        }

        let accepted =
            self.radio
                .request_receive(TermLevel::Ieee802154, ReqOriginator::DelayedTrx, id.0);

        // Reception goes on under the radio core's control.
        self.rsch.cancel(id, true);

        if !accepted {
            debug!("delayed rx: reception rejected");
            self.delayed_trx.withdraw_result(index);
            self.delayed_rx_finish(index, RxError::DelayedTimeslotDenied, false);
        }
    }

    /// Outcome of the reception requested for the oldest waiting window.
    pub(crate) fn delayed_rx_result(&self, accepted: bool) {
        let Some(index) = self.delayed_trx.dequeue_result() else {
            warn!("delayed rx: unexpected reception result");
            return;
        };
        let slot = &self.delayed_trx.rx[index];
        if slot.state.load() != DelayedOpState::Ongoing {
            // Cancelled while waiting for the result.
            return;
        }

        if !accepted {
            self.delayed_rx_finish(index, RxError::DelayedTimeslotDenied, false);
            return;
        }

        // A single radio serves one window at a time.
        for other in (0..DELAYED_RX_SLOTS).filter(|&other| other != index) {
            self.delayed_rx_abort_slot(other);
        }

        slot.op.clear_extension();
        let timeout = RadioDuration::from_ticks(slot.op.timeout_us.load(Ordering::Relaxed));
        let trigger = self.clock.now() + timeout;
        slot.op.trigger.store(trigger.ticks(), Ordering::Relaxed);
        if self.timer.add(TimerId::DelayedRx(index as u8), trigger).is_err() {
            warn!("delayed rx: no timer");
            self.delayed_rx_finish(index, RxError::DelayedTimeout, false);
        }
    }

    pub(crate) fn delayed_rx_timeout_fired(&self, index: usize) {
        let Some(slot) = self.delayed_trx.rx.get(index) else {
            return;
        };
        if slot.state.load() != DelayedOpState::Ongoing {
            return;
        }

        let extension = &slot.op.extension;
        let psdu_len = extension.psdu_len.load(Ordering::Acquire);
        fence(Ordering::Acquire);
        if psdu_len > 0 {
            let sof = RadioInstant::from_ticks(extension.sof.load(Ordering::Relaxed));
            let duration = rx_duration(psdu_len, extension.ack_requested.load(Ordering::Relaxed));
            if sof + duration > self.clock.now() {
                // The frame is still being received.
                let trigger =
                    RadioInstant::from_ticks(slot.op.trigger.load(Ordering::Relaxed)) + duration;
                slot.op.trigger.store(trigger.ticks(), Ordering::Relaxed);
                trace!("delayed rx: window extended");
                if self
                    .timer
                    .add(TimerId::DelayedRx(index as u8), trigger)
                    .is_ok()
                {
                    return;
                }
                warn!("delayed rx: no timer for extension");
            }
        }

        if self.delayed_rx_finish(index, RxError::DelayedTimeout, false)
            && !self.pib.rx_on_when_idle()
        {
            self.radio.request_sleep(TermLevel::None);
        }
    }

    /// Stops an ongoing reception slot and notifies `error`.
    ///
    /// Returns `false` if somebody else stopped the slot first.
    fn delayed_rx_finish(&self, index: usize, error: RxError, allow_drop: bool) -> bool {
        let slot = &self.delayed_trx.rx[index];
        let id = slot.id();
        if !slot.state.cas(DelayedOpState::Ongoing, DelayedOpState::Stopped) {
            return false;
        }
        self.timer.remove(TimerId::DelayedRx(index as u8));
        slot.id.store(TimeslotId::INVALID.0, Ordering::Release);
        debug!("delayed rx: window {} closed", id.0);
        if !self.sink.receive_failed(error, id.0, allow_drop) && !allow_drop {
            warn!("delayed rx: outcome of window {} dropped", id.0);
        }
        true
    }

    fn delayed_rx_abort_slot(&self, index: usize) -> bool {
        self.delayed_rx_finish(index, RxError::DelayedAborted, true)
    }

    /// Records the start of a frame received inside an open window.
    pub(crate) fn delayed_trx_rx_started_hook(&self, frame: FrameRef) {
        let sof = self.radio.last_rx_sof_timestamp();
        for slot in self
            .delayed_trx
            .rx
            .iter()
            .filter(|slot| slot.state.load() == DelayedOpState::Ongoing)
        {
            let extension = &slot.op.extension;
            extension.sof.store(sof.ticks(), Ordering::Relaxed);
            extension
                .ack_requested
                .store(frame.ack_request(), Ordering::Relaxed);
            fence(Ordering::Release);
            extension
                .psdu_len
                .store(frame.psdu_length(), Ordering::Release);
        }
    }

    /// Cancels the reception window `id`, whether it is still scheduled or
    /// already open. Nothing is notified for a cancelled window.
    ///
    /// Returns `true` if the window was stopped.
    pub fn receive_at_cancel(&self, id: u32) -> bool {
        let id = TimeslotId(id);
        let Some(index) = self.delayed_trx.rx_slot(id) else {
            return false;
        };
        let slot = &self.delayed_trx.rx[index];

        if slot.state.load() == DelayedOpState::Pending && self.rsch.cancel(id, false) {
            slot.reset();
            return true;
        }

        if slot.state.cas(DelayedOpState::Ongoing, DelayedOpState::Stopped) {
            self.timer.remove(TimerId::DelayedRx(index as u8));
            slot.id.store(TimeslotId::INVALID.0, Ordering::Release);
            return true;
        }

        false
    }

    /// Cancels the reception window `id` only if it has not opened yet. An
    /// open window runs until its timeout.
    pub fn receive_at_scheduled_cancel(&self, id: u32) -> bool {
        let id = TimeslotId(id);
        let Some(index) = self.delayed_trx.rx_slot(id) else {
            return false;
        };
        let slot = &self.delayed_trx.rx[index];
        if slot.state.load() != DelayedOpState::Pending || !self.rsch.cancel(id, false) {
            return false;
        }
        slot.reset();
        true
    }

    /// Aborts all open reception windows.
    ///
    /// Returns `false` if a window is open and `term_lvl` is too low to close
    /// it.
    pub fn delayed_trx_abort(&self, term_lvl: TermLevel, originator: ReqOriginator) -> bool {
        if originator == ReqOriginator::DelayedTrx {
            return true;
        }

        let ongoing = self
            .delayed_trx
            .rx
            .iter()
            .any(|slot| slot.state.load() == DelayedOpState::Ongoing);
        if !ongoing {
            return true;
        }
        if term_lvl < TermLevel::Ieee802154 {
            return false;
        }

        for index in 0..DELAYED_RX_SLOTS {
            self.delayed_rx_abort_slot(index);
        }
        true
    }

    /// Time until the middle of the nearest scheduled reception window.
    pub fn nearest_delayed_rx_midpoint(&self) -> Option<RadioDuration> {
        let now = self.clock.now();
        self.delayed_trx
            .rx
            .iter()
            .filter(|slot| slot.state.load() == DelayedOpState::Pending)
            .filter_map(|slot| {
                let time_to_start = self.rsch.time_to_start(slot.id(), now)?;
                let half_window = slot.op.timeout_us.load(Ordering::Relaxed) / 2;
                Some(time_to_start + RX_SETUP_DURATION + RadioDuration::from_ticks(half_window))
            })
            .min()
    }

    pub fn delayed_tx_state(&self) -> DelayedOpState {
        self.delayed_trx.tx.state.load()
    }

    /// State of the reception window `id`, `Stopped` if unknown.
    pub fn delayed_rx_state(&self, id: u32) -> DelayedOpState {
        self.delayed_trx
            .rx_slot(TimeslotId(id))
            .map(|index| self.delayed_trx.rx[index].state.load())
            .unwrap_or(DelayedOpState::Stopped)
    }
}
