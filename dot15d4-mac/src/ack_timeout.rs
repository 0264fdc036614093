//! ACK timeout supervisor.
//!
//! Started when the radio core begins transmitting a frame that requests an
//! acknowledgment. If neither the ACK nor a transmission failure arrives in
//! time, the radio core is asked to give up waiting.

use core::cell::Cell;

use critical_section::Mutex;
use dot15d4_driver::{
    constants::{frame_duration, IMM_ACK_DURATION},
    frame::FrameRef,
    radio::{RadioCore, ReqOriginator, TermLevel},
    timer::{RadioDuration, RadioInstant, RadioTimerApi, TimerService},
};
use dot15d4_util::{debug, error};
use portable_atomic::{fence, AtomicBool, AtomicU32, Ordering};

use crate::{const_config::ACK_TIMEOUT_DEFAULT_US, Mac, Platform, TimerId};

/// Delay before asking the radio core again if it could not handle the
/// timeout.
pub const RETRY_DELAY_US: u32 = 500;
/// Upper bound of the accumulated timeout.
pub const MAX_RETRY_DELAY_US: u32 = 1_000_000;

pub(crate) struct AckTimeout {
    pub(crate) active: AtomicBool,
    frame: Mutex<Cell<Option<FrameRef>>>,
    /// Configured ACK wait time in µs.
    timeout_us: AtomicU32,
    /// Accumulated timer duration for the current frame in µs.
    budget_us: AtomicU32,
    trigger: Mutex<Cell<RadioInstant>>,
}

impl AckTimeout {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            frame: Mutex::new(Cell::new(None)),
            timeout_us: AtomicU32::new(ACK_TIMEOUT_DEFAULT_US),
            budget_us: AtomicU32::new(0),
            trigger: Mutex::new(Cell::new(RadioInstant::from_ticks(0))),
        }
    }

    fn frame(&self) -> Option<FrameRef> {
        critical_section::with(|cs| self.frame.borrow(cs).get())
    }
}

impl<P: Platform> Mac<P> {
    /// Sets the time to wait for an ACK after the transmission ended.
    pub fn ack_timeout_set(&self, timeout_us: u32) {
        self.ack_timeout
            .timeout_us
            .store(timeout_us, Ordering::Relaxed);
    }

    pub fn ack_timeout_is_active(&self) -> bool {
        self.ack_timeout.active.load(Ordering::Acquire)
    }

    pub(crate) fn ack_timeout_tx_started_hook(&self, frame: FrameRef) {
        let budget = self.ack_timeout.timeout_us.load(Ordering::Relaxed) as u64
            + IMM_ACK_DURATION.ticks()
            + frame_duration(frame.psdu_length(), true, true).ticks();
        let trigger = self.clock.now() + RadioDuration::from_ticks(budget);

        critical_section::with(|cs| {
            self.ack_timeout.frame.borrow(cs).set(Some(frame));
            self.ack_timeout.trigger.borrow(cs).set(trigger);
        });
        self.ack_timeout
            .budget_us
            .store(budget as u32, Ordering::Relaxed);
        self.ack_timeout.active.store(true, Ordering::Release);

        if self.timer.add(TimerId::AckTimeout, trigger).is_err() {
            error!("ack timeout: no timer");
            self.ack_timeout.active.store(false, Ordering::Release);
        }
    }

    pub(crate) fn ack_timeout_timer_fired(&self) {
        if !self.ack_timeout.active.load(Ordering::Acquire) {
            return;
        }
        let Some(frame) = self.ack_timeout.frame() else {
            return;
        };

        if self.radio.request_ack_timeout_handle(frame) {
            debug!("ack timeout: handled");
            self.ack_timeout.active.store(false, Ordering::Release);
            return;
        }

        let budget = self.ack_timeout.budget_us.load(Ordering::Relaxed) + RETRY_DELAY_US;
        assert!(budget <= MAX_RETRY_DELAY_US, "ACK timeout retry ceiling exceeded");
        self.ack_timeout.budget_us.store(budget, Ordering::Relaxed);

        let trigger = critical_section::with(|cs| {
            let trigger = self.ack_timeout.trigger.borrow(cs);
            trigger.set(trigger.get() + RadioDuration::from_ticks(RETRY_DELAY_US as u64));
            trigger.get()
        });
        if self.timer.add(TimerId::AckTimeout, trigger).is_err() {
            error!("ack timeout: no timer for retry");
            self.ack_timeout.active.store(false, Ordering::Release);
        }
    }

    /// Stops the supervisor. A timer callback racing with this call observes
    /// the supervisor inactive and does nothing.
    pub fn ack_timeout_stop(&self) {
        self.ack_timeout.active.store(false, Ordering::Release);
        fence(Ordering::SeqCst);
        self.timer.remove(TimerId::AckTimeout);
    }

    pub fn ack_timeout_abort(&self, term_lvl: TermLevel, originator: ReqOriginator) -> bool {
        if originator == ReqOriginator::AckTimeout || !self.ack_timeout_is_active() {
            return true;
        }
        if term_lvl >= TermLevel::Ieee802154 {
            self.ack_timeout_stop();
            return true;
        }
        false
    }

    pub(crate) fn ack_timeout_transmitted_hook(&self, frame: FrameRef) {
        debug_assert!(
            !self.ack_timeout_is_active() || self.ack_timeout.frame() == Some(frame),
            "transmitted frame is not the one awaiting an ACK"
        );
        self.ack_timeout_stop();
    }

    /// Stops supervising `frame` once its transmission failed.
    pub(crate) fn ack_timeout_tx_failed_hook(&self, frame: FrameRef) {
        if self.ack_timeout.frame() == Some(frame) {
            self.ack_timeout_stop();
        }
    }

    pub(crate) fn ack_timeout_rx_ack_started_hook(&self) {
        self.ack_timeout_stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{data_frame, mac, run_until, RadioRequest};

    #[test]
    fn fires_after_budget() {
        let mac = mac();
        mac.ack_timeout_set(1_000);
        let frame = data_frame([0x34, 0x12], true, 10);
        mac.on_tx_started(frame);
        assert!(mac.ack_timeout_is_active());

        // 1000 + 352 + (160 + 32 + 320)
        let deadline = 1_000 + 352 + 512;
        run_until(&mac, deadline - 1);
        assert!(mac.radio().requests().is_empty());
        run_until(&mac, deadline);
        assert_eq!(
            mac.radio().requests(),
            [RadioRequest::AckTimeoutHandle(frame)]
        );
        assert!(!mac.ack_timeout_is_active());
    }

    #[test]
    fn stop_before_trigger_prevents_firing() {
        let mac = mac();
        let frame = data_frame([0x34, 0x12], true, 10);
        mac.on_tx_started(frame);
        run_until(&mac, 100);
        mac.ack_timeout_stop();
        assert!(!mac.ack_timeout_is_active());

        run_until(&mac, 1_000_000);
        assert!(mac.radio().requests().is_empty());
    }

    #[test]
    fn late_callback_after_stop_is_ignored() {
        let mac = mac();
        let frame = data_frame([0x34, 0x12], true, 10);
        mac.on_tx_started(frame);
        mac.ack_timeout_stop();
        mac.on_timer_fired(TimerId::AckTimeout);
        assert!(mac.radio().requests().is_empty());
    }

    #[test]
    fn retries_until_handled() {
        let mac = mac();
        mac.ack_timeout_set(0);
        mac.radio().accept_ack_timeout_handle.set(false);
        let frame = data_frame([0x34, 0x12], true, 10);
        mac.on_tx_started(frame);

        let first = 352 + 512;
        run_until(&mac, first + 2 * RETRY_DELAY_US as u64);
        assert_eq!(mac.radio().requests().len(), 3);
        assert!(mac.ack_timeout_is_active());

        mac.radio().accept_ack_timeout_handle.set(true);
        run_until(&mac, first + 3 * RETRY_DELAY_US as u64);
        assert_eq!(mac.radio().requests().len(), 4);
        assert!(!mac.ack_timeout_is_active());
        assert!(!mac.timer().is_running(TimerId::AckTimeout));
    }

    #[test]
    #[should_panic(expected = "retry ceiling")]
    fn retry_ceiling_is_fatal() {
        let mac = mac();
        mac.ack_timeout_set(MAX_RETRY_DELAY_US - 352 - 512);
        mac.radio().accept_ack_timeout_handle.set(false);
        mac.on_tx_started(data_frame([0x34, 0x12], true, 10));
        run_until(&mac, 2_000_000);
    }

    #[test]
    fn abort_and_failure_hooks() {
        let mac = mac();
        let frame = data_frame([0x34, 0x12], true, 10);
        let other = data_frame([0x34, 0x12], true, 10);
        mac.on_tx_started(frame);

        assert!(!mac.ack_timeout_abort(TermLevel::None, ReqOriginator::HigherLayer));
        assert!(mac.ack_timeout_abort(TermLevel::None, ReqOriginator::AckTimeout));
        assert!(mac.ack_timeout_is_active());

        mac.ack_timeout_tx_failed_hook(other);
        assert!(mac.ack_timeout_is_active());
        mac.ack_timeout_tx_failed_hook(frame);
        assert!(!mac.ack_timeout_is_active());

        mac.on_tx_started(frame);
        assert!(mac.ack_timeout_abort(TermLevel::Ieee802154, ReqOriginator::HigherLayer));
        assert!(!mac.ack_timeout_is_active());
        assert!(mac.ack_timeout_abort(TermLevel::None, ReqOriginator::HigherLayer));
    }
}
