//! IEEE 802.15.4 MAC timing core.
//!
//! The core coordinates microsecond-scale timing against a single shared
//! radio. It is made of four cooperating state machines:
//! - the CSMA-CA backoff engine ([`csma_ca`]),
//! - the inter-frame spacing gate ([`ifs`]),
//! - the delayed transmission/reception scheduler ([`delayed_trx`]),
//! - the ACK timeout supervisor ([`ack_timeout`]).
//!
//! All of them live inside a single [`Mac`] runtime that also owns the
//! platform collaborators: the radio time source, the timer service, the
//! radio scheduling arbiter, the radio core and the upper layer's
//! notification sink.
//!
//! Each state machine keeps its state in an atomic and moves between states
//! exclusively by compare-and-swap. Events are delivered from interrupt
//! context (radio core, arbiter and timer events) and from the upper layer
//! concurrently. A transition that finds the state already changed fails
//! cleanly, so that exactly one party ever reports the terminal outcome of
//! an operation.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod ack_timeout;
pub mod const_config;
pub mod csma_ca;
pub mod delayed_trx;
pub mod hooks;
pub mod ifs;
pub mod notification;
pub mod pib;

#[cfg(test)]
mod test_utils;

use core::cell::RefCell;

use critical_section::Mutex;
use dot15d4_driver::{
    radio::RadioCore,
    rsch::{TimeslotArbiter, TimeslotOp, TimeslotRequest},
    timer::{RadioTimerApi, TimerService},
};
use rand_core::RngCore;

use ack_timeout::AckTimeout;
use csma_ca::CsmaCa;
use delayed_trx::DelayedTrx;
use ifs::Ifs;
use notification::NotificationSink;
use pib::Pib;

/// Timers owned by the MAC timing core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum TimerId {
    Ifs,
    AckTimeout,
    /// Timeout of the delayed reception window in the given slot.
    DelayedRx(u8),
}

/// The collaborators a platform provides to the MAC timing core.
pub trait Platform {
    type Clock: RadioTimerApi;
    type Timer: TimerService<TimerId>;
    type Arbiter: TimeslotArbiter;
    type Radio: RadioCore;
    type Sink: NotificationSink;
    type Rng: RngCore;
}

/// The MAC timing core runtime.
///
/// The platform forwards arbiter grants to [`Mac::on_timeslot_started()`],
/// timer expiry to [`Mac::on_timer_fired()`] and radio core events to the
/// hooks in [`hooks`].
pub struct Mac<P: Platform> {
    clock: P::Clock,
    timer: P::Timer,
    rsch: P::Arbiter,
    radio: P::Radio,
    sink: P::Sink,
    /// Pseudo-random number generator
    rng: Mutex<RefCell<P::Rng>>,
    /// PAN Information Base
    pib: Pib,
    csma_ca: CsmaCa,
    ifs: Ifs,
    delayed_trx: DelayedTrx,
    ack_timeout: AckTimeout,
}

impl<P: Platform> Mac<P> {
    pub fn new(
        clock: P::Clock,
        timer: P::Timer,
        rsch: P::Arbiter,
        radio: P::Radio,
        sink: P::Sink,
        rng: P::Rng,
    ) -> Self {
        Self {
            clock,
            timer,
            rsch,
            radio,
            sink,
            rng: Mutex::new(RefCell::new(rng)),
            pib: Pib::new(),
            csma_ca: CsmaCa::new(),
            ifs: Ifs::new(),
            delayed_trx: DelayedTrx::new(),
            ack_timeout: AckTimeout::new(),
        }
    }

    pub fn clock(&self) -> &P::Clock {
        &self.clock
    }

    pub fn timer(&self) -> &P::Timer {
        &self.timer
    }

    pub fn rsch(&self) -> &P::Arbiter {
        &self.rsch
    }

    pub fn radio(&self) -> &P::Radio {
        &self.radio
    }

    pub fn sink(&self) -> &P::Sink {
        &self.sink
    }

    pub fn pib(&self) -> &Pib {
        &self.pib
    }

    /// Dispatches the start of a granted radio timeslot to its owner.
    pub fn on_timeslot_started(&self, request: TimeslotRequest) {
        match request.op {
            TimeslotOp::CsmaCa => self.csma_ca_timeslot_started(),
            TimeslotOp::DelayedTx => self.delayed_tx_timeslot_started(),
            TimeslotOp::DelayedRx => self.delayed_rx_timeslot_started(request.id),
        }
    }

    /// Dispatches an expired timer to its owner.
    pub fn on_timer_fired(&self, id: TimerId) {
        match id {
            TimerId::Ifs => self.ifs_timer_fired(),
            TimerId::AckTimeout => self.ack_timeout_timer_fired(),
            TimerId::DelayedRx(slot) => self.delayed_rx_timeout_fired(slot as usize),
        }
    }

    fn random_u32(&self) -> u32 {
        critical_section::with(|cs| self.rng.borrow_ref_mut(cs).next_u32())
    }
}
