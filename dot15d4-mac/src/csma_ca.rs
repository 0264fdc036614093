//! CSMA-CA backoff engine, see IEEE 802.15.4-2024, section 10.2.6.
//!
//! ```text
//!         start                 granted              transmission started
//! Idle ----------> Backoff ---------------> Ongoing -----------------------> Idle
//!                    ^                        |
//!                    |      channel busy      |   no retries left
//!                    +------------------------+-------------------------> Idle
//!
//! Backoff/Ongoing ---- abort ----> Aborted ---- (notified once) ----> Idle
//! ```
//!
//! The engine owns the frame from `start` until the radio core reports that
//! the transmission started, failed for good or was aborted.

use core::cell::Cell;

use critical_section::Mutex;
use dot15d4_driver::{
    constants::UNIT_BACKOFF_DURATION,
    frame::FrameRef,
    radio::{ReqOriginator, TermLevel, TxParams},
    rsch::{TimeslotArbiter, TimeslotId, TimeslotOp, TimeslotPriority, TimeslotRequest, TimeslotType},
    timer::RadioTimerApi,
};
use dot15d4_util::{
    debug,
    sync::{AtomicRepr, AtomicState},
    trace, warn,
};
use portable_atomic::{AtomicU8, Ordering};

use crate::{
    notification::{CsmaCaMetadata, NotificationSink, TxError, TxFailedMetadata},
    pib::{CoexTxRequestMode, CsmaBackoffMode},
    Mac, Platform,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsmaCaState {
    Idle,
    /// Waiting for the backoff timeslot.
    Backoff,
    /// Transmission attempt handed to the radio core.
    Ongoing,
    /// Aborted while in `Backoff` or `Ongoing`, the abort has not been
    /// reported yet.
    Aborted,
}

impl AtomicRepr for CsmaCaState {
    fn into_bits(self) -> u8 {
        self as u8
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => CsmaCaState::Idle,
            1 => CsmaCaState::Backoff,
            2 => CsmaCaState::Ongoing,
            3 => CsmaCaState::Aborted,
            _ => unreachable!(),
        }
    }
}

pub(crate) struct CsmaCa {
    pub(crate) state: AtomicState<CsmaCaState>,
    /// Number of backoffs for the current frame (NB).
    pub(crate) nb: AtomicU8,
    /// Backoff exponent (BE).
    pub(crate) be: AtomicU8,
    pub(crate) frame: Mutex<Cell<Option<FrameRef>>>,
    params: Mutex<Cell<Option<TxParams>>>,
}

impl CsmaCa {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicState::new(CsmaCaState::Idle),
            nb: AtomicU8::new(0),
            be: AtomicU8::new(0),
            frame: Mutex::new(Cell::new(None)),
            params: Mutex::new(Cell::new(None)),
        }
    }

    pub(crate) fn frame(&self) -> Option<FrameRef> {
        critical_section::with(|cs| self.frame.borrow(cs).get())
    }

    fn owns(&self, frame: FrameRef) -> bool {
        self.frame() == Some(frame)
    }

    fn params(&self) -> Option<TxParams> {
        critical_section::with(|cs| self.params.borrow(cs).get())
    }

    fn metadata(&self) -> TxFailedMetadata {
        TxFailedMetadata {
            frame_props: self.params().map(|params| params.frame_props).unwrap_or_default(),
        }
    }
}

impl<P: Platform> Mac<P> {
    /// Starts a CSMA-CA transmission of `frame`.
    ///
    /// Always returns `true`: exactly one transmission outcome will be
    /// notified later.
    ///
    /// Panics if a CSMA-CA transmission is already in progress.
    pub fn csma_ca_start(&self, frame: FrameRef, metadata: &CsmaCaMetadata) -> bool {
        assert!(
            self.csma_ca.state.cas(CsmaCaState::Idle, CsmaCaState::Backoff),
            "CSMA-CA already in progress"
        );

        let params = TxParams {
            frame_props: metadata.frame_props,
            tx_power: metadata.tx_power.unwrap_or(self.pib.tx_power()),
            channel: metadata.tx_channel.unwrap_or(self.pib.channel()),
            cca: true,
            immediate: false,
        };
        critical_section::with(|cs| {
            self.csma_ca.frame.borrow(cs).set(Some(frame));
            self.csma_ca.params.borrow(cs).set(Some(params));
        });
        self.csma_ca.nb.store(0, Ordering::Relaxed);
        self.csma_ca.be.store(self.pib.min_be(), Ordering::Relaxed);

        if !self.csma_ca_backoff_start() {
            // The frame never left the engine, report it right away.
            let metadata = self.csma_ca.metadata();
            self.csma_ca_release();
            self.sink
                .transmit_failed(frame, TxError::TimeslotDenied, &metadata);
        }

        true
    }

    pub fn csma_ca_state(&self) -> CsmaCaState {
        self.csma_ca.state.load()
    }

    /// Number of backoff periods to wait for the given backoff exponent.
    pub fn csma_ca_backoff_periods(&self, be: u8) -> u32 {
        let window = 1u32 << be;
        match self.pib.csma_backoff_mode() {
            CsmaBackoffMode::Random => self.random_u32() % window,
            CsmaBackoffMode::AlwaysMax => window - 1,
            CsmaBackoffMode::AlwaysMin => 0,
        }
    }

    /// Registers the backoff timeslot. Returns `false` if the arbiter rejected
    /// it.
    fn csma_ca_backoff_start(&self) -> bool {
        let be = self.csma_ca.be.load(Ordering::Relaxed);
        let periods = self.csma_ca_backoff_periods(be);
        let trigger = self.clock.now() + UNIT_BACKOFF_DURATION * periods;

        let priority = match self.pib.coex_tx_request_mode() {
            CoexTxRequestMode::FrameReady => TimeslotPriority::Tx,
            _ => TimeslotPriority::IdleListening,
        };

        trace!("csma-ca: backoff BE={} periods={}", be, periods);
        let accepted = self.rsch.request(TimeslotRequest {
            id: TimeslotId::CSMA_CA,
            op: TimeslotOp::CsmaCa,
            trigger,
            priority,
            kind: TimeslotType::Relaxed,
        });
        if !accepted {
            warn!("csma-ca: backoff timeslot rejected");
        }
        accepted
    }

    /// Drops frame ownership.
    fn csma_ca_clear(&self) {
        critical_section::with(|cs| {
            self.csma_ca.frame.borrow(cs).set(None);
            self.csma_ca.params.borrow(cs).set(None);
        });
    }

    /// Drops frame ownership and returns to `Idle`.
    fn csma_ca_release(&self) {
        self.csma_ca_clear();
        self.csma_ca.state.store(CsmaCaState::Idle);
    }

    /// Reports an abort that hasn't been reported yet. Only the party that
    /// moves the engine from `Aborted` to `Idle` reports.
    fn csma_ca_notify_aborted(&self) {
        let metadata = self.csma_ca.metadata();
        let frame = self.csma_ca.frame();
        if !self.csma_ca.state.cas(CsmaCaState::Aborted, CsmaCaState::Idle) {
            return;
        }
        self.csma_ca_clear();
        if let Some(frame) = frame {
            debug!("csma-ca: aborted");
            self.sink
                .transmit_failed(frame, TxError::Aborted, &metadata);
        }
    }

    /// The backoff timeslot started: attempt the transmission.
    pub(crate) fn csma_ca_timeslot_started(&self) {
        if !self
            .csma_ca
            .state
            .cas(CsmaCaState::Backoff, CsmaCaState::Ongoing)
        {
            // Aborted while the timeslot was being granted.
            self.rsch.cancel(TimeslotId::CSMA_CA, true);
            if self.csma_ca.state.load() == CsmaCaState::Aborted {
                self.csma_ca_notify_aborted();
            }
            return;
        }

        let nb = self.csma_ca.nb.load(Ordering::Relaxed);
        if nb == 0 && self.pib.coex_tx_request_mode() == CoexTxRequestMode::CcaDone {
            assert!(self
                .rsch
                .update_priority(TimeslotId::CSMA_CA, TimeslotPriority::Tx));
        }

        let (Some(frame), Some(params)) = (self.csma_ca.frame(), self.csma_ca.params()) else {
            // Safety: The frame and its parameters are set before entering
            //         `Backoff` and only cleared when leaving `Ongoing`.
            unreachable!()
        };

        let accepted =
            self.transmit_request(TermLevel::None, ReqOriginator::CsmaCa, frame, &params);
        self.rsch.cancel(TimeslotId::CSMA_CA, true);

        if !accepted {
            // The radio is busy with something else: treat like a busy
            // channel.
            let metadata = self.csma_ca.metadata();
            if let Some(error) = self.csma_ca_channel_busy(TxError::BusyChannel) {
                debug!("csma-ca: transmission failed for good");
                self.sink.transmit_failed(frame, error, &metadata);
            }
        }
    }

    /// Handles a busy channel reported as `error`.
    ///
    /// Returns the error the caller must report, or `None` if another backoff
    /// was scheduled. An abort that raced the failure is reported as
    /// [`TxError::Aborted`].
    fn csma_ca_channel_busy(&self, error: TxError) -> Option<TxError> {
        if !self
            .csma_ca
            .state
            .cas(CsmaCaState::Ongoing, CsmaCaState::Backoff)
        {
            // Aborted concurrently: whoever moves to Idle reports.
            if self.csma_ca.state.cas(CsmaCaState::Aborted, CsmaCaState::Idle) {
                self.csma_ca_clear();
                return Some(TxError::Aborted);
            }
            return None;
        }

        let nb = self.csma_ca.nb.load(Ordering::Relaxed) + 1;
        self.csma_ca.nb.store(nb, Ordering::Relaxed);
        let be = self.csma_ca.be.load(Ordering::Relaxed);
        if be < self.pib.max_be() {
            self.csma_ca.be.store(be + 1, Ordering::Relaxed);
        }

        if nb > self.pib.max_csma_backoffs() {
            debug!("csma-ca: channel access failure");
            self.csma_ca_release();
            return Some(error);
        }

        if !self.csma_ca_backoff_start() {
            self.csma_ca_release();
            return Some(error);
        }

        None
    }

    /// Aborts CSMA-CA.
    ///
    /// Returns `true` if the engine is idle after the call or will report the
    /// abort. Returns `false` if `term_lvl` is too low to preempt the ongoing
    /// procedure.
    pub fn csma_ca_abort(&self, term_lvl: TermLevel, originator: ReqOriginator) -> bool {
        if originator == ReqOriginator::CsmaCa {
            return true;
        }

        match self.csma_ca.state.load() {
            CsmaCaState::Idle | CsmaCaState::Aborted => true,
            _ if term_lvl < TermLevel::Ieee802154 => false,
            CsmaCaState::Backoff => {
                if !self
                    .csma_ca
                    .state
                    .cas(CsmaCaState::Backoff, CsmaCaState::Aborted)
                {
                    // The timeslot started meanwhile, retry from `Ongoing`.
                    return self.csma_ca_abort(term_lvl, originator);
                }
                if self.rsch.cancel(TimeslotId::CSMA_CA, false) {
                    self.csma_ca_notify_aborted();
                }
                // Otherwise the timeslot start handler reports.
                true
            }
            CsmaCaState::Ongoing => {
                if !self
                    .csma_ca
                    .state
                    .cas(CsmaCaState::Ongoing, CsmaCaState::Aborted)
                {
                    return self.csma_ca_abort(term_lvl, originator);
                }
                // The radio core reports the aborted transmission through
                // the tx failed hook.
                true
            }
        }
    }

    /// The radio core started transmitting `frame`.
    pub(crate) fn csma_ca_tx_started_hook(&self, frame: FrameRef) {
        if self.csma_ca.owns(frame) {
            self.csma_ca_release();
        }
    }

    /// The radio core failed to transmit `frame` with `error`.
    ///
    /// Returns the error to report to the upper layer, or `None` if the
    /// engine retries.
    pub(crate) fn csma_ca_tx_failed_hook(
        &self,
        frame: FrameRef,
        error: TxError,
    ) -> Option<TxError> {
        if error.is_security_error() {
            if self.csma_ca.owns(frame) {
                self.csma_ca_release();
            }
            return Some(error);
        }

        match self.csma_ca.state.load() {
            CsmaCaState::Aborted => {
                if self.csma_ca.owns(frame) {
                    self.csma_ca_release();
                } else {
                    // Some other transmission failed: our own abort is still
                    // due.
                    self.csma_ca_notify_aborted();
                }
                Some(error)
            }
            CsmaCaState::Ongoing if self.csma_ca.owns(frame) => self.csma_ca_channel_busy(error),
            _ => Some(error),
        }
    }
}
