//! Inter-frame spacing gate, see IEEE 802.15.4-2024, section 10.1.3.
//!
//! Delays a transmission until the short or long inter-frame spacing after
//! the previously transmitted frame has elapsed. Waiting doesn't need the
//! radio, so the gate uses a plain timer rather than a radio timeslot.

use core::cell::Cell;

use critical_section::Mutex;
use dot15d4_driver::{
    constants::A_MAX_SIFS_FRAME_SIZE,
    frame::{Address, FrameRef},
    radio::{RadioCore, ReqOriginator, TermLevel, TxParams},
    timer::{RadioDuration, RadioInstant, RadioTimerApi, TimerService},
};
use dot15d4_util::{
    debug,
    sync::{AtomicRepr, AtomicState},
    warn,
};

use crate::{
    notification::{TxError, TxFailedMetadata},
    pib::IfsMode,
    Mac, Platform, TimerId,
};

/// Gate states, one-hot encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfsState {
    Stopped = 1 << 0,
    /// A deferred frame waits for the spacing timer.
    Armed = 1 << 1,
    /// The spacing timer fired, the deferred frame is being re-issued.
    Fired = 1 << 2,
    /// The deferred frame is being aborted.
    Aborting = 1 << 3,
}

impl AtomicRepr for IfsState {
    fn into_bits(self) -> u8 {
        self as u8
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0b0001 => IfsState::Stopped,
            0b0010 => IfsState::Armed,
            0b0100 => IfsState::Fired,
            0b1000 => IfsState::Aborting,
            _ => unreachable!(),
        }
    }
}

/// Summary of the last transmitted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LastFrame {
    /// End of the frame.
    timestamp: RadioInstant,
    /// PSDU length, zero if no spacing is required after the frame.
    length: u8,
    dst: Option<Address>,
}

pub(crate) struct Ifs {
    pub(crate) state: AtomicState<IfsState>,
    last_frame: Mutex<Cell<LastFrame>>,
    context: Mutex<Cell<Option<(FrameRef, TxParams)>>>,
}

impl Ifs {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicState::new(IfsState::Stopped),
            last_frame: Mutex::new(Cell::new(LastFrame {
                timestamp: RadioInstant::from_ticks(0),
                length: 0,
                dst: None,
            })),
            context: Mutex::new(Cell::new(None)),
        }
    }

    fn last_frame(&self) -> LastFrame {
        critical_section::with(|cs| self.last_frame.borrow(cs).get())
    }

    fn take_context(&self) -> Option<(FrameRef, TxParams)> {
        critical_section::with(|cs| self.context.borrow(cs).take())
    }
}

impl<P: Platform> Mac<P> {
    /// Decides whether `frame` may be transmitted right away.
    ///
    /// Returns `false` if spacing is required. The gate then owns the frame
    /// and transmits it as soon as the spacing elapsed.
    pub(crate) fn ifs_pretransmission(&self, frame: FrameRef, params: &TxParams) -> bool {
        let mode = self.pib.ifs_mode();
        if params.immediate || mode == IfsMode::Disabled {
            return true;
        }

        let last = self.ifs.last_frame();
        if last.length == 0 {
            return true;
        }
        if mode == IfsMode::MatchingAddresses && frame.dst_address() != last.dst {
            return true;
        }

        let period = if last.length > A_MAX_SIFS_FRAME_SIZE {
            self.pib.lifs_period()
        } else {
            self.pib.sifs_period()
        };
        let now = self.clock.now();
        let elapsed = now
            .checked_duration_since(last.timestamp)
            .unwrap_or(RadioDuration::from_ticks(0));
        if elapsed >= period {
            return true;
        }

        assert!(
            self.ifs.state.cas(IfsState::Stopped, IfsState::Armed),
            "IFS gate already armed"
        );
        critical_section::with(|cs| self.ifs.context.borrow(cs).set(Some((frame, *params))));

        let trigger = last.timestamp + period;
        if self.timer.add(TimerId::Ifs, trigger).is_err() {
            warn!("ifs: no timer, transmitting without spacing");
            self.ifs.take_context();
            self.ifs.state.store(IfsState::Stopped);
            return true;
        }

        debug!("ifs: deferred by {} us", (period - elapsed).ticks());
        false
    }

    /// The spacing elapsed: re-issue the deferred frame.
    pub(crate) fn ifs_timer_fired(&self) {
        if !self.ifs.state.cas(IfsState::Armed, IfsState::Fired) {
            return;
        }

        let Some((frame, mut params)) = self.ifs.take_context() else {
            // Safety: The context is set before arming.
            unreachable!()
        };
        params.immediate = true;

        let accepted =
            self.radio
                .request_transmit(TermLevel::None, ReqOriginator::Ifs, frame, &params);
        self.ifs.state.store(IfsState::Stopped);

        if !accepted {
            debug!("ifs: deferred transmission rejected");
            self.on_tx_failed(
                frame,
                TxError::TimeslotDenied,
                &TxFailedMetadata {
                    frame_props: params.frame_props,
                },
            );
        }
    }

    /// Records the frame that was just transmitted.
    pub(crate) fn ifs_transmitted_hook(&self, frame: FrameRef) {
        let dst = frame.dst_address();
        let last = LastFrame {
            timestamp: self.radio.last_tx_end_timestamp(),
            length: if dst.is_some() { frame.psdu_length() } else { 0 },
            dst,
        };
        critical_section::with(|cs| self.ifs.last_frame.borrow(cs).set(last));
    }

    /// Aborts a deferred transmission.
    ///
    /// Returns `true` if the gate holds no frame after the call.
    pub fn ifs_abort(&self, term_lvl: TermLevel, originator: ReqOriginator) -> bool {
        if originator == ReqOriginator::Ifs {
            return true;
        }

        if term_lvl < TermLevel::Ieee802154 {
            return self
                .ifs
                .state
                .matches_any(IfsState::Stopped as u8 | IfsState::Aborting as u8);
        }

        if self.ifs.state.cas(IfsState::Armed, IfsState::Aborting) {
            self.timer.remove(TimerId::Ifs);
            let context = self.ifs.take_context();
            self.ifs.state.store(IfsState::Stopped);

            if let Some((frame, params)) = context {
                debug!("ifs: deferred transmission aborted");
                self.on_tx_failed(
                    frame,
                    TxError::Aborted,
                    &TxFailedMetadata {
                        frame_props: params.frame_props,
                    },
                );
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use dot15d4_driver::radio::Channel;

    use super::*;
    use crate::{
        csma_ca::CsmaCaState,
        notification::CsmaCaMetadata,
        pib::CsmaBackoffMode,
        test_utils::{data_frame, mac, run_until, Notification, RadioRequest, TestMac},
    };

    fn params() -> TxParams {
        TxParams {
            frame_props: Default::default(),
            tx_power: 0,
            channel: Channel::_11,
            cca: true,
            immediate: false,
        }
    }

    /// Transmits a frame ending at `end`.
    fn transmitted(mac: &TestMac, frame: FrameRef, end: u64) {
        mac.radio().tx_end.set(end);
        mac.on_transmitted(frame, &Default::default());
        mac.sink().clear();
    }

    #[test]
    fn short_frame_to_same_address_is_deferred() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::MatchingAddresses);
        transmitted(&mac, data_frame([0x34, 0x12], false, 18), 1_000);

        mac.clock().set(1_100);
        let frame = data_frame([0x34, 0x12], false, 10);
        assert!(!mac.pre_transmission(frame, &params()));
        assert_eq!(mac.ifs.state.load(), IfsState::Armed);

        // SIFS ends at 1_192.
        run_until(&mac, 1_191);
        assert!(mac.radio().requests().is_empty());
        run_until(&mac, 1_192);
        match mac.radio().requests().as_slice() {
            [RadioRequest::Transmit {
                originator,
                frame: requested,
                params,
                ..
            }] => {
                assert_eq!(*originator, ReqOriginator::Ifs);
                assert_eq!(*requested, frame);
                assert!(params.immediate);
            }
            other => panic!("unexpected requests {other:?}"),
        }
        assert_eq!(mac.ifs.state.load(), IfsState::Stopped);
    }

    #[test]
    fn long_frame_requires_lifs() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::Always);
        transmitted(&mac, data_frame([0x34, 0x12], false, 19), 1_000);

        mac.clock().set(1_500);
        assert!(!mac.pre_transmission(data_frame([0x01, 0x00], false, 10), &params()));
        assert_eq!(mac.timer().next_expiry().map(|t| t.ticks()), Some(1_640));
    }

    #[test]
    fn different_address_is_not_deferred() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::MatchingAddresses);
        transmitted(&mac, data_frame([0x34, 0x12], false, 10), 1_000);

        mac.clock().set(1_001);
        assert!(mac.pre_transmission(data_frame([0x35, 0x12], false, 10), &params()));
        assert_eq!(mac.ifs.state.load(), IfsState::Stopped);
    }

    #[test]
    fn no_delay_required() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::Always);
        let frame = data_frame([0x34, 0x12], false, 10);

        // Nothing transmitted yet.
        assert!(mac.pre_transmission(frame, &params()));

        transmitted(&mac, frame, 1_000);
        mac.clock().set(1_192);
        assert!(mac.pre_transmission(frame, &params()));

        mac.pib().set_ifs_mode(IfsMode::Disabled);
        mac.clock().set(1_001);
        assert!(mac.pre_transmission(frame, &params()));
    }

    #[test]
    fn frame_without_destination_needs_no_spacing() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::Always);
        let beacon = crate::test_utils::frame(&[7, 0x00, 0x80, 0x01, 0xcd, 0xab, 0x00, 0x00]);
        transmitted(&mac, beacon, 1_000);

        mac.clock().set(1_001);
        assert!(mac.pre_transmission(data_frame([0x34, 0x12], false, 10), &params()));
    }

    #[test]
    fn rejected_reissue_is_reported() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::Always);
        transmitted(&mac, data_frame([0x34, 0x12], false, 10), 1_000);
        mac.radio().accept_transmit.set(false);

        mac.clock().set(1_010);
        let frame = data_frame([0x34, 0x12], false, 10);
        assert!(!mac.pre_transmission(frame, &params()));
        run_until(&mac, 2_000);
        assert_eq!(
            mac.sink().notifications(),
            [Notification::TransmitFailed(frame, TxError::TimeslotDenied)]
        );
        assert_eq!(mac.ifs.state.load(), IfsState::Stopped);
    }

    #[test]
    fn abort_reports_deferred_frame() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::Always);
        transmitted(&mac, data_frame([0x34, 0x12], false, 10), 1_000);

        mac.clock().set(1_010);
        let frame = data_frame([0x34, 0x12], false, 10);
        assert!(!mac.pre_transmission(frame, &params()));

        assert!(!mac.ifs_abort(TermLevel::None, ReqOriginator::HigherLayer));
        assert!(mac.ifs_abort(TermLevel::Ieee802154, ReqOriginator::Ifs));
        assert_eq!(mac.ifs.state.load(), IfsState::Armed);

        assert!(mac.ifs_abort(TermLevel::Ieee802154, ReqOriginator::HigherLayer));
        assert_eq!(mac.ifs.state.load(), IfsState::Stopped);
        assert!(!mac.timer().is_running(TimerId::Ifs));
        assert_eq!(
            mac.sink().notifications(),
            [Notification::TransmitFailed(frame, TxError::Aborted)]
        );
        assert!(mac.ifs_abort(TermLevel::None, ReqOriginator::HigherLayer));

        run_until(&mac, 10_000);
        assert!(mac.radio().requests().is_empty());
    }

    #[test]
    fn csma_ca_retries_when_reissue_is_rejected() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::Always);
        mac.pib().set_csma_backoff_mode(CsmaBackoffMode::AlwaysMin);
        transmitted(&mac, data_frame([0x34, 0x12], false, 10), 0);

        let frame = data_frame([0x34, 0x12], false, 10);
        mac.csma_ca_start(frame, &CsmaCaMetadata::default());
        // The backoff timeslot starts at once and the gate defers the frame.
        run_until(&mac, 0);
        assert_eq!(mac.csma_ca_state(), CsmaCaState::Ongoing);
        assert_eq!(mac.ifs.state.load(), IfsState::Armed);
        assert!(mac.radio().requests().is_empty());

        mac.radio().accept_transmit.set(false);
        mac.pib().set_csma_backoff_mode(CsmaBackoffMode::AlwaysMax);
        run_until(&mac, 192);
        // The rejection is handled like a busy channel.
        assert_eq!(mac.radio().requests().len(), 1);
        assert!(mac.sink().notifications().is_empty());
        assert_eq!(mac.csma_ca_state(), CsmaCaState::Backoff);
    }
}
