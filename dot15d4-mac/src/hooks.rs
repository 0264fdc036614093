//! Radio core event hooks.
//!
//! The radio core reports transmission and reception events through these
//! hooks. Each hook fans the event out to the timing state machines in a
//! fixed order before the upper layer is notified, if at all.

use dot15d4_driver::{
    frame::FrameRef,
    radio::{RadioCore, ReqOriginator, TermLevel, TxParams},
};
use dot15d4_util::trace;

use crate::{
    notification::{NotificationSink, TxDoneMetadata, TxError, TxFailedMetadata},
    Mac, Platform,
};

impl<P: Platform> Mac<P> {
    /// Requests a transmission from the radio core, passing the inter-frame
    /// spacing gate first unless the request is immediate.
    ///
    /// Returns `true` if the radio core accepted the request or the gate
    /// deferred it. A deferred frame is re-issued by the gate itself.
    pub fn transmit_request(
        &self,
        term_lvl: TermLevel,
        originator: ReqOriginator,
        frame: FrameRef,
        params: &TxParams,
    ) -> bool {
        if !params.immediate && !self.pre_transmission(frame, params) {
            trace!("mac: transmission deferred by IFS");
            return true;
        }
        self.radio
            .request_transmit(term_lvl, originator, frame, params)
    }

    /// Asks every timing state machine to terminate its operation.
    ///
    /// Returns `true` only if all of them agreed.
    pub fn abort(&self, term_lvl: TermLevel, originator: ReqOriginator) -> bool {
        let csma_ca = self.csma_ca_abort(term_lvl, originator);
        let delayed_trx = self.delayed_trx_abort(term_lvl, originator);
        let ifs = self.ifs_abort(term_lvl, originator);
        let ack_timeout = self.ack_timeout_abort(term_lvl, originator);
        csma_ca && delayed_trx && ifs && ack_timeout
    }

    /// Called before a non-immediate transmission.
    ///
    /// Returns `false` if the transmission must not start now.
    pub fn pre_transmission(&self, frame: FrameRef, params: &TxParams) -> bool {
        self.ifs_pretransmission(frame, params)
    }

    /// The radio core started transmitting `frame`.
    pub fn on_tx_started(&self, frame: FrameRef) {
        self.csma_ca_tx_started_hook(frame);
        if frame.ack_request() {
            self.ack_timeout_tx_started_hook(frame);
        }
    }

    /// The transmission of `frame` failed.
    pub fn on_tx_failed(&self, frame: FrameRef, error: TxError, metadata: &TxFailedMetadata) {
        let report = self.csma_ca_tx_failed_hook(frame, error);
        self.ack_timeout_tx_failed_hook(frame);
        if let Some(error) = report {
            self.sink.transmit_failed(frame, error, metadata);
        }
    }

    /// `frame` was transmitted (and acknowledged, if requested).
    pub fn on_transmitted(&self, frame: FrameRef, metadata: &TxDoneMetadata) {
        self.ifs_transmitted_hook(frame);
        self.ack_timeout_transmitted_hook(frame);
        self.sink.transmitted(frame, metadata);
    }

    /// The radio core detected the start of a frame. `frame` points to the
    /// receive buffer with at least the PHY header in place.
    pub fn on_rx_started(&self, frame: FrameRef) {
        self.delayed_trx_rx_started_hook(frame);
    }

    /// The radio core started receiving the ACK of the frame awaiting one.
    pub fn on_rx_ack_started(&self) {
        self.ack_timeout_rx_ack_started_hook();
    }

    /// Outcome of a reception requested for a delayed reception window.
    pub fn on_delayed_rx_result(&self, accepted: bool) {
        self.delayed_rx_result(accepted);
    }
}

#[cfg(test)]
mod tests {
    use dot15d4_driver::{radio::Channel, timer::TimerService};

    use super::*;
    use crate::{
        csma_ca::CsmaCaState,
        notification::CsmaCaMetadata,
        pib::{CsmaBackoffMode, IfsMode},
        test_utils::{data_frame, mac, run_until, Notification, RadioRequest},
    };

    fn params(immediate: bool) -> TxParams {
        TxParams {
            frame_props: Default::default(),
            tx_power: 0,
            channel: Channel::_11,
            cca: true,
            immediate,
        }
    }

    #[test]
    fn immediate_requests_bypass_gate() {
        let mac = mac();
        mac.pib().set_ifs_mode(IfsMode::Always);
        let frame = data_frame([0x34, 0x12], false, 10);
        mac.radio().tx_end.set(0);
        mac.on_transmitted(frame, &Default::default());

        assert!(mac.transmit_request(
            TermLevel::None,
            ReqOriginator::HigherLayer,
            frame,
            &params(true)
        ));
        assert_eq!(mac.radio().requests().len(), 1);
    }

    #[test]
    fn abort_is_unanimous() {
        let mac = mac();
        assert!(mac.abort(TermLevel::None, ReqOriginator::HigherLayer));

        mac.pib().set_csma_backoff_mode(CsmaBackoffMode::AlwaysMax);
        let frame = data_frame([0x34, 0x12], false, 10);
        mac.csma_ca_start(frame, &CsmaCaMetadata::default());
        assert!(!mac.abort(TermLevel::None, ReqOriginator::HigherLayer));
        assert!(mac.abort(TermLevel::Ieee802154, ReqOriginator::HigherLayer));
        assert_eq!(mac.csma_ca_state(), CsmaCaState::Idle);
    }

    #[test]
    fn csma_ca_transmission_with_ack() {
        let mac = mac();
        mac.pib().set_csma_backoff_mode(CsmaBackoffMode::AlwaysMin);
        let frame = data_frame([0x34, 0x12], true, 30);
        mac.csma_ca_start(frame, &CsmaCaMetadata::default());
        run_until(&mac, 0);
        assert!(matches!(
            mac.radio().requests().as_slice(),
            [RadioRequest::Transmit { .. }]
        ));

        mac.on_tx_started(frame);
        assert!(mac.timer().is_running(crate::TimerId::AckTimeout));
        mac.on_rx_ack_started();
        assert!(!mac.timer().is_running(crate::TimerId::AckTimeout));
        mac.on_transmitted(frame, &Default::default());

        assert_eq!(mac.sink().notifications(), [Notification::Transmitted(frame)]);
        run_until(&mac, 1_000_000);
        assert_eq!(mac.radio().requests().len(), 1);
    }
}
