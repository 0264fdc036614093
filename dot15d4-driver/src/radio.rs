//! The radio core request interface.
//!
//! The radio core owns the radio peripheral and its state machine. The MAC
//! timing core never touches the radio directly: it issues requests that the
//! radio core accepts or rejects synchronously, depending on its current
//! state. The outcome of an accepted request is reported later through the
//! MAC runtime's hooks.

use dot15d4_util::{sync::AtomicRepr, Error, Result};

use crate::{frame::FrameRef, timer::RadioInstant};

/// How forcefully a request may preempt an ongoing operation.
///
/// Levels are ordered: a higher level may terminate everything a lower level
/// may terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum TermLevel {
    /// Only terminate operations that are idle (e.g. waiting in a backoff or
    /// a delayed window that has not yet started).
    None,
    /// Terminate any operation that is not protected by the IEEE 802.15.4
    /// standard itself (e.g. an ACK transmission).
    Ieee802154,
}

/// The module that issued a request.
///
/// Modules ignore abort requests they issued themselves. This prevents
/// recursive abort loops when a module's own radio request preempts the radio
/// core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum ReqOriginator {
    HigherLayer,
    Core,
    Rsch,
    CsmaCa,
    DelayedTrx,
    Ifs,
    AckTimeout,
}

/// IEEE 802.15.4 O-QPSK 2.4G channel page 0 channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
#[repr(u8)]
pub enum Channel {
    _11 = 11,
    _12,
    _13,
    _14,
    _15,
    _16,
    _17,
    _18,
    _19,
    _20,
    _21,
    _22,
    _23,
    _24,
    _25,
    _26,
}

impl TryFrom<u8> for Channel {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        use Channel::*;
        const CHANNELS: [Channel; 16] = [
            _11, _12, _13, _14, _15, _16, _17, _18, _19, _20, _21, _22, _23, _24, _25, _26,
        ];
        match value {
            11..=26 => Ok(CHANNELS[(value - 11) as usize]),
            _ => Err(Error),
        }
    }
}

impl From<Channel> for u8 {
    fn from(value: Channel) -> Self {
        value as u8
    }
}

impl AtomicRepr for Channel {
    fn into_bits(self) -> u8 {
        self.into()
    }

    fn from_bits(bits: u8) -> Self {
        Channel::try_from(bits).unwrap_or(Channel::_11)
    }
}

/// Properties of a frame that determine how the radio core may process it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct FrameProps {
    /// Security has already been applied to the frame.
    pub is_secured: bool,
    /// Dynamic header fields (e.g. IE contents) have already been filled in.
    pub dynamic_data_is_set: bool,
}

/// Resolved transmission parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct TxParams {
    pub frame_props: FrameProps,
    /// Transmit power in dBm.
    pub tx_power: i8,
    pub channel: Channel,
    /// Perform a CCA before transmitting.
    pub cca: bool,
    /// Skip inter-frame spacing evaluation.
    pub immediate: bool,
}

/// Requests the MAC timing core issues to the radio core.
///
/// All requests return synchronously whether the radio core accepted them in
/// its current state. A rejected request has no side effects and is never
/// followed by a callback.
pub trait RadioCore {
    /// Requests transmission of `frame`.
    ///
    /// On acceptance, the radio core reports the outcome through the MAC
    /// runtime's transmission hooks (`on_tx_started`, `on_tx_failed`,
    /// `on_transmitted`).
    fn request_transmit(
        &self,
        term_lvl: TermLevel,
        originator: ReqOriginator,
        frame: FrameRef,
        params: &TxParams,
    ) -> bool;

    /// Requests reception for the delayed reception window `window_id`.
    ///
    /// On acceptance, the radio core reports whether the receiver was actually
    /// enabled through `Mac::on_delayed_rx_result()`. The report may be issued
    /// before this method returns.
    fn request_receive(&self, term_lvl: TermLevel, originator: ReqOriginator, window_id: u32)
        -> bool;

    /// Requests the operating channel to be re-applied to the radio.
    fn request_channel_update(&self, originator: ReqOriginator, channel: Channel) -> bool;

    /// Requests the radio to enter sleep.
    fn request_sleep(&self, term_lvl: TermLevel) -> bool;

    /// Requests the radio core to give up waiting for the acknowledgment of
    /// `frame`.
    ///
    /// Returns `false` if the radio core cannot act right now (e.g. because
    /// it is in a critical section), in which case the caller retries.
    fn request_ack_timeout_handle(&self, frame: FrameRef) -> bool;

    /// End of the most recently transmitted frame.
    fn last_tx_end_timestamp(&self) -> RadioInstant;

    /// Start of the frame currently being received.
    fn last_rx_sof_timestamp(&self) -> RadioInstant;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_conversion() {
        assert_eq!(Channel::try_from(11), Ok(Channel::_11));
        assert_eq!(Channel::try_from(26), Ok(Channel::_26));
        assert_eq!(u8::from(Channel::_20), 20);
        assert!(Channel::try_from(10).is_err());
        assert!(Channel::try_from(27).is_err());
    }

    #[test]
    fn termination_levels_are_ordered() {
        assert!(TermLevel::Ieee802154 > TermLevel::None);
    }
}
