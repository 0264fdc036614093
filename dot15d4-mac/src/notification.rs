//! Notifications towards the upper layer and the metadata attached to
//! requests and notifications.
//!
//! The MAC timing core reports every terminal outcome through the
//! [`NotificationSink`]. It is the only path to the upper layer.

use dot15d4_driver::{
    frame::FrameRef,
    radio::{Channel, FrameProps},
};

/// Reasons a transmission failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum TxError {
    /// CSMA-CA found the channel busy on every attempt.
    BusyChannel,
    /// The received ACK frame was invalid.
    InvalidAck,
    /// No receive buffer was available for the ACK.
    NoMemory,
    /// The radio timeslot ended during the transmission.
    TimeslotEnded,
    /// No ACK was received in time.
    NoAck,
    /// The transmission was aborted.
    Aborted,
    /// The radio could not be granted for the transmission.
    TimeslotDenied,
    /// The key referenced by the frame does not exist.
    KeyIdInvalid,
    /// The frame counter could not be applied.
    FrameCounterError,
}

impl TxError {
    /// Frame-level security errors are never retried.
    pub const fn is_security_error(&self) -> bool {
        matches!(self, TxError::KeyIdInvalid | TxError::FrameCounterError)
    }
}

/// Reasons a reception failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum RxError {
    InvalidFrame,
    InvalidFcs,
    InvalidDestAddr,
    RuntimeError,
    TimeslotEnded,
    Aborted,
    /// The radio could not be granted for a delayed reception window.
    DelayedTimeslotDenied,
    /// A delayed reception window ended without receiving a frame.
    DelayedTimeout,
    InvalidLength,
    /// A delayed reception window was aborted.
    DelayedAborted,
}

/// Metadata reported with a successful transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDoneMetadata {
    pub frame_props: FrameProps,
    /// The received acknowledgment, if any.
    pub ack: Option<FrameRef>,
}

/// Metadata reported with a failed transmission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct TxFailedMetadata {
    pub frame_props: FrameProps,
}

/// Parameters of a CSMA-CA transmission. Unset values are taken from the
/// PIB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct CsmaCaMetadata {
    pub frame_props: FrameProps,
    pub tx_power: Option<i8>,
    pub tx_channel: Option<Channel>,
}

/// Parameters of a delayed transmission. Unset values are taken from the
/// PIB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct TransmitAtMetadata {
    pub frame_props: FrameProps,
    /// Perform a CCA right before the transmission.
    pub cca: bool,
    pub channel: Option<Channel>,
    pub tx_power: Option<i8>,
}

/// The upper layer's notification interface.
///
/// Notifications are issued from the radio interrupt context and must not
/// block.
pub trait NotificationSink {
    fn transmitted(&self, frame: FrameRef, metadata: &TxDoneMetadata);

    fn transmit_failed(&self, frame: FrameRef, error: TxError, metadata: &TxFailedMetadata);

    /// Reports a failed reception. `window_id` identifies the delayed
    /// reception window, if any. With `allow_drop`, the sink may drop the
    /// notification when it runs out of resources.
    ///
    /// Returns `true` if the notification was delivered.
    fn receive_failed(&self, error: RxError, window_id: u32, allow_drop: bool) -> bool;
}
