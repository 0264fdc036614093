//! A shallow view on outgoing and incoming radio frames.
//!
//! Frames are laid out as on air, starting with the PHY header (PSDU length)
//! followed by the MPDU including its FCS. Header fields are resolved through
//! `dot15d4-frame`.

use core::fmt::{self, Debug};

use dot15d4_frame::{Frame, FrameControl};
use dot15d4_util::{Error, Result};

use crate::constants::{PHY_HDR_LEN, PHY_MAX_PACKET_SIZE_127};

pub use dot15d4_frame::Address;

/// A handle to a frame buffer owned by the MAC pipeline.
///
/// Frame handles are compared by identity, not by content: two handles are
/// equal iff they point to the same buffer. This is what the ownership checks
/// in the transmission hooks rely on.
#[derive(Clone, Copy)]
pub struct FrameRef(&'static [u8]);

impl FrameRef {
    /// Wraps a buffer starting with the PHY header.
    ///
    /// Fails if the buffer is shorter than announced by its PHY header.
    pub fn new(buffer: &'static [u8]) -> Result<Self> {
        let Some(&phr) = buffer.first() else {
            return Err(Error);
        };
        let psdu_len = (phr & 0x7f) as usize;
        if psdu_len > PHY_MAX_PACKET_SIZE_127 || buffer.len() < PHY_HDR_LEN + psdu_len {
            return Err(Error);
        }
        Ok(Self(buffer))
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    pub fn psdu_length(&self) -> u8 {
        self.0[0] & 0x7f
    }

    pub fn psdu(&self) -> &'static [u8] {
        &self.0[PHY_HDR_LEN..PHY_HDR_LEN + self.psdu_length() as usize]
    }

    /// The acknowledgment request bit of the frame control field.
    ///
    /// Read from the raw frame control so that frame types the high-level
    /// reader does not model (e.g. MAC commands) still report it.
    pub fn ack_request(&self) -> bool {
        self.psdu()
            .get(..2)
            .and_then(|fcf| FrameControl::new(fcf).ok())
            .is_some_and(|fc| fc.ack_request())
    }

    /// Resolves the destination address.
    ///
    /// Returns `None` if the frame carries no destination address or cannot
    /// be parsed.
    pub fn dst_address(&self) -> Option<Address> {
        let frame = Frame::new(self.psdu()).ok()?;
        match frame.addressing().and_then(|fields| fields.dst_address()) {
            Some(Address::Absent) | None => None,
            address => address,
        }
    }
}

impl PartialEq for FrameRef {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0.as_ptr(), other.0.as_ptr())
    }
}

impl Eq for FrameRef {}

impl Debug for FrameRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameRef")
            .field("ptr", &self.0.as_ptr())
            .field("psdu_length", &self.psdu_length())
            .finish()
    }
}
