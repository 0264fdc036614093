#![allow(dead_code)]

use crate::timer::{RadioDuration, SymbolsOQpsk250Duration};

// TODO: Several of the following values are PHY-specific. Rename accordingly.

// Constants of IEEE 802.15.4-2024, section 8.4.2, Table 8-35, MAC constants
/// The maximum size of an MPDU, in octets, that can be followed by a SIFS
/// period.
pub const A_MAX_SIFS_FRAME_SIZE: u8 = 18;

// Constants from section 11.3, Table 11-1, PHY constants
/// The maximum PSDU size (in octets) the PHY shall be able to receive.
pub const PHY_MAX_PACKET_SIZE_127: usize = 127;

/// RX-to-TX or TX-to-RX turnaround time (in symbol periods), as defined in
/// 10.2.2 and 10.2.3.
pub const A_TURNAROUND_TIME: SymbolsOQpsk250Duration = SymbolsOQpsk250Duration::from_ticks(12);
/// The time required to perform CCA detection in symbol periods.
pub const PHY_CCA_DURATION: SymbolsOQpsk250Duration = SymbolsOQpsk250Duration::from_ticks(8);
/// The number of symbols forming the basic time period used by the CSMA-CA
/// algorithm.
pub const MAC_UNIT_BACKOFF_PERIOD: SymbolsOQpsk250Duration =
    SymbolsOQpsk250Duration::from_ticks(A_TURNAROUND_TIME.ticks() + PHY_CCA_DURATION.ticks());

pub const PHY_HDR_LEN: usize = 1;

// O-QPSK 2.4G airtime in radio timer ticks.
pub const PHY_US_PER_SYMBOL: u64 = 16;
pub const PHY_SYMBOLS_PER_OCTET: u64 = 2;
pub const PHY_US_PER_OCTET: u64 = PHY_US_PER_SYMBOL * PHY_SYMBOLS_PER_OCTET;
/// Preamble (4 octets) and SFD (1 octet).
pub const PHY_SHR_SYMBOLS: u64 = 10;

pub const PHY_SHR_DURATION: RadioDuration =
    RadioDuration::from_ticks(PHY_SHR_SYMBOLS * PHY_US_PER_SYMBOL);
pub const PHY_PHR_DURATION: RadioDuration =
    RadioDuration::from_ticks(PHY_HDR_LEN as u64 * PHY_US_PER_OCTET);
pub const TURNAROUND_DURATION: RadioDuration =
    RadioDuration::from_ticks(A_TURNAROUND_TIME.ticks() * PHY_US_PER_SYMBOL);
pub const CCA_DURATION: RadioDuration =
    RadioDuration::from_ticks(PHY_CCA_DURATION.ticks() * PHY_US_PER_SYMBOL);
pub const UNIT_BACKOFF_DURATION: RadioDuration =
    RadioDuration::from_ticks(MAC_UNIT_BACKOFF_PERIOD.ticks() * PHY_US_PER_SYMBOL);

/// PSDU length of an immediate acknowledgment (FCF, sequence number, FCS).
pub const IMM_ACK_PSDU_LEN: u8 = 5;
/// Airtime of a complete immediate acknowledgment frame.
pub const IMM_ACK_DURATION: RadioDuration = frame_duration(IMM_ACK_PSDU_LEN, true, true);

/// Airtime of a frame with the given PSDU length.
pub const fn frame_duration(psdu_len: u8, include_shr: bool, include_phr: bool) -> RadioDuration {
    let mut us = psdu_len as u64 * PHY_US_PER_OCTET;
    if include_shr {
        us += PHY_SHR_DURATION.ticks();
    }
    if include_phr {
        us += PHY_PHR_DURATION.ticks();
    }
    RadioDuration::from_ticks(us)
}

/// Time the radio is busy with a received frame, starting at its SHR and
/// including the acknowledgment exchange, if one was requested.
pub const fn rx_duration(psdu_len: u8, ack_requested: bool) -> RadioDuration {
    let mut us = frame_duration(psdu_len, true, true).ticks();
    if ack_requested {
        us += TURNAROUND_DURATION.ticks() + IMM_ACK_DURATION.ticks();
    }
    RadioDuration::from_ticks(us)
}
