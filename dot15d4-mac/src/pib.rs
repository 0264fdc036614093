//! The MAC attributes consumed by the timing core.
//!
//! Attributes are read from interrupt context and written from the upper
//! layer. All of them are therefore stored in atomics.

use dot15d4_driver::{radio::Channel, timer::RadioDuration};
use dot15d4_util::sync::{AtomicRepr, AtomicState};
use portable_atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU8, Ordering};

use crate::const_config::{
    DEFAULT_CHANNEL, DEFAULT_TX_POWER, IFS_LIFS_US, IFS_SIFS_US, MAC_MAX_BE,
    MAC_MAX_CSMA_BACKOFFS, MAC_MIN_BE,
};

/// Upper bound of macMaxBe, see IEEE 802.15.4-2024, section 10.4.2.
pub const MAX_BE_LIMIT: u8 = 8;
/// Lower bound of macMaxBe.
pub const MIN_MAX_BE: u8 = 3;
/// Upper bound of macMaxCsmaBackoffs.
pub const MAX_CSMA_BACKOFFS_LIMIT: u8 = 5;

/// When the coexistence arbiter is asked for the radio on transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum CoexTxRequestMode {
    /// As soon as a frame is ready for transmission.
    FrameReady,
    /// When the CCA starts.
    CcaStart,
    /// When the CCA reported an idle channel.
    CcaDone,
}

/// When inter-frame spacing is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum IfsMode {
    Disabled,
    /// Only between consecutive frames to the same destination.
    MatchingAddresses,
    Always,
}

/// How CSMA-CA draws its backoff periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum CsmaBackoffMode {
    /// Uniformly distributed in [0, 2^BE - 1] as mandated by the standard.
    Random,
    /// Always 2^BE - 1. Test only.
    AlwaysMax,
    /// Always 0. Test only.
    AlwaysMin,
}

macro_rules! atomic_repr {
    ($ty:ident { $($variant:ident = $bits:literal),+ $(,)? }) => {
        impl AtomicRepr for $ty {
            fn into_bits(self) -> u8 {
                match self {
                    $($ty::$variant => $bits,)+
                }
            }

            fn from_bits(bits: u8) -> Self {
                match bits {
                    $($bits => $ty::$variant,)+
                    _ => unreachable!(),
                }
            }
        }
    };
}

atomic_repr!(CoexTxRequestMode {
    FrameReady = 0,
    CcaStart = 1,
    CcaDone = 2,
});
atomic_repr!(IfsMode {
    Disabled = 0,
    MatchingAddresses = 1,
    Always = 2,
});
atomic_repr!(CsmaBackoffMode {
    Random = 0,
    AlwaysMax = 1,
    AlwaysMin = 2,
});

/// PAN Information Base subset used by the timing core.
pub struct Pib {
    min_be: AtomicU8,
    max_be: AtomicU8,
    max_csma_backoffs: AtomicU8,
    channel: AtomicState<Channel>,
    tx_power: AtomicI8,
    coex_tx_request_mode: AtomicState<CoexTxRequestMode>,
    ifs_mode: AtomicState<IfsMode>,
    sifs_period_us: AtomicU32,
    lifs_period_us: AtomicU32,
    rx_on_when_idle: AtomicBool,
    csma_backoff_mode: AtomicState<CsmaBackoffMode>,
}

impl Pib {
    pub fn new() -> Self {
        Self {
            min_be: AtomicU8::new(MAC_MIN_BE),
            max_be: AtomicU8::new(MAC_MAX_BE),
            max_csma_backoffs: AtomicU8::new(MAC_MAX_CSMA_BACKOFFS),
            channel: AtomicState::new(Channel::from_bits(DEFAULT_CHANNEL)),
            tx_power: AtomicI8::new(DEFAULT_TX_POWER),
            coex_tx_request_mode: AtomicState::new(CoexTxRequestMode::CcaDone),
            ifs_mode: AtomicState::new(IfsMode::Disabled),
            sifs_period_us: AtomicU32::new(IFS_SIFS_US),
            lifs_period_us: AtomicU32::new(IFS_LIFS_US),
            rx_on_when_idle: AtomicBool::new(true),
            csma_backoff_mode: AtomicState::new(CsmaBackoffMode::Random),
        }
    }

    pub fn min_be(&self) -> u8 {
        self.min_be.load(Ordering::Relaxed)
    }

    pub fn max_be(&self) -> u8 {
        self.max_be.load(Ordering::Relaxed)
    }

    /// Sets macMinBe and macMaxBe.
    ///
    /// Returns `false` and leaves both unchanged if `max_be` is outside
    /// [3, 8] or `min_be` exceeds `max_be`.
    pub fn set_backoff_exponents(&self, min_be: u8, max_be: u8) -> bool {
        if !(MIN_MAX_BE..=MAX_BE_LIMIT).contains(&max_be) || min_be > max_be {
            return false;
        }
        self.min_be.store(min_be, Ordering::Relaxed);
        self.max_be.store(max_be, Ordering::Relaxed);
        true
    }

    pub fn max_csma_backoffs(&self) -> u8 {
        self.max_csma_backoffs.load(Ordering::Relaxed)
    }

    pub fn set_max_csma_backoffs(&self, max_csma_backoffs: u8) -> bool {
        if max_csma_backoffs > MAX_CSMA_BACKOFFS_LIMIT {
            return false;
        }
        self.max_csma_backoffs
            .store(max_csma_backoffs, Ordering::Relaxed);
        true
    }

    pub fn channel(&self) -> Channel {
        self.channel.load()
    }

    pub fn set_channel(&self, channel: Channel) {
        self.channel.store(channel)
    }

    /// Transmit power in dBm.
    pub fn tx_power(&self) -> i8 {
        self.tx_power.load(Ordering::Relaxed)
    }

    pub fn set_tx_power(&self, tx_power: i8) {
        self.tx_power.store(tx_power, Ordering::Relaxed)
    }

    pub fn coex_tx_request_mode(&self) -> CoexTxRequestMode {
        self.coex_tx_request_mode.load()
    }

    pub fn set_coex_tx_request_mode(&self, mode: CoexTxRequestMode) {
        self.coex_tx_request_mode.store(mode)
    }

    pub fn ifs_mode(&self) -> IfsMode {
        self.ifs_mode.load()
    }

    pub fn set_ifs_mode(&self, mode: IfsMode) {
        self.ifs_mode.store(mode)
    }

    pub fn sifs_period(&self) -> RadioDuration {
        RadioDuration::from_ticks(self.sifs_period_us.load(Ordering::Relaxed) as u64)
    }

    pub fn set_sifs_period(&self, period_us: u32) {
        self.sifs_period_us.store(period_us, Ordering::Relaxed)
    }

    pub fn lifs_period(&self) -> RadioDuration {
        RadioDuration::from_ticks(self.lifs_period_us.load(Ordering::Relaxed) as u64)
    }

    pub fn set_lifs_period(&self, period_us: u32) {
        self.lifs_period_us.store(period_us, Ordering::Relaxed)
    }

    pub fn rx_on_when_idle(&self) -> bool {
        self.rx_on_when_idle.load(Ordering::Relaxed)
    }

    pub fn set_rx_on_when_idle(&self, enabled: bool) {
        self.rx_on_when_idle.store(enabled, Ordering::Relaxed)
    }

    pub fn csma_backoff_mode(&self) -> CsmaBackoffMode {
        self.csma_backoff_mode.load()
    }

    pub fn set_csma_backoff_mode(&self, mode: CsmaBackoffMode) {
        self.csma_backoff_mode.store(mode)
    }
}

impl Default for Pib {
    fn default() -> Self {
        Self::new()
    }
}
