use core::marker::PhantomData;

use portable_atomic::{AtomicU8, Ordering};

/// A state type that can be packed into a single byte.
///
/// Implementors must guarantee that `from_bits(into_bits(s)) == s`. Every
/// value ever stored in an [`AtomicState`] comes from `into_bits()`, so
/// `from_bits()` may treat other values as unreachable.
pub trait AtomicRepr: Copy {
    fn into_bits(self) -> u8;
    fn from_bits(bits: u8) -> Self;
}

/// An atomic cell holding a state machine's current state.
///
/// State transitions are requested via [`AtomicState::cas()`]: a transition
/// only succeeds if the expected prior state still holds. A late or
/// duplicate interrupt that finds the state already changed therefore fails
/// cleanly instead of corrupting the state machine.
pub struct AtomicState<S: AtomicRepr> {
    bits: AtomicU8,
    state: PhantomData<S>,
}

impl<S: AtomicRepr> AtomicState<S> {
    pub fn new(initial: S) -> Self {
        Self {
            bits: AtomicU8::new(initial.into_bits()),
            state: PhantomData,
        }
    }

    pub fn load(&self) -> S {
        S::from_bits(self.bits.load(Ordering::Acquire))
    }

    pub fn store(&self, state: S) {
        self.bits.store(state.into_bits(), Ordering::Release)
    }

    /// Transitions from `expected` to `new`. Returns `true` if the transition
    /// took place.
    pub fn cas(&self, expected: S, new: S) -> bool {
        self.bits
            .compare_exchange(
                expected.into_bits(),
                new.into_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Checks the current state against a bit mask.
    ///
    /// Only meaningful for state types encoded as one-hot bit flags.
    pub fn matches_any(&self, mask: u8) -> bool {
        self.bits.load(Ordering::Acquire) & mask != 0
    }
}

impl<S: AtomicRepr + core::fmt::Debug> core::fmt::Debug for AtomicState<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("AtomicState").field(&self.load()).finish()
    }
}
