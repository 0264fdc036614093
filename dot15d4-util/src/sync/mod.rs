//! Lock-free synchronization primitives.
//!
//! The MAC timing core runs on a single core but at several interrupt
//! priorities. Higher priorities must never block on lower ones, so the
//! primitives in here only ever use atomic loads, stores and
//! compare-and-swap.
pub mod atomic_state;

pub use atomic_state::*;
