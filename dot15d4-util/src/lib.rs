//! This crate contains generic utilities other dot15d4 crates depend upon but
//! not directly related to the IEEE 802.15.4 standard.
//!
//! The main purpose of this crate is to keep the MAC timing core free of
//! ad-hoc synchronization code.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod sync;

pub mod log;

#[cfg(any(feature = "defmt", feature = "log"))]
pub use crate::log::*;

/// A generic error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

/// A type alias for `Result<T, dot15d4-util::Error>`.
pub type Result<T> = core::result::Result<T, Error>;
