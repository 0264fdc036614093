//! This crate provides the leaf collaborators of the MAC timing core:
//! - the radio time source and a timer service,
//! - PHY and MAC timing constants,
//! - a shallow view on outgoing frames,
//! - the radio core request interface,
//! - the radio scheduling arbiter granting exclusive radio timeslots.

#![cfg_attr(not(any(feature = "std", test)), no_std)]

pub mod constants;
pub mod frame;
pub mod radio;
pub mod rsch;
pub mod timer;
