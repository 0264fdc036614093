//! Time structures, the radio time source and the timer service.
//!
//! - [`RadioInstant`] is used to represent a point in radio time.
//! - [`RadioDuration`] is used to represent a duration of radio time.
//!
//! Radio timer ticks are microseconds.

use core::cell::RefCell;

use critical_section::Mutex;
use dot15d4_util::{Error, Result};
use heapless::Vec;

pub mod export {
    pub use fugit::{Duration, ExtU64, Instant};
}

use export::*;

/// O-QPSK 250kB/s = 31.25kb/s = 62.5ksymbol/s (1 byte = 8 bit = 2 O-QPSK symbols)
pub type SymbolsOQpsk250Instant = Instant<u64, 1, 62_500>;
pub type SymbolsOQpsk250Duration = Duration<u64, 1, 62_500>;

pub type RadioInstant = Instant<u64, 1, 1_000_000>;
pub type RadioDuration = Duration<u64, 1, 1_000_000>;

/// The monotonic radio time source.
pub trait RadioTimerApi {
    fn now(&self) -> RadioInstant;
}

/// Schedules one-shot timers at absolute radio timestamps.
///
/// Timers are identified by the caller. Firing is reported by whoever drives
/// the service, usually the radio timer interrupt.
pub trait TimerService<Id: Copy + Eq> {
    /// Schedules the timer `id` to fire at `trigger`. Re-adding a scheduled
    /// timer moves it to the new trigger time.
    ///
    /// Fails if the service has no capacity left. The caller must not expect
    /// a firing in that case.
    fn add(&self, id: Id, trigger: RadioInstant) -> Result<()>;

    /// Removes the timer `id`.
    ///
    /// Returns `true` if the timer was still scheduled, i.e. the caller won
    /// the race against the timer firing. Returns `false` if the timer already
    /// fired (or was never scheduled): the firing path then remains solely
    /// responsible for any follow-up.
    fn remove(&self, id: Id) -> bool;

    /// Checks whether the timer `id` is scheduled.
    fn is_running(&self, id: Id) -> bool;
}

/// Software timer service backed by a small table of alarms.
///
/// The platform programs a single hardware compare channel to
/// [`SoftTimer::next_expiry()`] and drains [`SoftTimer::pop_expired()`] from
/// the compare interrupt.
pub struct SoftTimer<Id, const N: usize> {
    alarms: Mutex<RefCell<Vec<(Id, RadioInstant), N>>>,
}

impl<Id: Copy + Eq, const N: usize> SoftTimer<Id, N> {
    pub const fn new() -> Self {
        Self {
            alarms: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    /// The earliest scheduled trigger time, if any.
    pub fn next_expiry(&self) -> Option<RadioInstant> {
        critical_section::with(|cs| {
            let alarms = self.alarms.borrow_ref(cs);
            alarms.iter().map(|(_, trigger)| *trigger).min()
        })
    }

    /// Removes and returns the earliest timer due at `now`.
    ///
    /// Timers with equal trigger times expire in the order they were added.
    pub fn pop_expired(&self, now: RadioInstant) -> Option<Id> {
        critical_section::with(|cs| {
            let mut alarms = self.alarms.borrow_ref_mut(cs);
            let (index, _) = alarms
                .iter()
                .enumerate()
                .filter(|(_, (_, trigger))| *trigger <= now)
                .min_by_key(|(_, (_, trigger))| *trigger)?;
            Some(alarms.remove(index).0)
        })
    }
}

impl<Id: Copy + Eq, const N: usize> Default for SoftTimer<Id, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Id: Copy + Eq, const N: usize> TimerService<Id> for SoftTimer<Id, N> {
    fn add(&self, id: Id, trigger: RadioInstant) -> Result<()> {
        critical_section::with(|cs| {
            let mut alarms = self.alarms.borrow_ref_mut(cs);
            if let Some(index) = alarms.iter().position(|(alarm_id, _)| *alarm_id == id) {
                // Re-adding moves the timer to the back of the queue.
                alarms.remove(index);
            }
            alarms.push((id, trigger)).map_err(|_| Error)
        })
    }

    fn remove(&self, id: Id) -> bool {
        critical_section::with(|cs| {
            let mut alarms = self.alarms.borrow_ref_mut(cs);
            match alarms.iter().position(|(alarm_id, _)| *alarm_id == id) {
                Some(index) => {
                    alarms.remove(index);
                    true
                }
                None => false,
            }
        })
    }

    fn is_running(&self, id: Id) -> bool {
        critical_section::with(|cs| {
            self.alarms
                .borrow_ref(cs)
                .iter()
                .any(|(alarm_id, _)| *alarm_id == id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(us: u64) -> RadioInstant {
        RadioInstant::from_ticks(us)
    }

    #[test]
    fn symbol_rate() {
        assert_eq!(SymbolsOQpsk250Duration::from_ticks(1).to_micros(), 16);
        assert_eq!(SymbolsOQpsk250Instant::from_ticks(10).ticks(), 10);
    }

    #[test]
    fn fires_in_trigger_order() {
        let timer = SoftTimer::<u8, 4>::new();
        timer.add(1, at(300)).unwrap();
        timer.add(2, at(100)).unwrap();
        timer.add(3, at(200)).unwrap();
        assert_eq!(timer.next_expiry(), Some(at(100)));

        assert_eq!(timer.pop_expired(at(50)), None);
        assert_eq!(timer.pop_expired(at(250)), Some(2));
        assert_eq!(timer.pop_expired(at(250)), Some(3));
        assert_eq!(timer.pop_expired(at(250)), None);
        assert_eq!(timer.next_expiry(), Some(at(300)));
    }

    #[test]
    fn remove_reports_race_outcome() {
        let timer = SoftTimer::<u8, 2>::new();
        timer.add(1, at(100)).unwrap();
        assert!(timer.is_running(1));
        assert!(timer.remove(1));
        assert!(!timer.is_running(1));

        timer.add(1, at(100)).unwrap();
        assert_eq!(timer.pop_expired(at(100)), Some(1));
        // Already fired: removal loses the race.
        assert!(!timer.remove(1));
    }

    #[test]
    fn re_adding_moves_trigger() {
        let timer = SoftTimer::<u8, 1>::new();
        timer.add(7, at(100)).unwrap();
        timer.add(7, at(500)).unwrap();
        assert_eq!(timer.next_expiry(), Some(at(500)));
        assert_eq!(timer.pop_expired(at(100)), None);
    }

    #[test]
    fn add_fails_when_full() {
        let timer = SoftTimer::<u8, 1>::new();
        timer.add(1, at(100)).unwrap();
        assert_eq!(timer.add(2, at(100)), Err(Error));
    }
}
