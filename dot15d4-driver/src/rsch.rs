//! Radio scheduling: the arbiter granting exclusive radio timeslots.
//!
//! Every module of the MAC timing core that needs the radio at a given time
//! registers a timeslot request with the arbiter. The arbiter grants at most
//! one window at a time. Once granted, the owner of the window is notified
//! (see `Mac::on_timeslot_started()`) and must release the window as soon as
//! it has handed its work to the radio core.

use core::cell::{Cell, RefCell};

use critical_section::Mutex;
use dot15d4_util::trace;
use heapless::Vec;

use crate::timer::{RadioDuration, RadioInstant};

/// Identifies the owner of a timeslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub struct TimeslotId(pub u32);

impl TimeslotId {
    /// Marks unused delayed operation slots.
    pub const INVALID: Self = Self(u32::MAX);
    /// The single CSMA-CA backoff timeslot.
    pub const CSMA_CA: Self = Self(u32::MAX - 1);
    /// The single delayed transmission timeslot.
    pub const DELAYED_TX: Self = Self(u32::MAX - 2);

    /// Ids reserved for internal use. Delayed reception windows must be
    /// identified by other values.
    pub const fn is_reserved(&self) -> bool {
        self.0 >= Self::DELAYED_TX.0
    }
}

/// The operation a timeslot was requested for. Used to dispatch the start of
/// a granted window to its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum TimeslotOp {
    CsmaCa,
    DelayedTx,
    DelayedRx,
}

/// Timeslot priorities, lowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum TimeslotPriority {
    Idle,
    IdleListening,
    Rx,
    Detect,
    Tx,
    Max,
}

/// Timing class of a timeslot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "fuzz", derive(arbitrary::Arbitrary))]
pub enum TimeslotType {
    /// The window must start at the trigger time with bounded jitter.
    Precise,
    /// The window may start at or after the trigger time.
    Relaxed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeslotRequest {
    pub id: TimeslotId,
    pub op: TimeslotOp,
    /// Earliest start of the window.
    pub trigger: RadioInstant,
    pub priority: TimeslotPriority,
    pub kind: TimeslotType,
}

/// The radio scheduling arbiter contract.
pub trait TimeslotArbiter {
    /// Registers a timeslot request.
    ///
    /// Returns `false` if a request with the same id is already registered or
    /// granted, or if the arbiter has no capacity left. Accepted requests lead
    /// to exactly one start notification unless cancelled before.
    fn request(&self, request: TimeslotRequest) -> bool;

    /// Cancels a timeslot.
    ///
    /// With `handler == false`, removes a registration that has not been
    /// granted yet. Returns `false` if no such registration exists, in
    /// particular if the window already started: the start notification then
    /// remains responsible for the operation.
    ///
    /// With `handler == true`, called from within a start notification,
    /// additionally releases the granted window.
    fn cancel(&self, id: TimeslotId, handler: bool) -> bool;

    /// Changes the priority of a registered or granted timeslot.
    fn update_priority(&self, id: TimeslotId, priority: TimeslotPriority) -> bool;

    /// Time until the registered timeslot `id` is due to start.
    ///
    /// Returns `None` if no such registration exists.
    fn time_to_start(&self, id: TimeslotId, now: RadioInstant) -> Option<RadioDuration>;
}

/// A software arbiter for a single radio.
///
/// Due requests are granted by priority. Precise requests win over relaxed
/// ones of the same priority, then the earliest trigger wins. No new window
/// is granted while another one has not been released.
pub struct SoftArbiter<const N: usize> {
    pending: Mutex<RefCell<Vec<TimeslotRequest, N>>>,
    granted: Mutex<Cell<Option<TimeslotRequest>>>,
}

impl<const N: usize> SoftArbiter<N> {
    pub const fn new() -> Self {
        Self {
            pending: Mutex::new(RefCell::new(Vec::new())),
            granted: Mutex::new(Cell::new(None)),
        }
    }

    /// The currently granted window, if any.
    pub fn granted(&self) -> Option<TimeslotRequest> {
        critical_section::with(|cs| self.granted.borrow(cs).get())
    }

    pub fn is_pending(&self, id: TimeslotId) -> bool {
        critical_section::with(|cs| {
            self.pending
                .borrow_ref(cs)
                .iter()
                .any(|request| request.id == id)
        })
    }

    /// The earliest trigger time among registered requests.
    pub fn next_trigger(&self) -> Option<RadioInstant> {
        critical_section::with(|cs| {
            self.pending
                .borrow_ref(cs)
                .iter()
                .map(|request| request.trigger)
                .min()
        })
    }

    /// Grants the next due request, if the radio is not currently granted to
    /// someone else.
    ///
    /// The platform calls this from its scheduling interrupt and dispatches
    /// the returned request to `Mac::on_timeslot_started()`.
    pub fn pop_due(&self, now: RadioInstant) -> Option<TimeslotRequest> {
        critical_section::with(|cs| {
            let granted = self.granted.borrow(cs);
            if granted.get().is_some() {
                return None;
            }

            let mut pending = self.pending.borrow_ref_mut(cs);
            let mut best: Option<usize> = None;
            for (index, candidate) in pending.iter().enumerate() {
                if candidate.trigger > now {
                    continue;
                }
                best = match best {
                    Some(current) if !Self::wins(candidate, &pending[current]) => Some(current),
                    _ => Some(index),
                };
            }

            let request = pending.remove(best?);
            trace!("rsch: granted {}", request.id.0);
            granted.set(Some(request));
            Some(request)
        })
    }

    fn wins(candidate: &TimeslotRequest, current: &TimeslotRequest) -> bool {
        if candidate.priority != current.priority {
            return candidate.priority > current.priority;
        }
        match (candidate.kind, current.kind) {
            (TimeslotType::Precise, TimeslotType::Relaxed) => true,
            (TimeslotType::Relaxed, TimeslotType::Precise) => false,
            _ => candidate.trigger < current.trigger,
        }
    }
}

impl<const N: usize> Default for SoftArbiter<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TimeslotArbiter for SoftArbiter<N> {
    fn request(&self, request: TimeslotRequest) -> bool {
        critical_section::with(|cs| {
            let mut pending = self.pending.borrow_ref_mut(cs);
            let granted = self.granted.borrow(cs).get();
            if request.id == TimeslotId::INVALID
                || granted.is_some_and(|granted| granted.id == request.id)
                || pending.iter().any(|pending| pending.id == request.id)
            {
                return false;
            }
            pending.push(request).is_ok()
        })
    }

    fn cancel(&self, id: TimeslotId, handler: bool) -> bool {
        critical_section::with(|cs| {
            if handler {
                let granted = self.granted.borrow(cs);
                if granted.get().is_some_and(|granted| granted.id == id) {
                    granted.set(None);
                    return true;
                }
            }

            let mut pending = self.pending.borrow_ref_mut(cs);
            match pending.iter().position(|request| request.id == id) {
                Some(index) => {
                    pending.remove(index);
                    true
                }
                None => false,
            }
        })
    }

    fn update_priority(&self, id: TimeslotId, priority: TimeslotPriority) -> bool {
        critical_section::with(|cs| {
            let granted = self.granted.borrow(cs);
            if let Some(mut request) = granted.get().filter(|granted| granted.id == id) {
                request.priority = priority;
                granted.set(Some(request));
                return true;
            }

            let mut pending = self.pending.borrow_ref_mut(cs);
            match pending.iter_mut().find(|request| request.id == id) {
                Some(request) => {
                    request.priority = priority;
                    true
                }
                None => false,
            }
        })
    }

    fn time_to_start(&self, id: TimeslotId, now: RadioInstant) -> Option<RadioDuration> {
        critical_section::with(|cs| {
            let pending = self.pending.borrow_ref(cs);
            let request = pending.iter().find(|request| request.id == id)?;
            Some(
                request
                    .trigger
                    .checked_duration_since(now)
                    .unwrap_or(RadioDuration::from_ticks(0)),
            )
        })
    }
}
