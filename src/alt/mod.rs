/*
 * Alternation Engine
 *
 * Guarded external choice over channels, deadlines and skips. Both
 * selection flavors share one four-phase shape:
 *
 * 1. ENABLE: mark the process ENABLING, then walk the guards in order,
 *    installing a waiting marker on each channel and registering each
 *    deadline, stopping early at the first guard already ready. If the
 *    walk completes without a ready guard and any timer guard exists,
 *    the earliest deadline is registered once more as the wake target.
 * 2. PARK OR PROCEED: try ENABLING -> WAITING; success parks the process
 *    unconditionally, failure means a ready-maker fired mid-enable and
 *    the state is already READY.
 * 3. DISABLE: walk the enabled guards in reverse, retracting markers and
 *    deadlines; every guard that reports ready overwrites the selection,
 *    so the guard earliest in enable order wins ties (lowest index for
 *    pri_select, closest past the favorite for fair_select).
 * 4. COMMIT: mark the process NONE, advance the favorite one past the
 *    selection, return the selected index.
 *
 * Ready-makers synchronize with all of this through free_process_maybe's
 * two-level compare-exchange on alt_state: catching the owner mid-enable
 * needs no scheduling (the owner sees READY before parking), catching it
 * parked re-schedules it, and anything else means somebody already did.
 *
 * Interrupt guards are accepted but never become ready during selection;
 * interrupts reach processes through receive(), not through alternation.
 */

use crate::channel::{Channel, RawChannel};
use crate::interrupt::Interrupt;
use core::sync::atomic::Ordering;

use crate::scheduler::{self, ALT_ENABLING, ALT_NONE, ALT_READY, ALT_WAITING, Process};
use crate::timer;
use crate::types::{MAX_TIME, Time};
use crate::utils::fatal;

/// Earliest-timeout sentinel.
const NO_TIME: Time = MAX_TIME;

/// A single alternative in an alternation.
pub enum Guard<'a> {
    /// Ready when a writer is parked on the channel.
    Chan(&'a RawChannel),
    /// Always ready.
    Skip,
    /// Ready when wall time reaches the deadline.
    Timer(Time),
    /// Accepted for completeness; never ready during selection.
    Intr(&'a Interrupt),
}

impl<'a> Guard<'a> {
    /// Guard on input readiness of a channel.
    pub fn channel<T: Copy + Send>(chan: &'a Channel<T>) -> Guard<'a> {
        Guard::Chan(chan.raw())
    }

    /// Guard that is always ready.
    pub fn skip() -> Guard<'a> {
        Guard::Skip
    }

    /// Guard on a wall-time deadline.
    pub fn timer(time: Time) -> Guard<'a> {
        Guard::Timer(time)
    }

    /// Guard on an interrupt object.
    pub fn interrupt(intr: &'a Interrupt) -> Guard<'a> {
        Guard::Intr(intr)
    }
}

/// An alternation over a fixed set of guards.
///
/// The favorite is where fair_select starts its scan; committing a
/// selection moves it one past the taken branch, which is what spreads
/// consecutive selections over persistently ready guards.
pub struct Alternation<'a> {
    guards: &'a [Guard<'a>],
    favorite: usize,
}

impl<'a> Alternation<'a> {
    pub fn new(guards: &'a [Guard<'a>]) -> Alternation<'a> {
        Alternation {
            guards,
            favorite: 0,
        }
    }

    /// Number of guards.
    pub fn len(&self) -> usize {
        self.guards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Enables one guard. Returns true if it is ready, and folds timer
    /// deadlines into `earliest`.
    fn enable_guard(&self, i: usize, proc: *mut Process, earliest: &mut Time) -> bool {
        match self.guards[i] {
            Guard::Chan(chan) => chan.enable(proc),
            Guard::Skip => true,
            Guard::Timer(time) => {
                if time < *earliest {
                    *earliest = time;
                }
                timer::enable_timeout(time, proc)
            }
            Guard::Intr(_) => false,
        }
    }

    /// Disables one guard, reporting whether it is ready.
    fn disable_guard(&self, i: usize, proc: *mut Process) -> bool {
        match self.guards[i] {
            Guard::Chan(chan) => chan.disable(proc),
            Guard::Skip => true,
            Guard::Timer(time) => timer::disable_timeout(time, proc),
            Guard::Intr(_) => false,
        }
    }

    /// Parks the process if no guard came ready during the enable pass.
    fn park_unless_ready(&self, proc: *mut Process, any_ready: bool, earliest: Time) {
        if any_ready {
            return;
        }
        // a timer guard existed: register the alternation's earliest
        // deadline as its wake target
        if earliest != NO_TIME && timer::enable_timeout(earliest, proc) {
            return;
        }
        if alt_should_wait(proc) {
            scheduler::relinquish_unconditional();
        }
        // reaching here, the alternation is ready
    }

    /// Selects the first ready alternative, lowest index winning ties.
    pub fn pri_select(&mut self) -> usize {
        let n = self.guards.len();
        if n == 0 {
            fatal("alternation: no guards");
        }
        let proc = scheduler::get_current();
        alt_enabling(proc);

        let mut earliest = NO_TIME;
        let mut found = false;
        let mut last = 0;
        for i in 0..n {
            last = i;
            if self.enable_guard(i, proc, &mut earliest) {
                found = true;
                break;
            }
        }

        self.park_unless_ready(proc, found, earliest);

        // walk back from the last enabled guard; the final overwrite is
        // the lowest ready index
        let mut selected = None;
        for i in (0..=last).rev() {
            if self.disable_guard(i, proc) {
                selected = Some(i);
            }
        }

        self.commit(proc, selected)
    }

    /// Selects a ready alternative round-robin, starting one past the
    /// previously taken branch.
    pub fn fair_select(&mut self) -> usize {
        let n = self.guards.len();
        if n == 0 {
            fatal("alternation: no guards");
        }
        let proc = scheduler::get_current();
        alt_enabling(proc);

        let mut earliest = NO_TIME;
        let mut found = false;
        let mut i = self.favorite % n;
        let mut enabled = 0;
        for _ in 0..n {
            enabled += 1;
            if self.enable_guard(i, proc, &mut earliest) {
                found = true;
                break;
            }
            i = (i + 1) % n;
        }
        if !found {
            // the loop wrapped; step back onto the last enabled guard
            i = (i + n - 1) % n;
        }

        self.park_unless_ready(proc, found, earliest);

        // walk back towards the favorite; the final overwrite is the
        // ready guard closest past it
        let mut selected = None;
        let mut j = i;
        for _ in 0..enabled {
            if self.disable_guard(j, proc) {
                selected = Some(j);
            }
            j = (j + n - 1) % n;
        }

        self.commit(proc, selected)
    }

    fn commit(&mut self, proc: *mut Process, selected: Option<usize>) -> usize {
        alt_finish(proc);
        let selected = match selected {
            Some(index) => index,
            // a SKIP guard rules this out; without one it would mean a
            // wake with nothing to show for it
            None => fatal("alternation: woke with no ready guard"),
        };
        self.favorite = (selected + 1) % self.guards.len();
        selected
    }
}

/// Transition to the enabling state.
fn alt_enabling(proc: *mut Process) {
    unsafe {
        (*proc)
            .alt_state
            .store(ALT_ENABLING, Ordering::Release);
    }
}

/// Try ENABLING -> WAITING; failure means the state is already READY.
fn alt_should_wait(proc: *mut Process) -> bool {
    unsafe {
        (*proc)
            .alt_state
            .compare_exchange(
                ALT_ENABLING,
                ALT_WAITING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Transition to not alternating.
fn alt_finish(proc: *mut Process) {
    unsafe {
        (*proc)
            .alt_state
            .store(ALT_NONE, Ordering::Release);
    }
}

/// Wakes an alternating process from any ready-maker (a channel writer,
/// an expiring deadline on another unit's behalf, an interrupt).
///
/// Two-level compare-exchange: catching the owner ENABLING needs no
/// scheduling (it will see READY at the end of its enable pass); catching
/// it WAITING re-schedules it; READY or NONE means somebody already woke
/// it, or the alternation is over.
pub(crate) fn free_process_maybe(proc: *mut Process) {
    unsafe {
        match (*proc).alt_state.compare_exchange(
            ALT_ENABLING,
            ALT_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => (),
            Err(actual) if actual == ALT_WAITING => {
                if (*proc)
                    .alt_state
                    .compare_exchange(
                        ALT_WAITING,
                        ALT_READY,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    scheduler::schedule(proc);
                }
            }
            Err(_) => (),
        }
    }
}
