/*
 * Timeout Service
 *
 * This module provides the runtime's only notion of time: a global
 * elapsed-time counter advanced by the unit-0 tick interrupt, and one
 * ascending timeout queue per unit feeding that unit's single-shot
 * timeout timer.
 *
 * TIME READING:
 * now() combines the tick counter with the time remaining on the
 * repeating tick timer. The counter is read before and after the timer,
 * repeating until both reads agree, which detects a tick landing between
 * the observations.
 *
 * TIMEOUT QUEUE:
 * Two kinds of entries share the queue. AFTER entries park a process
 * until a wall deadline and live on the waiting process's own stack.
 * ALTING entries are registered by an alternation's enable pass, come
 * from the pool allocator, and are retired either by the matching
 * disable pass or by the timeout handler (release is lock-free, so the
 * handler may do this). The enable pass may register the alternation's
 * earliest deadline a second time; removal therefore takes every entry
 * matching (time, process), never just the first, so no stale entry can
 * wake a later alternation of the same process.
 *
 * Each unit's queue is touched only by the owning unit with interrupts
 * disabled; the single-shot timer is re-armed whenever the head changes.
 */

use core::ptr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::hardware;
use crate::memory;
use crate::scheduler::{
    self, ALT_ENABLING, ALT_READY, ALT_WAITING, PROC_READY, PROC_WAITING, Process,
};
use crate::types::{NPUN, PuLocal, Time};
use crate::utils::fatal;

/// Time units (nanoseconds) per elapsed-time tick.
const TICK: Time = 1_000_000_000;

/// An `After` request.
const TMO_AFTER: u8 = 0;
/// A deadline registered by an alternation.
const TMO_ALTING: u8 = 1;

/// Timeout queue entry, kept in ascending time order.
#[repr(C)]
struct TimeoutDesc {
    time: Time,
    proc: *mut Process,
    next: *mut TimeoutDesc,
    kind: u8,
}

/// Current elapsed time, in whole ticks.
static CURRENT_TIME: AtomicU64 = AtomicU64::new(0);

/// Queues of timeout requests, one per unit, in time order.
static TIME_QUES: PuLocal<*mut TimeoutDesc> = PuLocal::new([ptr::null_mut(); NPUN]);

/// Pool class of an ALTING descriptor.
static TMO_INDEX: AtomicUsize = AtomicUsize::new(0);

/// Returns the tick length (time units per tick).
pub fn tick() -> Time {
    TICK
}

/// Returns the current time in nanoseconds since runtime start.
pub fn current_time() -> Time {
    let mut count = CURRENT_TIME.load(Ordering::Acquire);
    loop {
        let remaining = hardware::read_elapsed_timer();
        let before = count;
        count = CURRENT_TIME.load(Ordering::Acquire);
        if count == before {
            // the same count twice in a row brackets the timer read
            return count + TICK.saturating_sub(remaining);
        }
    }
}

/// Synonym for current_time().
pub fn now() -> Time {
    current_time()
}

/// Returns true if the given deadline has passed.
pub fn timeout_ready(time: Time) -> bool {
    current_time() >= time
}

/// Inserts a descriptor into the given unit's queue in time order,
/// re-arming the single-shot timer when the head changes.
fn insert_in_queue(pun: usize, desc: *mut TimeoutDesc) {
    hardware::disable();
    unsafe {
        let que = TIME_QUES.get(pun);
        let mut prev: *mut TimeoutDesc = ptr::null_mut();
        let mut curr = *que;
        while !curr.is_null() && (*desc).time >= (*curr).time {
            prev = curr;
            curr = (*curr).next;
        }
        (*desc).next = curr;
        if prev.is_null() {
            *que = desc;
            let now = current_time();
            hardware::set_timeout_timer((*desc).time.saturating_sub(now));
        } else {
            (*prev).next = desc;
        }
    }
    hardware::enable();
}

/// Removes every entry matching (time, proc) from the given unit's queue,
/// returning ALTING entries to the pool.
fn remove_from_queue(pun: usize, time: Time, proc: *mut Process) {
    hardware::disable();
    unsafe {
        let que = TIME_QUES.get(pun);
        let mut prev: *mut TimeoutDesc = ptr::null_mut();
        let mut curr = *que;
        while !curr.is_null() && (*curr).time <= time {
            let next = (*curr).next;
            if (*curr).time == time && (*curr).proc == proc {
                if prev.is_null() {
                    *que = next;
                } else {
                    (*prev).next = next;
                }
                if (*curr).kind == TMO_ALTING {
                    memory::release(TMO_INDEX.load(Ordering::Relaxed), curr as *mut u8);
                }
            } else {
                prev = curr;
            }
            curr = next;
        }
    }
    hardware::enable();
}

/// Blocks the current process until wall time reaches `when`. Returns
/// immediately if the deadline has already passed.
pub fn after(when: Time) {
    if when > current_time() {
        let pun = hardware::current_pu();
        let proc = scheduler::get_current();

        // the descriptor lives on this process's own stack; the timeout
        // handler unlinks it before the process can run again
        let mut desc = TimeoutDesc {
            time: when,
            proc,
            next: ptr::null_mut(),
            kind: TMO_AFTER,
        };
        scheduler::prepare_to_wait(proc);
        insert_in_queue(pun, &mut desc);
        scheduler::relinquish();
        // resuming here, the timeout has expired
    }
}

/// Registers a deadline for an alternating process. Returns true (and
/// registers nothing) if the deadline has already passed.
pub(crate) fn enable_timeout(time: Time, proc: *mut Process) -> bool {
    if current_time() >= time {
        return true;
    }
    let desc = memory::allocate(TMO_INDEX.load(Ordering::Relaxed)) as *mut TimeoutDesc;
    unsafe {
        ptr::write(
            desc,
            TimeoutDesc {
                time,
                proc,
                next: ptr::null_mut(),
                kind: TMO_ALTING,
            },
        );
        insert_in_queue((*proc).pun as usize, desc);
    }
    false
}

/// Withdraws a deadline registered by enable_timeout (if it has not fired
/// yet) and reports whether it has passed.
pub(crate) fn disable_timeout(time: Time, proc: *mut Process) -> bool {
    let ready = current_time() >= time;
    unsafe {
        remove_from_queue((*proc).pun as usize, time, proc);
    }
    ready
}

/// Handles the elapsed-time interrupt: advance the clock by one tick.
/// Reached with interrupts disabled; unit 0 only.
pub(crate) fn handle_elapsed_time_interrupt() {
    CURRENT_TIME.fetch_add(TICK, Ordering::AcqRel);
}

/// Makes a process whose After expired ready.
fn free_process(proc: *mut Process) {
    unsafe {
        let old = (*proc).sched_state.swap(PROC_READY, Ordering::AcqRel);
        if old == PROC_WAITING {
            scheduler::enqueue0(proc);
        }
        // a PREPARING_TO_WAIT process will fail its park and proceed
    }
}

/// Makes an alternating process ready if nobody else has. The enabling /
/// waiting split mirrors free_process_maybe in the alternation engine,
/// but enqueues directly: this runs on the owning unit with interrupts
/// already disabled.
fn maybe_free_alting_process(proc: *mut Process) {
    unsafe {
        match (*proc).alt_state.compare_exchange(
            ALT_ENABLING,
            ALT_READY,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // still enabling; it will see READY at the end of the pass
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
                    scheduler::enqueue0(proc);
                }
            }
            // READY or NONE: someone beat us to it, or the alternation
            // is already over
            Err(_) => (),
        }
    }
}

/// Handles the timeout interrupt: ready every process whose deadline has
/// passed, re-arm for the next head, and preempt if warranted. Reached
/// with interrupts disabled.
pub(crate) fn handle_timeout_interrupt() {
    let pun = hardware::current_pu();
    unsafe {
        let que = TIME_QUES.get(pun);
        let now = current_time();

        while !(*que).is_null() && (**que).time <= now {
            let head = *que;
            *que = (*head).next;

            match (*head).kind {
                TMO_AFTER => free_process((*head).proc),
                TMO_ALTING => {
                    maybe_free_alting_process((*head).proc);
                    memory::release(TMO_INDEX.load(Ordering::Relaxed), head as *mut u8);
                }
                _ => fatal("timer: invalid timeout type"),
            }
        }

        if !(*que).is_null() {
            hardware::set_timeout_timer((**que).time.saturating_sub(now));
        }
    }

    // perform preemption if necessary
    scheduler::schedule_from_interrupt();
}

/// Initializes the timeout service.
pub(crate) fn init() {
    TMO_INDEX.store(
        memory::find_index(core::mem::size_of::<TimeoutDesc>()),
        Ordering::Relaxed,
    );
    log::debug!("timer: {} ns tick", TICK);
}
