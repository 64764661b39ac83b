/*
 * Interrupt Objects
 *
 * A process that wishes to react to an interrupt calls receive() with
 * that interrupt number; when the interrupt fires, the handler calls
 * transmit() on the same number. The two meet in a single atomic slot
 * per (unit, interrupt) pair.
 *
 * A process may receive interrupts only from its own unit. Delivery is
 * at most once per receive(): an interrupt that fires with no registered
 * receiver is dropped, and the receiver must be registered before the
 * firing. There is no buffering.
 *
 * This module uses no mutex, so the interrupt handler cannot lose the
 * processor trying to claim one.
 */

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hardware::NINTR;
use crate::scheduler::{self, PROC_READY, PROC_WAITING, Process};
use crate::types::NPUN;
use crate::utils::fatal;

pub use crate::hardware::{INTR_USER0, INTR_USER1, send_interrupt};

/// Single-slot rendezvous between an interrupt handler and a receiver.
pub struct Interrupt {
    waiting: AtomicPtr<Process>,
}

impl Interrupt {
    pub const fn new() -> Interrupt {
        Interrupt {
            waiting: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

impl Default for Interrupt {
    fn default() -> Interrupt {
        Interrupt::new()
    }
}

static INTERRUPTS: [[Interrupt; NINTR]; NPUN] =
    [const { [const { Interrupt::new() }; NINTR] }; NPUN];

/// Initializes the interrupt module.
pub(crate) fn init() {
    // the slots are statically empty; nothing to build
    log::debug!("interrupt: {} slots per unit", NINTR);
}

/// Blocks the current process until the given interrupt fires on its
/// unit. A firing between the two atomic actions below and the park is
/// absorbed by the preparing-to-wait handshake.
pub fn receive(intr_no: usize) {
    if intr_no >= NINTR {
        fatal("receive: no such interrupt");
    }
    let curr = scheduler::get_current();
    let slot = unsafe { &INTERRUPTS[(*curr).pun as usize][intr_no] };

    scheduler::prepare_to_wait(curr);

    // let it be known that this process awaits the interrupt
    slot.waiting.store(curr, Ordering::Release);

    scheduler::relinquish();
    // resuming here, the interrupt has fired
}

/// Informs the receiver of the given interrupt, if one is registered.
/// Called by the interrupt handler with interrupts disabled; returns the
/// readied process (null if none).
pub(crate) fn transmit(intr_no: usize) -> *mut Process {
    let curr = scheduler::get_current();
    let slot = unsafe { &INTERRUPTS[(*curr).pun as usize][intr_no] };

    let receiver = slot.waiting.swap(ptr::null_mut(), Ordering::AcqRel);
    if !receiver.is_null() {
        let old = unsafe { (*receiver).sched_state.swap(PROC_READY, Ordering::AcqRel) };
        if old == PROC_WAITING {
            scheduler::enqueue0(receiver);
        }
        // a PREPARING_TO_WAIT receiver will fail its park and proceed
    }
    receiver
}
