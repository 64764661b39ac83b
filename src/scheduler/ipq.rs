/*
 * Interprocessor Queues
 *
 * One inbox per unit, carrying processes made ready by another unit.
 * A producer on any unit pushes with a compare-exchange loop and then
 * raises the interprocessor interrupt; only the owning unit pops, which
 * keeps the pop side single-consumer and free of the ABA hazard (a node
 * being popped cannot be re-pushed until the pop has retired it).
 *
 * The intake is a stack, so bursts arrive in reverse push order. That is
 * harmless: every drained process goes through the priority insert of the
 * ready queue anyway.
 */

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::hardware;
use crate::types::NPUN;

use super::process::Process;

struct Ipq {
    head: AtomicPtr<Process>,
}

static IPQS: [Ipq; NPUN] = [const {
    Ipq {
        head: AtomicPtr::new(ptr::null_mut()),
    }
}; NPUN];

/// Pushes a process onto the given unit's inbox and notifies the unit.
pub(crate) fn add(pun: usize, proc: *mut Process) {
    let queue = &IPQS[pun];
    loop {
        let head = queue.head.load(Ordering::Acquire);
        unsafe {
            (*proc).next = head;
        }
        if queue
            .head
            .compare_exchange_weak(head, proc, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            break;
        }
    }
    hardware::send_interprocessor_interrupt(pun);
}

/// Pops one process from the current unit's inbox, or null when empty.
/// Owner only.
pub(crate) fn remove() -> *mut Process {
    let queue = &IPQS[hardware::current_pu()];
    loop {
        let head = queue.head.load(Ordering::Acquire);
        if head.is_null() {
            return ptr::null_mut();
        }
        let next = unsafe { (*head).next };
        if queue
            .head
            .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe {
                (*head).next = ptr::null_mut();
            }
            return head;
        }
    }
}
