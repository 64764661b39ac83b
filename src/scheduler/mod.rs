/*
 * Priority Scheduler
 *
 * This module multiplexes cooperative processes onto the processing
 * units. Each unit has its own ready queue ordered "strictly higher
 * priority first, FIFO within equal priority"; within a unit, processes
 * run until they suspend, but any interrupt boundary (timeout, elapsed
 * tick, interprocessor interrupt, user interrupt) may preempt the current
 * process when a strictly higher-priority process is ready.
 *
 * KEY MECHANISMS:
 *
 * 1. READY QUEUES: intrusive singly-linked lists, one per unit, touched
 *    only by the owning unit with interrupts disabled
 * 2. CROSS-UNIT WAKE-UPS: a unit readying a foreign process pushes it
 *    onto the target's interprocessor queue and raises an interrupt;
 *    the target drains the inbox whenever it next looks at its ready set
 * 3. PARKING: relinquish() tries sched_state PREPARING_TO_WAIT -> WAITING;
 *    if a ready-maker already flipped the state to READY the park is
 *    abandoned and the process continues. This closes the lost-wakeup
 *    window between deciding to wait and actually sleeping
 * 4. PREEMPTION: schedule_from_interrupt() runs at the tail of every
 *    interrupt handler and switches to the ready-queue head when it has
 *    strictly higher priority than the interrupted process
 * 5. TERMINATION: a dying process moves onto its unit's mutex-protected
 *    termination stack, frees its own record, and dispatches the next
 *    runnable process
 *
 * An idle process per unit (lowest priority) guarantees the dispatcher
 * always finds a runnable process; yield uses take1() so the idle process
 * can never be yielded to, nor can it yield itself.
 */

mod ipq;
pub(crate) mod process;

use core::cell::UnsafeCell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicU16, Ordering};

use crate::hardware;
use crate::interrupt;
use crate::memory;
use crate::timer;
use crate::types::{NPUN, PuLocal, Priority, Pun};
use crate::utils::fatal;

pub(crate) use process::{
    ALT_ENABLING, ALT_NONE, ALT_READY, ALT_WAITING, PROC_PREPARING_TO_WAIT, PROC_READY,
    PROC_WAITING, Process, context_slot, stack_base, stack_size,
};

/// Priority of the initial process (highest).
const INIT_PRI: Priority = Priority::HIGH;

/// Priority of the idle processes (lowest).
const IDLE_PRI: Priority = Priority::LOW;

/// Stack size of the idle processes.
const IDLE_STACK_SIZE: usize = 8192;

/// Stack size of the per-unit termination stacks.
const TERM_STACK_SIZE: usize = 16 * 1024;

/// Exchange attempts on the termination mutex before yielding.
const TERM_TRIALS_BEFORE_YIELD: usize = 5;

/// Currently executing process on each unit.
static CURRENT: PuLocal<*mut Process> = PuLocal::new([ptr::null_mut(); NPUN]);

/// Priority of the currently executing process on each unit; mirrors
/// `(*CURRENT[p]).pri` at all times.
static CURRENT_PRI: [AtomicU16; NPUN] = [const { AtomicU16::new(0) }; NPUN];

/// The ready queues (head = highest priority).
static RDY_QUES: PuLocal<*mut Process> = PuLocal::new([ptr::null_mut(); NPUN]);

/// Data structures used in process termination. The mutex serializes
/// terminations on one unit so the termination stack has a single user.
struct Termination {
    mutex: AtomicBool,
    stack: UnsafeCell<[u8; TERM_STACK_SIZE]>,
}

unsafe impl Sync for Termination {}

static TERMINATION: [Termination; NPUN] = [const {
    Termination {
        mutex: AtomicBool::new(false),
        stack: UnsafeCell::new([0; TERM_STACK_SIZE]),
    }
}; NPUN];

/// One-time bring-up guard.
static INITIALIZED: spin::Once<()> = spin::Once::new();

/// Returns the current process on this unit.
pub(crate) fn get_current() -> *mut Process {
    unsafe { *CURRENT.get(hardware::current_pu()) }
}

/// Sets the current (executing) process on this unit.
/// Interrupts must be disabled when calling this function.
pub(crate) fn set_current(proc: *mut Process) {
    let pun = hardware::current_pu();
    unsafe {
        if (*proc).pun as usize != pun {
            fatal("scheduler: set_current on non-matching unit");
        }
        *CURRENT.get(pun) = proc;
        CURRENT_PRI[pun].store((*proc).pri.0, Ordering::Release);
    }
}

/// Moves the given process to the preparing-to-wait state.
pub(crate) fn prepare_to_wait(proc: *mut Process) {
    unsafe {
        (*proc)
            .sched_state
            .store(PROC_PREPARING_TO_WAIT, Ordering::Release);
    }
}

/// Inserts a process into its unit's ready queue, preserving "strictly
/// higher priority first, FIFO within equal priority".
/// Interrupts must be disabled when calling this function.
pub(crate) fn enqueue0(proc: *mut Process) {
    unsafe {
        let que = RDY_QUES.get((*proc).pun as usize);
        let mut prev: *mut Process = ptr::null_mut();
        let mut curr = *que;
        while !curr.is_null() && !(*proc).pri.is_higher((*curr).pri) {
            prev = curr;
            curr = (*curr).next;
        }
        (*proc).next = curr;
        if prev.is_null() {
            *que = proc;
        } else {
            (*prev).next = proc;
        }
    }
}

/// Inserts a process into its unit's ready queue.
pub(crate) fn enqueue(proc: *mut Process) {
    hardware::disable();
    enqueue0(proc);
    hardware::enable();
}

/// Removes and returns the highest-priority ready process on the given
/// unit, draining the interprocessor inbox first. The result may be the
/// idle process. Must be called with interrupts disabled.
fn take(pun: usize) -> *mut Process {
    loop {
        let proc = ipq::remove();
        if proc.is_null() {
            break;
        }
        enqueue0(proc);
    }

    unsafe {
        let que = RDY_QUES.get(pun);
        let proc = *que;
        if !proc.is_null() {
            *que = (*proc).next;
        }
        proc
    }
}

/// Like take(), but returns null unless at least two processes are ready,
/// so the caller can never be handed the idle process (and the idle
/// process itself cannot yield). Must be called with interrupts disabled.
fn take1(pun: usize) -> *mut Process {
    loop {
        let proc = ipq::remove();
        if proc.is_null() {
            break;
        }
        enqueue0(proc);
    }

    unsafe {
        let que = RDY_QUES.get(pun);
        let head = *que;
        if !head.is_null() && !(*head).next.is_null() {
            *que = (*head).next;
            return head;
        }
        ptr::null_mut()
    }
}

/// Makes the given process ready to execute, possibly preempting the
/// current process. Interrupts must be disabled when calling this
/// function.
pub(crate) fn schedule0(proc: *mut Process) {
    let pun = hardware::current_pu();
    unsafe {
        if (*proc).pun as usize == pun {
            let curr = get_current();
            if !(*proc).pri.is_higher((*curr).pri) {
                enqueue0(proc);
            } else {
                // preempt the current process
                set_current(proc);
                enqueue0(curr);
                hardware::switch_context(curr, proc);
                // resuming here, the caller re-enables
            }
        } else {
            // the process belongs to another unit
            ipq::add((*proc).pun as usize, proc);
        }
    }
}

/// Makes the given process ready to execute, possibly preempting the
/// current process.
pub(crate) fn schedule(proc: *mut Process) {
    hardware::disable();
    schedule0(proc);
    hardware::enable();
}

/// True if the process is linked into its unit's ready queue.
/// Must be called with interrupts disabled.
fn queued0(proc: *mut Process) -> bool {
    unsafe {
        let mut curr = *RDY_QUES.get((*proc).pun as usize);
        while !curr.is_null() {
            if curr == proc {
                return true;
            }
            curr = (*curr).next;
        }
    }
    false
}

/// Preempts the current process if a strictly higher-priority process is
/// ready. Called from interrupt handlers with interrupts disabled; the
/// interrupted machine state was already saved at handler entry.
pub(crate) fn schedule_from_interrupt() {
    let curr = get_current();

    // a queued current process is one whose wake-up raced its park: the
    // queue entry is its wake ticket and its saved context must stay the
    // park's own. Let the park run to completion; it dispatches the
    // queue head itself a few instructions from now.
    if queued0(curr) {
        return;
    }

    unsafe {
        let que = RDY_QUES.get((*curr).pun as usize);
        let head = *que;
        if !head.is_null() && (*head).pri.is_higher((*curr).pri) {
            let proc = take((*curr).pun as usize);
            enqueue0(curr);
            set_current(proc);
            hardware::switch_interrupt_context(curr, proc);
        }
    }
    // an empty queue means the current process is the idle process
}

/// Parks the current process and gives the unit to the highest-priority
/// ready process, provided the process still holds its decision to wait;
/// a ready-maker that already flipped the state wins and the process
/// continues without switching.
pub(crate) fn relinquish() {
    let oldproc = get_current();
    let pun = unsafe { (*oldproc).pun as usize };

    let parked = unsafe {
        (*oldproc)
            .sched_state
            .compare_exchange(
                PROC_PREPARING_TO_WAIT,
                PROC_WAITING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    };

    if parked {
        hardware::disable();
        let newproc = take(pun);
        if newproc.is_null() {
            fatal("scheduler: relinquish found an empty ready queue");
        }
        set_current(newproc);
        hardware::switch_context(oldproc, newproc);
        hardware::enable();
        // a resumed process re-enables here
    }
}

/// Parks the current process unconditionally (alternation parks through
/// alt_state, not sched_state).
pub(crate) fn relinquish_unconditional() {
    let oldproc = get_current();
    let pun = unsafe { (*oldproc).pun as usize };

    hardware::disable();
    let newproc = take(pun);
    if newproc.is_null() {
        fatal("scheduler: relinquish found an empty ready queue");
    }
    set_current(newproc);
    hardware::switch_context(oldproc, newproc);
    hardware::enable();
}

/// Gives up the unit but remains ready. A no-op when no other process
/// (besides idle) is ready.
pub fn yield_now() {
    let oldproc = get_current();
    let pun = unsafe { (*oldproc).pun as usize };

    hardware::disable();
    let newproc = take1(pun);
    if !newproc.is_null() {
        set_current(newproc);
        enqueue0(oldproc);
        hardware::switch_context(oldproc, newproc);
    }
    hardware::enable();
}

fn claim_termination(term: &Termination) {
    loop {
        for _ in 0..TERM_TRIALS_BEFORE_YIELD {
            if !term.mutex.swap(true, Ordering::AcqRel) {
                return;
            }
            core::hint::spin_loop();
        }
        yield_now();
    }
}

/// Completes a termination: runs on the unit's termination stack with
/// interrupts disabled, frees the record, and dispatches the next
/// runnable process.
extern "C" fn finish_termination() {
    let oldproc = get_current();
    let (pun, index) = unsafe { ((*oldproc).pun as usize, (*oldproc).index as usize) };

    // the record can go back to its class now that this code runs on the
    // termination stack; release is lock-free, so holding interrupts
    // disabled here is legal
    memory::release(index, oldproc as *mut u8);

    TERMINATION[pun].mutex.store(false, Ordering::Release);

    let newproc = take(pun);
    if newproc.is_null() {
        fatal("scheduler: terminate found an empty ready queue");
    }
    set_current(newproc);
    hardware::restore_context(newproc);
    // the restored context re-establishes the new process's signal mask
}

/// Terminates the current process. Does not return.
pub fn terminate() -> ! {
    let curr = get_current();
    let pun = unsafe { (*curr).pun as usize };

    // sole use of the termination stack; claimed with interrupts enabled
    let term = &TERMINATION[pun];
    claim_termination(term);

    // interrupts stay disabled until the next process is dispatched, so
    // no handler can save state into the record while it is being freed
    hardware::disable();
    hardware::set_stack(
        curr,
        term.stack.get() as *mut u8,
        TERM_STACK_SIZE,
        finish_termination,
    );
}

/// Dispatches an incoming interrupt. Runs with interrupts disabled.
pub(crate) fn handle_interrupt(intr: usize) {
    match intr {
        hardware::INTR_ELAPSED => {
            timer::handle_elapsed_time_interrupt();
            schedule_from_interrupt();
        }
        hardware::INTR_TIMEOUT => timer::handle_timeout_interrupt(),
        hardware::INTR_INTERPROC => handle_interprocessor_interrupt(),
        hardware::INTR_USER0 | hardware::INTR_USER1 => {
            interrupt::transmit(intr);
            schedule_from_interrupt();
        }
        _ => fatal("scheduler: unknown interrupt"),
    }
}

/// Handles the interprocessor interrupt: adopt every process the inbox
/// carries, then preempt if one of them outranks the current process.
fn handle_interprocessor_interrupt() {
    loop {
        let proc = ipq::remove();
        if proc.is_null() {
            break;
        }
        enqueue0(proc);
    }
    schedule_from_interrupt();
}

/// Logic of the idle processes.
fn idle() {
    hardware::enable();
    loop {
        hardware::halt_processor();
    }
}

/// Starts the run.
///
/// `total` is the size of the allocatable pool in bytes; `initial_stack`
/// the stack size to account to the initial process. The calling thread
/// becomes unit 0 and returns from here as the initial process, holding
/// the highest priority.
pub fn initialize(total: usize, initial_stack: usize) {
    let mut first = false;
    INITIALIZED.call_once(|| first = true);
    if !first {
        fatal("initialize called twice");
    }

    // no interrupts during bring-up
    hardware::disable();

    hardware::init();
    memory::init(total - initial_stack);
    interrupt::init();
    timer::init();

    // the currently executing code is the initial process; its record's
    // stack area goes unused because the host thread brought its own
    let proc = process::make_process(None, initial_stack, INIT_PRI, 0);
    hardware::activate_processor(0, proc);
    set_current(proc);

    // idle process for unit 0
    let idler = process::make_process(Some(Box::new(idle)), IDLE_STACK_SIZE, IDLE_PRI, 0);
    enqueue0(idler);

    // activate the other units, each starting with an idle process
    for pun in 1..NPUN {
        let idler =
            process::make_process(Some(Box::new(idle)), IDLE_STACK_SIZE, IDLE_PRI, pun as Pun);
        unsafe {
            *CURRENT.get(pun) = idler;
        }
        CURRENT_PRI[pun].store(IDLE_PRI.0, Ordering::Release);
        hardware::activate_processor(pun, idler);
    }

    hardware::synchronize_processors();
    log::info!("scheduler: {} units running", NPUN);

    hardware::enable();
}
