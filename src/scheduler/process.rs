/*
 * Process Records
 *
 * This module implements the process record, the fundamental entity of
 * the runtime. A record carries:
 * - The saved machine context and the process's own stack
 * - The owning unit (fixed at creation) and the priority
 * - The size class that takes the record back on termination
 * - The intrusive link used by ready queues and the interprocessor queue
 * - Two independent atomic state fields: sched_state cooperates with
 *   wake-ups, alt_state cooperates with alternation ready-makers
 *
 * Records live in blocks from the pool allocator and are only ever
 * handled through raw pointers: the scheduler owns them, channels and
 * alternations hold transient non-owning handles, and a record dies only
 * through terminate().
 *
 * Why the three-valued sched_state matters: a reader that completes a
 * rendezvous can mark the writer READY between the writer's decision to
 * wait and its actual park. PREPARING_TO_WAIT makes that window explicit:
 * a ready-maker exchanges the state to READY, the parker's
 * PREPARING_TO_WAIT -> WAITING compare-exchange then fails, and the
 * parker resumes without ever sleeping. Never collapse the intermediate
 * state. alt_state is the alternation-specific analogue and transitions
 * independently.
 */

use core::mem;
use core::ptr;
use core::sync::atomic::AtomicU8;

use crate::hardware;
use crate::memory;
use crate::types::{Priority, Pun};

/// sched_state: runnable or running.
pub(crate) const PROC_READY: u8 = 0;
/// sched_state: committed to wait but not yet parked.
pub(crate) const PROC_PREPARING_TO_WAIT: u8 = 1;
/// sched_state: parked.
pub(crate) const PROC_WAITING: u8 = 2;

/// alt_state: not alternating.
pub(crate) const ALT_NONE: u8 = 0;
/// alt_state: walking the enable pass.
pub(crate) const ALT_ENABLING: u8 = 1;
/// alt_state: parked inside a select.
pub(crate) const ALT_WAITING: u8 = 2;
/// alt_state: a ready-maker fired during the select.
pub(crate) const ALT_READY: u8 = 3;

/// Process descriptor. Lives at the start of its pool block; the stack
/// occupies the rest of the block.
#[repr(C)]
pub(crate) struct Process {
    /// Saved machine context (parked, preempted, or not yet started).
    pub(crate) ctx: libc::ucontext_t,
    /// Next process in a ready queue or the interprocessor queue.
    pub(crate) next: *mut Process,
    /// Memory class of this record.
    pub(crate) index: u16,
    /// Priority of this process.
    pub(crate) pri: Priority,
    /// Unit this process runs on.
    pub(crate) pun: Pun,
    /// Scheduling state.
    pub(crate) sched_state: AtomicU8,
    /// State when alternating.
    pub(crate) alt_state: AtomicU8,
    /// Entry closure; taken once by the start trampoline.
    pub(crate) entry: Option<Box<dyn FnOnce() + Send>>,
    /// Stack region inside this record's block.
    pub(crate) stack_base: *mut u8,
    pub(crate) stack_size: usize,
}

/// Raw pointer to a process's context slot.
pub(crate) fn context_slot(proc: *mut Process) -> *mut libc::ucontext_t {
    unsafe { &raw mut (*proc).ctx }
}

/// Base of a process's stack region.
pub(crate) fn stack_base(proc: *mut Process) -> *mut u8 {
    unsafe { (*proc).stack_base }
}

/// Length of a process's stack region.
pub(crate) fn stack_size(proc: *mut Process) -> usize {
    unsafe { (*proc).stack_size }
}

/// First thing executed by a new process: run the entry closure, then
/// terminate.
pub(crate) extern "C" fn process_trampoline() {
    let proc = super::get_current();
    let entry = unsafe { (*proc).entry.take() };
    if let Some(entry) = entry {
        entry();
    }
    super::terminate();
}

/// Constructs a process record and returns a pointer to it.
///
/// The record and the stack share one pool block; `index` remembers the
/// class so terminate() can return the block. A record built without an
/// entry (the initial process) gets no machine context: the calling
/// thread already has one.
pub(crate) fn make_process(
    entry: Option<Box<dyn FnOnce() + Send>>,
    stack_size: usize,
    pri: Priority,
    pun: Pun,
) -> *mut Process {
    let record = mem::size_of::<Process>().next_multiple_of(16);
    let index = memory::find_index(stack_size + record);
    let block = memory::allocate(index);
    let proc = block as *mut Process;

    unsafe {
        let has_entry = entry.is_some();
        ptr::write(
            proc,
            Process {
                ctx: mem::zeroed(),
                next: ptr::null_mut(),
                index: index as u16,
                pri,
                pun,
                sched_state: AtomicU8::new(PROC_WAITING),
                alt_state: AtomicU8::new(ALT_NONE),
                entry,
                stack_base: block.add(record),
                stack_size: memory::BLOCK_SIZES[index] - record,
            },
        );
        if has_entry {
            hardware::build_context(proc, process_trampoline);
        }
    }
    proc
}
