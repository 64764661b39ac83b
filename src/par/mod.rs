/*
 * Parallel Composition
 *
 * Structured parallel composition: the calling process builds a child
 * process for each branch, parks on a completion barrier, and resumes
 * exactly once after the last child has finished. Four flavors:
 *
 * - par          children share the parent's unit and priority
 * - par_pri      children get descending priorities below the parent's
 * - placed_par   children may name their unit
 * - placed_par_pri  both
 *
 * Children may borrow from the parent's frame: the parent provably
 * outlives them because it does not leave this module until the barrier
 * has been struck by every child. The borrow is erased to 'static only
 * for storage in the process record.
 *
 * The priority spread works in levels: the first PRI PAR runs at level 0,
 * a PRI PAR inside one of its children at level 1, and so on, each level
 * packing up to eight children between two priorities of the level above.
 * Exceeding the level depth, the child count, or the 12-bit value range
 * is a fatal programming error, reported rather than wrapped.
 */

use core::mem;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::scheduler::{self, PROC_READY, PROC_WAITING, Process};
use crate::types::{PRI_LEVELS, PRI_PROCS, PRI_VAL_MASK, Priority, Pun};
use crate::utils::fatal;

/// Default child stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 16 * 1024;

/// Specification of one child process.
pub struct Proc<'a> {
    stack_size: usize,
    pun: Option<Pun>,
    entry: Box<dyn FnOnce() + Send + 'a>,
}

impl<'a> Proc<'a> {
    /// A child with the default stack size.
    pub fn new(entry: impl FnOnce() + Send + 'a) -> Proc<'a> {
        Proc {
            stack_size: DEFAULT_STACK_SIZE,
            pun: None,
            entry: Box::new(entry),
        }
    }

    /// A child with an explicit stack size. The stack also absorbs
    /// interrupt frames, so leave headroom beyond the code's own needs.
    pub fn with_stack(stack_size: usize, entry: impl FnOnce() + Send + 'a) -> Proc<'a> {
        Proc {
            stack_size,
            pun: None,
            entry: Box::new(entry),
        }
    }

    /// Places the child on the given unit (honored by the placed_par
    /// flavors).
    pub fn on(mut self, pun: Pun) -> Proc<'a> {
        self.pun = Some(pun);
        self
    }
}

/// Completion barrier, on the parent's stack for the duration of the par.
struct ParBarrier {
    children: AtomicI32,
    parent: *mut Process,
}

#[derive(Clone, Copy)]
struct BarrierRef(*const ParBarrier);
unsafe impl Send for BarrierRef {}

/// Strikes the barrier; the last child wakes the parent.
fn barrier_sync(barrier: BarrierRef) {
    unsafe {
        if (*barrier.0).children.fetch_sub(1, Ordering::AcqRel) == 1 {
            let parent = (*barrier.0).parent;
            let old = (*parent).sched_state.swap(PROC_READY, Ordering::AcqRel);
            if old == PROC_WAITING {
                scheduler::schedule(parent);
            }
            // a PREPARING_TO_WAIT parent fails its park and proceeds
        }
    }
}

/// Runs child processes in parallel on the parent's unit at the parent's
/// priority.
pub fn par(children: Vec<Proc<'_>>) {
    run_par(children, false, false);
}

/// Runs child processes in parallel on the parent's unit with descending
/// priorities starting at the parent's.
pub fn par_pri(children: Vec<Proc<'_>>) {
    run_par(children, true, false);
}

/// Runs child processes in parallel on their designated units at the
/// parent's priority.
pub fn placed_par(children: Vec<Proc<'_>>) {
    run_par(children, false, true);
}

/// Runs child processes in parallel on their designated units with
/// descending priorities starting at the parent's.
pub fn placed_par_pri(children: Vec<Proc<'_>>) {
    run_par(children, true, true);
}

fn run_par(children: Vec<Proc<'_>>, spread: bool, placed: bool) {
    let nc = children.len();
    if nc == 0 {
        // a barrier over zero children would never strike
        return;
    }
    if spread && nc > PRI_PROCS {
        fatal("par: too many child processes");
    }

    // the current process is the parent
    let parent = scheduler::get_current();
    let (parent_pri, parent_pun) = unsafe { ((*parent).pri, (*parent).pun) };

    let (level, delta) = if spread {
        let level = parent_pri.level() + 1;
        if level >= PRI_LEVELS {
            fatal("par: too many PRI levels");
        }
        (level, Priority::delta(level))
    } else {
        (0, 0)
    };

    let barrier = ParBarrier {
        children: AtomicI32::new(nc as i32),
        parent,
    };
    let barrier = BarrierRef(&barrier);

    scheduler::prepare_to_wait(parent);

    // build and schedule each child
    for (i, child) in children.into_iter().enumerate() {
        let pri = if spread {
            let value = parent_pri.value() as u32 + i as u32 * delta as u32;
            if value > PRI_VAL_MASK as u32 {
                fatal("par: PRI PAR priority value overflow");
            }
            Priority::new(level, value as u16)
        } else {
            parent_pri
        };
        let pun = if placed {
            child.pun.unwrap_or(parent_pun)
        } else {
            parent_pun
        };

        // the parent outlives its children by construction, so the
        // borrow can be erased for storage in the record
        let entry: Box<dyn FnOnce() + Send + 'static> = unsafe { mem::transmute(child.entry) };
        let wrapped: Box<dyn FnOnce() + Send> = Box::new(move || {
            entry();
            barrier_sync(barrier);
        });

        let proc = scheduler::process::make_process(Some(wrapped), child.stack_size, pri, pun);
        if pun == parent_pun {
            scheduler::enqueue(proc);
        } else {
            scheduler::schedule(proc);
        }
    }

    // the barrier awakens the parent when all children are done
    scheduler::relinquish();
}
