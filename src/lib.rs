/*
 * CXR Executive
 *
 * A CSP-style user-space executive: a multi-processor runtime that
 * multiplexes lightweight cooperative processes onto a fixed set of OS
 * threads (one per simulated processing unit). It provides synchronous
 * message passing on unbuffered channels, guarded external choice over
 * channels, deadlines and skips, priority-aware preemptive scheduling
 * driven by timer and software interrupts, and structured parallel
 * composition with a completion barrier.
 *
 * Why this is important:
 * - Gives programs occam-style PAR / ALT / channel semantics on stock
 *   OS threads, no kernel support required
 * - Keeps the concurrency model synchronous and priority-driven, which
 *   makes process interactions easy to reason about
 * - Confines all machine dependence to the hardware stand-in module
 *
 * Key components:
 * - scheduler: ready queues, preemption, yield, termination, bring-up
 * - channel: synchronous unbuffered rendezvous with alternation hooks
 * - alt: priority and fair selection over heterogeneous guards
 * - timer: per-unit timeout queues and the elapsed-time clock
 * - interrupt: single-slot rendezvous with interrupt handlers
 * - par: structured parallel composition
 * - memory: fixed size-class block allocator
 * - hardware: signals, POSIX timers and ucontext switching
 *
 * A program calls initialize() once, then composes processes with the
 * par family; processes communicate exclusively through channels,
 * alternation, deadlines and interrupts.
 */

mod alt;
mod channel;
mod hardware;
mod interrupt;
mod memory;
mod mutex;
mod par;
mod scheduler;
mod timer;
mod types;
pub mod utils;

pub use alt::{Alternation, Guard};
pub use channel::{Channel, RawChannel};
pub use hardware::{INTR_USER0, INTR_USER1, NINTR, send_interrupt};
pub use interrupt::{Interrupt, receive};
pub use memory::BLOCK_SIZES;
pub use par::{DEFAULT_STACK_SIZE, Proc, par, par_pri, placed_par, placed_par_pri};
pub use scheduler::{initialize, terminate, yield_now};
pub use timer::{after, current_time, now, tick, timeout_ready};
pub use types::{MAX_TIME, NPUN, PRI_LEVELS, PRI_PROCS, Priority, Pun, Time};
