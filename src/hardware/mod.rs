/*
 * Hardware Stand-In
 *
 * This module emulates the bare-hardware surface the rest of the runtime
 * is written against: processing units, interrupts, interval timers and
 * CPU context switching. On a real machine these routines would be a thin
 * layer of assembler; here they are built from POSIX primitives.
 *
 * MAPPING:
 * - processing unit  -> one OS thread (unit 0 is the caller of initialize)
 * - interrupt        -> real-time signal, one per (unit, interrupt) pair,
 *                       always delivered to the owning unit's thread
 * - disable/enable   -> thread signal mask (block all / unit allow mask)
 * - interval timer   -> POSIX timer with SIGEV_THREAD_ID notification
 * - CPU context      -> ucontext_t in the process record; switching is
 *                       swapcontext/setcontext
 * - IPI              -> pthread_kill of the target unit's thread
 *
 * CONCURRENCY NOTES:
 * - Only unit p writes the per-unit tables indexed by p; the startup
 *   barrier publishes them before any cross-unit read
 * - The signal handler saves the interrupted context into the current
 *   process record before dispatching, so a preemption can resume the
 *   interruptee later
 * - Signal delivery is thread-directed (SIGEV_THREAD_ID / pthread_kill);
 *   threads that are not processing units never observe runtime signals
 */

use core::cell::Cell;
use core::mem::{self, MaybeUninit};
use core::ptr;
use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, Ordering};

use crate::scheduler::{self, Process};
use crate::types::{NPUN, PuLocal, Time};
use crate::utils::{fatal, fatal_os};

/// Elapsed-time interrupt number (unit 0 only).
pub const INTR_ELAPSED: usize = 0;
/// Timeout interrupt number.
pub const INTR_TIMEOUT: usize = 1;
/// Interprocessor interrupt number.
pub const INTR_INTERPROC: usize = 2;
/// First application-level interrupt number.
pub const INTR_USER0: usize = 3;
/// Second application-level interrupt number.
pub const INTR_USER1: usize = 4;
/// Number of distinct interrupts per unit.
pub const NINTR: usize = 5;

const NS_PER_SEC: Time = 1_000_000_000;

// thread-local unit number, stored plus one so zero means "not a unit"
thread_local! {
    static PU_ID: Cell<usize> = const { Cell::new(0) };
}

/// First (lowest) signal number used by the runtime.
static SIGBASE: AtomicI32 = AtomicI32::new(0);

/// Next signal number to hand out.
static NEXT_SIGNO: AtomicI32 = AtomicI32::new(0);

/// Map from unit number to pthread handle.
static THREAD_ID: [AtomicU64; NPUN] = [const { AtomicU64::new(0) }; NPUN];

/// Map from unit number to kernel thread id (for SIGEV_THREAD_ID).
static KERNEL_TID: [AtomicI32; NPUN] = [const { AtomicI32::new(0) }; NPUN];

/// Map from (signo - SIGBASE) to interrupt number.
static INTR_OF_SIGNO: [AtomicI32; NPUN * NINTR] = [const { AtomicI32::new(-1) }; NPUN * NINTR];

/// Map from (unit, interrupt) to signal number.
static SIGNAL_NO: [[AtomicI32; NINTR]; NPUN] =
    [const { [const { AtomicI32::new(0) }; NINTR] }; NPUN];

/// Per-unit allow mask: blocks every runtime signal except the unit's own.
static SIGMASK: PuLocal<MaybeUninit<libc::sigset_t>> =
    PuLocal::new([const { MaybeUninit::uninit() }; NPUN]);

/// Per-unit single-shot timeout timer.
static TIMEOUT_TIMER: PuLocal<libc::timer_t> = PuLocal::new([ptr::null_mut(); NPUN]);

/// The single repeating elapsed-time timer (armed by unit 0, read anywhere).
static ELAPSED_TIMER: AtomicPtr<libc::c_void> = AtomicPtr::new(ptr::null_mut());

/// End-of-initialization barrier.
static BARRIER: AtomicI32 = AtomicI32::new(NPUN as i32);

/// Returns the unit number of the calling thread (0..NPUN-1).
pub(crate) fn current_pu() -> usize {
    let id = PU_ID.with(|id| id.get());
    if id == 0 {
        fatal("hardware: runtime call from a thread that is not a processing unit");
    }
    id - 1
}

/// Disables interrupts on the current thread.
pub(crate) fn disable() {
    unsafe {
        let mut blocked = MaybeUninit::<libc::sigset_t>::uninit();
        if libc::sigfillset(blocked.as_mut_ptr()) != 0 {
            fatal_os("hardware: disable sigfillset");
        }
        if libc::pthread_sigmask(libc::SIG_SETMASK, blocked.as_ptr(), ptr::null_mut()) != 0 {
            fatal("hardware: disable pthread_sigmask");
        }
    }
}

/// Enables interrupts on the current thread.
pub(crate) fn enable() {
    let pun = current_pu();
    unsafe {
        // only unit p reads SIGMASK[p]
        if libc::pthread_sigmask(libc::SIG_SETMASK, (*SIGMASK.get(pun)).as_ptr(), ptr::null_mut())
            != 0
        {
            fatal("hardware: enable pthread_sigmask");
        }
    }
}

/// The signal handler behind every runtime interrupt.
extern "C" fn handle_signal(
    signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    // signo itself is already blocked for the duration of the handler;
    // this blocks the rest of them
    disable();

    // save the interrupted context in case the handler preempts
    let curr = scheduler::get_current();
    unsafe {
        ptr::copy_nonoverlapping(
            context as *const libc::ucontext_t,
            scheduler::context_slot(curr),
            1,
        );
    }

    let index = (signo - SIGBASE.load(Ordering::Acquire)) as usize;
    let intr = INTR_OF_SIGNO[index].load(Ordering::Acquire);
    if intr < 0 {
        fatal("hardware: signal with no interrupt mapping");
    }

    scheduler::handle_interrupt(intr as usize);

    enable();
}

/// Allocates a signal for `intr` on this unit and installs the handler.
fn define_handler(intr: usize) {
    let signo = NEXT_SIGNO.fetch_add(1, Ordering::AcqRel);
    if signo > libc::SIGRTMAX() {
        fatal("hardware: out of real-time signals");
    }

    let pun = current_pu();
    let index = (signo - SIGBASE.load(Ordering::Acquire)) as usize;
    INTR_OF_SIGNO[index].store(intr as i32, Ordering::Release);
    SIGNAL_NO[pun][intr].store(signo, Ordering::Release);

    unsafe {
        // allow the signal on this unit's thread; only unit p writes SIGMASK[p]
        if libc::sigdelset((*SIGMASK.get(pun)).as_mut_ptr(), signo) != 0 {
            fatal_os("hardware: define_handler sigdelset");
        }

        // install the handler, blocking everything while it runs
        let mut action: libc::sigaction = mem::zeroed();
        if libc::sigfillset(&mut action.sa_mask) != 0 {
            fatal_os("hardware: define_handler sigfillset");
        }
        action.sa_sigaction = handle_signal as usize;
        action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        if libc::sigaction(signo, &action, ptr::null_mut()) != 0 {
            fatal_os("hardware: define_handler sigaction");
        }
    }
}

/// Defines the interrupt handlers and timers for the current unit.
fn define_interrupt_handlers() {
    let pun = current_pu();

    // unit 0 owns the elapsed-time tick
    if pun == 0 {
        define_handler(INTR_ELAPSED);
        init_elapsed_timer();
        start_elapsed_timer(crate::timer::tick());
    }

    define_handler(INTR_TIMEOUT);
    init_timeout_timer();

    define_handler(INTR_INTERPROC);

    define_handler(INTR_USER0);
    define_handler(INTR_USER1);
}

/// Creates a timer delivering the given interrupt to this unit's thread.
fn create_timer(intr: usize) -> libc::timer_t {
    let pun = current_pu();
    let signo = SIGNAL_NO[pun][intr].load(Ordering::Acquire);

    unsafe {
        let mut event: libc::sigevent = mem::zeroed();
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = signo;
        event.sigev_notify_thread_id = KERNEL_TID[pun].load(Ordering::Acquire);

        let mut timer: libc::timer_t = ptr::null_mut();
        if libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut timer) != 0 {
            fatal_os("hardware: timer_create");
        }
        timer
    }
}

fn init_elapsed_timer() {
    let timer = create_timer(INTR_ELAPSED);
    ELAPSED_TIMER.store(timer as *mut libc::c_void, Ordering::Release);
}

fn init_timeout_timer() {
    let timer = create_timer(INTR_TIMEOUT);
    unsafe {
        *TIMEOUT_TIMER.get(current_pu()) = timer;
    }
}

fn timespec_of(time: Time) -> libc::timespec {
    libc::timespec {
        tv_sec: (time / NS_PER_SEC) as libc::time_t,
        tv_nsec: (time % NS_PER_SEC) as libc::c_long,
    }
}

/// Starts the repeating elapsed-time timer with the given period.
fn start_elapsed_timer(period: Time) {
    let timer = ELAPSED_TIMER.load(Ordering::Acquire);
    let spec = libc::itimerspec {
        it_interval: timespec_of(period),
        it_value: timespec_of(period),
    };
    if unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) } != 0 {
        fatal_os("hardware: start_elapsed_timer timer_settime");
    }
}

/// Arms this unit's timeout timer for a single interval.
///
/// An interval of zero would disarm a POSIX timer instead of firing it,
/// so the interval is clamped to one nanosecond.
pub(crate) fn set_timeout_timer(interval: Time) {
    let interval = interval.max(1);
    let timer = unsafe { *TIMEOUT_TIMER.get(current_pu()) };
    let spec = libc::itimerspec {
        it_interval: timespec_of(0),
        it_value: timespec_of(interval),
    };
    if unsafe { libc::timer_settime(timer, 0, &spec, ptr::null_mut()) } != 0 {
        fatal_os("hardware: set_timeout_timer timer_settime");
    }
}

/// Reads the time remaining until the next elapsed tick. Any unit may call
/// this; timer handles are process-wide.
pub(crate) fn read_elapsed_timer() -> Time {
    let timer = ELAPSED_TIMER.load(Ordering::Acquire);
    let mut spec: libc::itimerspec = unsafe { mem::zeroed() };
    if unsafe { libc::timer_gettime(timer, &mut spec) } != 0 {
        fatal_os("hardware: read_elapsed_timer timer_gettime");
    }
    spec.it_value.tv_sec as Time * NS_PER_SEC + spec.it_value.tv_nsec as Time
}

/// Sends the interprocessor interrupt to the given unit.
///
/// ESRCH is tolerated: a unit thread that has exited (embedding program
/// teardown) has no processes left to run.
pub(crate) fn send_interprocessor_interrupt(pun: usize) {
    let thread = THREAD_ID[pun].load(Ordering::Acquire) as libc::pthread_t;
    let signo = SIGNAL_NO[pun][INTR_INTERPROC].load(Ordering::Acquire);
    let result = unsafe { libc::pthread_kill(thread, signo) };
    if result != 0 && result != libc::ESRCH {
        fatal("hardware: interprocessor pthread_kill");
    }
}

/// Raises an application-level interrupt on the current unit.
pub fn send_interrupt(intr: usize) {
    if !(INTR_USER0..NINTR).contains(&intr) {
        fatal("send_interrupt: not a user interrupt");
    }
    let pun = current_pu();
    let signo = SIGNAL_NO[pun][intr].load(Ordering::Acquire);
    if unsafe { libc::pthread_kill(libc::pthread_self(), signo) } != 0 {
        fatal("send_interrupt: pthread_kill");
    }
}

/// Halts the processor until an interrupt arrives (idle process body).
pub(crate) fn halt_processor() {
    unsafe {
        libc::pause();
    }
}

/// Synchronizes all units at the startup barrier.
pub(crate) fn synchronize_processors() {
    BARRIER.fetch_sub(1, Ordering::AcqRel);
    while BARRIER.load(Ordering::Acquire) > 0 {
        core::hint::spin_loop();
    }
}

/// Builds the initial machine context of a process: the entry trampoline
/// running on the record's own stack.
pub(crate) fn build_context(proc: *mut Process, entry: extern "C" fn()) {
    unsafe {
        let ctx = scheduler::context_slot(proc);
        if libc::getcontext(ctx) != 0 {
            fatal_os("hardware: build_context getcontext");
        }
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = scheduler::stack_base(proc) as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = scheduler::stack_size(proc);
        (*ctx).uc_stack.ss_flags = 0;
        libc::makecontext(ctx, entry, 0);
    }
}

/// Switches the processor from one process to another.
pub(crate) fn switch_context(old: *mut Process, new: *mut Process) {
    unsafe {
        if libc::swapcontext(scheduler::context_slot(old), scheduler::context_slot(new)) != 0 {
            fatal_os("hardware: switch_context swapcontext");
        }
    }
}

/// Switches to a preempting process from inside an interrupt handler.
/// The interrupted state was already saved at handler entry.
pub(crate) fn switch_interrupt_context(_interrupted: *mut Process, preempting: *mut Process) -> ! {
    unsafe {
        libc::setcontext(scheduler::context_slot(preempting));
    }
    fatal_os("hardware: switch_interrupt_context setcontext");
}

/// Restores a process's saved context, giving it the processor.
pub(crate) fn restore_context(new: *mut Process) -> ! {
    unsafe {
        libc::setcontext(scheduler::context_slot(new));
    }
    fatal_os("hardware: restore_context setcontext");
}

/// Moves the current (terminating) process onto the given stack and
/// continues in `code`.
pub(crate) fn set_stack(proc: *mut Process, stack: *mut u8, size: usize, code: extern "C" fn()) -> ! {
    unsafe {
        let ctx = scheduler::context_slot(proc);
        if libc::getcontext(ctx) != 0 {
            fatal_os("hardware: set_stack getcontext");
        }
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = size;
        (*ctx).uc_stack.ss_flags = 0;
        libc::makecontext(ctx, code, 0);
        libc::setcontext(ctx);
    }
    fatal_os("hardware: set_stack setcontext");
}

/// Prepares the calling thread to act as the given unit.
fn init_processor(pun: usize) {
    PU_ID.with(|id| id.set(pun + 1));

    THREAD_ID[pun].store(unsafe { libc::pthread_self() } as u64, Ordering::Release);
    KERNEL_TID[pun].store(
        unsafe { libc::syscall(libc::SYS_gettid) } as i32,
        Ordering::Release,
    );

    // start with every real-time signal blocked; define_handler carves out
    // the signals proper to this unit. Only unit p writes SIGMASK[p].
    unsafe {
        let mask = (*SIGMASK.get(pun)).as_mut_ptr();
        if libc::sigemptyset(mask) != 0 {
            fatal_os("hardware: init_processor sigemptyset");
        }
        let mut signo = libc::SIGRTMIN();
        while signo <= libc::SIGRTMAX() {
            if libc::sigaddset(mask, signo) != 0 {
                fatal_os("hardware: init_processor sigaddset");
            }
            signo += 1;
        }
    }

    define_interrupt_handlers();
}

struct SendProcess(*mut Process);
unsafe impl Send for SendProcess {}

/// Activates a unit, giving it a first process to run.
///
/// Unit 0 is initialized in the calling thread; every other unit gets a
/// fresh thread that initializes itself, waits at the startup barrier and
/// then assumes the given process's context. The new thread inherits the
/// creator's fully blocked signal mask.
pub(crate) fn activate_processor(pun: usize, proc: *mut Process) {
    if pun == 0 {
        init_processor(0);
        return;
    }

    let proc = SendProcess(proc);
    let spawned = std::thread::Builder::new()
        .name(format!("pu{}", pun))
        .spawn(move || {
            let proc = proc;
            init_processor(pun);
            synchronize_processors();
            restore_context(proc.0);
        });
    if spawned.is_err() {
        fatal("hardware: cannot start processing unit thread");
    }
    log::info!("hardware: unit {} activated", pun);
}

/// Initializes this module.
pub(crate) fn init() {
    let base = libc::SIGRTMIN();
    SIGBASE.store(base, Ordering::Release);
    NEXT_SIGNO.store(base, Ordering::Release);
}
