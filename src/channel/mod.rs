/*
 * Synchronous Channels
 *
 * Unbuffered rendezvous channels: sender and receiver both block until
 * the data copy has happened. Each channel is a spin mutex around a
 * single waiting-process slot and a data pointer; at most one process
 * waits on a channel at a time.
 *
 * The channel cooperates with the alternation engine through two hooks:
 * enable() installs the alternating process as a waiter with no
 * destination pointer, and a writer that finds such a marker does not
 * complete the transfer itself. Instead it replaces the marker, parks
 * with its source pointer published, and pulls the alternation owner out
 * of its select; the owner performs the actual copy when it re-enters
 * read(). This is what gives alternation its enable/observe/disable
 * shape.
 *
 * Payloads are plain copies: `Channel<T: Copy>` moves `size_of::<T>()`
 * bytes and never interprets them. The typed wrapper exists so both ends
 * agree on the length; the untyped core is what alternation guards hold.
 */

use core::marker::PhantomData;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::Ordering;

use crate::alt;
use crate::mutex::SpinMutex;
use crate::scheduler::{self, PROC_READY, PROC_WAITING, Process};
use crate::utils::fatal;

/// Channel state, guarded by the channel mutex.
///
/// Invariants at rest: `waiting` null implies both pointers null; a
/// parked writer has `src` set; a parked reader has `dest` set; an
/// alternation marker has both null.
struct ChanState {
    waiting: *mut Process,
    src: *mut u8,
    dest: *mut u8,
}

unsafe impl Send for ChanState {}

/// The untyped rendezvous core. Alternation guards reference this.
pub struct RawChannel {
    state: SpinMutex<ChanState>,
}

impl RawChannel {
    pub const fn new() -> RawChannel {
        RawChannel {
            state: SpinMutex::new(ChanState {
                waiting: ptr::null_mut(),
                src: ptr::null_mut(),
                dest: ptr::null_mut(),
            }),
        }
    }

    /// Reads `len` bytes from the channel into `dest`.
    fn read_bytes(&self, dest: *mut u8, len: usize) {
        let curr = scheduler::get_current();
        let mut st = self.state.lock();

        if !st.waiting.is_null() {
            // writer is ready: transfer the data
            if st.src.is_null() {
                // a second reader, or an alternation marker: either way
                // the channel already has its one allowed waiter
                fatal("channel: read found a waiter that is not a writer");
            }
            unsafe {
                ptr::copy_nonoverlapping(st.src, dest, len);
            }
            let was_waiting = st.waiting;
            st.waiting = ptr::null_mut();
            st.src = ptr::null_mut();
            drop(st);

            // make the sending process ready; if it was merely preparing
            // to wait, its park fails and it proceeds on its own
            let old = unsafe { (*was_waiting).sched_state.swap(PROC_READY, Ordering::AcqRel) };
            if old == PROC_WAITING {
                scheduler::schedule(was_waiting);
            }
        } else {
            // writer not ready: park with the destination published
            st.dest = dest;
            st.waiting = curr;
            scheduler::prepare_to_wait(curr);
            drop(st);
            scheduler::relinquish();
            // resuming here, the transfer is done
        }
    }

    /// Reads `len` bytes if a writer is parked; returns false otherwise.
    fn try_read_bytes(&self, dest: *mut u8, len: usize) -> bool {
        let mut st = self.state.lock();

        if st.waiting.is_null() || st.src.is_null() {
            return false;
        }

        unsafe {
            ptr::copy_nonoverlapping(st.src, dest, len);
        }
        let was_waiting = st.waiting;
        st.waiting = ptr::null_mut();
        st.src = ptr::null_mut();
        drop(st);

        let old = unsafe { (*was_waiting).sched_state.swap(PROC_READY, Ordering::AcqRel) };
        if old == PROC_WAITING {
            scheduler::schedule(was_waiting);
        }
        true
    }

    /// Writes `len` bytes from `src` into the channel.
    fn write_bytes(&self, src: *const u8, len: usize) {
        let curr = scheduler::get_current();
        let mut st = self.state.lock();

        if !st.waiting.is_null() {
            if !st.dest.is_null() {
                // normal output: a reader is parked, transfer the data
                unsafe {
                    ptr::copy_nonoverlapping(src, st.dest, len);
                }
                let was_waiting = st.waiting;
                st.waiting = ptr::null_mut();
                st.dest = ptr::null_mut();
                drop(st);

                let old =
                    unsafe { (*was_waiting).sched_state.swap(PROC_READY, Ordering::AcqRel) };
                if old == PROC_WAITING {
                    scheduler::schedule(was_waiting);
                }
            } else if !st.src.is_null() {
                // a writer is already parked; the channel allows one
                // waiter, so concurrent writers must be serialized
                fatal("channel: write found another writer parked");
            } else {
                // an alternation installed its marker: become the waiter,
                // publish the source, and pull the owner out of its select;
                // the owner completes the transfer on its re-entering read
                let was_waiting = st.waiting;
                st.waiting = curr;
                st.src = src as *mut u8;
                scheduler::prepare_to_wait(curr);
                drop(st);

                alt::free_process_maybe(was_waiting);
                scheduler::relinquish();
                // resuming here, the transfer is done
            }
        } else {
            // receiver not ready: park with the source published
            st.src = src as *mut u8;
            st.waiting = curr;
            scheduler::prepare_to_wait(curr);
            drop(st);
            scheduler::relinquish();
            // resuming here, the transfer is done
        }
    }

    /// Enables this channel for an alternation. Returns true if a writer
    /// is already parked.
    pub(crate) fn enable(&self, proc: *mut Process) -> bool {
        let mut st = self.state.lock();
        if !st.waiting.is_null() {
            // a waiter equal to `proc` means this channel appears more
            // than once in the same alternation
            st.waiting != proc
        } else {
            st.waiting = proc;
            st.dest = ptr::null_mut();
            false
        }
    }

    /// Disables this channel for an alternation. Returns true if a writer
    /// arrived while the alternation was enabled.
    pub(crate) fn disable(&self, proc: *mut Process) -> bool {
        let mut st = self.state.lock();
        if !st.waiting.is_null() && st.waiting != proc {
            true
        } else {
            // either nobody waiting, or just our own marker
            st.waiting = ptr::null_mut();
            false
        }
    }
}

impl Default for RawChannel {
    fn default() -> RawChannel {
        RawChannel::new()
    }
}

/// A typed unbuffered channel carrying values of `T` by copy.
pub struct Channel<T> {
    raw: RawChannel,
    marker: PhantomData<fn(T) -> T>,
}

impl<T: Copy + Send> Channel<T> {
    pub const fn new() -> Channel<T> {
        Channel {
            raw: RawChannel::new(),
            marker: PhantomData,
        }
    }

    /// The untyped core, for building alternation guards.
    pub(crate) fn raw(&self) -> &RawChannel {
        &self.raw
    }

    /// Receives a value, blocking until a sender rendezvouses.
    pub fn read(&self) -> T {
        let mut value = MaybeUninit::<T>::uninit();
        self.raw
            .read_bytes(value.as_mut_ptr() as *mut u8, size_of::<T>());
        unsafe { value.assume_init() }
    }

    /// Receives a value if a sender is already parked.
    pub fn try_read(&self) -> Option<T> {
        let mut value = MaybeUninit::<T>::uninit();
        if self
            .raw
            .try_read_bytes(value.as_mut_ptr() as *mut u8, size_of::<T>())
        {
            Some(unsafe { value.assume_init() })
        } else {
            None
        }
    }

    /// Sends a value, blocking until a receiver rendezvouses.
    pub fn write(&self, value: T) {
        self.raw
            .write_bytes(&value as *const T as *const u8, size_of::<T>());
    }
}

impl<T: Copy + Send> Default for Channel<T> {
    fn default() -> Channel<T> {
        Channel::new()
    }
}
