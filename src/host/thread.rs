//! Virtual-thread records and the fixed-capacity thread table.

use bitflags::bitflags;

use crate::host::memory::{ForeignPtr, GuestWord};
use crate::host::registers::RegisterFile;
use crate::host::request::Request;
use crate::host::sync::condvar::CondKey;
use crate::host::sync::mutex::MutexId;
use crate::host::sync::tsd::MAX_TSD_KEYS;

/// Capacity of the thread table. Exhaustion is fatal; raise and rebuild.
pub const MAX_VTHREADS: usize = 64;

/// Index into the thread table. Index 0 is the initial thread, which is
/// never destroyed.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const INITIAL_THREAD: ThreadId = ThreadId(0);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ThreadStatus {
    /// Slot free.
    Empty,
    /// Ready to be dispatched.
    Runnable,
    /// Parked on descriptor readiness.
    WaitFd,
    /// Parked in a join, waiting for the joinee to finish.
    WaitJoinee,
    /// Finished, waiting for someone to join.
    WaitJoiner,
    /// Parked on a mutex acquisition.
    WaitMx,
    /// Parked on a condition (client cond var, semaphore, rwlock, sigwait).
    WaitCond,
    /// Parked in nanosleep until `awaken_at`.
    Sleeping,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ThreadStatus::Empty => "Empty",
            ThreadStatus::Runnable => "Runnable",
            ThreadStatus::WaitFd => "WaitFD",
            ThreadStatus::WaitJoinee => "WaitJoinee",
            ThreadStatus::WaitJoiner => "WaitJoiner",
            ThreadStatus::WaitMx => "WaitMX",
            ThreadStatus::WaitCond => "WaitCV",
            ThreadStatus::Sleeping => "Sleeping",
        };
        f.write_str(s)
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct ThreadFlags: u32 {
        /// Exit frees the slot instead of parking in WaitJoiner.
        const DETACHED = 1 << 0;
        /// Cancellation requests are deferred while set.
        const CANCEL_DISABLED = 1 << 1;
        /// Asynchronous cancel type requested (accepted, not distinguished).
        const CANCEL_ASYNC = 1 << 2;
        /// A cancellation arrived while it could not be acted on.
        const CANCEL_PENDING = 1 << 3;
    }
}

/// The thread-local words the guest's C library expects the threading layer
/// to keep for it.
#[derive(Copy, Clone, Debug, Default)]
pub struct LibcTsd {
    pub errno: GuestWord,
    pub h_errno: GuestWord,
    pub res_state: GuestWord,
}

/// What to do with a `WaitCond` thread once it is woken.
#[derive(Clone, Debug)]
pub enum OnWake {
    /// Client condition wait: reacquire the mutex, then reply with the wait's
    /// result (0, or ETIMEDOUT for an expired timed wait).
    Reacquire { mid: MutexId },
    /// Semaphore/rwlock/sigwait: re-run the stored request from the top so
    /// the handler can recheck its predicate and either complete or re-park.
    Retry(Request),
}

/// Bookkeeping for a thread parked in `WaitCond`.
#[derive(Clone, Debug)]
pub struct CondWait {
    pub key: CondKey,
    /// Absolute millisecond deadline for timed waits.
    pub deadline_ms: Option<u64>,
    pub on_wake: OnWake,
}

pub struct Thread {
    pub status: ThreadStatus,
    pub regs: RegisterFile,
    /// Owned guest stack region; the initial thread's stack is host-provided
    /// and both fields stay zero for it.
    pub stack_base: GuestWord,
    pub stack_size: usize,
    pub joiner: Option<ThreadId>,
    /// Where the parked joiner wants the exit value stored.
    pub join_out: ForeignPtr<GuestWord>,
    pub waited_on_mid: Option<MutexId>,
    /// Reply delivered when a pending lock acquisition is finally granted;
    /// 0 when absent. Carries ETIMEDOUT through a timed wait's reacquire.
    pub pending_lock_reply: Option<GuestWord>,
    pub cond: Option<CondWait>,
    /// Wall-clock wakeup in microseconds while Sleeping.
    pub awaken_at: u64,
    pub retval: GuestWord,
    pub flags: ThreadFlags,
    pub libc_tsd: LibcTsd,
    pub specifics: [GuestWord; MAX_TSD_KEYS],
    /// Signals queued for this thread, as a bit set (bit n = signal n).
    pub sig_pending: u64,
    pub sig_mask: u64,
    /// Set being waited for while parked in sigwait.
    pub sigwait_set: u64,
    pub sigwait_out: ForeignPtr<i32>,
}

impl Thread {
    fn empty() -> Self {
        Self {
            status: ThreadStatus::Empty,
            regs: RegisterFile::default(),
            stack_base: 0,
            stack_size: 0,
            joiner: None,
            join_out: ForeignPtr::null(),
            waited_on_mid: None,
            pending_lock_reply: None,
            cond: None,
            awaken_at: 0,
            retval: 0,
            flags: ThreadFlags::empty(),
            libc_tsd: LibcTsd::default(),
            specifics: [0; MAX_TSD_KEYS],
            sig_pending: 0,
            sig_mask: 0,
            sigwait_set: 0,
            sigwait_out: ForeignPtr::null(),
        }
    }

    /// Reset everything except the slot's recyclable stack region.
    pub fn clear(&mut self) {
        let stack_base = self.stack_base;
        let stack_size = self.stack_size;
        *self = Self::empty();
        self.stack_base = stack_base;
        self.stack_size = stack_size;
    }
}

pub struct ThreadTable {
    slots: Vec<Thread>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_VTHREADS).map(|_| Thread::empty()).collect(),
        }
    }

    /// Find a free slot. The new occupant keeps any stack region a previous
    /// occupant left behind.
    pub fn alloc(&mut self) -> ThreadId {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.status == ThreadStatus::Empty {
                return ThreadId(i);
            }
        }
        log::error!("thread table full");
        panic!("no free thread slots; raise MAX_VTHREADS and rebuild");
    }

    pub fn is_live(&self, tid: ThreadId) -> bool {
        tid.0 < MAX_VTHREADS && self.slots[tid.0].status != ThreadStatus::Empty
    }

    pub fn thread(&self, tid: ThreadId) -> &Thread {
        let t = &self.slots[tid.0];
        debug_assert!(t.status != ThreadStatus::Empty);
        t
    }

    pub fn thread_mut(&mut self, tid: ThreadId) -> &mut Thread {
        let t = &mut self.slots[tid.0];
        debug_assert!(t.status != ThreadStatus::Empty);
        t
    }

    /// Raw slot access, Empty included: slot setup and sanity checks.
    pub fn slot_mut(&mut self, tid: ThreadId) -> &mut Thread {
        &mut self.slots[tid.0]
    }

    /// Status of any slot, Empty included: the selection scan.
    pub fn slot_status(&self, tid: ThreadId) -> ThreadStatus {
        self.slots[tid.0].status
    }

    /// Whether a `WaitCV` thread has a timed wait pending; such threads
    /// count as wakeable for the idle/deadlock decision.
    pub fn has_cond_deadline(&self, tid: ThreadId) -> bool {
        self.slots[tid.0]
            .cond
            .as_ref()
            .and_then(|c| c.deadline_ms)
            .is_some()
    }

    pub fn iter_live(&self) -> impl Iterator<Item = (ThreadId, &Thread)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, t)| t.status != ThreadStatus::Empty)
            .map(|(i, t)| (ThreadId(i), t))
    }

    /// Free a finished thread's slot. Fatal for the initial thread.
    pub fn release(&mut self, tid: ThreadId) {
        assert!(
            tid != INITIAL_THREAD,
            "attempted to destroy the initial thread"
        );
        self.slots[tid.0].clear();
    }

    /// The status table printed when deadlock is declared.
    pub fn format_status(&self) -> String {
        let mut out = String::from("sched status:\n");
        for (tid, t) in self.iter_live() {
            out.push_str(&format!("  tid {tid}:  {}", t.status));
            if let Some(j) = t.joiner {
                out.push_str(&format!("  joiner={j}"));
            }
            if let Some(m) = t.waited_on_mid {
                out.push_str(&format!("  mutex={}", m.0));
            }
            out.push('\n');
        }
        out
    }
}

impl Default for ThreadTable {
    fn default() -> Self {
        Self::new()
    }
}
