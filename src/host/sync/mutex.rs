//! Mutexes.
//!
//! The guest-visible `pthread_mutex_t` keeps its LinuxThreads byte layout:
//! the reserved word carries the slot index into the scheduler's mutex
//! table, and the count word doubles as the initialization flag (zero, the
//! static-initializer value, means needs-init). The table slot is the whole
//! truth about lock state; the guest words are only identity and ABI.

use bytemuck::{Pod, Zeroable};
use nix::errno::Errno;
use static_assertions::const_assert_eq;

use crate::host::memory::{ForeignPtr, GuestWord};
use crate::host::request::{ReqError, ReqResult, Request};
use crate::host::thread::{ThreadId, ThreadStatus};
use crate::host::Host;

/// Capacity of the mutex table. Exhaustion is fatal; raise and rebuild.
/// Semaphore and rwlock shadows allocate their internal mutexes here too.
pub const MAX_MUTEXES: usize = 256;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct MutexId(pub usize);

/// Guest-visible mutex object, byte-compatible with the client library's
/// `pthread_mutex_t`.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GuestMutex {
    /// Slot index, valid once `count` is non-zero.
    pub reserved: i32,
    /// 0 = needs-init (the static initializer), 1 = initialized.
    pub count: i32,
    pub owner: i32,
    pub kind: i32,
    pub lock: [i32; 2],
}

const_assert_eq!(std::mem::size_of::<GuestMutex>(), 24);

#[derive(Copy, Clone, Debug, Default)]
pub struct MutexSlot {
    pub in_use: bool,
    pub held: bool,
    pub owner: Option<ThreadId>,
}

pub struct MutexTable {
    slots: Vec<MutexSlot>,
}

impl MutexTable {
    pub fn new() -> Self {
        Self {
            slots: vec![MutexSlot::default(); MAX_MUTEXES],
        }
    }

    pub fn alloc(&mut self) -> MutexId {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if !slot.in_use {
                *slot = MutexSlot {
                    in_use: true,
                    held: false,
                    owner: None,
                };
                return MutexId(i);
            }
        }
        log::error!("mutex table full");
        panic!("no free mutex slots; raise MAX_MUTEXES and rebuild");
    }

    pub fn slot(&self, mid: MutexId) -> &MutexSlot {
        &self.slots[mid.0]
    }

    pub fn slot_mut(&mut self, mid: MutexId) -> &mut MutexSlot {
        &mut self.slots[mid.0]
    }

    pub fn release(&mut self, mid: MutexId) {
        debug_assert!(self.slots[mid.0].in_use);
        self.slots[mid.0] = MutexSlot::default();
    }

    pub fn check_id(&self, raw: i64) -> Result<MutexId, Errno> {
        let idx = usize::try_from(raw).map_err(|_| Errno::EINVAL)?;
        if idx >= MAX_MUTEXES || !self.slots[idx].in_use {
            return Err(Errno::EINVAL);
        }
        Ok(MutexId(idx))
    }

    pub fn check_sanity(&self) {
        for (i, s) in self.slots.iter().enumerate() {
            assert!(!s.held || s.in_use, "mutex {i} held but not in use");
            assert_eq!(
                s.owner.is_some(),
                s.held,
                "mutex {i} owner recorded without being held"
            );
        }
    }
}

impl Default for MutexTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    /// Resolve a guest mutex handle to its table slot, lazily initializing a
    /// handle that still carries the static-initializer value.
    pub fn mutex_from_guest(&mut self, ptr: ForeignPtr<GuestMutex>) -> Result<MutexId, Errno> {
        if ptr.is_null() {
            return Err(Errno::EINVAL);
        }
        let mut gm: GuestMutex = self.mem.read_val(ptr).map_err(|_| Errno::EFAULT)?;
        if gm.count == 0 {
            let mid = self.mutexes.alloc();
            gm.reserved = mid.0 as i32;
            gm.count = 1;
            self.mem.write_val(ptr, &gm).map_err(|_| Errno::EFAULT)?;
            log::trace!("PTHREAD: initialize mutex {:?} -> {}", ptr, mid.0);
            return Ok(mid);
        }
        self.mutexes.check_id(i64::from(gm.reserved))
    }

    /// Like `mutex_from_guest` but refuses to initialize: operations that
    /// make no sense on a never-locked mutex (unlock, destroy).
    fn mutex_from_guest_inited(&mut self, ptr: ForeignPtr<GuestMutex>) -> Result<MutexId, Errno> {
        if ptr.is_null() {
            return Err(Errno::EINVAL);
        }
        let gm: GuestMutex = self.mem.read_val(ptr).map_err(|_| Errno::EFAULT)?;
        if gm.count != 1 {
            return Err(Errno::EINVAL);
        }
        self.mutexes.check_id(i64::from(gm.reserved))
    }

    pub fn mutex_init(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let ptr = req.arg_ptr::<GuestMutex>(0);
        let kind = req.args[1] as i32;
        if ptr.is_null() {
            return Err(Errno::EINVAL.into());
        }
        let mut gm: GuestMutex = self.mem.read_val(ptr).map_err(|_| Errno::EFAULT)?;
        if gm.count == 1 {
            // Re-init of a live mutex: refuse while held, otherwise recycle
            // the old slot.
            let mid = self.mutexes.check_id(i64::from(gm.reserved))?;
            if self.mutexes.slot(mid).held {
                return Err(Errno::EBUSY.into());
            }
            self.mutexes.release(mid);
        }
        let mid = self.mutexes.alloc();
        gm.reserved = mid.0 as i32;
        gm.count = 1;
        gm.kind = kind;
        self.mem.write_val(ptr, &gm).map_err(|_| Errno::EFAULT)?;
        log::trace!("PTHREAD[{tid}]: mutex_init {ptr:?} -> {}", mid.0);
        Ok(0)
    }

    pub fn mutex_lock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let mid = self.mutex_from_guest(req.arg_ptr(0))?;
        log::trace!("PTHREAD[{tid}]: mutex_lock {}", mid.0);
        self.lock_slot(tid, mid, true)
    }

    pub fn mutex_trylock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let mid = self.mutex_from_guest(req.arg_ptr(0))?;
        log::trace!("PTHREAD[{tid}]: mutex_trylock {}", mid.0);
        self.lock_slot(tid, mid, false)
    }

    /// The shared acquisition path. All mutex kinds get errorcheck state
    /// transitions; a relock by the owner reports deadlock instead of
    /// recursing.
    pub(crate) fn lock_slot(&mut self, tid: ThreadId, mid: MutexId, park: bool) -> ReqResult {
        let slot = self.mutexes.slot(mid);
        if slot.held {
            if slot.owner == Some(tid) {
                return Err(Errno::EDEADLK.into());
            }
            if !park {
                return Err(Errno::EBUSY.into());
            }
            let thread = self.threads.thread_mut(tid);
            thread.status = ThreadStatus::WaitMx;
            thread.waited_on_mid = Some(mid);
            log::trace!("PTHREAD[{tid}]: mutex_lock {}: BLOCK", mid.0);
            return Err(ReqError::Parked);
        }
        let slot = self.mutexes.slot_mut(mid);
        slot.held = true;
        slot.owner = Some(tid);
        Ok(0)
    }

    pub fn mutex_unlock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let mid = self.mutex_from_guest_inited(req.arg_ptr(0))?;
        log::trace!("PTHREAD[{tid}]: mutex_unlock {}", mid.0);
        self.unlock_slot(tid, mid)?;
        Ok(0)
    }

    /// Release `mid`, handing ownership straight to the waiting thread with
    /// the lowest index if there is one. The new owner's pending lock reply
    /// (0 for a plain lock, ETIMEDOUT carried through a timed wait's
    /// reacquire) is delivered here.
    pub(crate) fn unlock_slot(&mut self, tid: ThreadId, mid: MutexId) -> Result<(), ReqError> {
        let slot = self.mutexes.slot(mid);
        if !slot.held || slot.owner != Some(tid) {
            return Err(Errno::EPERM.into());
        }

        let waiter = self
            .threads
            .iter_live()
            .find(|(_, t)| {
                t.status == ThreadStatus::WaitMx && t.waited_on_mid == Some(mid)
            })
            .map(|(wtid, _)| wtid);

        match waiter {
            Some(w) => {
                self.mutexes.slot_mut(mid).owner = Some(w);
                let thread = self.threads.thread_mut(w);
                thread.status = ThreadStatus::Runnable;
                thread.waited_on_mid = None;
                let reply: GuestWord = thread.pending_lock_reply.take().unwrap_or(0);
                self.reply(w, reply);
                log::trace!("PTHREAD[{w}]: mutex_lock {}: RESUME", mid.0);
            }
            None => {
                let slot = self.mutexes.slot_mut(mid);
                slot.held = false;
                slot.owner = None;
            }
        }
        Ok(())
    }

    pub fn mutex_destroy(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let ptr = req.arg_ptr::<GuestMutex>(0);
        let mid = self.mutex_from_guest_inited(ptr)?;
        if self.mutexes.slot(mid).held {
            return Err(Errno::EBUSY.into());
        }
        let mut gm: GuestMutex = self.mem.read_val(ptr).map_err(|_| Errno::EFAULT)?;
        gm.count = 0;
        self.mem.write_val(ptr, &gm).map_err(|_| Errno::EFAULT)?;
        self.mutexes.release(mid);
        log::trace!("PTHREAD[{tid}]: mutex_destroy {}", mid.0);
        Ok(0)
    }

    // Internal mutexes guard semaphore and rwlock shadow state. Handlers run
    // to completion between traps, so observing one held at acquisition is
    // an invariant violation, not contention.

    pub(crate) fn internal_mutex_alloc(&mut self) -> MutexId {
        self.mutexes.alloc()
    }

    pub(crate) fn internal_mutex_release(&mut self, mid: MutexId) {
        assert!(!self.mutexes.slot(mid).held, "internal mutex still held");
        self.mutexes.release(mid);
    }

    pub(crate) fn internal_lock(&mut self, mid: MutexId, tid: ThreadId) {
        let slot = self.mutexes.slot_mut(mid);
        assert!(!slot.held, "internal mutex {} contended", mid.0);
        slot.held = true;
        slot.owner = Some(tid);
    }

    pub(crate) fn internal_unlock(&mut self, mid: MutexId, tid: ThreadId) {
        let slot = self.mutexes.slot_mut(mid);
        assert_eq!(slot.owner, Some(tid), "internal mutex {} owner", mid.0);
        slot.held = false;
        slot.owner = None;
    }
}
