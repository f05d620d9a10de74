//! Reader-writer locks.
//!
//! The guest handle keeps its LinuxThreads byte layout but the state lives
//! in a shadow slot found by a linear scan over the handle's address. The
//! readers word of the handle doubles as the init flag (zero means the
//! static initializer), and the kind word selects reader or writer
//! preference; writer preference is the default.
//!
//! Blocked acquirers park on the shadow's read or write condition with
//! their request stored, and re-run it from the top when woken.

use bytemuck::{Pod, Zeroable};
use nix::errno::Errno;
use static_assertions::const_assert_eq;

use crate::host::memory::{ForeignPtr, GuestWord};
use crate::host::request::{ReqError, ReqResult, Request};
use crate::host::sync::condvar::CondKey;
use crate::host::sync::mutex::MutexId;
use crate::host::thread::{OnWake, ThreadId};
use crate::host::Host;

/// Capacity of the rwlock shadow table. Exhaustion is fatal; raise and
/// rebuild.
pub const MAX_RWLOCKS: usize = 64;

const RWLOCK_VALID: u32 = 0x00fa_cade;

/// Kind word value explicitly requesting reader preference. Anything else,
/// including the zeroed static initializer, prefers writers.
const PREFER_READER_KIND: i32 = 2;

/// Guest-visible rwlock object, byte-compatible with the client library's
/// `pthread_rwlock_t`.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GuestRwlock {
    pub lock: [i32; 2],
    /// 0 = needs-init; forced to 1 once the shadow exists.
    pub readers: i32,
    pub writer: i32,
    pub read_waiting: i32,
    pub write_waiting: i32,
    pub kind: i32,
    pub pshared: i32,
}

const_assert_eq!(std::mem::size_of::<GuestRwlock>(), 32);

#[derive(Clone, Debug)]
pub struct RwlockSlot {
    pub in_use: bool,
    pub guest_addr: GuestWord,
    pub internal_mx: MutexId,
    pub readers_active: u32,
    pub writer_active: bool,
    pub readers_waiting: u32,
    pub writers_waiting: u32,
    pub prefer_writer: bool,
    pub valid_magic: u32,
}

pub struct RwlockTable {
    slots: Vec<Option<RwlockSlot>>,
}

impl RwlockTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_RWLOCKS).map(|_| None).collect(),
        }
    }

    pub fn find(&self, guest_addr: GuestWord) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.in_use && s.guest_addr == guest_addr))
    }

    fn insert(&mut self, slot: RwlockSlot) -> usize {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.is_none() {
                *s = Some(slot);
                return i;
            }
        }
        log::error!("rwlock table full");
        panic!("no free rwlock slots; raise MAX_RWLOCKS and rebuild");
    }

    pub fn slot(&self, id: usize) -> &RwlockSlot {
        self.slots[id].as_ref().expect("rwlock slot in use")
    }

    pub fn slot_mut(&mut self, id: usize) -> &mut RwlockSlot {
        self.slots[id].as_mut().expect("rwlock slot in use")
    }

    fn remove(&mut self, id: usize) -> RwlockSlot {
        self.slots[id].take().expect("rwlock slot in use")
    }

    pub(crate) fn note_reader_unparked(&mut self, id: usize) {
        let slot = self.slot_mut(id);
        debug_assert!(slot.readers_waiting > 0);
        slot.readers_waiting -= 1;
    }

    pub(crate) fn note_writer_unparked(&mut self, id: usize) {
        let slot = self.slot_mut(id);
        debug_assert!(slot.writers_waiting > 0);
        slot.writers_waiting -= 1;
    }
}

impl Default for RwlockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    /// Find the shadow for a guest handle, creating and initializing it the
    /// first time the handle (or a statically initialized one) is seen.
    fn rwlock_from_guest(&mut self, ptr: ForeignPtr<GuestRwlock>) -> Result<usize, Errno> {
        if ptr.is_null() {
            return Err(Errno::EINVAL);
        }
        if let Some(id) = self.rwlocks.find(ptr.addr()) {
            return Ok(id);
        }
        let mut gr: GuestRwlock = self.mem.read_val(ptr).map_err(|_| Errno::EFAULT)?;
        let internal_mx = self.internal_mutex_alloc();
        let id = self.rwlocks.insert(RwlockSlot {
            in_use: true,
            guest_addr: ptr.addr(),
            internal_mx,
            readers_active: 0,
            writer_active: false,
            readers_waiting: 0,
            writers_waiting: 0,
            prefer_writer: gr.kind != PREFER_READER_KIND,
            valid_magic: RWLOCK_VALID,
        });
        gr.readers = 1;
        self.mem.write_val(ptr, &gr).map_err(|_| Errno::EFAULT)?;
        log::trace!("PTHREAD: initialize rwlock {ptr:?} -> {id}");
        Ok(id)
    }

    fn rwlock_checked(&mut self, req: &Request) -> Result<usize, ReqError> {
        let id = self.rwlock_from_guest(req.arg_ptr(0))?;
        if self.rwlocks.slot(id).valid_magic != RWLOCK_VALID {
            return Err(Errno::EINVAL.into());
        }
        Ok(id)
    }

    pub fn rwlock_init(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let ptr = req.arg_ptr::<GuestRwlock>(0);
        let kind = req.args[1] as i32;
        if let Some(id) = self.rwlocks.find(ptr.addr()) {
            let slot = self.rwlocks.slot(id);
            if slot.readers_active > 0
                || slot.writer_active
                || slot.readers_waiting > 0
                || slot.writers_waiting > 0
            {
                return Err(Errno::EBUSY.into());
            }
            let slot = self.rwlocks.slot_mut(id);
            slot.prefer_writer = kind != PREFER_READER_KIND;
            slot.valid_magic = RWLOCK_VALID;
            return Ok(0);
        }
        // Record the requested preference, then let the remap build it.
        let mut gr: GuestRwlock = self.mem.read_val(ptr).map_err(|_| Errno::EFAULT)?;
        gr.readers = 0;
        gr.kind = kind;
        self.mem.write_val(ptr, &gr).map_err(|_| Errno::EFAULT)?;
        self.rwlock_from_guest(ptr)?;
        log::trace!("PTHREAD[{tid}]: rwlock_init {ptr:?}");
        Ok(0)
    }

    pub fn rwlock_rdlock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.rwlock_checked(&req)?;
        let mx = self.rwlocks.slot(id).internal_mx;
        self.internal_lock(mx, tid);
        if self.rwlocks.slot(id).writer_active {
            let slot = self.rwlocks.slot_mut(id);
            slot.readers_waiting += 1;
            self.internal_unlock(mx, tid);
            log::trace!("PTHREAD[{tid}]: rwlock_rdlock {id}: BLOCK");
            self.cond_park(tid, CondKey::RwRead(id), None, OnWake::Retry(req));
            return Err(ReqError::Parked);
        }
        self.rwlocks.slot_mut(id).readers_active += 1;
        self.internal_unlock(mx, tid);
        Ok(0)
    }

    pub fn rwlock_tryrdlock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.rwlock_checked(&req)?;
        let mx = self.rwlocks.slot(id).internal_mx;
        self.internal_lock(mx, tid);
        let res = if self.rwlocks.slot(id).writer_active {
            Err(Errno::EBUSY.into())
        } else {
            self.rwlocks.slot_mut(id).readers_active += 1;
            Ok(0)
        };
        self.internal_unlock(mx, tid);
        res
    }

    pub fn rwlock_wrlock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.rwlock_checked(&req)?;
        let mx = self.rwlocks.slot(id).internal_mx;
        self.internal_lock(mx, tid);
        let slot = self.rwlocks.slot(id);
        if slot.writer_active || slot.readers_active > 0 {
            self.rwlocks.slot_mut(id).writers_waiting += 1;
            self.internal_unlock(mx, tid);
            log::trace!("PTHREAD[{tid}]: rwlock_wrlock {id}: BLOCK");
            self.cond_park(tid, CondKey::RwWrite(id), None, OnWake::Retry(req));
            return Err(ReqError::Parked);
        }
        self.rwlocks.slot_mut(id).writer_active = true;
        self.internal_unlock(mx, tid);
        Ok(0)
    }

    pub fn rwlock_trywrlock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.rwlock_checked(&req)?;
        let mx = self.rwlocks.slot(id).internal_mx;
        self.internal_lock(mx, tid);
        let slot = self.rwlocks.slot(id);
        let res = if slot.writer_active || slot.readers_active > 0 {
            Err(Errno::EBUSY.into())
        } else {
            self.rwlocks.slot_mut(id).writer_active = true;
            Ok(0)
        };
        self.internal_unlock(mx, tid);
        res
    }

    /// Which side held is deduced from the counters, as in the classic
    /// implementation. Last reader out signals a waiting writer; a writer
    /// release consults the preference flag and falls back to the other
    /// side when the preferred one is empty.
    pub fn rwlock_unlock(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.rwlock_checked(&req)?;
        let mx = self.rwlocks.slot(id).internal_mx;
        self.internal_lock(mx, tid);

        let slot = self.rwlocks.slot(id).clone();
        if slot.readers_active > 0 {
            debug_assert!(!slot.writer_active);
            let slot = self.rwlocks.slot_mut(id);
            slot.readers_active -= 1;
            let wake_writer = slot.readers_active == 0 && slot.writers_waiting > 0;
            self.internal_unlock(mx, tid);
            if wake_writer {
                self.cond_wake_one(CondKey::RwWrite(id));
            }
        } else if slot.writer_active {
            self.rwlocks.slot_mut(id).writer_active = false;
            self.internal_unlock(mx, tid);
            let (first, second): (CondKey, CondKey) = if slot.prefer_writer {
                (CondKey::RwWrite(id), CondKey::RwRead(id))
            } else {
                (CondKey::RwRead(id), CondKey::RwWrite(id))
            };
            // Writers are woken singly, readers en masse.
            let woke = match first {
                CondKey::RwWrite(_) => self.cond_wake_one(first),
                _ => self.cond_wake_all(first) > 0,
            };
            if !woke {
                match second {
                    CondKey::RwWrite(_) => {
                        self.cond_wake_one(second);
                    }
                    _ => {
                        self.cond_wake_all(second);
                    }
                }
            }
        } else {
            self.internal_unlock(mx, tid);
            return Err(Errno::EPERM.into());
        }
        log::trace!("PTHREAD[{tid}]: rwlock_unlock {id}");
        Ok(0)
    }

    pub fn rwlock_destroy(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.rwlock_checked(&req)?;
        let slot = self.rwlocks.slot(id);
        if slot.readers_active > 0
            || slot.writer_active
            || slot.readers_waiting > 0
            || slot.writers_waiting > 0
        {
            return Err(Errno::EBUSY.into());
        }
        let slot = self.rwlocks.remove(id);
        self.internal_mutex_release(slot.internal_mx);
        // Put the handle back in needs-init state for any later reuse.
        let ptr = req.arg_ptr::<GuestRwlock>(0);
        let mut gr: GuestRwlock = self.mem.read_val(ptr).map_err(|_| Errno::EFAULT)?;
        gr.readers = 0;
        self.mem.write_val(ptr, &gr).map_err(|_| Errno::EFAULT)?;
        log::trace!("PTHREAD[{tid}]: rwlock_destroy {id}");
        Ok(0)
    }
}
