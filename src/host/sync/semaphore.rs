//! Counting semaphores.
//!
//! A guest `sem_t` is never interpreted; its address maps to a shadow slot
//! by linear scan, created on first sight with a zero count. The shadow is
//! an internal mutex, an internal condition and the count, and the wait and
//! post operations are the usual condition-variable algorithm run as
//! scheduler-side handlers: a blocked waiter parks with its request stored
//! and re-runs it from the top when a post broadcasts the condition.

use nix::errno::Errno;

use crate::host::memory::GuestWord;
use crate::host::request::{ReqError, ReqResult, Request};
use crate::host::sync::condvar::CondKey;
use crate::host::sync::mutex::MutexId;
use crate::host::thread::{OnWake, ThreadId};
use crate::host::Host;

/// Capacity of the semaphore shadow table. Exhaustion is fatal; raise and
/// rebuild.
pub const MAX_SEMAPHORES: usize = 64;

#[derive(Clone, Debug)]
pub struct SemSlot {
    pub guest_addr: GuestWord,
    pub internal_mx: MutexId,
    pub count: u32,
}

pub struct SemTable {
    slots: Vec<Option<SemSlot>>,
}

impl SemTable {
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_SEMAPHORES).map(|_| None).collect(),
        }
    }

    pub fn find(&self, guest_addr: GuestWord) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.guest_addr == guest_addr))
    }

    fn insert(&mut self, slot: SemSlot) -> usize {
        for (i, s) in self.slots.iter_mut().enumerate() {
            if s.is_none() {
                *s = Some(slot);
                return i;
            }
        }
        log::error!("semaphore table full");
        panic!("no free semaphore slots; raise MAX_SEMAPHORES and rebuild");
    }

    pub fn slot(&self, id: usize) -> &SemSlot {
        self.slots[id].as_ref().expect("semaphore slot in use")
    }

    pub fn slot_mut(&mut self, id: usize) -> &mut SemSlot {
        self.slots[id].as_mut().expect("semaphore slot in use")
    }

    fn remove(&mut self, id: usize) -> SemSlot {
        self.slots[id].take().expect("semaphore slot in use")
    }
}

impl Default for SemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    fn sem_from_guest(&mut self, addr: GuestWord) -> Result<usize, Errno> {
        if addr == 0 {
            return Err(Errno::EINVAL);
        }
        if let Some(id) = self.sems.find(addr) {
            return Ok(id);
        }
        let internal_mx = self.internal_mutex_alloc();
        let id = self.sems.insert(SemSlot {
            guest_addr: addr,
            internal_mx,
            count: 0,
        });
        log::trace!("PTHREAD: allocated semaphore {id} for {addr:#x}");
        Ok(id)
    }

    pub fn sem_init(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let pshared = req.args[1];
        if pshared != 0 {
            return Err(Errno::ENOSYS.into());
        }
        let id = self.sem_from_guest(req.args[0])?;
        self.sems.slot_mut(id).count = req.args[2] as u32;
        log::trace!("PTHREAD[{tid}]: sem_init {id} count={}", req.args[2]);
        Ok(0)
    }

    pub fn sem_wait(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.sem_from_guest(req.args[0])?;
        let mx = self.sems.slot(id).internal_mx;
        self.internal_lock(mx, tid);
        if self.sems.slot(id).count == 0 {
            self.internal_unlock(mx, tid);
            log::trace!("PTHREAD[{tid}]: sem_wait {id}: BLOCK");
            self.cond_park(tid, CondKey::Semaphore(id), None, OnWake::Retry(req));
            return Err(ReqError::Parked);
        }
        self.sems.slot_mut(id).count -= 1;
        self.internal_unlock(mx, tid);
        Ok(0)
    }

    pub fn sem_trywait(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.sem_from_guest(req.args[0])?;
        let mx = self.sems.slot(id).internal_mx;
        self.internal_lock(mx, tid);
        let res = if self.sems.slot(id).count == 0 {
            Err(Errno::EAGAIN.into())
        } else {
            self.sems.slot_mut(id).count -= 1;
            Ok(0)
        };
        self.internal_unlock(mx, tid);
        res
    }

    pub fn sem_post(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.sem_from_guest(req.args[0])?;
        let mx = self.sems.slot(id).internal_mx;
        self.internal_lock(mx, tid);
        let slot = self.sems.slot_mut(id);
        slot.count += 1;
        let was_empty = slot.count == 1;
        self.internal_unlock(mx, tid);
        if was_empty {
            let woken = self.cond_wake_all(CondKey::Semaphore(id));
            log::trace!("PTHREAD[{tid}]: sem_post {id}: woke {woken}");
        }
        Ok(0)
    }

    pub fn sem_getvalue(&mut self, _tid: ThreadId, req: Request) -> ReqResult {
        let id = self.sem_from_guest(req.args[0])?;
        Ok(GuestWord::from(self.sems.slot(id).count))
    }

    pub fn sem_destroy(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let id = self.sem_from_guest(req.args[0])?;
        let waiters = self
            .threads
            .iter_live()
            .any(|(_, t)| t.cond.as_ref().map(|c| c.key) == Some(CondKey::Semaphore(id)));
        if waiters {
            return Err(Errno::EBUSY.into());
        }
        let slot = self.sems.remove(id);
        self.internal_mutex_release(slot.internal_mx);
        log::trace!("PTHREAD[{tid}]: sem_destroy {id}");
        Ok(0)
    }
}
