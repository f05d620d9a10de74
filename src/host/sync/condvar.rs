//! Condition waits and the wake machinery.
//!
//! There is no condition-variable table: a waiter is any thread parked in
//! `WaitCV` whose stored key matches. Client condition variables are keyed
//! by the guest handle's address; the internal conditions of semaphore and
//! rwlock shadows, and sigwait parks, get typed keys of their own so they
//! can never collide with a client address.
//!
//! Waking is where the two park flavors differ. A client condition waiter
//! must reacquire its mutex before its wait call returns, so a wake either
//! grants the free mutex immediately or moves the thread to `WaitMX` with
//! the wait's reply (0 or "timed out") parked on the thread record until
//! the lock arrives. A semaphore/rwlock/sigwait waiter instead re-runs its
//! whole request from the top, which recenters the handler on current state
//! and lets it complete or park again; that replay is the scheduler-side
//! rendition of the classic `while (!predicate) cond_wait(...)` loop.

use nix::errno::Errno;

use crate::host::memory::GuestWord;
use crate::host::request::{ReqError, ReqResult, Request};
use crate::host::sync::mutex::GuestMutex;
use crate::host::thread::{CondWait, OnWake, ThreadId, ThreadStatus};
use crate::host::Host;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CondKey {
    /// A client condition variable, identified by its guest address.
    Client(GuestWord),
    /// A semaphore shadow's internal condition.
    Semaphore(usize),
    /// The reader and writer sides of an rwlock shadow.
    RwRead(usize),
    RwWrite(usize),
    /// A sigwait park; only the signal dispatcher wakes these.
    SigWait(usize),
}

impl Host {
    pub(crate) fn cond_park(
        &mut self,
        tid: ThreadId,
        key: CondKey,
        deadline_ms: Option<u64>,
        on_wake: OnWake,
    ) {
        let thread = self.threads.thread_mut(tid);
        debug_assert_eq!(thread.status, ThreadStatus::Runnable);
        thread.status = ThreadStatus::WaitCond;
        thread.cond = Some(CondWait {
            key,
            deadline_ms,
            on_wake,
        });
    }

    fn cond_waiters(&self, key: CondKey) -> Vec<ThreadId> {
        self.threads
            .iter_live()
            .filter(|(_, t)| {
                t.status == ThreadStatus::WaitCond
                    && t.cond.as_ref().map(|c| c.key) == Some(key)
            })
            .map(|(tid, _)| tid)
            .collect()
    }

    /// Wake the lowest-index waiter on `key`; returns whether one existed.
    pub fn cond_wake_one(&mut self, key: CondKey) -> bool {
        match self.cond_waiters(key).first() {
            Some(&tid) => {
                self.cond_wake_thread(tid, Ok(()));
                true
            }
            None => false,
        }
    }

    pub fn cond_wake_all(&mut self, key: CondKey) -> usize {
        let waiters = self.cond_waiters(key);
        for &tid in &waiters {
            self.cond_wake_thread(tid, Ok(()));
        }
        waiters.len()
    }

    /// Release a `WaitCV` thread, `result` being `Err(ETIMEDOUT)` when its
    /// deadline expired rather than anyone signaling it. Signal dispatchers
    /// use this to release sigwait parks.
    pub fn cond_wake_thread(&mut self, tid: ThreadId, result: Result<(), Errno>) {
        let thread = self.threads.thread_mut(tid);
        debug_assert_eq!(thread.status, ThreadStatus::WaitCond);
        let wait = thread.cond.take().expect("WaitCV thread has no wait record");
        thread.status = ThreadStatus::Runnable;

        match wait.on_wake {
            OnWake::Reacquire { mid } => {
                let reply = match result {
                    Ok(()) => 0,
                    Err(e) => e as u32 as GuestWord,
                };
                let slot = self.mutexes.slot(mid);
                if slot.held {
                    let thread = self.threads.thread_mut(tid);
                    thread.status = ThreadStatus::WaitMx;
                    thread.waited_on_mid = Some(mid);
                    thread.pending_lock_reply = Some(reply);
                } else {
                    let slot = self.mutexes.slot_mut(mid);
                    slot.held = true;
                    slot.owner = Some(tid);
                    self.reply(tid, reply);
                }
            }
            OnWake::Retry(req) => {
                debug_assert!(result.is_ok(), "retry waits have no deadline");
                // The park edge counted this thread as waiting; undo that
                // before the handler runs and possibly counts it again.
                match wait.key {
                    CondKey::RwRead(id) => self.rwlocks.note_reader_unparked(id),
                    CondKey::RwWrite(id) => self.rwlocks.note_writer_unparked(id),
                    _ => {}
                }
                self.replay_request(tid, req);
            }
        }
    }

    /// Phase 1 sweep: timed condition waits whose deadline passed wake with
    /// the timed-out reply and go reacquire their mutex.
    pub fn expire_cond_deadlines(&mut self, now_ms: u64) {
        let expired: Vec<ThreadId> = self
            .threads
            .iter_live()
            .filter(|(_, t)| {
                t.status == ThreadStatus::WaitCond
                    && t.cond
                        .as_ref()
                        .and_then(|c| c.deadline_ms)
                        .is_some_and(|d| now_ms >= d)
            })
            .map(|(tid, _)| tid)
            .collect();
        for tid in expired {
            log::trace!("PTHREAD[{tid}]: timed condition wait expired");
            self.cond_wake_thread(tid, Err(Errno::ETIMEDOUT));
        }
    }

    // Client request handlers.

    pub fn cond_init(&mut self, _tid: ThreadId, req: Request) -> ReqResult {
        if req.args[0] == 0 {
            return Err(Errno::EINVAL.into());
        }
        Ok(0)
    }

    pub fn cond_wait(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        self.cond_wait_common(tid, req, None)
    }

    pub fn cond_timedwait(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let deadline_ms = req.args[2];
        self.cond_wait_common(tid, req, Some(deadline_ms))
    }

    /// Atomically unlock the mutex and park on the condition. "Atomically"
    /// is free here: nothing else runs until this handler returns.
    fn cond_wait_common(
        &mut self,
        tid: ThreadId,
        req: Request,
        deadline_ms: Option<u64>,
    ) -> ReqResult {
        let cv_addr = req.args[0];
        if cv_addr == 0 {
            return Err(Errno::EINVAL.into());
        }
        let mid = self.mutex_from_guest(req.arg_ptr::<GuestMutex>(1))?;
        let slot = self.mutexes.slot(mid);
        if !slot.held || slot.owner != Some(tid) {
            return Err(Errno::EPERM.into());
        }
        self.unlock_slot(tid, mid).expect("ownership checked above");
        log::trace!("PTHREAD[{tid}]: cond_wait {cv_addr:#x}: BLOCK");
        self.cond_park(
            tid,
            CondKey::Client(cv_addr),
            deadline_ms,
            OnWake::Reacquire { mid },
        );
        Err(ReqError::Parked)
    }

    pub fn cond_signal(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let key = CondKey::Client(req.args[0]);
        log::trace!("PTHREAD[{tid}]: cond_signal {:#x}", req.args[0]);
        self.cond_wake_one(key);
        Ok(0)
    }

    pub fn cond_broadcast(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let key = CondKey::Client(req.args[0]);
        let woken = self.cond_wake_all(key);
        log::trace!("PTHREAD[{tid}]: cond_broadcast {:#x}: woke {woken}", req.args[0]);
        Ok(0)
    }

    pub fn cond_destroy(&mut self, _tid: ThreadId, req: Request) -> ReqResult {
        let key = CondKey::Client(req.args[0]);
        if !self.cond_waiters(key).is_empty() {
            return Err(Errno::EBUSY.into());
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::memory::GuestWord;
    use crate::host::request::RequestCode;
    use crate::host::sync::mutex::MutexId;
    use crate::host::testutil::{guest_alloc, spawn_runnable, test_host};

    fn locked_mutex(host: &mut Host, tid: ThreadId) -> (GuestWord, MutexId) {
        let m = guest_alloc::<GuestMutex>(host);
        let req = Request {
            code: RequestCode::MutexLock,
            args: [m.addr(), 0, 0, 0],
        };
        assert_eq!(host.mutex_lock(tid, req), Ok(0));
        let gm: GuestMutex = host.mem.read_val(m).unwrap();
        (m.addr(), MutexId(gm.reserved as usize))
    }

    fn wait_req(code: RequestCode, cv: GuestWord, mx: GuestWord, dl: GuestWord) -> Request {
        Request {
            code,
            args: [cv, mx, dl, 0],
        }
    }

    #[test]
    fn wait_releases_the_mutex_and_signal_reacquires_it() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let (mx, mid) = locked_mutex(&mut host, t0);
        let cv = 0x7000;

        let res = host.cond_wait(t0, wait_req(RequestCode::CondWait, cv, mx, 0));
        assert_eq!(res, Err(ReqError::Parked));
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::WaitCond);
        assert!(!host.mutexes.slot(mid).held);

        // Signal: the waiter takes the free mutex and gets reply 0.
        assert!(host.cond_wake_one(CondKey::Client(cv)));
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::Runnable);
        assert_eq!(host.mutexes.slot(mid).owner, Some(t0));
    }

    #[test]
    fn wake_with_contended_mutex_moves_waiter_to_waitmx() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let t1 = spawn_runnable(&mut host);
        let (mx, mid) = locked_mutex(&mut host, t0);
        let cv = 0x7000;

        assert_eq!(
            host.cond_wait(t0, wait_req(RequestCode::CondWait, cv, mx, 0)),
            Err(ReqError::Parked)
        );
        // t1 grabs the mutex while t0 waits.
        let req = Request {
            code: RequestCode::MutexLock,
            args: [mx, 0, 0, 0],
        };
        assert_eq!(host.mutex_lock(t1, req), Ok(0));

        assert!(host.cond_wake_one(CondKey::Client(cv)));
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::WaitMx);

        // t1 unlocking hands the mutex to t0, whose wait finally replies 0.
        host.unlock_slot(t1, mid).unwrap();
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::Runnable);
        assert_eq!(host.mutexes.slot(mid).owner, Some(t0));
        assert_eq!(host.threads.thread(t0).regs.gprs[crate::host::registers::REG_RES], 0);
    }

    #[test]
    fn deadline_expiry_replies_timedout_and_reacquires() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let (mx, mid) = locked_mutex(&mut host, t0);

        assert_eq!(
            host.cond_timedwait(t0, wait_req(RequestCode::CondTimedWait, 0x7000, mx, 500)),
            Err(ReqError::Parked)
        );
        host.expire_cond_deadlines(499);
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::WaitCond);

        host.expire_cond_deadlines(500);
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::Runnable);
        assert_eq!(host.mutexes.slot(mid).owner, Some(t0));
        assert_eq!(
            host.threads.thread(t0).regs.gprs[crate::host::registers::REG_RES],
            Errno::ETIMEDOUT as u32 as GuestWord
        );
    }

    #[test]
    fn signal_wakes_lowest_index_waiter_only() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let t1 = spawn_runnable(&mut host);
        let t2 = spawn_runnable(&mut host);
        let cv = 0x7000;
        // Park t2 then t1 on distinct mutexes so both can reacquire freely.
        for &tid in &[t2, t1] {
            let (mx, _) = locked_mutex(&mut host, tid);
            assert_eq!(
                host.cond_wait(tid, wait_req(RequestCode::CondWait, cv, mx, 0)),
                Err(ReqError::Parked)
            );
        }
        let sig = Request {
            code: RequestCode::CondSignal,
            args: [cv, 0, 0, 0],
        };
        assert_eq!(host.cond_signal(t0, sig), Ok(0));
        assert_eq!(host.threads.thread(t1).status, ThreadStatus::Runnable);
        assert_eq!(host.threads.thread(t2).status, ThreadStatus::WaitCond);

        let destroy = Request {
            code: RequestCode::CondDestroy,
            args: [cv, 0, 0, 0],
        };
        assert_eq!(
            host.cond_destroy(t0, destroy),
            Err(ReqError::Failed(Errno::EBUSY))
        );
    }

    #[test]
    fn wait_requires_holding_the_mutex() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let t1 = spawn_runnable(&mut host);
        let (mx, _) = locked_mutex(&mut host, t0);
        assert_eq!(
            host.cond_wait(t1, wait_req(RequestCode::CondWait, 0x7000, mx, 0)),
            Err(ReqError::Failed(Errno::EPERM))
        );
    }
}
