//! Signal requests and the signal-dispatch collaborator.
//!
//! Real signal machinery (handler frames on the guest stack, host signal
//! interception) lives outside this crate. The scheduler keeps the
//! bookkeeping the requests need: a per-thread pending set and mask, and
//! sigwait parks. The [`SignalDispatch`] trait is the narrow interface the
//! external machinery implements; it may promote parked threads and rewrite
//! their registers during Phase 1 delivery.

use nix::errno::Errno;

use crate::core::scheduler::Scheduler;
use crate::host::memory::ForeignPtr;
use crate::host::request::{ReqError, ReqResult, Request};
use crate::host::sync::condvar::CondKey;
use crate::host::thread::{OnWake, ThreadId, ThreadStatus};
use crate::host::Host;

/// Signals are a 64-bit set with bit n meaning signal n; bit 0 is unused,
/// so the highest representable signal is 63.
pub const MAX_SIGNAL: u64 = 63;

/// How-constant for mask updates, after the shim's remap from the guest's
/// C-library values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MaskHow {
    Block = 0,
    Unblock = 1,
    SetMask = 2,
}

impl MaskHow {
    pub fn from_word(w: u64) -> Option<Self> {
        match w {
            0 => Some(MaskHow::Block),
            1 => Some(MaskHow::Unblock),
            2 => Some(MaskHow::SetMask),
            _ => None,
        }
    }
}

/// The external signal machinery, seen from the scheduler.
pub trait SignalDispatch {
    /// Phase 1: deliver whatever is deliverable. May mutate thread states.
    fn deliver_pending(&mut self, host: &mut Host);

    /// A guest thread changed its signal mask; mirror it at the host level
    /// if the integration needs that.
    fn host_mask_update(&mut self, how: MaskHow, mask: u64) -> Result<(), Errno> {
        let _ = (how, mask);
        Ok(())
    }

    /// A signal handler returned on `tid`. Restore whatever state delivery
    /// saved, and say whether an interrupted blocking syscall should be
    /// transparently restarted (SA_RESTART). The core's contract is that it
    /// should not.
    fn signal_returns(&mut self, host: &mut Host, tid: ThreadId) -> bool {
        let _ = (host, tid);
        false
    }
}

/// The in-crate dispatcher: enough for sigwait and thread-targeted kills.
/// Signals for threads that are not sigwaiting stay pending until something
/// asks for them; building handler frames is the embedder's business.
pub struct QueuedSignals;

impl SignalDispatch for QueuedSignals {
    fn deliver_pending(&mut self, host: &mut Host) {
        let waiting: Vec<ThreadId> = host
            .threads
            .iter_live()
            .filter(|(_, t)| {
                t.status == ThreadStatus::WaitCond
                    && matches!(
                        t.cond.as_ref().map(|c| c.key),
                        Some(CondKey::SigWait(_))
                    )
                    && t.sig_pending & t.sigwait_set != 0
            })
            .map(|(tid, _)| tid)
            .collect();
        for tid in waiting {
            // The replayed sigwait request consumes the signal.
            host.cond_wake_thread(tid, Ok(()));
        }
    }
}

impl Host {
    /// Queue `signo` for a particular virtual thread.
    pub fn thread_kill(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let target = ThreadId(req.args[0] as usize);
        let signo = req.args[1];
        if !(1..=MAX_SIGNAL).contains(&signo) {
            return Err(Errno::EINVAL.into());
        }
        if req.args[0] as usize >= crate::host::thread::MAX_VTHREADS
            || !self.threads.is_live(target)
        {
            return Err(Errno::ESRCH.into());
        }
        self.threads.thread_mut(target).sig_pending |= 1 << signo;
        log::trace!("PTHREAD[{tid}]: kill({target}, {signo})");
        Ok(0)
    }

    /// Park until a signal from the set is queued; the reply is the signal
    /// number, which the shim stores through the caller's out pointer after
    /// this request writes it there.
    pub fn sigwait(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let set_ptr = ForeignPtr::<u64>::new(req.args[0]);
        let out_ptr = ForeignPtr::<i32>::new(req.args[1]);
        if set_ptr.is_null() {
            return Err(Errno::EFAULT.into());
        }
        let set = self.mem.read_val(set_ptr).map_err(|_| Errno::EFAULT)?;

        let thread = self.threads.thread_mut(tid);
        let ready = thread.sig_pending & set;
        if ready != 0 {
            let signo = ready.trailing_zeros() as u64;
            thread.sig_pending &= !(1 << signo);
            thread.sigwait_set = 0;
            if !out_ptr.is_null() {
                self.mem
                    .write_val(out_ptr, &(signo as i32))
                    .map_err(|_| Errno::EFAULT)?;
            }
            log::trace!("PTHREAD[{tid}]: sigwait got signal {signo}");
            return Ok(signo);
        }

        thread.sigwait_set = set;
        thread.sigwait_out = out_ptr;
        log::trace!("PTHREAD[{tid}]: sigwait: BLOCK");
        self.cond_park(tid, CondKey::SigWait(tid.0), None, OnWake::Retry(req));
        Err(ReqError::Parked)
    }
}

impl Scheduler {
    /// Update the calling thread's mask and forward the change. Bad mask
    /// pointers surface as the would-fault error, per the crude null check
    /// the replacement library has always done.
    pub(crate) fn req_signal_mask(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let how = MaskHow::from_word(req.args[0]).ok_or(Errno::EINVAL)?;
        let new_ptr = ForeignPtr::<u64>::new(req.args[1]);
        let old_ptr = ForeignPtr::<u64>::new(req.args[2]);
        if new_ptr.is_null() {
            return Err(Errno::EFAULT.into());
        }
        let new_mask = self
            .host
            .mem
            .read_val(new_ptr)
            .map_err(|_| Errno::EFAULT)?;

        let old = self.host.threads.thread(tid).sig_mask;
        if !old_ptr.is_null() {
            self.host
                .mem
                .write_val(old_ptr, &old)
                .map_err(|_| Errno::EFAULT)?;
        }
        let thread = self.host.threads.thread_mut(tid);
        thread.sig_mask = match how {
            MaskHow::Block => old | new_mask,
            MaskHow::Unblock => old & !new_mask,
            MaskHow::SetMask => new_mask,
        };
        let mask = thread.sig_mask;
        self.signals.host_mask_update(how, mask)?;
        Ok(0)
    }

    /// A signal handler returned. If the thread was blocked in read/write
    /// when the signal preempted it, the syscall is not retried: it returns
    /// "interrupted" and the descriptor wait is dropped. SA_RESTART
    /// semantics deliberately do not hold here.
    pub(crate) fn req_signal_returns(&mut self, tid: ThreadId, _req: Request) -> ReqResult {
        let restart = self.signals.signal_returns(&mut self.host, tid);
        if restart {
            return Ok(0);
        }
        if self.host.threads.thread(tid).status == ThreadStatus::WaitFd {
            let number = self.host.threads.thread(tid).regs.syscall_number();
            debug_assert!(number == libc::SYS_read || number == libc::SYS_write);
            let thread = self.host.threads.thread_mut(tid);
            thread.regs
                .set_syscall_result(-i64::from(Errno::EINTR as i32));
            thread.status = ThreadStatus::Runnable;
            self.host.fd_waits.clear_for_thread(tid);
            log::trace!("SCHED[{tid}]: read/write interrupted by signal; EINTR");
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::request::RequestCode;
    use crate::host::testutil::{guest_alloc, spawn_runnable, test_host};

    fn kill_req(target: ThreadId, signo: u64) -> Request {
        Request {
            code: RequestCode::ThreadKill,
            args: [target.0 as u64, signo, 0, 0],
        }
    }

    #[test]
    fn kill_queues_and_sigwait_consumes() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let t1 = spawn_runnable(&mut host);
        let set_ptr = guest_alloc::<u64>(&mut host);
        let out_ptr = guest_alloc::<i32>(&mut host);
        host.mem.write_val(set_ptr, &(1u64 << 10)).unwrap();

        let req = Request {
            code: RequestCode::SigWait,
            args: [set_ptr.addr(), out_ptr.addr(), 0, 0],
        };
        assert_eq!(host.sigwait(t1, req), Err(ReqError::Parked));
        assert_eq!(host.threads.thread(t1).status, ThreadStatus::WaitCond);

        // A non-matching signal does not wake the waiter.
        assert_eq!(host.thread_kill(t0, kill_req(t1, 12)), Ok(0));
        QueuedSignals.deliver_pending(&mut host);
        assert_eq!(host.threads.thread(t1).status, ThreadStatus::WaitCond);

        assert_eq!(host.thread_kill(t0, kill_req(t1, 10)), Ok(0));
        QueuedSignals.deliver_pending(&mut host);
        let thread = host.threads.thread(t1);
        assert_eq!(thread.status, ThreadStatus::Runnable);
        assert_eq!(thread.regs.gprs[crate::host::registers::REG_RES], 10);
        assert_eq!(host.mem.read_val(out_ptr).unwrap(), 10i32);
        // Signal 12 is still pending, 10 was consumed.
        assert_eq!(host.threads.thread(t1).sig_pending, 1 << 12);
    }

    #[test]
    fn sigwait_returns_immediately_when_pending() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let set_ptr = guest_alloc::<u64>(&mut host);
        let out_ptr = guest_alloc::<i32>(&mut host);
        host.mem.write_val(set_ptr, &(1u64 << 5)).unwrap();
        host.threads.thread_mut(t0).sig_pending = 1 << 5;

        let req = Request {
            code: RequestCode::SigWait,
            args: [set_ptr.addr(), out_ptr.addr(), 0, 0],
        };
        assert_eq!(host.sigwait(t0, req), Ok(5));
        assert_eq!(host.threads.thread(t0).sig_pending, 0);
    }

    #[test]
    fn signal_return_forces_eintr_on_fd_waits() {
        use crate::core::configuration::Options;
        use crate::core::scheduler::Scheduler;
        use crate::host::dispatch::{GuestRunner, TrapCode};
        use crate::host::memory::FlatMemory;
        use crate::host::registers::{DispatchBlock, RegisterFile, REG_REQ};

        struct NoRunner;
        impl GuestRunner for NoRunner {
            fn run(&mut self, _: ThreadId, _: &mut DispatchBlock, _: &mut u32) -> TrapCode {
                TrapCode::CounterZero
            }
        }

        let mem = FlatMemory::new(0x10000, 1 << 20, 1 << 20);
        let mut sched = Scheduler::new(
            Options::default(),
            Box::new(mem),
            Box::new(NoRunner),
            RegisterFile::default(),
        );
        let t0 = ThreadId(0);
        {
            let thread = sched.host.threads.thread_mut(t0);
            thread.regs.gprs[REG_REQ] = libc::SYS_read as u64;
            thread.status = ThreadStatus::WaitFd;
        }
        sched.host.fd_waits.add(t0, 9, libc::SYS_read);

        let req = Request {
            code: RequestCode::SignalReturns,
            args: [0; 4],
        };
        assert_eq!(sched.req_signal_returns(t0, req), Ok(0));
        let thread = sched.host.threads.thread(t0);
        assert_eq!(thread.status, ThreadStatus::Runnable);
        assert_eq!(thread.regs.syscall_number(), -i64::from(Errno::EINTR as i32));
        assert_eq!(sched.host.fd_waits.iter_used().count(), 0);
    }

    #[test]
    fn kill_validates_target_and_signal() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        assert_eq!(
            host.thread_kill(t0, kill_req(ThreadId(55), 5)),
            Err(ReqError::Failed(Errno::ESRCH))
        );
        assert_eq!(
            host.thread_kill(t0, kill_req(t0, 0)),
            Err(ReqError::Failed(Errno::EINVAL))
        );
        assert_eq!(
            host.thread_kill(t0, kill_req(t0, 99)),
            Err(ReqError::Failed(Errno::EINVAL))
        );
    }
}
