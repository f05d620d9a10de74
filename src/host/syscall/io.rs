//! Descriptor-wait bookkeeping: the table of threads parked on fds, the
//! zero-timeout readiness poll, and completion delivery.
//!
//! Polling and completion are deliberately two passes. A thread that parked
//! on an fd may have been made Runnable by a signal in the meantime; its
//! slot can become ready while the handler runs, but the result can only be
//! delivered once the thread is back in WaitFD. So the poll just marks
//! slots ready, and completion delivers results to threads that are
//! actually waiting, possibly much later.

use nix::sys::signal::{sigprocmask, SigSet, SigmaskHow};

use crate::host::memory::ForeignPtr;
use crate::host::registers::REG_ARG2;
use crate::host::syscall::GuestTimespec;
use crate::host::thread::{ThreadId, ThreadStatus, ThreadTable};
use crate::host::Host;

/// Capacity of the descriptor-wait table. Exhaustion is fatal; raise and
/// rebuild.
pub const MAX_WAITING_FDS: usize = 64;

#[derive(Copy, Clone, Debug)]
pub struct FdWaitSlot {
    pub tid: ThreadId,
    /// -1 means the slot is free.
    pub fd: i32,
    pub syscall_no: i64,
    /// select() said the fd is ready but the result has not been delivered.
    pub ready: bool,
}

const FREE: FdWaitSlot = FdWaitSlot {
    tid: ThreadId(0),
    fd: -1,
    syscall_no: 0,
    ready: false,
};

pub struct FdWaitTable {
    slots: [FdWaitSlot; MAX_WAITING_FDS],
}

impl FdWaitTable {
    pub fn new() -> Self {
        Self {
            slots: [FREE; MAX_WAITING_FDS],
        }
    }

    pub fn add(&mut self, tid: ThreadId, fd: i32, syscall_no: i64) {
        assert!(fd != -1);
        for slot in self.slots.iter_mut() {
            if slot.fd == -1 {
                *slot = FdWaitSlot {
                    tid,
                    fd,
                    syscall_no,
                    ready: false,
                };
                return;
            }
        }
        log::error!("descriptor-wait table full");
        panic!("no free descriptor-wait slots; raise MAX_WAITING_FDS and rebuild");
    }

    pub fn iter_used(&self) -> impl Iterator<Item = (usize, &FdWaitSlot)> {
        self.slots.iter().enumerate().filter(|(_, s)| s.fd != -1)
    }

    pub fn clear(&mut self, index: usize) {
        self.slots[index] = FREE;
    }

    /// Drop any wait owned by `tid` (forced-EINTR signal return).
    pub fn clear_for_thread(&mut self, tid: ThreadId) {
        for slot in self.slots.iter_mut() {
            if slot.fd != -1 && slot.tid == tid {
                *slot = FREE;
            }
        }
    }

    fn mark_ready(&mut self, fd: i32, want_read: bool) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.fd != fd || slot.ready {
                continue;
            }
            let is_read = slot.syscall_no == libc::SYS_read;
            if is_read == want_read {
                slot.ready = true;
                return true;
            }
        }
        false
    }

    /// A used slot must belong to a live thread that is either waiting on
    /// the fd or temporarily Runnable because a signal preempted it.
    pub fn check_sanity(&self, threads: &ThreadTable) {
        for (i, slot) in self.iter_used() {
            assert!(threads.is_live(slot.tid), "fd-wait slot {i} owner is dead");
            let status = threads.thread(slot.tid).status;
            assert!(
                status == ThreadStatus::WaitFd || status == ThreadStatus::Runnable,
                "fd-wait slot {i} owner in {status}"
            );
        }
    }
}

impl Default for FdWaitTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    /// Phase 1: wake sleepers whose deadline passed, synthesizing the zero
    /// return from their nanosleep (and clearing the remaining-time output).
    pub fn wake_expired_sleepers(&mut self, now_us: u64) {
        let expired: Vec<ThreadId> = self
            .threads
            .iter_live()
            .filter(|(_, t)| t.status == ThreadStatus::Sleeping && now_us >= t.awaken_at)
            .map(|(tid, _)| tid)
            .collect();
        for tid in expired {
            let rem_addr = self.threads.thread(tid).regs.gprs[REG_ARG2];
            if rem_addr != 0 {
                // The sleep used all its time; a fault here is the guest's
                // problem, not ours.
                let _ = self
                    .mem
                    .write_val(ForeignPtr::new(rem_addr), &GuestTimespec::default());
            }
            let thread = self.threads.thread_mut(tid);
            thread.regs.set_syscall_result(0);
            thread.status = ThreadStatus::Runnable;
            log::trace!("SCHED[{tid}]: nanosleep done at {now_us}");
        }
    }

    /// Phase 1: ask select() which waited-on fds fired, with zero timeout
    /// and all host signals masked so the call cannot be interrupted.
    pub fn poll_ready_fds(&mut self) {
        let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut exceptfds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            libc::FD_ZERO(&mut exceptfds);
        }

        let mut fd_max = -1;
        for (_, slot) in self.fd_waits.iter_used() {
            if slot.ready {
                continue;
            }
            assert!(slot.fd >= 0);
            fd_max = fd_max.max(slot.fd);
            match slot.syscall_no {
                libc::SYS_read => unsafe { libc::FD_SET(slot.fd, &mut readfds) },
                libc::SYS_write => unsafe { libc::FD_SET(slot.fd, &mut writefds) },
                other => panic!("fd wait for unexpected syscall {other}"),
            }
        }
        if fd_max == -1 {
            return;
        }

        let mut saved_mask = SigSet::empty();
        sigprocmask(
            SigmaskHow::SIG_SETMASK,
            Some(&SigSet::all()),
            Some(&mut saved_mask),
        )
        .expect("mask host signals");

        let mut timeout = libc::timeval {
            tv_sec: 0,
            tv_usec: 0,
        };
        let n_ready = unsafe {
            libc::select(
                fd_max + 1,
                &mut readfds,
                &mut writefds,
                &mut exceptfds,
                &mut timeout,
            )
        };

        sigprocmask(SigmaskHow::SIG_SETMASK, Some(&saved_mask), None)
            .expect("restore host signals");

        if n_ready < 0 {
            panic!(
                "readiness select failed: {}",
                nix::errno::Errno::last()
            );
        }
        if n_ready == 0 {
            return;
        }

        for fd in 0..=fd_max {
            let rd = unsafe { libc::FD_ISSET(fd, &mut readfds) };
            let wr = unsafe { libc::FD_ISSET(fd, &mut writefds) };
            let ex = unsafe { libc::FD_ISSET(fd, &mut exceptfds) };
            let n_ok = usize::from(rd) + usize::from(wr) + usize::from(ex);
            if n_ok == 0 {
                continue;
            }
            if n_ok > 1 {
                panic!("multiple readiness events on fd {fd}");
            }
            if !self.fd_waits.mark_ready(fd, rd) {
                panic!("readiness event on fd {fd} with no matching wait");
            }
        }
    }

    /// Phase 1: deliver results for ready slots whose thread is actually in
    /// WaitFD; the retried syscall is guaranteed not to block now.
    pub fn complete_blocked_syscalls(&mut self) {
        let deliverable: Vec<(usize, ThreadId, i32)> = self
            .fd_waits
            .iter_used()
            .filter(|(_, s)| s.ready)
            .filter(|(_, s)| self.threads.thread(s.tid).status == ThreadStatus::WaitFd)
            .map(|(i, s)| (i, s.tid, s.fd))
            .collect();

        for (index, tid, fd) in deliverable {
            debug_assert_eq!(
                self.threads.thread(tid).regs.syscall_number(),
                self.fd_waits.slots[index].syscall_no,
                "saved syscall register diverged from the wait slot"
            );
            let res = self.exec_read_write_native(tid);
            let thread = self.threads.thread_mut(tid);
            thread.regs.set_syscall_result(res);
            thread.status = ThreadStatus::Runnable;
            self.fd_waits.clear(index);
            log::trace!("SCHED[{tid}]: resume due to I/O completion on fd {fd}");
        }
    }
}
