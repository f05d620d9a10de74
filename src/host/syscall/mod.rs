//! The non-blocking syscall shim.
//!
//! Syscalls trap out of the dispatch loop with their number and arguments
//! in the thread's registers. Three classes:
//!
//! - nanosleep never reaches the host: the thread is marked Sleeping and
//!   the Phase 1 sweep synthesizes its zero return at the deadline;
//! - read and write on a descriptor that is currently blocking are executed
//!   speculatively with the descriptor flipped to non-blocking; would-block
//!   parks the thread on the descriptor-wait table;
//! - everything else is assumed non-blocking and executed straight through
//!   the passthrough collaborator.
//!
//! Results use the negated-errno convention in the syscall register.

pub mod io;

use bytemuck::{Pod, Zeroable};
use nix::errno::Errno;

use crate::core::scheduler::Scheduler;
use crate::host::memory::ForeignPtr;
use crate::host::thread::{ThreadId, ThreadStatus};
use crate::host::Host;
use crate::utility::time;

/// Guest-visible `struct timespec`.
#[derive(Copy, Clone, Debug, Default, Pod, Zeroable)]
#[repr(C)]
pub struct GuestTimespec {
    pub tv_sec: i64,
    pub tv_nsec: i64,
}

fn fd_status_flags(fd: i32) -> Result<i32, Errno> {
    let res = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if res < 0 {
        Err(Errno::last())
    } else {
        Ok(res)
    }
}

fn set_fd_flags(fd: i32, flags: i32) -> Result<(), Errno> {
    let res = unsafe { libc::fcntl(fd, libc::F_SETFL, flags) };
    if res < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

fn fd_is_blockful(fd: i32) -> Result<bool, Errno> {
    Ok(fd_status_flags(fd)? & libc::O_NONBLOCK == 0)
}

fn set_fd_nonblocking(fd: i32) -> Result<(), Errno> {
    set_fd_flags(fd, fd_status_flags(fd)? | libc::O_NONBLOCK)
}

fn set_fd_blocking(fd: i32) -> Result<(), Errno> {
    set_fd_flags(fd, fd_status_flags(fd)? & !libc::O_NONBLOCK)
}

impl Scheduler {
    /// Phase 3 syscall trap. May leave the thread Sleeping or WaitFD instead
    /// of Runnable.
    pub(crate) fn do_syscall(&mut self, tid: ThreadId) {
        debug_assert_eq!(
            self.host.threads.thread(tid).status,
            ThreadStatus::Runnable
        );
        let number = self.host.threads.thread(tid).regs.syscall_number();
        match number {
            libc::SYS_nanosleep => self.host.syscall_nanosleep(tid),
            libc::SYS_read | libc::SYS_write => self.host.syscall_read_write(tid),
            _ => {
                let regs = &self.host.threads.thread(tid).regs;
                let args = [
                    regs.syscall_arg(0),
                    regs.syscall_arg(1),
                    regs.syscall_arg(2),
                    regs.syscall_arg(3),
                    regs.syscall_arg(4),
                    regs.syscall_arg(5),
                ];
                let res = self.passthrough.syscall(number, args);
                self.host
                    .threads
                    .thread_mut(tid)
                    .regs
                    .set_syscall_result(res);
            }
        }
    }
}

impl Host {
    /// Divert nanosleep into the sleep queue; the host never sleeps for it.
    fn syscall_nanosleep(&mut self, tid: ThreadId) {
        let req_addr = self.threads.thread(tid).regs.syscall_arg(0);
        let spec: GuestTimespec = match self.mem.read_val(ForeignPtr::new(req_addr)) {
            Ok(spec) => spec,
            Err(_) => {
                self.threads
                    .thread_mut(tid)
                    .regs
                    .set_syscall_result(-i64::from(Errno::EFAULT as i32));
                return;
            }
        };
        if spec.tv_sec < 0 || !(0..1_000_000_000).contains(&spec.tv_nsec) {
            self.threads
                .thread_mut(tid)
                .regs
                .set_syscall_result(-i64::from(Errno::EINVAL as i32));
            return;
        }
        let now = time::now_micros();
        let awaken_at =
            now + spec.tv_sec as u64 * 1_000_000 + spec.tv_nsec as u64 / 1000;
        let thread = self.threads.thread_mut(tid);
        thread.status = ThreadStatus::Sleeping;
        thread.awaken_at = awaken_at;
        log::trace!("SCHED[{tid}]: at {now}: nanosleep for {}", awaken_at - now);
    }

    /// The speculative path for read/write. The syscall register holds the
    /// number going in and the result coming out; on would-block nothing is
    /// written, so the retry after completion still finds the number there.
    fn syscall_read_write(&mut self, tid: ThreadId) {
        let number = self.threads.thread(tid).regs.syscall_number();
        let fd = self.threads.thread(tid).regs.syscall_arg(0) as i32;

        let was_blocking = match fd_is_blockful(fd) {
            Ok(b) => b,
            Err(_) => {
                // Not even a queryable fd: one native attempt reports the
                // right error to the guest.
                let res = self.exec_read_write_native(tid);
                self.threads.thread_mut(tid).regs.set_syscall_result(res);
                return;
            }
        };

        if !was_blocking {
            let res = self.exec_read_write_native(tid);
            self.threads.thread_mut(tid).regs.set_syscall_result(res);
            return;
        }

        set_fd_nonblocking(fd).expect("fd mode flip");
        let res = self.exec_read_write_native(tid);
        set_fd_blocking(fd).expect("fd mode restore");

        if res == -i64::from(Errno::EAGAIN as i32) {
            // Lodged with the kernel; park until select() reports progress.
            self.fd_waits.add(tid, fd, number);
            self.threads.thread_mut(tid).status = ThreadStatus::WaitFd;
            log::trace!("SCHED[{tid}]: block until I/O ready on fd {fd}");
        } else {
            self.threads.thread_mut(tid).regs.set_syscall_result(res);
        }
    }

    /// One native read or write against the host fd, marshaling the buffer
    /// through guest memory. Used both speculatively and at completion.
    pub(crate) fn exec_read_write_native(&mut self, tid: ThreadId) -> i64 {
        let regs = &self.threads.thread(tid).regs;
        let number = regs.syscall_number();
        let fd = regs.syscall_arg(0) as i32;
        let buf_addr = regs.syscall_arg(1);
        let count = regs.syscall_arg(2) as usize;

        match number {
            libc::SYS_read => {
                let mut buf = vec![0u8; count];
                let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), count) };
                if n < 0 {
                    return -i64::from(Errno::last() as i32);
                }
                if self
                    .mem
                    .write_bytes(buf_addr, &buf[..n as usize])
                    .is_err()
                {
                    return -i64::from(Errno::EFAULT as i32);
                }
                n as i64
            }
            libc::SYS_write => {
                let mut buf = vec![0u8; count];
                if self.mem.read_bytes(buf_addr, &mut buf).is_err() {
                    return -i64::from(Errno::EFAULT as i32);
                }
                let n = unsafe { libc::write(fd, buf.as_ptr().cast(), count) };
                if n < 0 {
                    return -i64::from(Errno::last() as i32);
                }
                n as i64
            }
            other => panic!("native exec of unexpected syscall {other}"),
        }
    }
}
