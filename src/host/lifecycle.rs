//! Thread lifecycle: create, return/exit, join, detach, cancellation.

use nix::errno::Errno;

use crate::host::dispatch::{CANCELED_RETVAL, THREAD_RETURN_ADDR};
use crate::host::memory::{ForeignPtr, GuestWord};
use crate::host::request::{ReqError, ReqResult, Request};
use crate::host::thread::{ThreadFlags, ThreadId, ThreadStatus, MAX_VTHREADS};
use crate::host::Host;

/// Unused bytes kept between a new thread's stack top and its first frame.
const STACK_REDZONE: GuestWord = 16;

impl Host {
    /// Allocate a record and a stack, aim the program counter at the entry
    /// function with the return trampoline as its return address, and make
    /// the new thread Runnable. The parent's reply is the child's id.
    pub fn thread_create(&mut self, parent: ThreadId, req: Request) -> ReqResult {
        let entry = req.args[0];
        let arg = req.args[1];

        let child = self.threads.alloc();
        debug_assert_ne!(child, parent);

        // The child starts from a copy of the parent's register state, the
        // same way the dispatch block would hand it down.
        let parent_regs = self.threads.thread(parent).regs.clone();
        let parent_sigmask = self.threads.thread(parent).sig_mask;

        let min_stack = self.opts.min_stack_size;
        let slot = self.threads.slot_mut(child);
        if slot.stack_size < min_stack {
            // No region yet (or a recycled one that is too small).
            slot.stack_base = 0;
            slot.stack_size = 0;
        }
        if self.threads.slot_mut(child).stack_size == 0 {
            let base = self
                .mem
                .map_region(min_stack)
                .unwrap_or_else(|e| panic!("cannot map a guest stack: {e}"));
            let slot = self.threads.slot_mut(child);
            slot.stack_base = base;
            slot.stack_size = min_stack;
        }

        let slot = self.threads.slot_mut(child);
        slot.regs = parent_regs;
        slot.sig_mask = parent_sigmask;
        let mut sp = slot.stack_base + slot.stack_size as GuestWord - STACK_REDZONE;

        // Push the argument, then the magic return address.
        sp -= 8;
        self.mem
            .write_word(ForeignPtr::new(sp), arg)
            .expect("fresh stack is mapped");
        sp -= 8;
        self.mem
            .write_word(ForeignPtr::new(sp), THREAD_RETURN_ADDR)
            .expect("fresh stack is mapped");

        let slot = self.threads.slot_mut(child);
        slot.regs.sp = sp;
        slot.regs.pc = entry;
        slot.joiner = None;
        slot.status = ThreadStatus::Runnable;

        log::trace!("SCHED[{child}]: new thread, created by {parent}");
        Ok(child.0 as GuestWord)
    }

    /// The thread reached the return trampoline, by falling off its entry
    /// function, calling exit, or being cancelled. Never replies: the caller
    /// is either parked or gone.
    pub fn thread_return(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let retval = req.args[0];
        self.threads.thread_mut(tid).retval = retval;

        match self.threads.thread(tid).joiner {
            Some(jnr) => {
                debug_assert_eq!(self.threads.thread(jnr).status, ThreadStatus::WaitJoinee);
                // A bad output pointer turns the joiner's reply into the
                // would-fault error; the exit itself still completes.
                let out = self.threads.thread(jnr).join_out;
                let reply = if out.is_null() || self.mem.write_word(out, retval).is_ok() {
                    0
                } else {
                    Errno::EFAULT as u32 as GuestWord
                };
                self.threads.thread_mut(jnr).status = ThreadStatus::Runnable;
                self.reply(jnr, reply);
                self.threads.release(tid);
                log::trace!("SCHED[{tid}]: root fn returns, joined by {jnr}");
            }
            None if self.threads.thread(tid).flags.contains(ThreadFlags::DETACHED) => {
                self.threads.release(tid);
                log::trace!("SCHED[{tid}]: detached root fn returns; slot freed");
            }
            None => {
                self.threads.thread_mut(tid).status = ThreadStatus::WaitJoiner;
                log::trace!("SCHED[{tid}]: root fn returns, waiting for a join");
            }
        }
        Err(ReqError::Parked)
    }

    pub fn thread_join(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let jee_raw = req.args[0] as usize;
        let out = ForeignPtr::<GuestWord>::new(req.args[1]);

        if jee_raw == tid.0 {
            return Err(Errno::EDEADLK.into());
        }
        let jee = ThreadId(jee_raw);
        if jee_raw >= MAX_VTHREADS || !self.threads.is_live(jee) {
            return Err(Errno::EINVAL.into());
        }
        if self.threads.thread(jee).joiner.is_some() {
            return Err(Errno::EINVAL.into());
        }

        if self.threads.thread(jee).status == ThreadStatus::WaitJoiner {
            // Already finished: consume the exit value and free the slot.
            // The value is stored before the slot goes away, so a bad
            // output pointer leaves the joinee intact.
            let retval = self.threads.thread(jee).retval;
            if !out.is_null() {
                self.mem.write_word(out, retval).map_err(|_| Errno::EFAULT)?;
            }
            self.threads.release(jee);
            log::trace!("SCHED[{tid}]: join({jee}) returned immediately");
            return Ok(0);
        }

        self.threads.thread_mut(jee).joiner = Some(tid);
        let thread = self.threads.thread_mut(tid);
        thread.join_out = out;
        thread.status = ThreadStatus::WaitJoinee;
        log::trace!("SCHED[{tid}]: blocking on join({jee})");
        Err(ReqError::Parked)
    }

    /// The flag-toggling detach: exit consults the flag to free the slot
    /// without waiting for a joiner.
    pub fn thread_detach(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let target = ThreadId(req.args[0] as usize);
        if req.args[0] as usize >= MAX_VTHREADS || !self.threads.is_live(target) {
            return Err(Errno::ESRCH.into());
        }
        if self.threads.thread(target).joiner.is_some() {
            return Err(Errno::EINVAL.into());
        }
        self.threads.thread_mut(target).flags.insert(ThreadFlags::DETACHED);
        log::trace!("PTHREAD[{tid}]: detach({target})");
        Ok(0)
    }

    /// Aim the victim's next dispatch at the return trampoline with the
    /// canceled sentinel as its exit value.
    fn arm_cancel(&mut self, victim: ThreadId) {
        let thread = self.threads.thread_mut(victim);
        thread.flags.remove(ThreadFlags::CANCEL_PENDING);
        thread.regs.pc = THREAD_RETURN_ADDR;
        thread.regs.set_exit_value(CANCELED_RETVAL);
        thread.status = ThreadStatus::Runnable;
        log::trace!("SCHED[{victim}]: cancelled");
    }

    /// Cancellation takes effect immediately on a Runnable or Sleeping
    /// victim. A victim with cancellation disabled, or parked in a
    /// synchronization wait, keeps the request pending instead.
    pub fn thread_cancel(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let victim = ThreadId(req.args[0] as usize);
        if req.args[0] as usize >= MAX_VTHREADS || !self.threads.is_live(victim) {
            return Err(Errno::ESRCH.into());
        }
        let flags = self.threads.thread(victim).flags;
        let status = self.threads.thread(victim).status;
        if flags.contains(ThreadFlags::CANCEL_DISABLED)
            || !matches!(status, ThreadStatus::Runnable | ThreadStatus::Sleeping)
        {
            self.threads
                .thread_mut(victim)
                .flags
                .insert(ThreadFlags::CANCEL_PENDING);
            log::trace!("PTHREAD[{tid}]: cancel({victim}) deferred");
            return Ok(0);
        }
        log::trace!("PTHREAD[{tid}]: cancel({victim})");
        self.arm_cancel(victim);
        Ok(0)
    }

    /// Replies the previous state, 0 enable / 1 disable.
    pub fn set_cancel_state(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let thread = self.threads.thread_mut(tid);
        let old = GuestWord::from(thread.flags.contains(ThreadFlags::CANCEL_DISABLED));
        match req.args[0] {
            0 => thread.flags.remove(ThreadFlags::CANCEL_DISABLED),
            1 => thread.flags.insert(ThreadFlags::CANCEL_DISABLED),
            _ => return Err(Errno::EINVAL.into()),
        }
        let thread = self.threads.thread(tid);
        if !thread.flags.contains(ThreadFlags::CANCEL_DISABLED)
            && thread.flags.contains(ThreadFlags::CANCEL_PENDING)
        {
            self.arm_cancel(tid);
        }
        Ok(old)
    }

    /// Replies the previous type, 0 deferred / 1 asynchronous. The type is
    /// recorded but both behave as the immediate variant here.
    pub fn set_cancel_type(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let thread = self.threads.thread_mut(tid);
        let old = GuestWord::from(thread.flags.contains(ThreadFlags::CANCEL_ASYNC));
        match req.args[0] {
            0 => thread.flags.remove(ThreadFlags::CANCEL_ASYNC),
            1 => thread.flags.insert(ThreadFlags::CANCEL_ASYNC),
            _ => return Err(Errno::EINVAL.into()),
        }
        Ok(old)
    }

    pub fn test_cancel(&mut self, tid: ThreadId, _req: Request) -> ReqResult {
        let flags = self.threads.thread(tid).flags;
        if flags.contains(ThreadFlags::CANCEL_PENDING)
            && !flags.contains(ThreadFlags::CANCEL_DISABLED)
        {
            self.arm_cancel(tid);
        }
        Ok(0)
    }

    /// Per-thread words the guest C library stores through the threading
    /// layer: errno, h_errno and the resolver-state pointer.
    pub fn libc_tsd_get(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let tsd = &self.threads.thread(tid).libc_tsd;
        match req.args[0] {
            0 => Ok(tsd.errno),
            1 => Ok(tsd.h_errno),
            2 => Ok(tsd.res_state),
            _ => Err(Errno::EINVAL.into()),
        }
    }

    pub fn libc_tsd_set(&mut self, tid: ThreadId, req: Request) -> ReqResult {
        let tsd = &mut self.threads.thread_mut(tid).libc_tsd;
        match req.args[0] {
            0 => tsd.errno = req.args[1],
            1 => tsd.h_errno = req.args[1],
            2 => tsd.res_state = req.args[1],
            _ => return Err(Errno::EINVAL.into()),
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::request::RequestCode;
    use crate::host::testutil::{guest_alloc, spawn_runnable, test_host};

    fn req(code: RequestCode, args: [GuestWord; 4]) -> Request {
        Request { code, args }
    }

    fn create(host: &mut Host, parent: ThreadId, entry: GuestWord, arg: GuestWord) -> ThreadId {
        let child = host
            .thread_create(parent, req(RequestCode::ThreadCreate, [entry, arg, 0, 0]))
            .unwrap();
        ThreadId(child as usize)
    }

    #[test]
    fn create_builds_the_initial_frame() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let child = create(&mut host, t0, 0x4100, 0xfeed);

        let thread = host.threads.thread(child);
        assert_eq!(thread.status, ThreadStatus::Runnable);
        assert_eq!(thread.regs.pc, 0x4100);
        let sp = thread.regs.sp;
        assert_eq!(
            host.mem.read_word(ForeignPtr::new(sp)).unwrap(),
            THREAD_RETURN_ADDR
        );
        assert_eq!(host.mem.read_word(ForeignPtr::new(sp + 8)).unwrap(), 0xfeed);
        assert!(sp >= thread.stack_base);
        assert!(sp < thread.stack_base + thread.stack_size as GuestWord);
    }

    #[test]
    fn exit_then_join_transfers_the_value() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let child = create(&mut host, t0, 0x4100, 0);
        let out = guest_alloc::<GuestWord>(&mut host);

        // Child exits with no joiner: parks as WaitJoiner.
        let res = host.thread_return(child, req(RequestCode::ThreadReturn, [0x1234, 0, 0, 0]));
        assert_eq!(res, Err(ReqError::Parked));
        assert_eq!(host.threads.thread(child).status, ThreadStatus::WaitJoiner);

        // Join consumes immediately and frees the slot.
        let res = host.thread_join(
            t0,
            req(RequestCode::Join, [child.0 as GuestWord, out.addr(), 0, 0]),
        );
        assert_eq!(res, Ok(0));
        assert_eq!(host.mem.read_word(out).unwrap(), 0x1234);
        assert!(!host.threads.is_live(child));
    }

    #[test]
    fn join_then_exit_wakes_the_joiner() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let child = create(&mut host, t0, 0x4100, 0);
        let out = guest_alloc::<GuestWord>(&mut host);

        let res = host.thread_join(
            t0,
            req(RequestCode::Join, [child.0 as GuestWord, out.addr(), 0, 0]),
        );
        assert_eq!(res, Err(ReqError::Parked));
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::WaitJoinee);

        host.thread_return(child, req(RequestCode::ThreadReturn, [0xabcd, 0, 0, 0]))
            .unwrap_err();
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::Runnable);
        assert_eq!(host.mem.read_word(out).unwrap(), 0xabcd);
        assert!(!host.threads.is_live(child));
        assert_eq!(
            host.threads.thread(t0).regs.gprs[crate::host::registers::REG_RES],
            0
        );
    }

    #[test]
    fn bad_join_output_pointer_faults() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let child = create(&mut host, t0, 0x4100, 0);
        let bad_out: GuestWord = 0x8;

        // Joinee already finished: the failed store is surfaced before the
        // slot is consumed.
        host.thread_return(child, req(RequestCode::ThreadReturn, [0x1234, 0, 0, 0]))
            .unwrap_err();
        assert_eq!(
            host.thread_join(t0, req(RequestCode::Join, [child.0 as GuestWord, bad_out, 0, 0])),
            Err(ReqError::Failed(Errno::EFAULT))
        );
        assert_eq!(host.threads.thread(child).status, ThreadStatus::WaitJoiner);

        // Joiner parked first: its join reply is the would-fault error.
        let second = create(&mut host, t0, 0x4100, 0);
        host.thread_join(t0, req(RequestCode::Join, [second.0 as GuestWord, bad_out, 0, 0]))
            .unwrap_err();
        host.thread_return(second, req(RequestCode::ThreadReturn, [0xabcd, 0, 0, 0]))
            .unwrap_err();
        assert_eq!(host.threads.thread(t0).status, ThreadStatus::Runnable);
        assert_eq!(
            host.threads.thread(t0).regs.gprs[crate::host::registers::REG_RES],
            Errno::EFAULT as u32 as GuestWord
        );
        assert!(!host.threads.is_live(second));
    }

    #[test]
    fn join_errors() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let t1 = spawn_runnable(&mut host);
        let t2 = spawn_runnable(&mut host);

        assert_eq!(
            host.thread_join(t0, req(RequestCode::Join, [t0.0 as GuestWord, 0, 0, 0])),
            Err(ReqError::Failed(Errno::EDEADLK))
        );
        assert_eq!(
            host.thread_join(t0, req(RequestCode::Join, [33, 0, 0, 0])),
            Err(ReqError::Failed(Errno::EINVAL))
        );
        // Second joiner is invalid.
        host.thread_join(t0, req(RequestCode::Join, [t2.0 as GuestWord, 0, 0, 0]))
            .unwrap_err();
        assert_eq!(
            host.thread_join(t1, req(RequestCode::Join, [t2.0 as GuestWord, 0, 0, 0])),
            Err(ReqError::Failed(Errno::EINVAL))
        );
    }

    #[test]
    fn detached_exit_frees_immediately() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let child = create(&mut host, t0, 0x4100, 0);
        host.thread_detach(
            t0,
            req(RequestCode::Detach, [child.0 as GuestWord, 0, 0, 0]),
        )
        .unwrap();
        host.thread_return(child, req(RequestCode::ThreadReturn, [1, 0, 0, 0]))
            .unwrap_err();
        assert!(!host.threads.is_live(child));
    }

    #[test]
    fn cancel_arms_the_trampoline() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let child = create(&mut host, t0, 0x4100, 0);

        host.thread_cancel(t0, req(RequestCode::CancelThread, [child.0 as GuestWord, 0, 0, 0]))
            .unwrap();
        let thread = host.threads.thread(child);
        assert_eq!(thread.status, ThreadStatus::Runnable);
        assert_eq!(thread.regs.pc, THREAD_RETURN_ADDR);
        assert_eq!(thread.regs.exit_value(), CANCELED_RETVAL);
    }

    #[test]
    fn disabled_cancel_is_deferred_until_enable() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let child = create(&mut host, t0, 0x4100, 0);

        // Child disables cancellation.
        assert_eq!(
            host.set_cancel_state(child, req(RequestCode::SetCancelState, [1, 0, 0, 0])),
            Ok(0)
        );
        host.thread_cancel(t0, req(RequestCode::CancelThread, [child.0 as GuestWord, 0, 0, 0]))
            .unwrap();
        let thread = host.threads.thread(child);
        assert_ne!(thread.regs.pc, THREAD_RETURN_ADDR);
        assert!(thread.flags.contains(ThreadFlags::CANCEL_PENDING));

        // Re-enabling delivers the deferred cancel; the old state replies 1.
        assert_eq!(
            host.set_cancel_state(child, req(RequestCode::SetCancelState, [0, 0, 0, 0])),
            Ok(1)
        );
        assert_eq!(host.threads.thread(child).regs.pc, THREAD_RETURN_ADDR);
    }

    #[test]
    fn libc_tsd_words_are_per_thread() {
        let mut host = test_host();
        let t0 = spawn_runnable(&mut host);
        let t1 = spawn_runnable(&mut host);
        host.libc_tsd_set(t0, req(RequestCode::LibcTsdSet, [0, 11, 0, 0]))
            .unwrap();
        host.libc_tsd_set(t1, req(RequestCode::LibcTsdSet, [0, 22, 0, 0]))
            .unwrap();
        assert_eq!(
            host.libc_tsd_get(t0, req(RequestCode::LibcTsdGet, [0, 0, 0, 0])),
            Ok(11)
        );
        assert_eq!(
            host.libc_tsd_get(t1, req(RequestCode::LibcTsdGet, [0, 0, 0, 0])),
            Ok(22)
        );
        assert_eq!(
            host.libc_tsd_get(t0, req(RequestCode::LibcTsdGet, [7, 0, 0, 0])),
            Err(ReqError::Failed(Errno::EINVAL))
        );
    }
}
