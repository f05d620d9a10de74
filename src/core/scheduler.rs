//! The scheduler proper: a three-phase loop that services completions and
//! signals, picks a runnable virtual thread round-robin, dispatches it for
//! a bounded quantum, and classifies the trap that ended the quantum.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::core::configuration::Options;
use crate::host::dispatch::{
    ClientAnnotations, CodeCache, GuestRunner, NativePassthrough, NullAnnotations,
    NullCodeCache, SyscallPassthrough, TrapCode,
};
use crate::host::memory::GuestMemory;
use crate::host::registers::{DispatchBlock, RegisterFile};
use crate::host::signal::{QueuedSignals, SignalDispatch};
use crate::host::thread::{ThreadId, ThreadStatus, INITIAL_THREAD, MAX_VTHREADS};
use crate::host::Host;
use crate::utility::time;

/// Why the scheduler returned.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExitReason {
    /// The basic-block budget ran out.
    BudgetDone,
    /// No thread is runnable and none can become runnable: every live
    /// thread is parked on something only another virtual thread could
    /// provide.
    Deadlock,
    /// A thread issued the shutdown request.
    Shutdown,
}

pub struct Scheduler {
    pub host: Host,
    pub(crate) runner: Box<dyn GuestRunner>,
    pub(crate) code_cache: Box<dyn CodeCache>,
    pub(crate) signals: Box<dyn SignalDispatch>,
    pub(crate) annotations: Box<dyn ClientAnnotations>,
    pub(crate) passthrough: Box<dyn SyscallPassthrough>,
    block: DispatchBlock,
    dispatch_ctr: u32,
    bbs_done: u64,
    bbs_remaining: u64,
}

impl Scheduler {
    /// Create a scheduler whose initial thread (index 0) starts Runnable
    /// with the given register state, on the host-provided stack it is
    /// already running on.
    pub fn new(
        opts: Options,
        mem: Box<dyn GuestMemory>,
        runner: Box<dyn GuestRunner>,
        initial_regs: RegisterFile,
    ) -> Self {
        let bbs_remaining = opts.bb_budget.unwrap_or(u64::MAX);
        let mut host = Host::new(opts, mem);

        let tid_main = host.threads.alloc();
        assert_eq!(tid_main, INITIAL_THREAD);
        let slot = host.threads.slot_mut(tid_main);
        slot.status = ThreadStatus::Runnable;
        slot.regs = initial_regs;

        Self {
            host,
            runner,
            code_cache: Box::new(NullCodeCache),
            signals: Box::new(QueuedSignals),
            annotations: Box::new(NullAnnotations),
            passthrough: Box::new(NativePassthrough),
            block: DispatchBlock::new(),
            dispatch_ctr: 0,
            bbs_done: 0,
            bbs_remaining,
        }
    }

    pub fn with_code_cache(mut self, cache: Box<dyn CodeCache>) -> Self {
        self.code_cache = cache;
        self
    }

    pub fn with_signals(mut self, signals: Box<dyn SignalDispatch>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_annotations(mut self, annotations: Box<dyn ClientAnnotations>) -> Self {
        self.annotations = annotations;
        self
    }

    pub fn with_passthrough(mut self, passthrough: Box<dyn SyscallPassthrough>) -> Self {
        self.passthrough = passthrough;
        self
    }

    /// Basic blocks executed so far, summed over every dispatch.
    pub fn bbs_done(&self) -> u64 {
        self.bbs_done
    }

    /// Run virtual threads until deadlock, shutdown, or budget exhaustion.
    pub fn run(&mut self) -> ExitReason {
        let mut tid = INITIAL_THREAD;
        let mut epoch: u64 = 0;
        let mut epoch_started_at: u64 = 0;

        loop {
            // ==================== Phase 1 ====================
            // Bookkeeping that can change thread states, then selection.

            if self.bbs_done - epoch_started_at >= self.host.opts.epoch_interval {
                epoch_started_at = self.bbs_done;
                epoch += 1;
                self.code_cache.epoch_rolled(epoch);
            }

            if self.bbs_remaining == 0 {
                return ExitReason::BudgetDone;
            }

            loop {
                if self.host.opts.sanity_checks {
                    self.host.check_sanity();
                }

                self.host.wake_expired_sleepers(time::now_micros());
                self.host.expire_cond_deadlines(time::now_millis());
                self.host.poll_ready_fds();
                self.host.complete_blocked_syscalls();
                self.signals.deliver_pending(&mut self.host);

                // Round-robin from the thread after the last one run. Timed
                // waits count as wakeable: their deadline will promote them.
                let mut tid_next = tid;
                let mut n_wakeable = 0;
                loop {
                    tid_next = ThreadId((tid_next.0 + 1) % MAX_VTHREADS);
                    let status = self.host.threads.slot_status(tid_next);
                    match status {
                        ThreadStatus::WaitFd | ThreadStatus::Sleeping => n_wakeable += 1,
                        ThreadStatus::WaitCond
                            if self.host.threads.has_cond_deadline(tid_next) =>
                        {
                            n_wakeable += 1
                        }
                        _ => {}
                    }
                    if status == ThreadStatus::Runnable {
                        break;
                    }
                    if tid_next == tid {
                        break;
                    }
                }
                tid = tid_next;

                if self.host.threads.slot_status(tid) == ThreadStatus::Runnable {
                    break;
                }

                if n_wakeable == 0 {
                    log::error!("deadlock detected\n{}", self.host.threads.format_status());
                    return ExitReason::Deadlock;
                }

                // Someone will become runnable eventually; wait for it.
                std::thread::sleep(self.host.opts.poll_interval);
            }

            // ==================== Phase 2 ====================
            // Run the chosen thread, handling trivial events inline. The
            // counter is decremented before being tested, hence the +1.

            let quantum = u64::from(self.host.opts.quantum);
            self.dispatch_ctr = (self.bbs_remaining.min(quantum) + 1) as u32;
            let ctr_saved = self.dispatch_ctr;

            let trc = loop {
                let trc = self.run_quantum(tid);
                match trc {
                    TrapCode::FastMiss => {
                        assert!(self.dispatch_ctr > 0);
                        let pc = self.host.threads.thread(tid).regs.pc;
                        if !self.code_cache.contains(pc) {
                            self.code_cache.translate_and_insert(pc);
                            assert!(
                                self.code_cache.contains(pc),
                                "translation of {pc:#x} missing after insert"
                            );
                        }
                        continue;
                    }
                    TrapCode::ClientRequest if self.host.maybe_trivial_request(tid) => {
                        continue;
                    }
                    other => break other,
                }
            };

            // ==================== Phase 3 ====================
            // Charge the blocks consumed and handle the non-trivial trap.

            let done = i64::from(ctr_saved) - i64::from(self.dispatch_ctr) - 1;
            assert!(done >= 0, "runner never decremented the dispatch counter");
            self.bbs_done += done as u64;
            self.bbs_remaining = self.bbs_remaining.saturating_sub(done as u64);

            log::trace!(
                "SCHED[{tid}]: completed {done} bbs, event {trc}, {} done",
                self.bbs_done
            );

            match trc {
                TrapCode::CounterZero => {
                    // Timeslice out; Phase 1 reselects.
                }
                TrapCode::UnresumableSignal => {
                    // Delivery happens at the top of Phase 1.
                }
                TrapCode::Syscall => self.do_syscall(tid),
                TrapCode::ClientRequest => {
                    if let Some(exit) = self.handle_client_request(tid) {
                        return exit;
                    }
                }
                TrapCode::FastMiss => unreachable!("handled in phase 2"),
            }
        }
    }

    /// The dispatch driver: load the thread's state into the shared block,
    /// run the inner loop, classify, save back. A panic out of the runner
    /// is the rescue point for unresumable signals.
    fn run_quantum(&mut self, tid: ThreadId) -> TrapCode {
        debug_assert!(self.bbs_remaining > 0);
        debug_assert_eq!(
            self.host.threads.thread(tid).status,
            ThreadStatus::Runnable
        );

        self.block.load(&self.host.threads.thread(tid).regs);
        let outcome = {
            let runner = &mut self.runner;
            let block = &mut self.block;
            let ctr = &mut self.dispatch_ctr;
            catch_unwind(AssertUnwindSafe(move || runner.run(tid, block, ctr)))
        };
        let trc = match outcome {
            Ok(trc) => trc,
            Err(_) => {
                log::warn!("SCHED[{tid}]: runner took a non-local exit");
                TrapCode::UnresumableSignal
            }
        };
        self.host.threads.thread_mut(tid).regs = self.block.save();
        trc
    }
}
