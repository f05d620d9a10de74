//! The scheduler's view of the instrumented program: thread and resource
//! tables, register state, guest memory, the syscall shim and the request
//! handlers. Everything here is exclusively owned by the scheduler loop;
//! guest code reaches it only through traps.

pub mod dispatch;
pub mod heap;
pub mod lifecycle;
pub mod memory;
pub mod registers;
pub mod request;
pub mod signal;
pub mod sync;
pub mod syscall;
pub mod thread;

#[cfg(test)]
pub(crate) mod testutil;

use crate::core::configuration::Options;
use crate::host::heap::ClientHeap;
use crate::host::memory::GuestMemory;
use crate::host::sync::mutex::MutexTable;
use crate::host::sync::rwlock::RwlockTable;
use crate::host::sync::semaphore::SemTable;
use crate::host::sync::tsd::KeyTable;
use crate::host::syscall::io::FdWaitTable;
use crate::host::thread::{ThreadId, ThreadStatus, ThreadTable, INITIAL_THREAD};

/// All mutable machine state, owned by the scheduler loop. Collaborators
/// receive `&mut Host` for the duration of one call and nothing longer.
pub struct Host {
    pub opts: Options,
    pub threads: ThreadTable,
    pub mutexes: MutexTable,
    pub sems: SemTable,
    pub rwlocks: RwlockTable,
    pub keys: KeyTable,
    pub fd_waits: FdWaitTable,
    pub heap: ClientHeap,
    pub mem: Box<dyn GuestMemory>,
}

impl Host {
    pub fn new(opts: Options, mut mem: Box<dyn GuestMemory>) -> Self {
        let heap_base = mem
            .map_region(opts.client_heap_size)
            .unwrap_or_else(|e| panic!("cannot map the client heap arena: {e}"));
        Self {
            heap: ClientHeap::new(heap_base, opts.client_heap_size),
            opts,
            threads: ThreadTable::new(),
            mutexes: MutexTable::new(),
            sems: SemTable::new(),
            rwlocks: RwlockTable::new(),
            keys: KeyTable::new(),
            fd_waits: FdWaitTable::new(),
            mem,
        }
    }

    /// Store a client-request reply in `tid`'s result register.
    pub fn reply(&mut self, tid: ThreadId, val: crate::host::memory::GuestWord) {
        self.threads.thread_mut(tid).regs.set_request_result(val);
    }

    /// Whole-machine invariant check, run from the top of the scheduler loop
    /// when enabled. Violations are bugs in this crate, never guest errors.
    pub fn check_sanity(&self) {
        // Thread 0 exists for the whole run.
        assert!(
            self.threads.is_live(INITIAL_THREAD),
            "initial thread vanished"
        );

        for (tid, t) in self.threads.iter_live() {
            if t.status == ThreadStatus::WaitMx {
                let mid = t
                    .waited_on_mid
                    .unwrap_or_else(|| panic!("tid {tid} in WaitMX without a mutex"));
                assert!(
                    self.mutexes.slot(mid).held,
                    "tid {tid} waits on mutex {} which is not held",
                    mid.0
                );
            }
            if let Some(j) = t.joiner {
                assert!(
                    self.threads.is_live(j)
                        && self.threads.thread(j).status == ThreadStatus::WaitJoinee,
                    "joiner of tid {tid} is not parked in WaitJoinee"
                );
            }
        }

        self.mutexes.check_sanity();
        self.fd_waits.check_sanity(&self.threads);
    }
}
