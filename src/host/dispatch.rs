//! The boundary between the scheduler and the external guest-code machinery.
//!
//! Everything that actually executes or translates guest code lives outside
//! this crate; the scheduler sees it only through the narrow traits here.

use crate::host::memory::GuestWord;
use crate::host::registers::DispatchBlock;
use crate::host::thread::ThreadId;

/// Why the inner loop handed control back.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TrapCode {
    /// The dispatch counter reached zero: quantum exhausted.
    CounterZero,
    /// The fast translation lookup missed; a full lookup (and possibly a
    /// fresh translation) is needed before this thread can continue.
    FastMiss,
    /// The guest issued a system call.
    Syscall,
    /// The guest issued a client request through the trap sequence.
    ClientRequest,
    /// A fatal signal took a non-local exit out of the inner loop.
    UnresumableSignal,
}

impl std::fmt::Display for TrapCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrapCode::CounterZero => "COUNTERZERO",
            TrapCode::FastMiss => "FASTMISS",
            TrapCode::Syscall => "SYSCALL",
            TrapCode::ClientRequest => "CLIENTREQ",
            TrapCode::UnresumableSignal => "FATALSIGNAL",
        };
        f.write_str(s)
    }
}

/// Threads whose program counter is aimed here do not resume guest code: the
/// runner must instead issue a thread-return client request carrying the
/// thread's exit value register. Thread creation pushes this as the return
/// address of the entry function, and cancellation points a victim directly
/// at it.
pub const THREAD_RETURN_ADDR: GuestWord = 0xDEAD_4000;

/// Exit value observed by joiners of a cancelled thread.
pub const CANCELED_RETVAL: GuestWord = GuestWord::MAX;

/// The external inner loop that executes translated guest code.
///
/// The runner executes basic blocks for the thread whose state is in
/// `block`, decrementing `dispatch_ctr` once per block *before* running it,
/// and returns as soon as the counter hits zero or the guest traps. A panic
/// escaping `run` is treated as [`TrapCode::UnresumableSignal`].
pub trait GuestRunner {
    fn run(&mut self, tid: ThreadId, block: &mut DispatchBlock, dispatch_ctr: &mut u32)
        -> TrapCode;
}

/// The translation cache collaborator.
pub trait CodeCache {
    /// Full-table lookup after a fast-path miss.
    fn contains(&mut self, pc: GuestWord) -> bool;
    /// Translate the basic block at `pc` and insert it into the cache.
    fn translate_and_insert(&mut self, pc: GuestWord);
    /// The LRU aging epoch advanced.
    fn epoch_rolled(&mut self, epoch: u64) {
        let _ = epoch;
    }
}

/// A cache that never misses; for embedders whose runner does its own
/// translation management.
pub struct NullCodeCache;

impl CodeCache for NullCodeCache {
    fn contains(&mut self, _pc: GuestWord) -> bool {
        true
    }

    fn translate_and_insert(&mut self, _pc: GuestWord) {}
}

/// Sink for the memory-annotation client requests, which the scheduler
/// routes through without interpreting.
pub trait ClientAnnotations {
    fn client_request(&mut self, code: u32, args: [GuestWord; 4]) -> GuestWord;
}

/// Default sink: acknowledge and discard.
pub struct NullAnnotations;

impl ClientAnnotations for NullAnnotations {
    fn client_request(&mut self, code: u32, _args: [GuestWord; 4]) -> GuestWord {
        log::trace!("ignoring annotation request {code:#x}");
        0
    }
}

/// Executor for syscalls the shim classifies as non-blocking and does not
/// interpret itself.
pub trait SyscallPassthrough {
    /// Returns the raw result, negated-errno convention.
    fn syscall(&mut self, number: i64, args: [GuestWord; 6]) -> i64;
}

/// Straight-through execution on the host. Only usable when guest pointers
/// are host pointers; embedders with a relocated guest address space must
/// provide their own.
pub struct NativePassthrough;

impl SyscallPassthrough for NativePassthrough {
    fn syscall(&mut self, number: i64, args: [GuestWord; 6]) -> i64 {
        let res = unsafe {
            libc::syscall(
                number as libc::c_long,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                args[5],
            )
        };
        if res == -1 {
            -(nix::errno::Errno::last() as i64)
        } else {
            res
        }
    }
}
