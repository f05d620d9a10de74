//! Client requests: the structured messages guest code sends the scheduler
//! through the in-band trap sequence.
//!
//! A request is five guest words starting at the address in the trapping
//! thread's request register: a code and up to four arguments. The reply
//! goes back in the result register. Trivial codes (client heap and
//! identity) are answered inline during dispatch; everything else falls
//! through to the scheduler's slow path and may reschedule.

use nix::errno::Errno;

use crate::core::scheduler::{ExitReason, Scheduler};
use crate::host::memory::{ForeignPtr, GuestWord};
use crate::host::thread::ThreadId;
use crate::host::Host;
use crate::utility::time;

/// Memory-annotation codes are routed to the annotation sink unparsed.
pub const ANNOTATION_BASE: u32 = 0x5000;
pub const ANNOTATION_LAST: u32 = 0x50ff;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestCode {
    // Trivial: client heap.
    Malloc = 0x1001,
    Free = 0x1002,
    Calloc = 0x1003,
    Realloc = 0x1004,
    Memalign = 0x1005,
    BuiltinNew = 0x1006,
    BuiltinVecNew = 0x1007,
    BuiltinDelete = 0x1008,
    BuiltinVecDelete = 0x1009,
    // Trivial: identity.
    GetThreadId = 0x1010,

    // Thread lifecycle.
    ThreadCreate = 0x3001,
    ThreadReturn = 0x3002,
    Join = 0x3003,
    Detach = 0x3004,
    Yield = 0x3005,

    // Mutexes.
    MutexInit = 0x3010,
    MutexLock = 0x3011,
    MutexTryLock = 0x3012,
    MutexUnlock = 0x3013,
    MutexDestroy = 0x3014,

    // Condition variables.
    CondInit = 0x3020,
    CondWait = 0x3021,
    CondTimedWait = 0x3022,
    CondSignal = 0x3023,
    CondBroadcast = 0x3024,
    CondDestroy = 0x3025,

    // Reader-writer locks.
    RwlockInit = 0x3030,
    RwlockRdLock = 0x3031,
    RwlockTryRdLock = 0x3032,
    RwlockWrLock = 0x3033,
    RwlockTryWrLock = 0x3034,
    RwlockUnlock = 0x3035,
    RwlockDestroy = 0x3036,

    // Semaphores.
    SemInit = 0x3040,
    SemWait = 0x3041,
    SemTryWait = 0x3042,
    SemPost = 0x3043,
    SemGetValue = 0x3044,
    SemDestroy = 0x3045,

    // Thread-specific keys.
    KeyCreate = 0x3050,
    KeyDelete = 0x3051,
    SetSpecific = 0x3052,
    GetSpecific = 0x3053,

    // Cancellation.
    SetCancelState = 0x3060,
    SetCancelType = 0x3061,
    CancelThread = 0x3062,
    TestCancel = 0x3063,

    // Signals.
    SignalMask = 0x3070,
    ThreadKill = 0x3071,
    SigWait = 0x3072,
    SignalReturns = 0x3073,

    // Miscellaneous.
    ReadMillisecondTimer = 0x3080,
    GetTraceLevel = 0x3081,
    LibcTsdGet = 0x3082,
    LibcTsdSet = 0x3083,

    Shutdown = 0x3090,
}

impl RequestCode {
    pub fn from_word(w: GuestWord) -> Option<Self> {
        use RequestCode::*;
        let code = match w {
            0x1001 => Malloc,
            0x1002 => Free,
            0x1003 => Calloc,
            0x1004 => Realloc,
            0x1005 => Memalign,
            0x1006 => BuiltinNew,
            0x1007 => BuiltinVecNew,
            0x1008 => BuiltinDelete,
            0x1009 => BuiltinVecDelete,
            0x1010 => GetThreadId,
            0x3001 => ThreadCreate,
            0x3002 => ThreadReturn,
            0x3003 => Join,
            0x3004 => Detach,
            0x3005 => Yield,
            0x3010 => MutexInit,
            0x3011 => MutexLock,
            0x3012 => MutexTryLock,
            0x3013 => MutexUnlock,
            0x3014 => MutexDestroy,
            0x3020 => CondInit,
            0x3021 => CondWait,
            0x3022 => CondTimedWait,
            0x3023 => CondSignal,
            0x3024 => CondBroadcast,
            0x3025 => CondDestroy,
            0x3030 => RwlockInit,
            0x3031 => RwlockRdLock,
            0x3032 => RwlockTryRdLock,
            0x3033 => RwlockWrLock,
            0x3034 => RwlockTryWrLock,
            0x3035 => RwlockUnlock,
            0x3036 => RwlockDestroy,
            0x3040 => SemInit,
            0x3041 => SemWait,
            0x3042 => SemTryWait,
            0x3043 => SemPost,
            0x3044 => SemGetValue,
            0x3045 => SemDestroy,
            0x3050 => KeyCreate,
            0x3051 => KeyDelete,
            0x3052 => SetSpecific,
            0x3053 => GetSpecific,
            0x3060 => SetCancelState,
            0x3061 => SetCancelType,
            0x3062 => CancelThread,
            0x3063 => TestCancel,
            0x3070 => SignalMask,
            0x3071 => ThreadKill,
            0x3072 => SigWait,
            0x3073 => SignalReturns,
            0x3080 => ReadMillisecondTimer,
            0x3081 => GetTraceLevel,
            0x3082 => LibcTsdGet,
            0x3083 => LibcTsdSet,
            0x3090 => Shutdown,
            _ => return None,
        };
        Some(code)
    }

    pub fn is_annotation(w: GuestWord) -> bool {
        (ANNOTATION_BASE as GuestWord..=ANNOTATION_LAST as GuestWord).contains(&w)
    }
}

/// A parsed request record.
#[derive(Copy, Clone, Debug)]
pub struct Request {
    pub code: RequestCode,
    pub args: [GuestWord; 4],
}

impl Request {
    pub fn arg_ptr<T>(&self, n: usize) -> ForeignPtr<T> {
        ForeignPtr::new(self.args[n])
    }
}

// Calling the parked case an error stretches the word, but it keeps the
// handlers fluent with `?`.
#[derive(Debug, PartialEq, Eq)]
pub enum ReqError {
    /// Reply with a positive error code; scheduler state is unchanged.
    Failed(Errno),
    /// The caller was parked; no reply yet.
    Parked,
}

impl From<Errno> for ReqError {
    fn from(e: Errno) -> Self {
        ReqError::Failed(e)
    }
}

pub type ReqResult = Result<GuestWord, ReqError>;

impl Host {
    /// Read the five-word request record the trapping thread points at.
    /// An unreadable record means the trap transport and the guest disagree
    /// about the protocol, which is not survivable.
    pub fn read_request_raw(&self, tid: ThreadId) -> (GuestWord, [GuestWord; 4]) {
        let addr = self.threads.thread(tid).regs.request_addr();
        let mut words = [0 as GuestWord; 5];
        for (i, w) in words.iter_mut().enumerate() {
            *w = self
                .mem
                .read_word(ForeignPtr::new(addr + 8 * i as GuestWord))
                .unwrap_or_else(|e| {
                    panic!("tid {tid}: unreadable request block at {addr:#x}: {e}")
                });
        }
        (words[0], [words[1], words[2], words[3], words[4]])
    }

    /// Store a request reply, mapping errors onto the positive error-code
    /// convention of the request channel.
    pub fn reply_result(&mut self, tid: ThreadId, res: ReqResult) {
        match res {
            Ok(val) => self.reply(tid, val),
            Err(ReqError::Failed(errno)) => self.reply(tid, errno as u32 as GuestWord),
            Err(ReqError::Parked) => {}
        }
    }

    /// Answer a purely thread-local request without touching scheduling
    /// state. Returns false if the request is non-trivial and must take the
    /// slow path.
    pub fn maybe_trivial_request(&mut self, tid: ThreadId) -> bool {
        let (code_word, args) = self.read_request_raw(tid);
        let Some(code) = RequestCode::from_word(code_word) else {
            return false;
        };

        use RequestCode::*;
        let reply = match code {
            Malloc | BuiltinNew | BuiltinVecNew => self.heap.alloc(args[0], 1),
            Calloc => {
                let bytes = args[0].saturating_mul(args[1]);
                let addr = self.heap.alloc(bytes, 1);
                if addr != 0 {
                    let zeros = vec![0u8; bytes as usize];
                    self.mem
                        .write_bytes(addr, &zeros)
                        .expect("client heap arena is mapped");
                }
                addr
            }
            Memalign => self.heap.alloc(args[1], args[0]),
            Realloc => self.client_realloc(args[0], args[1]),
            Free | BuiltinDelete | BuiltinVecDelete => {
                self.heap.free(args[0]);
                0
            }
            GetThreadId => tid.0 as GuestWord,
            _ => return false,
        };
        self.reply(tid, reply);
        true
    }

    fn client_realloc(&mut self, old: GuestWord, size: GuestWord) -> GuestWord {
        if old == 0 {
            return self.heap.alloc(size, 1);
        }
        let Some(old_size) = self.heap.usable_size(old) else {
            log::warn!("guest realloc of unknown pointer {old:#x}");
            return 0;
        };
        let new = self.heap.alloc(size, 1);
        if new != 0 {
            let mut buf = vec![0u8; old_size.min(size as usize)];
            self.mem
                .read_bytes(old, &mut buf)
                .expect("client heap arena is mapped");
            self.mem
                .write_bytes(new, &buf)
                .expect("client heap arena is mapped");
            self.heap.free(old);
        }
        new
    }

    /// Re-run a stored request after a wakeup. Only the park-and-retry
    /// requests can appear here.
    pub(crate) fn replay_request(&mut self, tid: ThreadId, req: Request) {
        use RequestCode::*;
        let res = match req.code {
            SemWait => self.sem_wait(tid, req),
            RwlockRdLock => self.rwlock_rdlock(tid, req),
            RwlockWrLock => self.rwlock_wrlock(tid, req),
            SigWait => self.sigwait(tid, req),
            other => unreachable!("request {other:?} is not restartable"),
        };
        self.reply_result(tid, res);
    }
}

impl Scheduler {
    /// Phase 3 demux for a non-trivial client request. `Some` means the
    /// whole scheduler should return. Requests affecting only the caller
    /// reply directly; the synchronization handlers may instead park the
    /// caller and wake, reschedule, or destroy arbitrary threads.
    pub(crate) fn handle_client_request(&mut self, tid: ThreadId) -> Option<ExitReason> {
        let (code_word, args) = self.host.read_request_raw(tid);

        if RequestCode::is_annotation(code_word) {
            let res = self.annotations.client_request(code_word as u32, args);
            self.host.reply(tid, res);
            return None;
        }

        let Some(code) = RequestCode::from_word(code_word) else {
            log::error!("unknown client request {code_word:#x} from tid {tid}");
            panic!("unknown client request code {code_word:#x}");
        };
        let req = Request { code, args };
        log::trace!("SCHED[{tid}]: request {code:?}");

        use RequestCode::*;
        let res: ReqResult = match code {
            Shutdown => return Some(ExitReason::Shutdown),

            ThreadCreate => self.host.thread_create(tid, req),
            ThreadReturn => self.host.thread_return(tid, req),
            Join => self.host.thread_join(tid, req),
            Detach => self.host.thread_detach(tid, req),
            // Falling back into Phase 1 is the whole of yielding.
            Yield => Ok(0),

            MutexInit => self.host.mutex_init(tid, req),
            MutexLock => self.host.mutex_lock(tid, req),
            MutexTryLock => self.host.mutex_trylock(tid, req),
            MutexUnlock => self.host.mutex_unlock(tid, req),
            MutexDestroy => self.host.mutex_destroy(tid, req),

            CondInit => self.host.cond_init(tid, req),
            CondWait => self.host.cond_wait(tid, req),
            CondTimedWait => self.host.cond_timedwait(tid, req),
            CondSignal => self.host.cond_signal(tid, req),
            CondBroadcast => self.host.cond_broadcast(tid, req),
            CondDestroy => self.host.cond_destroy(tid, req),

            RwlockInit => self.host.rwlock_init(tid, req),
            RwlockRdLock => self.host.rwlock_rdlock(tid, req),
            RwlockTryRdLock => self.host.rwlock_tryrdlock(tid, req),
            RwlockWrLock => self.host.rwlock_wrlock(tid, req),
            RwlockTryWrLock => self.host.rwlock_trywrlock(tid, req),
            RwlockUnlock => self.host.rwlock_unlock(tid, req),
            RwlockDestroy => self.host.rwlock_destroy(tid, req),

            SemInit => self.host.sem_init(tid, req),
            SemWait => self.host.sem_wait(tid, req),
            SemTryWait => self.host.sem_trywait(tid, req),
            SemPost => self.host.sem_post(tid, req),
            SemGetValue => self.host.sem_getvalue(tid, req),
            SemDestroy => self.host.sem_destroy(tid, req),

            KeyCreate => self.host.key_create(tid, req),
            KeyDelete => self.host.key_delete(tid, req),
            SetSpecific => self.host.set_specific(tid, req),
            GetSpecific => self.host.get_specific(tid, req),

            SetCancelState => self.host.set_cancel_state(tid, req),
            SetCancelType => self.host.set_cancel_type(tid, req),
            CancelThread => self.host.thread_cancel(tid, req),
            TestCancel => self.host.test_cancel(tid, req),

            SignalMask => self.req_signal_mask(tid, req),
            ThreadKill => self.host.thread_kill(tid, req),
            SigWait => self.host.sigwait(tid, req),
            SignalReturns => self.req_signal_returns(tid, req),

            ReadMillisecondTimer => Ok(time::now_millis()),
            GetTraceLevel => Ok(self.host.opts.pthread_trace_level),
            LibcTsdGet => self.host.libc_tsd_get(tid, req),
            LibcTsdSet => self.host.libc_tsd_set(tid, req),

            // Trivial codes are answered during dispatch and cannot get here.
            Malloc | Free | Calloc | Realloc | Memalign | BuiltinNew | BuiltinVecNew
            | BuiltinDelete | BuiltinVecDelete | GetThreadId => {
                unreachable!("trivial request {code:?} reached the slow path")
            }
        };
        self.host.reply_result(tid, res);
        None
    }
}
