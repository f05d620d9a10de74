//! The client-library surface: thin entry points that marshal threading
//! calls into client requests.
//!
//! In a deployed build this code is what the replacement `libpthread` links
//! against; in tests it is driven by scripted guests. Either way it runs in
//! guest context: [`ShimContext`] is the transport that materializes a
//! request record, traps into the scheduler, and returns the reply from the
//! result register.
//!
//! Everything here is a thin marshaling wrapper except the pieces that are
//! genuinely library-side logic: the thread-body wrapper that funnels every
//! way of finishing a thread through the return trampoline, the
//! once-barrier over its master mutex, the timed-wait deadline arithmetic,
//! and errno emulation over the per-thread TSD words.

use bytemuck::Pod;
use nix::errno::Errno;

use crate::host::memory::{ForeignPtr, GuestWord};
use crate::host::request::RequestCode;
use crate::host::sync::mutex::GuestMutex;
use crate::host::syscall::GuestTimespec;

/// The in-band transport between guest code and the scheduler.
pub trait ShimContext {
    /// Issue a client request and return the reply word.
    fn trap(&mut self, code: RequestCode, args: [GuestWord; 4]) -> GuestWord;

    /// Issue a syscall trap; negated-errno result convention.
    fn syscall(&mut self, number: i64, args: [GuestWord; 6]) -> i64;

    /// Guest memory, as seen from guest code.
    fn mem_read(&mut self, addr: GuestWord, buf: &mut [u8]) -> Result<(), Errno>;
    fn mem_write(&mut self, addr: GuestWord, data: &[u8]) -> Result<(), Errno>;

    /// The wall clock the timed-wait ABI is expressed against, as
    /// (seconds, microseconds).
    fn wall_clock(&mut self) -> (i64, i64) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        (now.as_secs() as i64, i64::from(now.subsec_micros()))
    }

    fn read_val<T: Pod>(&mut self, ptr: ForeignPtr<T>) -> Result<T, Errno> {
        let mut val = T::zeroed();
        self.mem_read(ptr.addr(), bytemuck::bytes_of_mut(&mut val))?;
        Ok(val)
    }

    fn write_val<T: Pod>(&mut self, ptr: ForeignPtr<T>, val: &T) -> Result<(), Errno> {
        self.mem_write(ptr.addr(), bytemuck::bytes_of(val))
    }
}

/// Payload thrown by [`thread_exit`]; the thread-body wrapper turns it into
/// an ordinary thread return.
pub struct ThreadExit(pub GuestWord);

/// Leave the current thread with `retval`, from anywhere in its body.
pub fn thread_exit(retval: GuestWord) -> ! {
    std::panic::panic_any(ThreadExit(retval))
}

/// Run a thread body and issue the thread-return request with its result,
/// whether it returned normally or called [`thread_exit`]. Every guest
/// thread runs under this wrapper; the return trampoline the scheduler aims
/// cancelled threads at leads to the same request.
pub fn run_thread_body<C: ShimContext, F>(ctx: &mut C, body: F)
where
    F: FnOnce(&mut C) -> GuestWord,
{
    let retval = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| body(ctx))) {
        Ok(v) => v,
        Err(payload) => match payload.downcast::<ThreadExit>() {
            Ok(exit) => exit.0,
            Err(payload) => std::panic::resume_unwind(payload),
        },
    };
    ctx.trap(RequestCode::ThreadReturn, [retval, 0, 0, 0]);
}

fn as_i32(reply: GuestWord) -> i32 {
    reply as i32
}

/// The pthread-flavored entry points. The once master mutex is the one
/// library-global the surface needs; the embedder places it in guest
/// memory.
#[derive(Copy, Clone)]
pub struct PthreadShim {
    once_master: ForeignPtr<GuestMutex>,
}

impl PthreadShim {
    pub fn new(once_master: ForeignPtr<GuestMutex>) -> Self {
        Self { once_master }
    }

    // -------- thread lifecycle --------

    /// Returns the new thread's id.
    pub fn create<C: ShimContext>(&self, ctx: &mut C, entry: GuestWord, arg: GuestWord) -> GuestWord {
        ctx.trap(RequestCode::ThreadCreate, [entry, arg, 0, 0])
    }

    pub fn join<C: ShimContext>(
        &self,
        ctx: &mut C,
        tid: GuestWord,
        thread_return: ForeignPtr<GuestWord>,
    ) -> i32 {
        as_i32(ctx.trap(RequestCode::Join, [tid, thread_return.addr(), 0, 0]))
    }

    pub fn self_id<C: ShimContext>(&self, ctx: &mut C) -> GuestWord {
        ctx.trap(RequestCode::GetThreadId, [0, 0, 0, 0])
    }

    pub fn equal(&self, a: GuestWord, b: GuestWord) -> bool {
        a == b
    }

    pub fn detach<C: ShimContext>(&self, ctx: &mut C, tid: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::Detach, [tid, 0, 0, 0]))
    }

    pub fn yield_now<C: ShimContext>(&self, ctx: &mut C) {
        ctx.trap(RequestCode::Yield, [0, 0, 0, 0]);
    }

    // -------- client heap --------

    pub fn malloc<C: ShimContext>(&self, ctx: &mut C, size: GuestWord) -> GuestWord {
        ctx.trap(RequestCode::Malloc, [size, 0, 0, 0])
    }

    pub fn calloc<C: ShimContext>(&self, ctx: &mut C, nmemb: GuestWord, size: GuestWord) -> GuestWord {
        ctx.trap(RequestCode::Calloc, [nmemb, size, 0, 0])
    }

    pub fn realloc<C: ShimContext>(&self, ctx: &mut C, addr: GuestWord, size: GuestWord) -> GuestWord {
        ctx.trap(RequestCode::Realloc, [addr, size, 0, 0])
    }

    pub fn memalign<C: ShimContext>(&self, ctx: &mut C, align: GuestWord, size: GuestWord) -> GuestWord {
        ctx.trap(RequestCode::Memalign, [align, size, 0, 0])
    }

    pub fn free<C: ShimContext>(&self, ctx: &mut C, addr: GuestWord) {
        ctx.trap(RequestCode::Free, [addr, 0, 0, 0]);
    }

    // -------- mutexes --------

    pub fn mutex_init<C: ShimContext>(
        &self,
        ctx: &mut C,
        mutex: ForeignPtr<GuestMutex>,
        kind: i32,
    ) -> i32 {
        as_i32(ctx.trap(
            RequestCode::MutexInit,
            [mutex.addr(), kind as u32 as GuestWord, 0, 0],
        ))
    }

    pub fn mutex_lock<C: ShimContext>(&self, ctx: &mut C, mutex: ForeignPtr<GuestMutex>) -> i32 {
        as_i32(ctx.trap(RequestCode::MutexLock, [mutex.addr(), 0, 0, 0]))
    }

    pub fn mutex_trylock<C: ShimContext>(&self, ctx: &mut C, mutex: ForeignPtr<GuestMutex>) -> i32 {
        as_i32(ctx.trap(RequestCode::MutexTryLock, [mutex.addr(), 0, 0, 0]))
    }

    pub fn mutex_unlock<C: ShimContext>(&self, ctx: &mut C, mutex: ForeignPtr<GuestMutex>) -> i32 {
        as_i32(ctx.trap(RequestCode::MutexUnlock, [mutex.addr(), 0, 0, 0]))
    }

    pub fn mutex_destroy<C: ShimContext>(&self, ctx: &mut C, mutex: ForeignPtr<GuestMutex>) -> i32 {
        as_i32(ctx.trap(RequestCode::MutexDestroy, [mutex.addr(), 0, 0, 0]))
    }

    // -------- condition variables --------

    pub fn cond_init<C: ShimContext>(&self, ctx: &mut C, cond: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::CondInit, [cond, 0, 0, 0]))
    }

    pub fn cond_wait<C: ShimContext>(
        &self,
        ctx: &mut C,
        cond: GuestWord,
        mutex: ForeignPtr<GuestMutex>,
    ) -> i32 {
        as_i32(ctx.trap(RequestCode::CondWait, [cond, mutex.addr(), 0, 0]))
    }

    /// The absolute wall deadline is rebased onto the scheduler's
    /// millisecond timer: read both clocks, convert the remaining span to
    /// milliseconds (microseconds divide by 1000), and pass the absolute
    /// scheduler-clock deadline.
    pub fn cond_timedwait<C: ShimContext>(
        &self,
        ctx: &mut C,
        cond: GuestWord,
        mutex: ForeignPtr<GuestMutex>,
        abstime: &GuestTimespec,
    ) -> i32 {
        let ms_now = ctx.trap(RequestCode::ReadMillisecondTimer, [0, 0, 0, 0]);
        let (wall_sec, wall_usec) = ctx.wall_clock();
        let wall_ms = wall_sec * 1000 + wall_usec / 1000;
        let abs_ms = abstime.tv_sec * 1000 + abstime.tv_nsec / 1_000_000;
        let ms_end = ms_now + u64::try_from(abs_ms - wall_ms).unwrap_or(0);
        as_i32(ctx.trap(
            RequestCode::CondTimedWait,
            [cond, mutex.addr(), ms_end, 0],
        ))
    }

    pub fn cond_signal<C: ShimContext>(&self, ctx: &mut C, cond: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::CondSignal, [cond, 0, 0, 0]))
    }

    pub fn cond_broadcast<C: ShimContext>(&self, ctx: &mut C, cond: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::CondBroadcast, [cond, 0, 0, 0]))
    }

    pub fn cond_destroy<C: ShimContext>(&self, ctx: &mut C, cond: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::CondDestroy, [cond, 0, 0, 0]))
    }

    // -------- reader-writer locks --------

    pub fn rwlock_rdlock<C: ShimContext>(&self, ctx: &mut C, rwlock: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::RwlockRdLock, [rwlock, 0, 0, 0]))
    }

    pub fn rwlock_tryrdlock<C: ShimContext>(&self, ctx: &mut C, rwlock: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::RwlockTryRdLock, [rwlock, 0, 0, 0]))
    }

    pub fn rwlock_wrlock<C: ShimContext>(&self, ctx: &mut C, rwlock: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::RwlockWrLock, [rwlock, 0, 0, 0]))
    }

    pub fn rwlock_trywrlock<C: ShimContext>(&self, ctx: &mut C, rwlock: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::RwlockTryWrLock, [rwlock, 0, 0, 0]))
    }

    pub fn rwlock_unlock<C: ShimContext>(&self, ctx: &mut C, rwlock: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::RwlockUnlock, [rwlock, 0, 0, 0]))
    }

    pub fn rwlock_destroy<C: ShimContext>(&self, ctx: &mut C, rwlock: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::RwlockDestroy, [rwlock, 0, 0, 0]))
    }

    // -------- semaphores (sem_* return -1 and set errno on failure) --------

    pub fn sem_init<C: ShimContext>(
        &self,
        ctx: &mut C,
        sem: GuestWord,
        pshared: i32,
        value: u32,
    ) -> i32 {
        let res = as_i32(ctx.trap(
            RequestCode::SemInit,
            [sem, pshared as u32 as GuestWord, GuestWord::from(value), 0],
        ));
        self.sem_result(ctx, res)
    }

    pub fn sem_wait<C: ShimContext>(&self, ctx: &mut C, sem: GuestWord) -> i32 {
        let res = as_i32(ctx.trap(RequestCode::SemWait, [sem, 0, 0, 0]));
        self.sem_result(ctx, res)
    }

    pub fn sem_trywait<C: ShimContext>(&self, ctx: &mut C, sem: GuestWord) -> i32 {
        let res = as_i32(ctx.trap(RequestCode::SemTryWait, [sem, 0, 0, 0]));
        self.sem_result(ctx, res)
    }

    pub fn sem_post<C: ShimContext>(&self, ctx: &mut C, sem: GuestWord) -> i32 {
        let res = as_i32(ctx.trap(RequestCode::SemPost, [sem, 0, 0, 0]));
        self.sem_result(ctx, res)
    }

    pub fn sem_getvalue<C: ShimContext>(
        &self,
        ctx: &mut C,
        sem: GuestWord,
        sval: ForeignPtr<i32>,
    ) -> i32 {
        let value = ctx.trap(RequestCode::SemGetValue, [sem, 0, 0, 0]);
        if ctx.write_val(sval, &(value as i32)).is_err() {
            return self.sem_result(ctx, Errno::EFAULT as i32);
        }
        0
    }

    pub fn sem_destroy<C: ShimContext>(&self, ctx: &mut C, sem: GuestWord) -> i32 {
        let res = as_i32(ctx.trap(RequestCode::SemDestroy, [sem, 0, 0, 0]));
        self.sem_result(ctx, res)
    }

    fn sem_result<C: ShimContext>(&self, ctx: &mut C, res: i32) -> i32 {
        if res == 0 {
            0
        } else {
            self.set_errno(ctx, res);
            -1
        }
    }

    // -------- thread-specific keys --------

    /// The scheduler stores the new key index through `key_out`.
    pub fn key_create<C: ShimContext>(
        &self,
        ctx: &mut C,
        key_out: ForeignPtr<u32>,
        destructor: GuestWord,
    ) -> i32 {
        as_i32(ctx.trap(RequestCode::KeyCreate, [key_out.addr(), destructor, 0, 0]))
    }

    pub fn key_delete<C: ShimContext>(&self, ctx: &mut C, key: u32) -> i32 {
        as_i32(ctx.trap(RequestCode::KeyDelete, [GuestWord::from(key), 0, 0, 0]))
    }

    pub fn setspecific<C: ShimContext>(&self, ctx: &mut C, key: u32, value: GuestWord) -> i32 {
        as_i32(ctx.trap(
            RequestCode::SetSpecific,
            [GuestWord::from(key), value, 0, 0],
        ))
    }

    pub fn getspecific<C: ShimContext>(&self, ctx: &mut C, key: u32) -> GuestWord {
        ctx.trap(RequestCode::GetSpecific, [GuestWord::from(key), 0, 0, 0])
    }

    // -------- once --------

    /// First caller through flips the control word and runs `init` while
    /// still under the master mutex. The master mutex is errorcheck, so an
    /// init routine that calls back into once reports deadlock, which is
    /// fatal here: the program's init routine is broken.
    pub fn once<C: ShimContext, F>(&self, ctx: &mut C, control: ForeignPtr<u32>, init: F) -> i32
    where
        F: FnOnce(&mut C),
    {
        let res = self.mutex_lock(ctx, self.once_master);
        assert_eq!(
            res, 0,
            "once: init routine called back into once (master mutex deadlock)"
        );
        let done = ctx.read_val(control).unwrap_or(1);
        if done == 0 {
            let _ = ctx.write_val(control, &1u32);
            init(ctx);
        }
        self.mutex_unlock(ctx, self.once_master);
        0
    }

    // -------- cancellation --------

    pub fn setcancelstate<C: ShimContext>(&self, ctx: &mut C, disable: bool) -> i32 {
        as_i32(ctx.trap(
            RequestCode::SetCancelState,
            [GuestWord::from(disable), 0, 0, 0],
        ))
    }

    pub fn setcanceltype<C: ShimContext>(&self, ctx: &mut C, asynchronous: bool) -> i32 {
        as_i32(ctx.trap(
            RequestCode::SetCancelType,
            [GuestWord::from(asynchronous), 0, 0, 0],
        ))
    }

    pub fn cancel<C: ShimContext>(&self, ctx: &mut C, tid: GuestWord) -> i32 {
        as_i32(ctx.trap(RequestCode::CancelThread, [tid, 0, 0, 0]))
    }

    pub fn testcancel<C: ShimContext>(&self, ctx: &mut C) {
        ctx.trap(RequestCode::TestCancel, [0, 0, 0, 0]);
    }

    // -------- signals --------

    /// `how` uses the C library's 0/1/2 constants, remapped crudely onto
    /// the scheduler's. A null new-set pointer faults, as it always has.
    pub fn sigmask<C: ShimContext>(
        &self,
        ctx: &mut C,
        how: i32,
        newmask: ForeignPtr<u64>,
        oldmask: ForeignPtr<u64>,
    ) -> i32 {
        let how = match how {
            0 | 1 | 2 => how as GuestWord,
            _ => return Errno::EINVAL as i32,
        };
        if newmask.is_null() {
            return Errno::EFAULT as i32;
        }
        as_i32(ctx.trap(
            RequestCode::SignalMask,
            [how, newmask.addr(), oldmask.addr(), 0],
        ))
    }

    pub fn kill<C: ShimContext>(&self, ctx: &mut C, tid: GuestWord, signo: i32) -> i32 {
        as_i32(ctx.trap(
            RequestCode::ThreadKill,
            [tid, signo as u32 as GuestWord, 0, 0],
        ))
    }

    /// Send a signal to the calling thread.
    pub fn raise<C: ShimContext>(&self, ctx: &mut C, signo: i32) -> i32 {
        let me = self.self_id(ctx);
        let res = self.kill(ctx, me, signo);
        if res == 0 {
            0
        } else {
            self.set_errno(ctx, res);
            -1
        }
    }

    /// Returns 0 with the delivered signal number stored through `sig`.
    pub fn sigwait<C: ShimContext>(
        &self,
        ctx: &mut C,
        set: ForeignPtr<u64>,
        sig: ForeignPtr<i32>,
    ) -> i32 {
        let wanted = ctx.read_val(set).unwrap_or(0);
        let reply = ctx.trap(RequestCode::SigWait, [set.addr(), sig.addr(), 0, 0]);
        // The reply is the signal number (the scheduler already stored it
        // through `sig`); anything outside the requested set is an error
        // code riding the same word.
        if (1..=crate::host::signal::MAX_SIGNAL).contains(&reply) && wanted & (1 << reply) != 0 {
            0
        } else {
            reply as i32
        }
    }

    // -------- misc --------

    pub fn read_millisecond_timer<C: ShimContext>(&self, ctx: &mut C) -> u64 {
        ctx.trap(RequestCode::ReadMillisecondTimer, [0, 0, 0, 0])
    }

    pub fn trace_level<C: ShimContext>(&self, ctx: &mut C) -> u64 {
        ctx.trap(RequestCode::GetTraceLevel, [0, 0, 0, 0])
    }

    pub fn shutdown<C: ShimContext>(&self, ctx: &mut C) {
        ctx.trap(RequestCode::Shutdown, [0, 0, 0, 0]);
    }

    /// errno lives in the per-thread words the scheduler keeps for the
    /// guest C library.
    pub fn errno<C: ShimContext>(&self, ctx: &mut C) -> i32 {
        ctx.trap(RequestCode::LibcTsdGet, [0, 0, 0, 0]) as i32
    }

    pub fn set_errno<C: ShimContext>(&self, ctx: &mut C, value: i32) {
        ctx.trap(
            RequestCode::LibcTsdSet,
            [0, value as u32 as GuestWord, 0, 0],
        );
    }

    // -------- blocking syscalls through the shim --------

    pub fn read<C: ShimContext>(
        &self,
        ctx: &mut C,
        fd: i32,
        buf: GuestWord,
        count: usize,
    ) -> i64 {
        ctx.syscall(
            libc::SYS_read,
            [fd as u32 as GuestWord, buf, count as GuestWord, 0, 0, 0],
        )
    }

    pub fn write<C: ShimContext>(
        &self,
        ctx: &mut C,
        fd: i32,
        buf: GuestWord,
        count: usize,
    ) -> i64 {
        ctx.syscall(
            libc::SYS_write,
            [fd as u32 as GuestWord, buf, count as GuestWord, 0, 0, 0],
        )
    }

    /// nanosleep through the scheduler's sleep queue. `req` must already be
    /// in guest memory.
    pub fn nanosleep<C: ShimContext>(
        &self,
        ctx: &mut C,
        req: ForeignPtr<GuestTimespec>,
        rem: ForeignPtr<GuestTimespec>,
    ) -> i64 {
        ctx.syscall(
            libc::SYS_nanosleep,
            [req.addr(), rem.addr(), 0, 0, 0, 0],
        )
    }

    /// Sleep helper for guests: maps a millisecond count onto nanosleep
    /// with a scratch timespec on the guest heap.
    pub fn sleep_ms<C: ShimContext>(&self, ctx: &mut C, ms: u64) -> i64 {
        let scratch = self.malloc(ctx, std::mem::size_of::<GuestTimespec>() as GuestWord);
        assert_ne!(scratch, 0, "client heap exhausted");
        let spec = GuestTimespec {
            tv_sec: (ms / 1000) as i64,
            tv_nsec: (ms % 1000) as i64 * 1_000_000,
        };
        ctx.write_val(ForeignPtr::new(scratch), &spec)
            .expect("heap scratch is mapped");
        let res = self.nanosleep(ctx, ForeignPtr::new(scratch), ForeignPtr::null());
        self.free(ctx, scratch);
        res
    }
}
