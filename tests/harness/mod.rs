//! Scenario harness: scripted guest programs driven by a fake runner.
//!
//! Guest programs are closures running on real host threads. The runner
//! hands control to exactly one of them at a time over rendezvous channels:
//! a resumed guest computes until it wants to trap, writes its request into
//! guest memory and its registers, and hands both back with the trap code.
//! From the scheduler's side this is indistinguishable from an inner loop
//! executing translated code.
//!
//! The runner consumes the dispatch counter one block per step, can burn
//! extra blocks on request (`GuestCtx::spin`) so quantum and budget
//! behavior is observable, optionally injects a fast-miss trap the first
//! time it sees a program counter, and synthesizes the thread-return
//! request when asked to resume a thread whose program counter is aimed at
//! the return trampoline.

// Not every scenario uses every helper.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crossbeam::channel::{bounded, Receiver, Sender};
use nix::errno::Errno;

use threadmill::core::configuration::Options;
use threadmill::core::scheduler::{ExitReason, Scheduler};
use threadmill::host::dispatch::{GuestRunner, TrapCode, THREAD_RETURN_ADDR};
use threadmill::host::memory::{FlatMemory, ForeignPtr, GuestMemory, GuestWord};
use threadmill::host::registers::{DispatchBlock, RegisterFile, REG_ARG1, REG_REQ, REG_RES};
use threadmill::host::request::RequestCode;
use threadmill::host::sync::mutex::GuestMutex;
use threadmill::host::thread::ThreadId;
use threadmill::shim::{run_thread_body, PthreadShim, ShimContext};

/// Guest entry addresses live far outside the mapped guest memory; they are
/// only ever compared, never dereferenced.
const PROGRAM_BASE: GuestWord = 0x4000_0000;

/// Exit value synthesized for a guest whose host thread died unexpectedly;
/// scenario assertions will trip on it.
const GUEST_DIED_RETVAL: GuestWord = 0xDEAD_0BAD;

pub type Program = Arc<dyn Fn(&mut GuestCtx, GuestWord) -> GuestWord + Send + Sync>;

/// Guest memory shared between the scheduler and the guest host-threads.
/// Only one side runs at a time, so the lock is never contended for long.
#[derive(Clone)]
pub struct SharedMem(pub Arc<Mutex<FlatMemory>>);

impl SharedMem {
    pub fn map_region(&self, len: usize) -> GuestWord {
        self.0.lock().unwrap().map_region(len).expect("guest memory exhausted")
    }

    pub fn read_word(&self, addr: GuestWord) -> GuestWord {
        let mem = self.0.lock().unwrap();
        let m: &dyn GuestMemory = &*mem;
        m.read_word(ForeignPtr::new(addr)).unwrap()
    }

    pub fn write_word(&self, addr: GuestWord, val: GuestWord) {
        let mut mem = self.0.lock().unwrap();
        let m: &mut dyn GuestMemory = &mut *mem;
        m.write_word(ForeignPtr::new(addr), val).unwrap()
    }
}

impl GuestMemory for SharedMem {
    fn read_bytes(&self, addr: GuestWord, buf: &mut [u8]) -> Result<(), Errno> {
        self.0.lock().unwrap().read_bytes(addr, buf)
    }

    fn write_bytes(&mut self, addr: GuestWord, data: &[u8]) -> Result<(), Errno> {
        self.0.lock().unwrap().write_bytes(addr, data)
    }

    fn map_region(&mut self, len: usize) -> Result<GuestWord, Errno> {
        self.0.lock().unwrap().map_region(len)
    }
}

enum GuestEvent {
    Trap {
        code: TrapCode,
        regs: RegisterFile,
        /// Thread-return: the guest will not wait for a resume.
        last: bool,
    },
    Spin {
        regs: RegisterFile,
        blocks: u64,
    },
}

/// What a guest program sees: its registers, the shim, and guest memory.
pub struct GuestCtx {
    pub regs: RegisterFile,
    pub shim: PthreadShim,
    mem: SharedMem,
    scratch: GuestWord,
    to_runner: Sender<GuestEvent>,
    from_runner: Receiver<RegisterFile>,
}

fn park_forever() -> ! {
    // The scheduler abandoned this guest (cancellation, shutdown); the
    // host thread just stops participating.
    loop {
        std::thread::park();
    }
}

impl GuestCtx {
    /// The argument the creator pushed onto this thread's stack.
    fn stack_arg(&mut self) -> GuestWord {
        let sp = self.regs.sp;
        self.read_val(ForeignPtr::<GuestWord>::new(sp + 8))
            .expect("stack is mapped")
    }

    fn roundtrip(&mut self, code: TrapCode, last: bool) {
        let event = GuestEvent::Trap {
            code,
            regs: self.regs.clone(),
            last,
        };
        if self.to_runner.send(event).is_err() {
            park_forever();
        }
        if last {
            return;
        }
        match self.from_runner.recv() {
            Ok(regs) => self.regs = regs,
            Err(_) => park_forever(),
        }
    }

    /// Burn `blocks` basic blocks of "computation".
    pub fn spin(&mut self, blocks: u64) {
        let event = GuestEvent::Spin {
            regs: self.regs.clone(),
            blocks,
        };
        if self.to_runner.send(event).is_err() {
            park_forever();
        }
        match self.from_runner.recv() {
            Ok(regs) => self.regs = regs,
            Err(_) => park_forever(),
        }
    }
}

impl ShimContext for GuestCtx {
    fn trap(&mut self, code: RequestCode, args: [GuestWord; 4]) -> GuestWord {
        let words = [code as u32 as GuestWord, args[0], args[1], args[2], args[3]];
        for (i, w) in words.iter().enumerate() {
            self.mem_write(self.scratch + 8 * i as GuestWord, &w.to_ne_bytes())
                .expect("request scratch is mapped");
        }
        self.regs.gprs[REG_REQ] = self.scratch;
        let last = code == RequestCode::ThreadReturn;
        self.roundtrip(TrapCode::ClientRequest, last);
        if last {
            return 0;
        }
        self.regs.gprs[REG_RES]
    }

    fn syscall(&mut self, number: i64, args: [GuestWord; 6]) -> i64 {
        self.regs.gprs[REG_REQ] = number as GuestWord;
        for (i, a) in args.iter().enumerate() {
            self.regs.gprs[REG_ARG1 + i] = *a;
        }
        self.roundtrip(TrapCode::Syscall, false);
        self.regs.syscall_number()
    }

    fn mem_read(&mut self, addr: GuestWord, buf: &mut [u8]) -> Result<(), Errno> {
        self.mem.0.lock().unwrap().read_bytes(addr, buf)
    }

    fn mem_write(&mut self, addr: GuestWord, data: &[u8]) -> Result<(), Errno> {
        self.mem.0.lock().unwrap().write_bytes(addr, data)
    }
}

struct Session {
    to_guest: Sender<RegisterFile>,
    from_guest: Receiver<GuestEvent>,
    spin: u64,
}

pub struct FakeRunner {
    programs: HashMap<GuestWord, Program>,
    sessions: HashMap<usize, Session>,
    mem: SharedMem,
    shim: PthreadShim,
    inject_fastmiss: bool,
    seen_pcs: HashSet<GuestWord>,
    synth_scratch: GuestWord,
}

impl FakeRunner {
    fn spawn_guest(&mut self, tid: ThreadId, regs: &RegisterFile, program: Program) {
        let (to_guest, from_runner) = bounded::<RegisterFile>(1);
        let (to_runner, from_guest) = bounded::<GuestEvent>(1);
        let scratch = self.mem.map_region(64);
        let mut ctx = GuestCtx {
            regs: regs.clone(),
            shim: self.shim,
            mem: self.mem.clone(),
            scratch,
            to_runner,
            from_runner,
        };
        std::thread::spawn(move || {
            let arg = ctx.stack_arg();
            run_thread_body(&mut ctx, |ctx| program(ctx, arg));
        });
        self.sessions.insert(
            tid.0,
            Session {
                to_guest,
                from_guest,
                spin: 0,
            },
        );
    }

    fn synthesize_request(&mut self, block: &mut DispatchBlock, words: [GuestWord; 5]) {
        for (i, w) in words.iter().enumerate() {
            self.mem
                .write_word(self.synth_scratch + 8 * i as GuestWord, *w);
        }
        block.regs.gprs[REG_REQ] = self.synth_scratch;
    }

    fn guest_died(&mut self, tid: ThreadId, block: &mut DispatchBlock) -> TrapCode {
        self.sessions.remove(&tid.0);
        self.synthesize_request(
            block,
            [
                RequestCode::ThreadReturn as u32 as GuestWord,
                GUEST_DIED_RETVAL,
                0,
                0,
                0,
            ],
        );
        TrapCode::ClientRequest
    }

    /// Burn leftover spin blocks; Some means the quantum ran out first.
    fn burn_spin(&mut self, tid: ThreadId, ctr: &mut u32) -> Option<TrapCode> {
        while self.sessions.get(&tid.0).is_some_and(|s| s.spin > 0) {
            if *ctr <= 1 {
                *ctr = 0;
                return Some(TrapCode::CounterZero);
            }
            *ctr -= 1;
            self.sessions.get_mut(&tid.0).unwrap().spin -= 1;
        }
        None
    }

    fn wait_event(
        &mut self,
        tid: ThreadId,
        block: &mut DispatchBlock,
        ctr: &mut u32,
    ) -> TrapCode {
        loop {
            let event = match self.sessions[&tid.0].from_guest.recv() {
                Ok(event) => event,
                Err(_) => return self.guest_died(tid, block),
            };
            match event {
                GuestEvent::Trap { code, regs, last } => {
                    block.regs = regs;
                    if last {
                        self.sessions.remove(&tid.0);
                    }
                    return code;
                }
                GuestEvent::Spin { regs, blocks } => {
                    block.regs = regs;
                    self.sessions.get_mut(&tid.0).unwrap().spin = blocks;
                    if let Some(trap) = self.burn_spin(tid, ctr) {
                        return trap;
                    }
                    let session = &self.sessions[&tid.0];
                    if session.to_guest.send(block.regs.clone()).is_err() {
                        return self.guest_died(tid, block);
                    }
                }
            }
        }
    }
}

impl GuestRunner for FakeRunner {
    fn run(
        &mut self,
        tid: ThreadId,
        block: &mut DispatchBlock,
        dispatch_ctr: &mut u32,
    ) -> TrapCode {
        // One block charged on entry; the counter is decremented before the
        // test, so a counter of one means the quantum is already gone.
        if *dispatch_ctr <= 1 {
            *dispatch_ctr = 0;
            return TrapCode::CounterZero;
        }
        *dispatch_ctr -= 1;

        // A spin interrupted by quantum exhaustion continues first.
        if self.sessions.get(&tid.0).is_some_and(|s| s.spin > 0) {
            if let Some(trap) = self.burn_spin(tid, dispatch_ctr) {
                return trap;
            }
            let session = &self.sessions[&tid.0];
            if session.to_guest.send(block.regs.clone()).is_err() {
                return self.guest_died(tid, block);
            }
            return self.wait_event(tid, block, dispatch_ctr);
        }

        let pc = block.regs.pc;

        if self.inject_fastmiss && pc != THREAD_RETURN_ADDR && self.seen_pcs.insert(pc) {
            return TrapCode::FastMiss;
        }

        if pc == THREAD_RETURN_ADDR {
            // The trampoline does not resume guest code: it traps the
            // thread-return request built from the exit value register.
            self.sessions.remove(&tid.0);
            let retval = block.regs.exit_value();
            self.synthesize_request(
                block,
                [
                    RequestCode::ThreadReturn as u32 as GuestWord,
                    retval,
                    0,
                    0,
                    0,
                ],
            );
            return TrapCode::ClientRequest;
        }

        if !self.sessions.contains_key(&tid.0) {
            let program = self
                .programs
                .get(&pc)
                .unwrap_or_else(|| panic!("no guest program at pc {pc:#x}"))
                .clone();
            self.spawn_guest(tid, &block.regs, program);
        } else {
            let session = &self.sessions[&tid.0];
            if session.to_guest.send(block.regs.clone()).is_err() {
                return self.guest_died(tid, block);
            }
        }
        self.wait_event(tid, block, dispatch_ctr)
    }
}

pub struct SimBuilder {
    programs: HashMap<GuestWord, Program>,
    next_entry: GuestWord,
    opts: Options,
    inject_fastmiss: bool,
    code_cache: Option<Box<dyn threadmill::host::dispatch::CodeCache>>,
}

impl SimBuilder {
    pub fn new() -> Self {
        let mut opts = Options::default();
        // A runaway scenario should end in BudgetDone, not a hung test.
        opts.bb_budget = Some(5_000_000);
        opts.poll_interval = std::time::Duration::from_millis(2);
        Self {
            programs: HashMap::new(),
            next_entry: PROGRAM_BASE,
            opts,
            inject_fastmiss: false,
            code_cache: None,
        }
    }

    pub fn code_cache(mut self, cache: Box<dyn threadmill::host::dispatch::CodeCache>) -> Self {
        self.code_cache = Some(cache);
        self
    }

    /// Register a guest program; returns its entry address.
    pub fn program<F>(&mut self, body: F) -> GuestWord
    where
        F: Fn(&mut GuestCtx, GuestWord) -> GuestWord + Send + Sync + 'static,
    {
        let entry = self.next_entry;
        self.next_entry += 0x1000;
        self.programs.insert(entry, Arc::new(body));
        entry
    }

    pub fn options(mut self, f: impl FnOnce(&mut Options)) -> Self {
        f(&mut self.opts);
        self
    }

    pub fn inject_fastmiss(mut self) -> Self {
        self.inject_fastmiss = true;
        self
    }

    /// Assemble guest memory, the initial thread's stack and the scheduler,
    /// with `main_entry` as the initial thread's program.
    pub fn build(self, main_entry: GuestWord, main_arg: GuestWord) -> Sim {
        let size = 16 << 20;
        let mem = SharedMem(Arc::new(Mutex::new(FlatMemory::new(0x10000, size, size))));

        let once_master = mem.map_region(std::mem::size_of::<GuestMutex>());
        let shim = PthreadShim::new(ForeignPtr::new(once_master));

        // The initial thread runs on a "host-provided" stack: one we map
        // here rather than one the thread table owns.
        let stack = mem.map_region(64 * 1024);
        let mut sp = stack + 64 * 1024 - 16;
        sp -= 8;
        mem.write_word(sp, main_arg);
        sp -= 8;
        mem.write_word(sp, THREAD_RETURN_ADDR);

        let mut initial_regs = RegisterFile::default();
        initial_regs.pc = main_entry;
        initial_regs.sp = sp;

        let runner = FakeRunner {
            programs: self.programs,
            sessions: HashMap::new(),
            mem: mem.clone(),
            shim,
            inject_fastmiss: self.inject_fastmiss,
            seen_pcs: HashSet::new(),
            synth_scratch: mem.map_region(64),
        };

        let mut sched = Scheduler::new(
            self.opts,
            Box::new(mem.clone()),
            Box::new(runner),
            initial_regs,
        );
        if let Some(cache) = self.code_cache {
            sched = sched.with_code_cache(cache);
        }
        Sim { sched, mem, shim }
    }
}

impl Default for SimBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Sim {
    pub sched: Scheduler,
    pub mem: SharedMem,
    pub shim: PthreadShim,
}

impl Sim {
    pub fn run(&mut self) -> ExitReason {
        self.sched.run()
    }
}
