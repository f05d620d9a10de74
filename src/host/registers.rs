//! Saved guest machine state.
//!
//! The dispatch driver and the guest runner communicate through one shared
//! [`DispatchBlock`]: the chosen thread's registers are copied in, the runner
//! executes guest code against them, and they are copied back out when the
//! quantum ends. The vacated block is filled with a poison pattern so that
//! any code that keeps poking at it without a fresh load fails fast.

use crate::host::memory::GuestWord;

/// General-purpose registers in the file, beyond `pc` and `sp`.
pub const N_GPRS: usize = 8;

/// Bytes of floating-point spill area carried per thread.
pub const FPU_SPILL_BYTES: usize = 112;

/// Register conventions for traps. `REG_REQ` does triple duty exactly like
/// the accumulator it abstracts: syscall number and syscall result for
/// syscall traps, request-block address for client requests, and the exit
/// value when a thread reaches the return trampoline.
pub const REG_REQ: usize = 0;
/// Client-request replies land here.
pub const REG_RES: usize = 1;
/// First syscall argument; further arguments follow in order.
pub const REG_ARG1: usize = 2;
pub const REG_ARG2: usize = 3;
pub const REG_ARG3: usize = 4;

const POISON: GuestWord = 0xDEAD_BEEF_DEAD_BEEF;
const FPU_POISON: u8 = 0xDB;

/// One thread's full saved register state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegisterFile {
    pub pc: GuestWord,
    pub sp: GuestWord,
    pub gprs: [GuestWord; N_GPRS],
    pub fpu: [u8; FPU_SPILL_BYTES],
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            pc: 0,
            sp: 0,
            gprs: [0; N_GPRS],
            fpu: [0; FPU_SPILL_BYTES],
        }
    }
}

impl RegisterFile {
    pub fn syscall_number(&self) -> i64 {
        self.gprs[REG_REQ] as i64
    }

    pub fn syscall_arg(&self, n: usize) -> GuestWord {
        self.gprs[REG_ARG1 + n]
    }

    /// Syscall results use the negated-errno convention.
    pub fn set_syscall_result(&mut self, res: i64) {
        self.gprs[REG_REQ] = res as GuestWord;
    }

    pub fn request_addr(&self) -> GuestWord {
        self.gprs[REG_REQ]
    }

    pub fn set_request_result(&mut self, res: GuestWord) {
        self.gprs[REG_RES] = res;
    }

    /// The word a thread "returns" when it reaches the return trampoline.
    pub fn exit_value(&self) -> GuestWord {
        self.gprs[REG_REQ]
    }

    pub fn set_exit_value(&mut self, val: GuestWord) {
        self.gprs[REG_REQ] = val;
    }
}

/// The shared block the runner executes against.
pub struct DispatchBlock {
    pub regs: RegisterFile,
}

impl DispatchBlock {
    pub fn new() -> Self {
        let mut block = Self {
            regs: RegisterFile::default(),
        };
        block.poison();
        block
    }

    pub fn load(&mut self, regs: &RegisterFile) {
        debug_assert!(self.is_poisoned(), "dispatch block loaded twice");
        self.regs = regs.clone();
    }

    /// Copy the register state back out and poison the block.
    pub fn save(&mut self) -> RegisterFile {
        let regs = self.regs.clone();
        self.poison();
        regs
    }

    fn poison(&mut self) {
        self.regs.pc = POISON;
        self.regs.sp = POISON;
        self.regs.gprs = [POISON; N_GPRS];
        self.regs.fpu = [FPU_POISON; FPU_SPILL_BYTES];
    }

    fn is_poisoned(&self) -> bool {
        self.regs.pc == POISON && self.regs.sp == POISON
    }
}

impl Default for DispatchBlock {
    fn default() -> Self {
        Self::new()
    }
}
