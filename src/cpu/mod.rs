//! RV32IMAC user-mode CPU
//!
//! Guest code is decoded, lowered to a small IR a basic block at a time,
//! compiled by a [`codegen::Codegen`] backend and cached per process in a
//! [`cache::CodeCache`]. The [`dispatcher::Dispatcher`] runs blocks against
//! a thread's [`CpuContext`] and falls back to the [`interpreter`] for
//! instructions that are not worth compiling.

pub mod asm;
pub mod cache;
pub mod codegen;
mod compressed;
pub mod decode;
pub mod dispatcher;
pub mod emit;
pub mod interpreter;
pub mod ir;
pub mod translate;
pub mod trap;

pub use cache::{CacheStats, CodeCache, CompiledBlock};
pub use decode::{decode, DecodeError, ExecMode, Instruction, Op};
pub use dispatcher::{Dispatcher, RunExit};
pub use trap::Trap;

use serde::{Deserialize, Serialize};

/// Architectural state of one guest thread
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuContext {
    /// General purpose registers (x0-x31)
    pub regs: [u32; 32],
    /// Program counter
    pub pc: u32,
    /// Thread-local region base (also loaded into `tp` at thread start)
    pub tls: u32,
    /// LR/SC reservation: address and the value observed by LR
    pub reservation: Option<(u32, u32)>,
    /// Retired instruction count
    pub instret: u64,
    /// Exception raised by the last run, waiting for the kernel
    pub pending_exception: Option<Trap>,
}

impl CpuContext {
    pub fn new(entry: u32, stack_top: u32, tls: u32) -> Self {
        let mut ctx = CpuContext { pc: entry, tls, ..Default::default() };
        ctx.write_reg(2, stack_top);
        ctx.write_reg(4, tls);
        ctx
    }

    #[inline(always)]
    pub fn read_reg(&self, reg: u8) -> u32 {
        self.regs[reg as usize]
    }

    #[inline(always)]
    pub fn write_reg(&mut self, reg: u8, value: u32) {
        if reg != 0 {
            self.regs[reg as usize] = value;
        }
    }

    /// Syscall argument `n` (a0 + n)
    #[inline(always)]
    pub fn arg(&self, n: usize) -> u32 {
        self.regs[10 + n]
    }

    /// 64-bit argument passed in the register pair starting at a`n`
    pub fn arg64(&self, n: usize) -> u64 {
        self.arg(n) as u64 | (self.arg(n + 1) as u64) << 32
    }

    pub fn set_ret(&mut self, n: usize, value: u32) {
        self.regs[10 + n] = value;
    }
}
