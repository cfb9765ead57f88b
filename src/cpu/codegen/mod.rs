//! Code generation backends
//!
//! A backend turns a translated [`Block`] into [`CompiledCode`]. Two exist:
//! - `PortableCodegen`: validated IR run by a tight loop over a shadow
//!   register file. Always available, including wasm32.
//! - `NativeCodegen` (feature `jit-dynasm`, x86_64 only): register/ALU-only
//!   bodies assembled to host code with dynasm-rs. Anything else falls back
//!   to the portable form.
//!
//! Terminators are always evaluated by [`execute_block`] in Rust.

mod dynasm;
mod lowered;

use std::sync::Arc;

use thiserror::Error;

use super::ir::{Block, InstRef, Terminator, MAX_BLOCK_TEMPS};
use super::trap::Trap;
use super::CpuContext;
use crate::memory::Bus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodegenError {
    #[error("block at {entry:#010x} needs {count} temps (limit {MAX_BLOCK_TEMPS})")]
    TooManyTemps { entry: u32, count: usize },
    #[error("temp t{temp} read before definition in block at {entry:#010x}")]
    UndefinedTemp { entry: u32, temp: u16 },
    #[error("temp t{temp} defined twice in block at {entry:#010x}")]
    Redefined { entry: u32, temp: u16 },
    #[error("register x{reg} out of range in block at {entry:#010x}")]
    BadRegister { entry: u32, reg: u8 },
    #[error("native assembler failed for block at {entry:#010x}")]
    Assembler { entry: u32 },
}

pub enum CompiledCode {
    /// Validated IR interpreted op by op
    Lowered,
    /// Host machine code for the body
    #[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
    Native(dynasm::NativeBlock),
}

impl CompiledCode {
    pub fn is_native(&self) -> bool {
        !matches!(self, CompiledCode::Lowered)
    }
}

pub trait Codegen: Send + Sync {
    fn name(&self) -> &'static str;
    fn compile(&self, block: &Block) -> Result<CompiledCode, CodegenError>;
}

/// Portable backend; see [`lowered`]
#[derive(Default)]
pub struct PortableCodegen;

impl Codegen for PortableCodegen {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn compile(&self, block: &Block) -> Result<CompiledCode, CodegenError> {
        lowered::validate(block)?;
        Ok(CompiledCode::Lowered)
    }
}

pub use self::dynasm::NativeCodegen;

/// Best backend available in this build
pub fn default_backend() -> Arc<dyn Codegen> {
    if NativeCodegen::available() {
        Arc::new(NativeCodegen)
    } else {
        Arc::new(PortableCodegen)
    }
}

/// How a block handed control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockResult {
    /// Continue at the given pc
    Continue(u32),
    /// Exception raised; `pc` points at the faulting instruction
    Trap(Trap),
    /// `fence.i` retired; the code cache must be flushed before continuing
    FlushICache(u32),
}

/// Shadow state a block body runs against
pub(crate) struct Frame {
    pub regs: [u32; 32],
    pub temps: [u32; MAX_BLOCK_TEMPS],
}

impl Frame {
    fn load(ctx: &CpuContext, mask: u32) -> Self {
        let mut frame = Frame { regs: [0; 32], temps: [0; MAX_BLOCK_TEMPS] };
        frame.reload(ctx, mask);
        frame
    }

    pub(crate) fn reload(&mut self, ctx: &CpuContext, mask: u32) {
        let mut bits = mask & !1;
        while bits != 0 {
            let r = bits.trailing_zeros() as usize;
            self.regs[r] = ctx.regs[r];
            bits &= bits - 1;
        }
    }

    pub(crate) fn store(&self, ctx: &mut CpuContext, mask: u32) {
        let mut bits = mask & !1;
        while bits != 0 {
            let r = bits.trailing_zeros() as usize;
            ctx.regs[r] = self.regs[r];
            bits &= bits - 1;
        }
    }
}

/// Run one compiled block against `ctx`
pub fn execute_block(ctx: &mut CpuContext, bus: &mut impl Bus, block: &Block, code: &CompiledCode) -> BlockResult {
    let mut frame = Frame::load(ctx, block.load_mask());

    let body = match code {
        CompiledCode::Lowered => lowered::run_body(ctx, bus, block, &mut frame),
        #[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
        CompiledCode::Native(native) => {
            native.run(&mut frame);
            Ok(())
        }
    };
    frame.store(ctx, block.output_mask);

    if let Err((trap, at)) = body {
        return raise(ctx, trap, at);
    }

    let align_mask = block.mode.instruction_align() - 1;
    let retired = block.inst_count as u64;
    match block.terminator {
        Terminator::Jump { target } | Terminator::Fallthrough { next: target } => {
            ctx.pc = target;
            ctx.instret += retired;
            BlockResult::Continue(target)
        }
        Terminator::Branch { cond, taken, not_taken } => {
            let target = if frame.temps[cond.index()] != 0 { taken } else { not_taken };
            if target & align_mask != 0 {
                return raise(ctx, Trap::InstructionAddressMisaligned(target), block.last);
            }
            ctx.pc = target;
            ctx.instret += retired;
            BlockResult::Continue(target)
        }
        Terminator::Indirect { target } => {
            let target = frame.temps[target.index()];
            ctx.pc = target;
            ctx.instret += retired;
            BlockResult::Continue(target)
        }
        Terminator::Raise { trap, at } => raise(ctx, trap, at),
        Terminator::FlushICache { next } => {
            ctx.pc = next;
            ctx.instret += retired;
            BlockResult::FlushICache(next)
        }
    }
}

fn raise(ctx: &mut CpuContext, trap: Trap, at: InstRef) -> BlockResult {
    ctx.pc = at.pc;
    ctx.instret += at.index as u64;
    BlockResult::Trap(trap)
}
