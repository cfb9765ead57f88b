//! Execution dispatcher
//!
//! Runs one guest thread for a slice: look the block at `pc` up in the
//! process code cache, execute it, repeat until the instruction budget is
//! spent, an exception is raised or the core is asked to preempt.

use std::sync::atomic::{AtomicBool, Ordering};

use super::cache::CodeCache;
use super::codegen::{execute_block, BlockResult, CodegenError};
use super::decode::{ExecMode, Op};
use super::interpreter;
use super::trap::Trap;
use super::CpuContext;
use crate::memory::{AddressSpace, MemoryAccessor, Tlb};

/// Why a slice ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    /// Exception raised; also parked in `ctx.pending_exception`
    Trap(Trap),
    /// Instruction budget used up
    Budget,
    /// The core's preemption flag was raised
    Preempted,
    /// The block at `pc` could not be compiled
    Fatal(CodegenError),
}

pub struct Dispatcher<'a> {
    cache: &'a CodeCache,
    space: &'a AddressSpace,
    tlb: &'a mut Tlb,
    mode: ExecMode,
    interpreter_only: bool,
    ticks: u64,
}

impl<'a> Dispatcher<'a> {
    pub fn new(cache: &'a CodeCache, space: &'a AddressSpace, tlb: &'a mut Tlb) -> Self {
        Dispatcher { cache, space, tlb, mode: ExecMode::COMPRESSED, interpreter_only: false, ticks: 0 }
    }

    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Route every instruction through the interpreter
    pub fn interpreter_only(mut self, enabled: bool) -> Self {
        self.interpreter_only = enabled;
        self
    }

    /// Value of the `time` counter for this slice
    pub fn with_ticks(mut self, ticks: u64) -> Self {
        self.ticks = ticks;
        self
    }

    /// Run `ctx` until it has retired at least `budget` instructions or
    /// something needs the kernel
    pub fn run(&mut self, ctx: &mut CpuContext, budget: u64, preempt: &AtomicBool) -> RunExit {
        let start = ctx.instret;
        let mode = self.mode;
        let mut mem = MemoryAccessor::new(self.space, self.tlb).with_ticks(self.ticks);

        loop {
            if preempt.swap(false, Ordering::AcqRel) {
                return RunExit::Preempted;
            }
            if ctx.instret.wrapping_sub(start) >= budget {
                return RunExit::Budget;
            }

            if self.interpreter_only {
                let stepped = interpreter::fetch_decode(&mut mem, ctx.pc, mode)
                    .and_then(|inst| interpreter::step(ctx, &mut mem, &inst, mode).map(|_| inst));
                match stepped {
                    Ok(inst) if inst.op == Op::FenceI => self.cache.invalidate_all(),
                    Ok(_) => {}
                    Err(trap) => return raise(ctx, trap),
                }
                continue;
            }

            let compiled = match self.cache.get_or_translate(&mut mem, ctx.pc, mode) {
                Ok(compiled) => compiled,
                Err(err) => return RunExit::Fatal(err),
            };
            match execute_block(ctx, &mut mem, &compiled.block, &compiled.code) {
                BlockResult::Continue(_) => {}
                BlockResult::FlushICache(_) => self.cache.invalidate_all(),
                BlockResult::Trap(trap) => return raise(ctx, trap),
            }
        }
    }
}

fn raise(ctx: &mut CpuContext, trap: Trap) -> RunExit {
    ctx.pending_exception = Some(trap);
    RunExit::Trap(trap)
}
