//! Dynasm-rs native backend for x86_64
//!
//! Assembles block bodies made only of register moves, constants, simple
//! ALU ops and compares. Anything touching memory, counters or the
//! interpreter stays on the portable path.
//! Only available on native builds with the `jit-dynasm` feature.

use super::{lowered, Codegen, CodegenError, CompiledCode};
use crate::cpu::decode::AluOp;
use crate::cpu::ir::{Block, IrOp};
use tracing::warn;

/// Native backend; degrades to the portable form per block
#[derive(Default)]
pub struct NativeCodegen;

impl NativeCodegen {
    pub fn available() -> bool {
        cfg!(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))
    }
}

/// ALU ops with a direct x86 counterpart
fn native_alu(op: AluOp) -> bool {
    matches!(
        op,
        AluOp::Add
            | AluOp::Sub
            | AluOp::And
            | AluOp::Or
            | AluOp::Xor
            | AluOp::Sll
            | AluOp::Srl
            | AluOp::Sra
            | AluOp::Slt
            | AluOp::Sltu
            | AluOp::Mul
    )
}

/// Whether every body op can be assembled
pub fn can_compile(block: &Block) -> bool {
    !block.ops.is_empty()
        && block.ops.iter().all(|op| match op {
            IrOp::GetReg { .. } | IrOp::SetReg { .. } | IrOp::Const { .. } | IrOp::Cmp { .. } => true,
            IrOp::Alu { op, .. } => native_alu(*op),
            _ => false,
        })
}

impl Codegen for NativeCodegen {
    fn name(&self) -> &'static str {
        "dynasm-x64"
    }

    fn compile(&self, block: &Block) -> Result<CompiledCode, CodegenError> {
        lowered::validate(block)?;
        if !can_compile(block) {
            return Ok(CompiledCode::Lowered);
        }
        Ok(assemble(block).unwrap_or_else(|err| {
            warn!("{err}, running block portably");
            CompiledCode::Lowered
        }))
    }
}

#[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
fn assemble(block: &Block) -> Result<CompiledCode, CodegenError> {
    backend::compile_block(block).map(CompiledCode::Native)
}

#[cfg(not(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64")))]
fn assemble(_block: &Block) -> Result<CompiledCode, CodegenError> {
    Ok(CompiledCode::Lowered)
}

#[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
pub use backend::NativeBlock;

#[cfg(all(not(target_arch = "wasm32"), feature = "jit-dynasm", target_arch = "x86_64"))]
mod backend {
    use dynasm::dynasm;
    use dynasmrt::{x64::Assembler, DynasmApi, ExecutableBuffer};
    use std::mem;

    use super::super::{CodegenError, Frame};
    use crate::cpu::decode::{AluOp, BranchCond};
    use crate::cpu::ir::{Block, IrOp, Temp};

    type BlockFn = unsafe extern "sysv64" fn(*mut u32, *mut u32);

    /// Compiled native code block
    pub struct NativeBlock {
        /// Keeps the code mapped for as long as `func` may be called
        _code: ExecutableBuffer,
        /// Signature: fn(regs: *mut u32, temps: *mut u32)
        func: BlockFn,
    }

    impl NativeBlock {
        /// Run the body against the frame's shadow registers and temps
        pub(crate) fn run(&self, frame: &mut Frame) {
            // SAFETY: the body was validated, so every register index is
            // below 32 and every temp index below temp_count, which fits
            // MAX_BLOCK_TEMPS.
            unsafe { (self.func)(frame.regs.as_mut_ptr(), frame.temps.as_mut_ptr()) }
        }
    }

    #[inline(always)]
    fn reg(r: u8) -> i32 {
        r as i32 * 4
    }

    #[inline(always)]
    fn tmp(t: Temp) -> i32 {
        t.index() as i32 * 4
    }

    pub fn compile_block(block: &Block) -> Result<NativeBlock, CodegenError> {
        let entry = block.entry;
        let mut ops = Assembler::new().map_err(|_| CodegenError::Assembler { entry })?;

        // SysV: RDI = regs, RSI = temps. EAX/ECX scratch.
        for op in &block.ops {
            match *op {
                IrOp::GetReg { dst, reg: r } => {
                    dynasm!(ops
                        ; .arch x64
                        ; mov eax, [rdi + reg(r)]
                        ; mov [rsi + tmp(dst)], eax
                    );
                }
                IrOp::SetReg { reg: r, src } => {
                    dynasm!(ops
                        ; .arch x64
                        ; mov eax, [rsi + tmp(src)]
                        ; mov [rdi + reg(r)], eax
                    );
                }
                IrOp::Const { dst, value } => {
                    dynasm!(ops
                        ; .arch x64
                        ; mov DWORD [rsi + tmp(dst)], value as i32
                    );
                }
                IrOp::Alu { op, dst, a, b } => {
                    dynasm!(ops
                        ; .arch x64
                        ; mov eax, [rsi + tmp(a)]
                    );
                    match op {
                        AluOp::Add => dynasm!(ops ; .arch x64 ; add eax, [rsi + tmp(b)]),
                        AluOp::Sub => dynasm!(ops ; .arch x64 ; sub eax, [rsi + tmp(b)]),
                        AluOp::And => dynasm!(ops ; .arch x64 ; and eax, [rsi + tmp(b)]),
                        AluOp::Or => dynasm!(ops ; .arch x64 ; or eax, [rsi + tmp(b)]),
                        AluOp::Xor => dynasm!(ops ; .arch x64 ; xor eax, [rsi + tmp(b)]),
                        AluOp::Mul => dynasm!(ops ; .arch x64 ; imul eax, [rsi + tmp(b)]),
                        // x86 masks 32-bit shift counts to 5 bits, same as RV32
                        AluOp::Sll => dynasm!(ops ; .arch x64 ; mov ecx, [rsi + tmp(b)] ; shl eax, cl),
                        AluOp::Srl => dynasm!(ops ; .arch x64 ; mov ecx, [rsi + tmp(b)] ; shr eax, cl),
                        AluOp::Sra => dynasm!(ops ; .arch x64 ; mov ecx, [rsi + tmp(b)] ; sar eax, cl),
                        AluOp::Slt => dynasm!(ops
                            ; .arch x64
                            ; cmp eax, [rsi + tmp(b)]
                            ; setl al
                            ; movzx eax, al
                        ),
                        AluOp::Sltu => dynasm!(ops
                            ; .arch x64
                            ; cmp eax, [rsi + tmp(b)]
                            ; setb al
                            ; movzx eax, al
                        ),
                        _ => return Err(CodegenError::Assembler { entry }),
                    }
                    dynasm!(ops
                        ; .arch x64
                        ; mov [rsi + tmp(dst)], eax
                    );
                }
                IrOp::Cmp { cond, dst, a, b } => {
                    dynasm!(ops
                        ; .arch x64
                        ; mov eax, [rsi + tmp(a)]
                        ; cmp eax, [rsi + tmp(b)]
                    );
                    match cond {
                        BranchCond::Eq => dynasm!(ops ; .arch x64 ; sete al),
                        BranchCond::Ne => dynasm!(ops ; .arch x64 ; setne al),
                        BranchCond::Lt => dynasm!(ops ; .arch x64 ; setl al),
                        BranchCond::Ge => dynasm!(ops ; .arch x64 ; setge al),
                        BranchCond::Ltu => dynasm!(ops ; .arch x64 ; setb al),
                        BranchCond::Geu => dynasm!(ops ; .arch x64 ; setae al),
                    }
                    dynasm!(ops
                        ; .arch x64
                        ; movzx eax, al
                        ; mov [rsi + tmp(dst)], eax
                    );
                }
                _ => return Err(CodegenError::Assembler { entry }),
            }
        }

        dynasm!(ops
            ; .arch x64
            ; ret
        );

        let code = ops.finalize().map_err(|_| CodegenError::Assembler { entry })?;
        // SAFETY: the buffer holds a complete function with the BlockFn ABI
        // starting at offset 0.
        let func: BlockFn = unsafe { mem::transmute(code.ptr(dynasmrt::AssemblyOffset(0))) };

        Ok(NativeBlock { _code: code, func })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::ExecMode;
    use crate::cpu::ir::{InstRef, IrBuilder, Terminator};

    #[test]
    fn test_memory_ops_stay_portable() {
        let mut b = IrBuilder::new(ExecMode::COMPRESSED);
        let a = b.get_reg(10);
        let v = b.load(crate::cpu::decode::LoadWidth::Word, a, InstRef { pc: 0, index: 0 });
        b.set_reg(11, v);
        let block = b.finish(0, 4, Terminator::Fallthrough { next: 4 }, InstRef { pc: 0, index: 0 }, 1, vec![0, 0]);
        assert!(!can_compile(&block));
        assert!(!NativeCodegen.compile(&block).unwrap().is_native());
    }

    #[test]
    fn test_alu_block_is_native_when_available() {
        let mut b = IrBuilder::new(ExecMode::COMPRESSED);
        let a = b.get_reg(10);
        let c = b.constant(3);
        let r = b.alu(AluOp::Sll, a, c);
        b.set_reg(11, r);
        let block = b.finish(0, 4, Terminator::Fallthrough { next: 4 }, InstRef { pc: 0, index: 0 }, 1, vec![0, 0]);
        assert!(can_compile(&block));
        assert_eq!(NativeCodegen.compile(&block).unwrap().is_native(), NativeCodegen::available());
    }
}
