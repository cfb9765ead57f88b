//! Portable backend: validated IR run over a shadow register file

use super::{CodegenError, Frame};
use crate::cpu::emit::counter_value;
use crate::cpu::interpreter;
use crate::cpu::ir::{Block, InstRef, IrOp, Temp, Terminator, MAX_BLOCK_TEMPS};
use crate::cpu::trap::Trap;
use crate::cpu::CpuContext;
use crate::memory::Bus;

/// Check the SSA shape the runtime relies on: every temp in range, defined
/// once and before any use.
pub(super) fn validate(block: &Block) -> Result<(), CodegenError> {
    let entry = block.entry;
    let count = block.temp_count as usize;
    if count > MAX_BLOCK_TEMPS {
        return Err(CodegenError::TooManyTemps { entry, count });
    }

    let mut defined = vec![false; count];
    let use_temp = |defined: &[bool], t: Temp| -> Result<(), CodegenError> {
        match defined.get(t.index()) {
            Some(true) => Ok(()),
            _ => Err(CodegenError::UndefinedTemp { entry, temp: t.0 }),
        }
    };
    let def_temp = |defined: &mut [bool], t: Temp| -> Result<(), CodegenError> {
        match defined.get_mut(t.index()) {
            Some(slot) if !*slot => {
                *slot = true;
                Ok(())
            }
            Some(_) => Err(CodegenError::Redefined { entry, temp: t.0 }),
            None => Err(CodegenError::TooManyTemps { entry, count: t.index() + 1 }),
        }
    };
    let check_reg = |reg: u8| {
        if reg < 32 {
            Ok(())
        } else {
            Err(CodegenError::BadRegister { entry, reg })
        }
    };

    for op in &block.ops {
        match *op {
            IrOp::GetReg { dst, reg } => {
                check_reg(reg)?;
                def_temp(&mut defined, dst)?;
            }
            IrOp::SetReg { reg, src } => {
                check_reg(reg)?;
                use_temp(&defined, src)?;
            }
            IrOp::Const { dst, .. } | IrOp::ReadCounter { dst, .. } => def_temp(&mut defined, dst)?,
            IrOp::Alu { dst, a, b, .. } | IrOp::Cmp { dst, a, b, .. } => {
                use_temp(&defined, a)?;
                use_temp(&defined, b)?;
                def_temp(&mut defined, dst)?;
            }
            IrOp::Load { dst, addr, .. } => {
                use_temp(&defined, addr)?;
                def_temp(&mut defined, dst)?;
            }
            IrOp::Store { addr, value, .. } => {
                use_temp(&defined, addr)?;
                use_temp(&defined, value)?;
            }
            IrOp::CheckAlign { addr, .. } => use_temp(&defined, addr)?,
            IrOp::Fallback { .. } => {}
        }
    }

    match block.terminator {
        Terminator::Branch { cond, .. } => use_temp(&defined, cond),
        Terminator::Indirect { target } => use_temp(&defined, target),
        _ => Ok(()),
    }
}

/// Run the body ops. On a fault the frame holds everything the retired
/// instructions wrote and the offending instruction is returned with the
/// trap.
pub(super) fn run_body(
    ctx: &mut CpuContext,
    bus: &mut impl Bus,
    block: &Block,
    frame: &mut Frame,
) -> Result<(), (Trap, InstRef)> {
    let t = &mut frame.temps;
    let regs = &mut frame.regs;

    for op in &block.ops {
        match *op {
            IrOp::GetReg { dst, reg } => t[dst.index()] = regs[reg as usize],
            IrOp::SetReg { reg, src } => regs[reg as usize] = t[src.index()],
            IrOp::Const { dst, value } => t[dst.index()] = value,
            IrOp::Alu { op, dst, a, b } => t[dst.index()] = op.apply(t[a.index()], t[b.index()]),
            IrOp::Cmp { cond, dst, a, b } => t[dst.index()] = cond.evaluate(t[a.index()], t[b.index()]) as u32,
            IrOp::Load { width, dst, addr, at } => {
                t[dst.index()] = interpreter::load(bus, width, t[addr.index()]).map_err(|trap| (trap, at))?;
            }
            IrOp::Store { width, addr, value, at } => {
                interpreter::store(bus, width, t[addr.index()], t[value.index()]).map_err(|trap| (trap, at))?;
            }
            IrOp::CheckAlign { addr, align, fault, at } => {
                let addr = t[addr.index()];
                if addr & (align - 1) != 0 {
                    return Err((fault.trap(addr), at));
                }
            }
            IrOp::ReadCounter { counter, dst, at } => {
                t[dst.index()] = counter_value(counter, ctx.instret + at.index as u64, bus.ticks());
            }
            IrOp::Fallback { ref inst, at } => {
                // The interpreter works on the live context
                for r in 1..32 {
                    if block.output_mask & (1 << r) != 0 {
                        ctx.regs[r] = regs[r];
                    }
                }
                ctx.pc = at.pc;
                interpreter::execute(ctx, bus, inst, block.mode).map_err(|trap| (trap, at))?;
                for r in 1..32 {
                    if block.load_mask() & (1 << r) != 0 {
                        regs[r] = ctx.regs[r];
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::decode::{AluOp, ExecMode};
    use crate::cpu::ir::IrBuilder;

    fn finish(b: IrBuilder, term: Terminator) -> Block {
        let at = InstRef { pc: 0x1000, index: 0 };
        b.finish(0x1000, 0x1004, term, at, 1, vec![0, 0])
    }

    #[test]
    fn test_validate_accepts_builder_output() {
        let mut b = IrBuilder::new(ExecMode::COMPRESSED);
        let x = b.get_reg(10);
        let y = b.constant(4);
        let z = b.alu(AluOp::Add, x, y);
        b.set_reg(11, z);
        assert!(validate(&finish(b, Terminator::Indirect { target: z })).is_ok());
    }

    #[test]
    fn test_validate_rejects_dangling_terminator() {
        let mut b = IrBuilder::new(ExecMode::COMPRESSED);
        b.constant(1);
        let block = finish(b, Terminator::Indirect { target: Temp(7) });
        assert_eq!(validate(&block), Err(CodegenError::UndefinedTemp { entry: 0x1000, temp: 7 }));
    }

    #[test]
    fn test_validate_rejects_redefinition() {
        let mut b = IrBuilder::new(ExecMode::COMPRESSED);
        b.constant(1);
        let mut block = finish(b, Terminator::Fallthrough { next: 0x1004 });
        block.ops.push(IrOp::Const { dst: Temp(0), value: 2 });
        assert_eq!(validate(&block), Err(CodegenError::Redefined { entry: 0x1000, temp: 0 }));
    }
}
