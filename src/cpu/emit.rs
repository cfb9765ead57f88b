//! IR emission for one guest instruction

use super::decode::*;
use super::ir::{AlignFault, Counter, InstRef, IrBuilder, Terminator};
use super::trap::Trap;

/// Append the effect of `inst` to the block. Returns the terminator when
/// the instruction ends the block.
pub fn emit(inst: &Instruction, b: &mut IrBuilder, at: InstRef) -> Option<Terminator> {
    let pc = inst.addr;
    let next = inst.next_pc();
    let align = b.mode().instruction_align();

    match inst.op {
        Op::Lui { rd, imm } => {
            let v = b.constant(imm);
            b.set_reg(rd, v);
            None
        }
        Op::Auipc { rd, imm } => {
            let v = b.constant(pc.wrapping_add(imm));
            b.set_reg(rd, v);
            None
        }
        Op::Jal { rd, offset } => {
            let target = pc.wrapping_add(offset as u32);
            if target & (align - 1) != 0 {
                return Some(Terminator::Raise { trap: Trap::InstructionAddressMisaligned(target), at });
            }
            let link = b.constant(next);
            b.set_reg(rd, link);
            Some(Terminator::Jump { target })
        }
        Op::Jalr { rd, rs1, offset } => {
            let base = b.get_reg(rs1);
            let off = b.constant(offset as u32);
            let sum = b.alu(AluOp::Add, base, off);
            let mask = b.constant(!1);
            let target = b.alu(AluOp::And, sum, mask);
            b.check_align(target, align, AlignFault::Fetch, at);
            let link = b.constant(next);
            b.set_reg(rd, link);
            Some(Terminator::Indirect { target })
        }
        Op::Branch { cond, rs1, rs2, offset } => {
            let a = b.get_reg(rs1);
            let c = b.get_reg(rs2);
            let taken = b.cmp(cond, a, c);
            Some(Terminator::Branch { cond: taken, taken: pc.wrapping_add(offset as u32), not_taken: next })
        }
        Op::Load { width, rd, rs1, offset } => {
            let base = b.get_reg(rs1);
            let off = b.constant(offset as u32);
            let addr = b.alu(AluOp::Add, base, off);
            let v = b.load(width, addr, at);
            b.set_reg(rd, v);
            None
        }
        Op::Store { width, rs1, rs2, offset } => {
            let base = b.get_reg(rs1);
            let off = b.constant(offset as u32);
            let addr = b.alu(AluOp::Add, base, off);
            let v = b.get_reg(rs2);
            b.store(width, addr, v, at);
            None
        }
        Op::AluImm { op, rd, rs1, imm } => {
            let a = b.get_reg(rs1);
            let c = b.constant(imm as u32);
            let r = b.alu(op, a, c);
            b.set_reg(rd, r);
            None
        }
        Op::Alu { op, rd, rs1, rs2 } | Op::MulDiv { op, rd, rs1, rs2 } => {
            let a = b.get_reg(rs1);
            let c = b.get_reg(rs2);
            let r = b.alu(op, a, c);
            b.set_reg(rd, r);
            None
        }
        // Single-threaded visibility is already sequentially consistent
        Op::Fence => None,
        Op::FenceI => Some(Terminator::FlushICache { next }),
        Op::Ecall => Some(Terminator::Raise { trap: Trap::EnvironmentCall, at }),
        Op::Ebreak => Some(Terminator::Raise { trap: Trap::Breakpoint(pc), at }),
        Op::Csr { op, rd, src, csr } => match user_counter(op, src, csr) {
            Some(counter) => {
                let v = b.read_counter(counter, at);
                b.set_reg(rd, v);
                None
            }
            None => Some(Terminator::Raise { trap: Trap::IllegalInstruction(inst.raw), at }),
        },
        Op::LoadReserved { rd, rs1 } => {
            let addr = b.get_reg(rs1);
            b.check_align(addr, 4, AlignFault::Load, at);
            b.fallback(*inst, at, &[rs1], rd);
            None
        }
        Op::StoreConditional { rd, rs1, rs2 } | Op::Amo { rd, rs1, rs2, .. } => {
            let addr = b.get_reg(rs1);
            b.check_align(addr, 4, AlignFault::Store, at);
            b.fallback(*inst, at, &[rs1, rs2], rd);
            None
        }
    }
}

/// The read-only user counter a CSR access names, if the access is legal
/// from user mode
pub fn user_counter(op: CsrOp, src: CsrSrc, csr: u16) -> Option<Counter> {
    let writes = match (op, src) {
        (CsrOp::ReadWrite, _) => true,
        (_, CsrSrc::Reg(r)) => r != 0,
        (_, CsrSrc::Imm(i)) => i != 0,
    };
    if writes {
        return None;
    }
    match csr {
        CSR_CYCLE => Some(Counter::Cycle),
        CSR_CYCLEH => Some(Counter::CycleHigh),
        CSR_TIME => Some(Counter::Time),
        CSR_TIMEH => Some(Counter::TimeHigh),
        CSR_INSTRET => Some(Counter::Instret),
        CSR_INSTRETH => Some(Counter::InstretHigh),
        _ => None,
    }
}

/// Counter value given the retired count and the time base
#[inline]
pub fn counter_value(counter: Counter, instret: u64, ticks: u64) -> u32 {
    match counter {
        Counter::Cycle | Counter::Instret => instret as u32,
        Counter::CycleHigh | Counter::InstretHigh => (instret >> 32) as u32,
        Counter::Time => ticks as u32,
        Counter::TimeHigh => (ticks >> 32) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm;
    use crate::cpu::ir::IrOp;

    fn emit_one(raw: u32) -> (IrBuilder, Option<Terminator>) {
        let inst = decode(raw, 0x1000, ExecMode::COMPRESSED).unwrap();
        let mut b = IrBuilder::new(ExecMode::COMPRESSED);
        let term = emit(&inst, &mut b, InstRef { pc: 0x1000, index: 0 });
        (b, term)
    }

    #[test]
    fn test_jalr_checks_alignment() {
        let (b, term) = emit_one(asm::jalr(1, 5, 8));
        assert!(matches!(term, Some(Terminator::Indirect { .. })));
        let block = b.finish(0x1000, 0x1004, term.unwrap(), InstRef { pc: 0x1000, index: 0 }, 1, vec![]);
        assert!(block.ops.iter().any(|op| matches!(op, IrOp::CheckAlign { align: 2, fault: AlignFault::Fetch, .. })));
    }

    #[test]
    fn test_privileged_csr_raises() {
        // csrrw x0, mstatus, x1
        let raw = (0x300 << 20) | (1 << 15) | (FUNCT3_CSRRW << 12) | OP_SYSTEM;
        let (_, term) = emit_one(raw);
        assert!(matches!(term, Some(Terminator::Raise { trap: Trap::IllegalInstruction(r), .. }) if r == raw));
        // rdcycle a0 is fine
        let raw = ((CSR_CYCLE as u32) << 20) | (FUNCT3_CSRRS << 12) | (10 << 7) | OP_SYSTEM;
        let (_, term) = emit_one(raw);
        assert!(term.is_none());
    }

    #[test]
    fn test_amo_falls_back() {
        let raw = (FUNCT5_AMOSWAP << 27) | (12 << 20) | (11 << 15) | (0b010 << 12) | (10 << 7) | OP_AMO;
        let (b, term) = emit_one(raw);
        assert!(term.is_none());
        let block = b.finish(0x1000, 0x1004, Terminator::Fallthrough { next: 0x1004 }, InstRef { pc: 0x1000, index: 0 }, 1, vec![]);
        assert!(matches!(block.ops.last(), Some(IrOp::Fallback { .. })));
        assert_eq!(block.input_mask, (1 << 11) | (1 << 12));
        assert_eq!(block.output_mask, 1 << 10);
    }
}
