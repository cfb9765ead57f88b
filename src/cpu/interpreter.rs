//! Reference interpreter
//!
//! Executes one decoded instruction straight against a `CpuContext`. Used
//! for `Fallback` ops, for the interpreter-only configuration and as the
//! oracle the compiled path is checked against.

use super::decode::*;
use super::emit::{counter_value, user_counter};
use super::ir::AlignFault;
use super::trap::Trap;
use super::CpuContext;
use crate::memory::{AccessKind, Bus};

/// Fetch and decode the instruction at `pc`
pub fn fetch_decode(bus: &mut impl Bus, pc: u32, mode: ExecMode) -> Result<Instruction, Trap> {
    let low = bus.fetch16(pc).map_err(|e| Trap::from_memory(e, AccessKind::Fetch, pc))?;
    let raw = if is_full_width(low) {
        let high_addr = pc.wrapping_add(2);
        let high = bus.fetch16(high_addr).map_err(|e| Trap::from_memory(e, AccessKind::Fetch, high_addr))?;
        low as u32 | (high as u32) << 16
    } else {
        low as u32
    };
    decode(raw, pc, mode).map_err(|_| Trap::IllegalInstruction(raw))
}

/// Execute `inst` and retire it
#[inline]
pub fn step(ctx: &mut CpuContext, bus: &mut impl Bus, inst: &Instruction, mode: ExecMode) -> Result<(), Trap> {
    execute(ctx, bus, inst, mode)?;
    ctx.instret += 1;
    Ok(())
}

/// Execute `inst` without touching `instret`. On error the context is left
/// exactly as before the instruction, with `pc` still pointing at it.
pub fn execute(ctx: &mut CpuContext, bus: &mut impl Bus, inst: &Instruction, mode: ExecMode) -> Result<(), Trap> {
    let pc = inst.addr;
    let next = inst.next_pc();
    let align = mode.instruction_align();
    let mut new_pc = next;

    match inst.op {
        Op::Lui { rd, imm } => ctx.write_reg(rd, imm),
        Op::Auipc { rd, imm } => ctx.write_reg(rd, pc.wrapping_add(imm)),
        Op::Jal { rd, offset } => {
            let target = pc.wrapping_add(offset as u32);
            check_target(target, align)?;
            ctx.write_reg(rd, next);
            new_pc = target;
        }
        Op::Jalr { rd, rs1, offset } => {
            let target = ctx.read_reg(rs1).wrapping_add(offset as u32) & !1;
            check_target(target, align)?;
            ctx.write_reg(rd, next);
            new_pc = target;
        }
        Op::Branch { cond, rs1, rs2, offset } => {
            if cond.evaluate(ctx.read_reg(rs1), ctx.read_reg(rs2)) {
                let target = pc.wrapping_add(offset as u32);
                check_target(target, align)?;
                new_pc = target;
            }
        }
        Op::Load { width, rd, rs1, offset } => {
            let addr = ctx.read_reg(rs1).wrapping_add(offset as u32);
            let value = load(bus, width, addr)?;
            ctx.write_reg(rd, value);
        }
        Op::Store { width, rs1, rs2, offset } => {
            let addr = ctx.read_reg(rs1).wrapping_add(offset as u32);
            store(bus, width, addr, ctx.read_reg(rs2))?;
        }
        Op::AluImm { op, rd, rs1, imm } => {
            let v = op.apply(ctx.read_reg(rs1), imm as u32);
            ctx.write_reg(rd, v);
        }
        Op::Alu { op, rd, rs1, rs2 } | Op::MulDiv { op, rd, rs1, rs2 } => {
            let v = op.apply(ctx.read_reg(rs1), ctx.read_reg(rs2));
            ctx.write_reg(rd, v);
        }
        Op::Fence | Op::FenceI => {}
        Op::Ecall => return Err(Trap::EnvironmentCall),
        Op::Ebreak => return Err(Trap::Breakpoint(pc)),
        Op::Csr { op, rd, src, csr } => {
            let counter = user_counter(op, src, csr).ok_or(Trap::IllegalInstruction(inst.raw))?;
            ctx.write_reg(rd, counter_value(counter, ctx.instret, bus.ticks()));
        }
        Op::LoadReserved { rd, rs1 } => {
            let addr = ctx.read_reg(rs1);
            check_data_align(addr, AlignFault::Load)?;
            let value = load(bus, LoadWidth::Word, addr)?;
            ctx.reservation = Some((addr, value));
            ctx.write_reg(rd, value);
        }
        Op::StoreConditional { rd, rs1, rs2 } => {
            let addr = ctx.read_reg(rs1);
            check_data_align(addr, AlignFault::Store)?;
            let success = match ctx.reservation {
                Some((reserved, expected)) if reserved == addr => bus
                    .compare_exchange32(addr, expected, ctx.read_reg(rs2))
                    .map_err(|e| Trap::from_memory(e, AccessKind::Store, addr))?
                    .is_ok(),
                _ => {
                    // A failing SC still needs a writable address
                    bus.read32(addr).map_err(|e| Trap::from_memory(e, AccessKind::Store, addr))?;
                    false
                }
            };
            ctx.reservation = None;
            ctx.write_reg(rd, if success { 0 } else { 1 });
        }
        Op::Amo { op, rd, rs1, rs2 } => {
            let addr = ctx.read_reg(rs1);
            check_data_align(addr, AlignFault::Store)?;
            let src = ctx.read_reg(rs2);
            let mut old = bus.read32(addr).map_err(|e| Trap::from_memory(e, AccessKind::Store, addr))?;
            loop {
                let result = bus
                    .compare_exchange32(addr, old, op.apply(old, src))
                    .map_err(|e| Trap::from_memory(e, AccessKind::Store, addr))?;
                match result {
                    Ok(_) => break,
                    Err(actual) => old = actual,
                }
            }
            ctx.write_reg(rd, old);
        }
    }

    ctx.pc = new_pc;
    Ok(())
}

#[inline(always)]
fn check_target(target: u32, align: u32) -> Result<(), Trap> {
    if target & (align - 1) != 0 {
        return Err(Trap::InstructionAddressMisaligned(target));
    }
    Ok(())
}

#[inline(always)]
fn check_data_align(addr: u32, fault: AlignFault) -> Result<(), Trap> {
    if addr & 3 != 0 {
        return Err(fault.trap(addr));
    }
    Ok(())
}

/// Sign- or zero-extended guest load
#[inline(always)]
pub fn load(bus: &mut impl Bus, width: LoadWidth, addr: u32) -> Result<u32, Trap> {
    let fault = |e| Trap::from_memory(e, AccessKind::Load, addr);
    Ok(match width {
        LoadWidth::Byte => bus.read8(addr).map_err(fault)? as i8 as i32 as u32,
        LoadWidth::Half => bus.read16(addr).map_err(fault)? as i16 as i32 as u32,
        LoadWidth::Word => bus.read32(addr).map_err(fault)?,
        LoadWidth::ByteUnsigned => bus.read8(addr).map_err(fault)? as u32,
        LoadWidth::HalfUnsigned => bus.read16(addr).map_err(fault)? as u32,
    })
}

#[inline(always)]
pub fn store(bus: &mut impl Bus, width: StoreWidth, addr: u32, value: u32) -> Result<(), Trap> {
    let fault = |e| Trap::from_memory(e, AccessKind::Store, addr);
    match width {
        StoreWidth::Byte => bus.write8(addr, value as u8).map_err(fault),
        StoreWidth::Half => bus.write16(addr, value as u16).map_err(fault),
        StoreWidth::Word => bus.write32(addr, value).map_err(fault),
    }
}
