//! Block IR
//!
//! Straight-line SSA over virtual temporaries. Every temp is defined
//! exactly once, before any use. Guest registers are only touched through
//! `GetReg`/`SetReg`, which is what the register masks are built from.

use super::decode::{AluOp, BranchCond, ExecMode, Instruction, LoadWidth, Reg, StoreWidth};
use super::trap::Trap;

/// Upper bound on temps in one block
pub const MAX_BLOCK_TEMPS: usize = 512;
/// Upper bound on guest instructions in one block
pub const MAX_BLOCK_INSTS: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Temp(pub u16);

impl Temp {
    #[inline(always)]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Position of a guest instruction inside its block; used to restore `pc`
/// and `instret` when the instruction faults
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InstRef {
    pub pc: u32,
    /// Instructions retired in the block before this one
    pub index: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlignFault {
    Fetch,
    Load,
    Store,
}

impl AlignFault {
    pub fn trap(self, addr: u32) -> Trap {
        match self {
            AlignFault::Fetch => Trap::InstructionAddressMisaligned(addr),
            AlignFault::Load => Trap::LoadAddressMisaligned(addr),
            AlignFault::Store => Trap::StoreAddressMisaligned(addr),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    Cycle,
    CycleHigh,
    Time,
    TimeHigh,
    Instret,
    InstretHigh,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IrOp {
    GetReg { dst: Temp, reg: Reg },
    SetReg { reg: Reg, src: Temp },
    Const { dst: Temp, value: u32 },
    Alu { op: AluOp, dst: Temp, a: Temp, b: Temp },
    /// `dst = cond(a, b) as u32`
    Cmp { cond: BranchCond, dst: Temp, a: Temp, b: Temp },
    Load { width: LoadWidth, dst: Temp, addr: Temp, at: InstRef },
    Store { width: StoreWidth, addr: Temp, value: Temp, at: InstRef },
    /// Raise the alignment fault unless `addr` is a multiple of `align`
    CheckAlign { addr: Temp, align: u32, fault: AlignFault, at: InstRef },
    ReadCounter { counter: Counter, dst: Temp, at: InstRef },
    /// Run the instruction through the interpreter against the live context
    Fallback { inst: Instruction, at: InstRef },
}

/// How control leaves a block
#[derive(Clone, Debug, PartialEq)]
pub enum Terminator {
    Jump { target: u32 },
    Branch { cond: Temp, taken: u32, not_taken: u32 },
    Indirect { target: Temp },
    Raise { trap: Trap, at: InstRef },
    /// `fence.i`: drop cached translations, then continue at `next`
    FlushICache { next: u32 },
    /// Block cut short (size limit or a fetch fault ahead)
    Fallthrough { next: u32 },
}

#[derive(Clone, Debug)]
pub struct Block {
    pub entry: u32,
    pub mode: ExecMode,
    /// Exclusive end of the guest bytes the block was built from
    pub end: u32,
    pub ops: Vec<IrOp>,
    pub terminator: Terminator,
    /// The instruction owning the terminator
    pub last: InstRef,
    /// Statically known successor addresses
    pub successors: Vec<u32>,
    /// Registers read before being written
    pub input_mask: u32,
    /// Registers written
    pub output_mask: u32,
    /// Instructions retired when the terminator is reached
    pub inst_count: u16,
    pub temp_count: u16,
    /// Halfwords the block was decoded from, for revalidation
    pub code: Vec<u16>,
    /// False when the block encodes a transient condition (fetch fault)
    pub cacheable: bool,
}

impl Block {
    /// Registers the runtime must load before running the body
    #[inline(always)]
    pub fn load_mask(&self) -> u32 {
        self.input_mask | self.output_mask
    }
}

pub struct IrBuilder {
    ops: Vec<IrOp>,
    next_temp: u16,
    input_mask: u32,
    output_mask: u32,
    mode: ExecMode,
}

impl IrBuilder {
    pub fn new(mode: ExecMode) -> Self {
        IrBuilder { ops: Vec::with_capacity(64), next_temp: 0, input_mask: 0, output_mask: 0, mode }
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn temps_used(&self) -> usize {
        self.next_temp as usize
    }

    fn temp(&mut self) -> Temp {
        let t = Temp(self.next_temp);
        self.next_temp += 1;
        t
    }

    pub fn get_reg(&mut self, reg: Reg) -> Temp {
        if reg == 0 {
            return self.constant(0);
        }
        let bit = 1u32 << reg;
        if self.output_mask & bit == 0 {
            self.input_mask |= bit;
        }
        let dst = self.temp();
        self.ops.push(IrOp::GetReg { dst, reg });
        dst
    }

    pub fn set_reg(&mut self, reg: Reg, src: Temp) {
        if reg == 0 {
            return;
        }
        self.output_mask |= 1 << reg;
        self.ops.push(IrOp::SetReg { reg, src });
    }

    pub fn constant(&mut self, value: u32) -> Temp {
        let dst = self.temp();
        self.ops.push(IrOp::Const { dst, value });
        dst
    }

    pub fn alu(&mut self, op: AluOp, a: Temp, b: Temp) -> Temp {
        let dst = self.temp();
        self.ops.push(IrOp::Alu { op, dst, a, b });
        dst
    }

    pub fn cmp(&mut self, cond: BranchCond, a: Temp, b: Temp) -> Temp {
        let dst = self.temp();
        self.ops.push(IrOp::Cmp { cond, dst, a, b });
        dst
    }

    pub fn load(&mut self, width: LoadWidth, addr: Temp, at: InstRef) -> Temp {
        let dst = self.temp();
        self.ops.push(IrOp::Load { width, dst, addr, at });
        dst
    }

    pub fn store(&mut self, width: StoreWidth, addr: Temp, value: Temp, at: InstRef) {
        self.ops.push(IrOp::Store { width, addr, value, at });
    }

    pub fn check_align(&mut self, addr: Temp, align: u32, fault: AlignFault, at: InstRef) {
        self.ops.push(IrOp::CheckAlign { addr, align, fault, at });
    }

    pub fn read_counter(&mut self, counter: Counter, at: InstRef) -> Temp {
        let dst = self.temp();
        self.ops.push(IrOp::ReadCounter { counter, dst, at });
        dst
    }

    /// Interpreter call-out. `reads` and `write` feed the register masks so
    /// the runtime keeps the live context coherent around the call.
    pub fn fallback(&mut self, inst: Instruction, at: InstRef, reads: &[Reg], write: Reg) {
        for &reg in reads {
            let bit = 1u32 << reg;
            if reg != 0 && self.output_mask & bit == 0 {
                self.input_mask |= bit;
            }
        }
        if write != 0 {
            self.output_mask |= 1 << write;
        }
        self.ops.push(IrOp::Fallback { inst, at });
    }

    pub fn finish(self, entry: u32, end: u32, terminator: Terminator, last: InstRef, inst_count: u16, code: Vec<u16>) -> Block {
        let successors = match &terminator {
            Terminator::Jump { target } => vec![*target],
            Terminator::Branch { taken, not_taken, .. } => vec![*taken, *not_taken],
            Terminator::FlushICache { next } | Terminator::Fallthrough { next } => vec![*next],
            Terminator::Indirect { .. } | Terminator::Raise { .. } => Vec::new(),
        };
        Block {
            entry,
            mode: self.mode,
            end,
            ops: self.ops,
            terminator,
            last,
            successors,
            input_mask: self.input_mask,
            output_mask: self.output_mask,
            inst_count,
            temp_count: self.next_temp,
            code,
            cacheable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_follow_op_order() {
        let mut b = IrBuilder::new(ExecMode::empty());
        // x5 read before written -> input; x6 written then read -> output only
        let a = b.get_reg(5);
        b.set_reg(6, a);
        let c = b.get_reg(6);
        b.set_reg(5, c);
        let zero = b.get_reg(0);
        b.set_reg(0, zero);
        let at = InstRef { pc: 0, index: 0 };
        let block = b.finish(0, 4, Terminator::Fallthrough { next: 4 }, at, 1, vec![0, 0]);
        assert_eq!(block.input_mask, 1 << 5);
        assert_eq!(block.output_mask, (1 << 5) | (1 << 6));
        assert_eq!(block.temp_count, 3);
        assert_eq!(block.successors, vec![4]);
    }
}
