//! Basic block translator
//!
//! Decodes from `entry` until an instruction ends the block or the size
//! limit is hit. Fetch faults and undecodable words become `Raise`
//! terminators; translation itself never fails.

use super::decode::{decode, is_full_width, ExecMode};
use super::emit::emit;
use super::ir::{Block, InstRef, IrBuilder, Terminator, MAX_BLOCK_INSTS, MAX_BLOCK_TEMPS};
use super::trap::Trap;
use crate::memory::{AccessKind, Bus};

/// Temps one instruction may need at most
const TEMPS_PER_INST: usize = 8;

enum Fetched {
    Word(u32, Vec<u16>),
    Fault(Trap),
}

fn fetch(bus: &mut impl Bus, pc: u32) -> Fetched {
    let low = match bus.fetch16(pc) {
        Ok(v) => v,
        Err(e) => return Fetched::Fault(Trap::from_memory(e, AccessKind::Fetch, pc)),
    };
    if !is_full_width(low) {
        return Fetched::Word(low as u32, vec![low]);
    }
    match bus.fetch16(pc.wrapping_add(2)) {
        Ok(high) => Fetched::Word(low as u32 | (high as u32) << 16, vec![low, high]),
        Err(e) => Fetched::Fault(Trap::from_memory(e, AccessKind::Fetch, pc.wrapping_add(2))),
    }
}

pub fn translate(bus: &mut impl Bus, entry: u32, mode: ExecMode, max_insts: usize) -> Block {
    let max_insts = if mode.contains(ExecMode::SINGLE_STEP) {
        1
    } else {
        max_insts.clamp(1, MAX_BLOCK_INSTS)
    };
    let mut b = IrBuilder::new(mode);
    let mut code = Vec::new();
    let mut pc = entry;
    let mut index: u16 = 0;

    loop {
        let at = InstRef { pc, index };
        let (raw, halves) = match fetch(bus, pc) {
            Fetched::Word(raw, halves) => (raw, halves),
            Fetched::Fault(trap) if index == 0 => {
                let mut block = b.finish(entry, pc, Terminator::Raise { trap, at }, at, 0, code);
                block.cacheable = false;
                return block;
            }
            // Leave the fault for the block that starts there
            Fetched::Fault(_) => {
                let last = InstRef { pc, index: index - 1 };
                return b.finish(entry, pc, Terminator::Fallthrough { next: pc }, last, index, code);
            }
        };

        let inst = match decode(raw, pc, mode) {
            Ok(inst) => inst,
            Err(_) => {
                code.extend_from_slice(&halves);
                let end = pc.wrapping_add(2 * halves.len() as u32);
                let trap = Trap::IllegalInstruction(raw);
                return b.finish(entry, end, Terminator::Raise { trap, at }, at, index, code);
            }
        };
        code.extend_from_slice(&halves);
        let next = inst.next_pc();

        if let Some(term) = emit(&inst, &mut b, at) {
            let count = match term {
                Terminator::Raise { .. } => index,
                _ => index + 1,
            };
            return b.finish(entry, next, term, at, count, code);
        }

        index += 1;
        pc = next;
        if index as usize >= max_insts || b.temps_used() + TEMPS_PER_INST > MAX_BLOCK_TEMPS {
            return b.finish(entry, next, Terminator::Fallthrough { next }, at, index, code);
        }
    }
}
