#![allow(dead_code)]

use otohle::cpu::asm::{self, reg::*};
use otohle::memory::{MemoryPermission, MemoryState};
use otohle::{Emulator, EmulatorConfig, ProcessId};

/// Scratch data page shared by host and guest
pub const DATA: u32 = 0x0020_0000;
pub const DATA_SIZE: u32 = 0x1_0000;

pub const S0: u8 = 8;
pub const S1: u8 = 9;

pub fn emulator(cores: usize) -> Emulator {
    Emulator::new(EmulatorConfig::deterministic(cores)).unwrap()
}

pub fn map_data(emu: &Emulator, pid: ProcessId) {
    emu.map(pid, DATA, DATA_SIZE, MemoryPermission::READ_WRITE, MemoryState::Normal).unwrap();
}

pub fn read_u32(emu: &Emulator, pid: ProcessId, addr: u32) -> u32 {
    let bytes = emu.read_memory(pid, addr, 4).unwrap();
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub fn write_u32(emu: &Emulator, pid: ProcessId, addr: u32, value: u32) {
    emu.write_memory(pid, addr, &value.to_le_bytes()).unwrap();
}

/// Instruction sequence with word-index labels
#[derive(Default)]
pub struct Program {
    words: Vec<u32>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, word: u32) -> &mut Self {
        self.words.push(word);
        self
    }

    pub fn li(&mut self, rd: u8, value: u32) -> &mut Self {
        self.words.extend(asm::li(rd, value));
        self
    }

    pub fn svc(&mut self, number: u32) -> &mut Self {
        self.emit(asm::addi(A7, ZERO, number as i32)).emit(asm::ecall())
    }

    /// Index of the next instruction
    pub fn label(&self) -> usize {
        self.words.len()
    }

    /// Byte offset from the next instruction back (or forward) to `label`
    pub fn offset_to(&self, label: usize) -> i32 {
        (label as i32 - self.words.len() as i32) * 4
    }

    /// Copy a 0x100-byte message from `src` to the thread's IPC buffer.
    /// Clobbers t0-t2 and a3.
    pub fn copy_to_tls(&mut self, src: u32) -> &mut Self {
        self.li(T0, src);
        self.emit(asm::addi(T1, TP, 0));
        self.emit(asm::addi(T2, ZERO, 64));
        let top = self.label();
        self.emit(asm::lw(A3, T0, 0));
        self.emit(asm::sw(T1, A3, 0));
        self.emit(asm::addi(T0, T0, 4));
        self.emit(asm::addi(T1, T1, 4));
        self.emit(asm::addi(T2, T2, -1));
        let back = self.offset_to(top);
        self.emit(asm::bne(T2, ZERO, back))
    }

    pub fn bytes(&self) -> Vec<u8> {
        asm::assemble(&self.words)
    }
}

pub fn srli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    asm::encode_i(0x13, rd as u32, rs1 as u32, 5, shamt as i32)
}

pub fn slli(rd: u8, rs1: u8, shamt: u32) -> u32 {
    asm::encode_i(0x13, rd as u32, rs1 as u32, 1, shamt as i32)
}
