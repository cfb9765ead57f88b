//! Instruction encoders
//!
//! Used to expand compressed instructions into their 32-bit forms, and by
//! tests and the demo loader to assemble small guest programs.

use super::decode::*;

pub fn encode_i(op: u32, rd: u32, rs1: u32, funct3: u32, imm: i32) -> u32 {
    let imm_u = (imm as u32) & 0xFFF;
    (imm_u << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

pub fn encode_u(op: u32, rd: u32, imm: i32) -> u32 {
    (imm as u32 & 0xFFFFF000) | (rd << 7) | op
}

pub fn encode_r(op: u32, rd: u32, rs1: u32, rs2: u32, funct3: u32, funct7: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | op
}

pub fn encode_s(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm_u = imm as u32;
    let imm_11_5 = (imm_u >> 5) & 0x7F;
    let imm_4_0 = imm_u & 0x1F;
    (imm_11_5 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm_4_0 << 7) | op
}

pub fn encode_b(op: u32, rs1: u32, rs2: u32, funct3: u32, imm: i32) -> u32 {
    let imm_u = imm as u32;
    let imm_12 = (imm_u >> 12) & 1;
    let imm_10_5 = (imm_u >> 5) & 0x3F;
    let imm_4_1 = (imm_u >> 1) & 0xF;
    let imm_11 = (imm_u >> 11) & 1;
    (imm_12 << 31) | (imm_10_5 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) |
        (imm_4_1 << 8) | (imm_11 << 7) | op
}

pub fn encode_j(op: u32, rd: u32, imm: i32) -> u32 {
    let imm_u = imm as u32;
    let imm_20 = (imm_u >> 20) & 1;
    let imm_10_1 = (imm_u >> 1) & 0x3FF;
    let imm_11 = (imm_u >> 11) & 1;
    let imm_19_12 = (imm_u >> 12) & 0xFF;
    (imm_20 << 31) | (imm_19_12 << 12) | (imm_11 << 20) | (imm_10_1 << 21) | (rd << 7) | op
}

// Mnemonic helpers

pub fn addi(rd: u8, rs1: u8, imm: i32) -> u32 {
    encode_i(OP_OP_IMM, rd as u32, rs1 as u32, FUNCT3_ADD_SUB, imm)
}

pub fn add(rd: u8, rs1: u8, rs2: u8) -> u32 {
    encode_r(OP_OP, rd as u32, rs1 as u32, rs2 as u32, FUNCT3_ADD_SUB, 0)
}

pub fn sub(rd: u8, rs1: u8, rs2: u8) -> u32 {
    encode_r(OP_OP, rd as u32, rs1 as u32, rs2 as u32, FUNCT3_ADD_SUB, 0b0100000)
}

pub fn lui(rd: u8, imm: i32) -> u32 {
    encode_u(OP_LUI, rd as u32, imm)
}

pub fn lw(rd: u8, rs1: u8, offset: i32) -> u32 {
    encode_i(OP_LOAD, rd as u32, rs1 as u32, FUNCT3_LW, offset)
}

pub fn sw(rs1: u8, rs2: u8, offset: i32) -> u32 {
    encode_s(OP_STORE, rs1 as u32, rs2 as u32, FUNCT3_LW, offset)
}

pub fn beq(rs1: u8, rs2: u8, offset: i32) -> u32 {
    encode_b(OP_BRANCH, rs1 as u32, rs2 as u32, FUNCT3_BEQ, offset)
}

pub fn bne(rs1: u8, rs2: u8, offset: i32) -> u32 {
    encode_b(OP_BRANCH, rs1 as u32, rs2 as u32, FUNCT3_BNE, offset)
}

pub fn blt(rs1: u8, rs2: u8, offset: i32) -> u32 {
    encode_b(OP_BRANCH, rs1 as u32, rs2 as u32, FUNCT3_BLT, offset)
}

pub fn jal(rd: u8, offset: i32) -> u32 {
    encode_j(OP_JAL, rd as u32, offset)
}

pub fn jalr(rd: u8, rs1: u8, offset: i32) -> u32 {
    encode_i(OP_JALR, rd as u32, rs1 as u32, FUNCT3_ADD_SUB, offset)
}

pub fn ecall() -> u32 {
    OP_SYSTEM
}

pub fn ebreak() -> u32 {
    0x0010_0000 | OP_SYSTEM
}

pub fn fence_i() -> u32 {
    encode_i(OP_MISC_MEM, 0, 0, 0b001, 0)
}

pub fn lb(rd: u8, rs1: u8, offset: i32) -> u32 {
    encode_i(OP_LOAD, rd as u32, rs1 as u32, FUNCT3_LB, offset)
}

pub fn lbu(rd: u8, rs1: u8, offset: i32) -> u32 {
    encode_i(OP_LOAD, rd as u32, rs1 as u32, FUNCT3_LBU, offset)
}

/// Any A-extension word op by funct5 (aq/rl clear)
pub fn amo(funct5: u32, rd: u8, rs1: u8, rs2: u8) -> u32 {
    encode_r(OP_AMO, rd as u32, rs1 as u32, rs2 as u32, 0b010, funct5 << 2)
}

pub fn lr_w(rd: u8, rs1: u8) -> u32 {
    amo(FUNCT5_LR, rd, rs1, 0)
}

pub fn sc_w(rd: u8, rs1: u8, rs2: u8) -> u32 {
    amo(FUNCT5_SC, rd, rs1, rs2)
}

/// csrrs rd, csr, x0
pub fn csrr(rd: u8, csr: u16) -> u32 {
    encode_i(OP_SYSTEM, rd as u32, 0, FUNCT3_CSRRS, csr as i32)
}

/// Load a full 32-bit constant (lui + addi)
pub fn li(rd: u8, value: u32) -> [u32; 2] {
    let lo = ((value & 0xFFF) as i32) << 20 >> 20;
    let hi = value.wrapping_sub(lo as u32);
    [lui(rd, hi as i32), addi(rd, rd, lo)]
}

/// Little-endian byte image of an instruction sequence
pub fn assemble(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

/// ABI register numbers
pub mod reg {
    pub const ZERO: u8 = 0;
    pub const RA: u8 = 1;
    pub const SP: u8 = 2;
    pub const TP: u8 = 4;
    pub const T0: u8 = 5;
    pub const T1: u8 = 6;
    pub const T2: u8 = 7;
    pub const A0: u8 = 10;
    pub const A1: u8 = 11;
    pub const A2: u8 = 12;
    pub const A3: u8 = 13;
    pub const A4: u8 = 14;
    pub const A5: u8 = 15;
    pub const A6: u8 = 16;
    pub const A7: u8 = 17;
}
