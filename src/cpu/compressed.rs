//! RV32C expansion
//!
//! Maps each 16-bit encoding onto the 32-bit instruction it abbreviates.
//! Reserved and RV64-only encodings return `None`.

use super::asm::{encode_b, encode_i, encode_j, encode_r, encode_s, encode_u};
use super::decode::*;

pub fn expand_compressed(inst: u16) -> Option<u32> {
    let opcode = inst & 0b11;
    let funct3 = (inst >> 13) & 0b111;

    match (funct3, opcode) {
        (0b000, 0b00) => c_addi4spn(inst),
        (0b010, 0b00) => c_lw(inst),
        (0b110, 0b00) => c_sw(inst),

        (0b000, 0b01) => c_addi(inst),
        (0b001, 0b01) => c_jal(inst),
        (0b010, 0b01) => c_li(inst),
        (0b011, 0b01) => c_addi16sp_lui(inst),
        (0b100, 0b01) => c_alu_imm(inst),
        (0b101, 0b01) => c_j(inst),
        (0b110, 0b01) => c_beqz(inst),
        (0b111, 0b01) => c_bnez(inst),

        (0b000, 0b10) => c_slli(inst),
        (0b010, 0b10) => c_lwsp(inst),
        (0b100, 0b10) => c_misc_alu(inst),
        (0b110, 0b10) => c_swsp(inst),
        _ => None,
    }
}

fn reg_prime(val: u16) -> u32 {
    8 + (val as u32 & 0x7)
}

fn sign_extend(val: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((val << shift) as i32) >> shift
}

fn imm6(inst: u16) -> i32 {
    sign_extend(((inst as u32 >> 2) & 0x1F) | ((inst as u32 >> 12) & 1) << 5, 6)
}

/// 5-bit shift amount; bit 12 set is an RV64 encoding
fn shamt(inst: u16) -> Option<u32> {
    if (inst >> 12) & 1 != 0 {
        return None;
    }
    Some((inst as u32 >> 2) & 0x1F)
}

fn c_addi4spn(inst: u16) -> Option<u32> {
    let rd = reg_prime((inst >> 2) & 0x7);
    let imm = ((inst as u32 >> 12) & 1) << 5
        | ((inst as u32 >> 11) & 1) << 4
        | ((inst as u32 >> 7) & 0xF) << 6
        | ((inst as u32 >> 6) & 1) << 2
        | ((inst as u32 >> 5) & 1) << 3;
    if imm == 0 {
        return None;
    }
    Some(encode_i(OP_OP_IMM, rd, 2, FUNCT3_ADD_SUB, imm as i32))
}

fn c_lw(inst: u16) -> Option<u32> {
    let rd = reg_prime((inst >> 2) & 0x7);
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let imm = ((inst as u32 >> 10) & 0x7) << 3
        | ((inst as u32 >> 6) & 1) << 2
        | ((inst as u32 >> 5) & 1) << 6;
    Some(encode_i(OP_LOAD, rd, rs1, FUNCT3_LW, imm as i32))
}

fn c_sw(inst: u16) -> Option<u32> {
    let rs2 = reg_prime((inst >> 2) & 0x7);
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let imm = ((inst as u32 >> 10) & 0x7) << 3
        | ((inst as u32 >> 6) & 1) << 2
        | ((inst as u32 >> 5) & 1) << 6;
    Some(encode_s(OP_STORE, rs1, rs2, FUNCT3_LW, imm as i32))
}

fn c_addi(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_ADD_SUB, imm6(inst)))
}

fn c_jal(inst: u16) -> Option<u32> {
    Some(encode_j(OP_JAL, 1, decode_cj_imm(inst)))
}

fn c_li(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    Some(encode_i(OP_OP_IMM, rd, 0, FUNCT3_ADD_SUB, imm6(inst)))
}

fn c_addi16sp_lui(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    if rd == 2 {
        let imm = ((inst as u32 >> 12) & 1) << 9
            | ((inst as u32 >> 3) & 0x3) << 7
            | ((inst as u32 >> 5) & 1) << 6
            | ((inst as u32 >> 2) & 1) << 5
            | ((inst as u32 >> 6) & 1) << 4;
        let imm = sign_extend(imm, 10);
        if imm == 0 {
            return None;
        }
        Some(encode_i(OP_OP_IMM, 2, 2, FUNCT3_ADD_SUB, imm))
    } else {
        let imm = imm6(inst);
        if imm == 0 {
            return None;
        }
        Some(encode_u(OP_LUI, rd, imm << 12))
    }
}

fn c_alu_imm(inst: u16) -> Option<u32> {
    let subop = (inst >> 10) & 0x3;
    let rs1 = reg_prime((inst >> 7) & 0x7);

    match subop {
        0b00 => Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_SRL_SRA, shamt(inst)? as i32)),
        0b01 => Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_SRL_SRA, 0x400 | shamt(inst)? as i32)),
        0b10 => Some(encode_i(OP_OP_IMM, rs1, rs1, FUNCT3_AND, imm6(inst))),
        _ => c_alu_reg(inst),
    }
}

fn c_alu_reg(inst: u16) -> Option<u32> {
    // c.subw / c.addw are RV64 only
    if (inst >> 12) & 1 != 0 {
        return None;
    }
    let rs1 = reg_prime((inst >> 7) & 0x7);
    let rs2 = reg_prime((inst >> 2) & 0x7);
    let (funct3, funct7) = match (inst >> 5) & 0x3 {
        0b00 => (FUNCT3_ADD_SUB, 0b0100000),
        0b01 => (FUNCT3_XOR, 0b0000000),
        0b10 => (FUNCT3_OR, 0b0000000),
        _ => (FUNCT3_AND, 0b0000000),
    };
    Some(encode_r(OP_OP, rs1, rs1, rs2, funct3, funct7))
}

fn c_j(inst: u16) -> Option<u32> {
    Some(encode_j(OP_JAL, 0, decode_cj_imm(inst)))
}

fn c_beqz(inst: u16) -> Option<u32> {
    let rs1 = reg_prime((inst >> 7) & 0x7);
    Some(encode_b(OP_BRANCH, rs1, 0, FUNCT3_BEQ, decode_cb_imm(inst)))
}

fn c_bnez(inst: u16) -> Option<u32> {
    let rs1 = reg_prime((inst >> 7) & 0x7);
    Some(encode_b(OP_BRANCH, rs1, 0, FUNCT3_BNE, decode_cb_imm(inst)))
}

fn c_slli(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    Some(encode_i(OP_OP_IMM, rd, rd, FUNCT3_SLL, shamt(inst)? as i32))
}

fn c_lwsp(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    if rd == 0 {
        return None;
    }
    let imm = ((inst as u32 >> 12) & 1) << 5
        | ((inst as u32 >> 4) & 0x7) << 2
        | ((inst as u32 >> 2) & 0x3) << 6;
    Some(encode_i(OP_LOAD, rd, 2, FUNCT3_LW, imm as i32))
}

fn c_misc_alu(inst: u16) -> Option<u32> {
    let rd = ((inst >> 7) & 0x1F) as u32;
    let rs2 = ((inst >> 2) & 0x1F) as u32;
    let bit12 = (inst >> 12) & 1;

    match (bit12, rd, rs2) {
        (0, 0, 0) => None,
        // c.jr
        (0, _, 0) => Some(encode_i(OP_JALR, 0, rd, FUNCT3_ADD_SUB, 0)),
        // c.mv
        (0, _, _) => Some(encode_r(OP_OP, rd, 0, rs2, FUNCT3_ADD_SUB, 0)),
        // c.ebreak
        (_, 0, 0) => Some(0x0010_0073),
        // c.jalr
        (_, _, 0) => Some(encode_i(OP_JALR, 1, rd, FUNCT3_ADD_SUB, 0)),
        // c.add
        _ => Some(encode_r(OP_OP, rd, rd, rs2, FUNCT3_ADD_SUB, 0)),
    }
}

fn c_swsp(inst: u16) -> Option<u32> {
    let rs2 = ((inst >> 2) & 0x1F) as u32;
    let imm = ((inst as u32 >> 9) & 0xF) << 2
        | ((inst as u32 >> 7) & 0x3) << 6;
    Some(encode_s(OP_STORE, 2, rs2, FUNCT3_LW, imm as i32))
}

fn decode_cj_imm(inst: u16) -> i32 {
    let imm = ((inst as u32 >> 12) & 1) << 11
        | ((inst as u32 >> 8) & 0x1) << 10
        | ((inst as u32 >> 9) & 0x3) << 8
        | ((inst as u32 >> 6) & 0x1) << 7
        | ((inst as u32 >> 7) & 0x1) << 6
        | ((inst as u32 >> 2) & 0x1) << 5
        | ((inst as u32 >> 11) & 0x1) << 4
        | ((inst as u32 >> 3) & 0x7) << 1;
    sign_extend(imm, 12)
}

fn decode_cb_imm(inst: u16) -> i32 {
    let imm = ((inst as u32 >> 12) & 1) << 8
        | ((inst as u32 >> 5) & 0x3) << 6
        | ((inst as u32 >> 2) & 0x1) << 5
        | ((inst as u32 >> 10) & 0x3) << 3
        | ((inst as u32 >> 3) & 0x3) << 1;
    sign_extend(imm, 9)
}
