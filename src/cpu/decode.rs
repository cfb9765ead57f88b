//! Instruction decoder
//!
//! Decodes RV32IMAC instructions into a closed [`Op`] enum. Compressed
//! encodings are expanded to their 32-bit equivalents first and keep
//! `len == 2`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::compressed::expand_compressed;

pub type Reg = u8;

bitflags! {
    /// Execution mode a block was translated under; part of the cache key
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ExecMode: u8 {
        /// C extension enabled
        const COMPRESSED = 1 << 0;
        /// One instruction per block
        const SINGLE_STEP = 1 << 1;
    }
}

impl ExecMode {
    /// Required alignment of jump targets
    #[inline(always)]
    pub fn instruction_align(self) -> u32 {
        if self.contains(ExecMode::COMPRESSED) { 2 } else { 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown instruction {0:#010x}")]
    UnknownInstruction(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AluOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
}

impl AluOp {
    #[inline(always)]
    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Sll => a << (b & 0x1F),
            AluOp::Slt => ((a as i32) < (b as i32)) as u32,
            AluOp::Sltu => (a < b) as u32,
            AluOp::Xor => a ^ b,
            AluOp::Srl => a >> (b & 0x1F),
            AluOp::Sra => ((a as i32) >> (b & 0x1F)) as u32,
            AluOp::Or => a | b,
            AluOp::And => a & b,
            AluOp::Mul => a.wrapping_mul(b),
            AluOp::Mulh => ((a as i32 as i64 * b as i32 as i64) >> 32) as u32,
            AluOp::Mulhsu => ((a as i32 as i64 * b as u64 as i64) >> 32) as u32,
            AluOp::Mulhu => ((a as u64 * b as u64) >> 32) as u32,
            AluOp::Div => {
                if b == 0 {
                    u32::MAX
                } else if a == 0x8000_0000 && b == u32::MAX {
                    a
                } else {
                    ((a as i32) / (b as i32)) as u32
                }
            }
            AluOp::Divu => {
                if b == 0 { u32::MAX } else { a / b }
            }
            AluOp::Rem => {
                if b == 0 {
                    a
                } else if a == 0x8000_0000 && b == u32::MAX {
                    0
                } else {
                    ((a as i32) % (b as i32)) as u32
                }
            }
            AluOp::Remu => {
                if b == 0 { a } else { a % b }
            }
        }
    }

    /// Part of the M extension
    pub fn is_muldiv(self) -> bool {
        matches!(
            self,
            AluOp::Mul | AluOp::Mulh | AluOp::Mulhsu | AluOp::Mulhu | AluOp::Div | AluOp::Divu | AluOp::Rem | AluOp::Remu
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BranchCond {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl BranchCond {
    #[inline(always)]
    pub fn evaluate(self, a: u32, b: u32) -> bool {
        match self {
            BranchCond::Eq => a == b,
            BranchCond::Ne => a != b,
            BranchCond::Lt => (a as i32) < (b as i32),
            BranchCond::Ge => (a as i32) >= (b as i32),
            BranchCond::Ltu => a < b,
            BranchCond::Geu => a >= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadWidth {
    Byte,
    Half,
    Word,
    ByteUnsigned,
    HalfUnsigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreWidth {
    Byte,
    Half,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    Minu,
    Maxu,
}

impl AmoOp {
    /// Value stored back given the loaded word and rs2
    #[inline(always)]
    pub fn apply(self, old: u32, src: u32) -> u32 {
        match self {
            AmoOp::Swap => src,
            AmoOp::Add => old.wrapping_add(src),
            AmoOp::Xor => old ^ src,
            AmoOp::And => old & src,
            AmoOp::Or => old | src,
            AmoOp::Min => (old as i32).min(src as i32) as u32,
            AmoOp::Max => (old as i32).max(src as i32) as u32,
            AmoOp::Minu => old.min(src),
            AmoOp::Maxu => old.max(src),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CsrSrc {
    Reg(Reg),
    Imm(u8),
}

/// Instruction class with its operands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Lui { rd: Reg, imm: u32 },
    Auipc { rd: Reg, imm: u32 },
    Jal { rd: Reg, offset: i32 },
    Jalr { rd: Reg, rs1: Reg, offset: i32 },
    Branch { cond: BranchCond, rs1: Reg, rs2: Reg, offset: i32 },
    Load { width: LoadWidth, rd: Reg, rs1: Reg, offset: i32 },
    Store { width: StoreWidth, rs1: Reg, rs2: Reg, offset: i32 },
    AluImm { op: AluOp, rd: Reg, rs1: Reg, imm: i32 },
    Alu { op: AluOp, rd: Reg, rs1: Reg, rs2: Reg },
    MulDiv { op: AluOp, rd: Reg, rs1: Reg, rs2: Reg },
    Fence,
    FenceI,
    Ecall,
    Ebreak,
    Csr { op: CsrOp, rd: Reg, src: CsrSrc, csr: u16 },
    LoadReserved { rd: Reg, rs1: Reg },
    StoreConditional { rd: Reg, rs1: Reg, rs2: Reg },
    Amo { op: AmoOp, rd: Reg, rs1: Reg, rs2: Reg },
}

/// A decoded guest instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instruction {
    /// Guest address
    pub addr: u32,
    /// Original encoding (low 16 bits only for compressed)
    pub raw: u32,
    /// Encoded length in bytes (2 or 4)
    pub len: u8,
    pub op: Op,
}

impl Instruction {
    #[inline(always)]
    pub fn next_pc(&self) -> u32 {
        self.addr.wrapping_add(self.len as u32)
    }
}

/// Whether the low halfword starts a 32-bit encoding
#[inline(always)]
pub fn is_full_width(low: u16) -> bool {
    low & 0b11 == 0b11
}

/// Decode one instruction. `raw` holds the low halfword for compressed
/// encodings (upper bits ignored) or the full word otherwise.
pub fn decode(raw: u32, addr: u32, mode: ExecMode) -> Result<Instruction, DecodeError> {
    if !is_full_width(raw as u16) {
        let half = raw as u16;
        if !mode.contains(ExecMode::COMPRESSED) {
            return Err(DecodeError::UnknownInstruction(half as u32));
        }
        let expanded = expand_compressed(half).ok_or(DecodeError::UnknownInstruction(half as u32))?;
        let op = decode_op(expanded).ok_or(DecodeError::UnknownInstruction(half as u32))?;
        return Ok(Instruction { addr, raw: half as u32, len: 2, op });
    }
    let op = decode_op(raw).ok_or(DecodeError::UnknownInstruction(raw))?;
    Ok(Instruction { addr, raw, len: 4, op })
}

fn decode_op(inst: u32) -> Option<Op> {
    let opcode = inst & 0x7F;
    let rd = ((inst >> 7) & 0x1F) as Reg;
    let rs1 = ((inst >> 15) & 0x1F) as Reg;
    let rs2 = ((inst >> 20) & 0x1F) as Reg;
    let funct3 = (inst >> 12) & 0x7;
    let funct7 = (inst >> 25) & 0x7F;

    let imm_i = (inst as i32) >> 20;
    let imm_s = ((inst & 0xFE000000) as i32 >> 20) | ((inst >> 7) & 0x1F) as i32;
    let imm_b = ((inst & 0x80000000) as i32 >> 19)
        | (((inst >> 7) & 1) << 11) as i32
        | (((inst >> 25) & 0x3F) << 5) as i32
        | (((inst >> 8) & 0xF) << 1) as i32;
    let imm_u = inst & 0xFFFFF000;
    let imm_j = ((inst & 0x80000000) as i32 >> 11)
        | (inst & 0xFF000) as i32
        | (((inst >> 20) & 1) << 11) as i32
        | (((inst >> 21) & 0x3FF) << 1) as i32;

    let op = match opcode {
        OP_LUI => Op::Lui { rd, imm: imm_u },
        OP_AUIPC => Op::Auipc { rd, imm: imm_u },
        OP_JAL => Op::Jal { rd, offset: imm_j },
        OP_JALR if funct3 == 0 => Op::Jalr { rd, rs1, offset: imm_i },
        OP_BRANCH => {
            let cond = match funct3 {
                FUNCT3_BEQ => BranchCond::Eq,
                FUNCT3_BNE => BranchCond::Ne,
                FUNCT3_BLT => BranchCond::Lt,
                FUNCT3_BGE => BranchCond::Ge,
                FUNCT3_BLTU => BranchCond::Ltu,
                FUNCT3_BGEU => BranchCond::Geu,
                _ => return None,
            };
            Op::Branch { cond, rs1, rs2, offset: imm_b }
        }
        OP_LOAD => {
            let width = match funct3 {
                FUNCT3_LB => LoadWidth::Byte,
                FUNCT3_LH => LoadWidth::Half,
                FUNCT3_LW => LoadWidth::Word,
                FUNCT3_LBU => LoadWidth::ByteUnsigned,
                FUNCT3_LHU => LoadWidth::HalfUnsigned,
                _ => return None,
            };
            Op::Load { width, rd, rs1, offset: imm_i }
        }
        OP_STORE => {
            let width = match funct3 {
                FUNCT3_LB => StoreWidth::Byte,
                FUNCT3_LH => StoreWidth::Half,
                FUNCT3_LW => StoreWidth::Word,
                _ => return None,
            };
            Op::Store { width, rs1, rs2, offset: imm_s }
        }
        OP_OP_IMM => {
            let shamt = (inst >> 20) & 0x1F;
            let (op, imm) = match funct3 {
                FUNCT3_ADD_SUB => (AluOp::Add, imm_i),
                FUNCT3_SLT => (AluOp::Slt, imm_i),
                FUNCT3_SLTU => (AluOp::Sltu, imm_i),
                FUNCT3_XOR => (AluOp::Xor, imm_i),
                FUNCT3_OR => (AluOp::Or, imm_i),
                FUNCT3_AND => (AluOp::And, imm_i),
                FUNCT3_SLL if funct7 == 0 => (AluOp::Sll, shamt as i32),
                FUNCT3_SRL_SRA if funct7 == 0 => (AluOp::Srl, shamt as i32),
                FUNCT3_SRL_SRA if funct7 == 0b0100000 => (AluOp::Sra, shamt as i32),
                _ => return None,
            };
            Op::AluImm { op, rd, rs1, imm }
        }
        OP_OP => match funct7 {
            0b0000000 | 0b0100000 => {
                let op = match (funct3, funct7) {
                    (FUNCT3_ADD_SUB, 0) => AluOp::Add,
                    (FUNCT3_ADD_SUB, 0b0100000) => AluOp::Sub,
                    (FUNCT3_SLL, 0) => AluOp::Sll,
                    (FUNCT3_SLT, 0) => AluOp::Slt,
                    (FUNCT3_SLTU, 0) => AluOp::Sltu,
                    (FUNCT3_XOR, 0) => AluOp::Xor,
                    (FUNCT3_SRL_SRA, 0) => AluOp::Srl,
                    (FUNCT3_SRL_SRA, 0b0100000) => AluOp::Sra,
                    (FUNCT3_OR, 0) => AluOp::Or,
                    (FUNCT3_AND, 0) => AluOp::And,
                    _ => return None,
                };
                Op::Alu { op, rd, rs1, rs2 }
            }
            0b0000001 => {
                let op = match funct3 {
                    FUNCT3_MUL => AluOp::Mul,
                    FUNCT3_MULH => AluOp::Mulh,
                    FUNCT3_MULHSU => AluOp::Mulhsu,
                    FUNCT3_MULHU => AluOp::Mulhu,
                    FUNCT3_DIV => AluOp::Div,
                    FUNCT3_DIVU => AluOp::Divu,
                    FUNCT3_REM => AluOp::Rem,
                    _ => AluOp::Remu,
                };
                Op::MulDiv { op, rd, rs1, rs2 }
            }
            _ => return None,
        },
        OP_MISC_MEM => match funct3 {
            0b000 => Op::Fence,
            0b001 => Op::FenceI,
            _ => return None,
        },
        OP_SYSTEM => {
            let csr = (inst >> 20) as u16;
            match funct3 {
                FUNCT3_PRIV if inst == 0x0000_0073 => Op::Ecall,
                FUNCT3_PRIV if inst == 0x0010_0073 => Op::Ebreak,
                FUNCT3_CSRRW => Op::Csr { op: CsrOp::ReadWrite, rd, src: CsrSrc::Reg(rs1), csr },
                FUNCT3_CSRRS => Op::Csr { op: CsrOp::ReadSet, rd, src: CsrSrc::Reg(rs1), csr },
                FUNCT3_CSRRC => Op::Csr { op: CsrOp::ReadClear, rd, src: CsrSrc::Reg(rs1), csr },
                FUNCT3_CSRRWI => Op::Csr { op: CsrOp::ReadWrite, rd, src: CsrSrc::Imm(rs1), csr },
                FUNCT3_CSRRSI => Op::Csr { op: CsrOp::ReadSet, rd, src: CsrSrc::Imm(rs1), csr },
                FUNCT3_CSRRCI => Op::Csr { op: CsrOp::ReadClear, rd, src: CsrSrc::Imm(rs1), csr },
                _ => return None,
            }
        }
        OP_AMO if funct3 == 0b010 => {
            let funct5 = inst >> 27;
            match funct5 {
                FUNCT5_LR if rs2 == 0 => Op::LoadReserved { rd, rs1 },
                FUNCT5_SC => Op::StoreConditional { rd, rs1, rs2 },
                _ => {
                    let op = match funct5 {
                        FUNCT5_AMOSWAP => AmoOp::Swap,
                        FUNCT5_AMOADD => AmoOp::Add,
                        FUNCT5_AMOXOR => AmoOp::Xor,
                        FUNCT5_AMOAND => AmoOp::And,
                        FUNCT5_AMOOR => AmoOp::Or,
                        FUNCT5_AMOMIN => AmoOp::Min,
                        FUNCT5_AMOMAX => AmoOp::Max,
                        FUNCT5_AMOMINU => AmoOp::Minu,
                        FUNCT5_AMOMAXU => AmoOp::Maxu,
                        _ => return None,
                    };
                    Op::Amo { op, rd, rs1, rs2 }
                }
            }
        }
        _ => return None,
    };
    Some(op)
}

// Opcodes
pub const OP_LUI: u32 = 0b0110111;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_LOAD: u32 = 0b0000011;
pub const OP_STORE: u32 = 0b0100011;
pub const OP_OP_IMM: u32 = 0b0010011;
pub const OP_OP: u32 = 0b0110011;
pub const OP_MISC_MEM: u32 = 0b0001111;
pub const OP_SYSTEM: u32 = 0b1110011;
pub const OP_AMO: u32 = 0b0101111;

// Branch funct3
pub const FUNCT3_BEQ: u32 = 0b000;
pub const FUNCT3_BNE: u32 = 0b001;
pub const FUNCT3_BLT: u32 = 0b100;
pub const FUNCT3_BGE: u32 = 0b101;
pub const FUNCT3_BLTU: u32 = 0b110;
pub const FUNCT3_BGEU: u32 = 0b111;

// Load/Store funct3
pub const FUNCT3_LB: u32 = 0b000;
pub const FUNCT3_LH: u32 = 0b001;
pub const FUNCT3_LW: u32 = 0b010;
pub const FUNCT3_LBU: u32 = 0b100;
pub const FUNCT3_LHU: u32 = 0b101;

// ALU funct3
pub const FUNCT3_ADD_SUB: u32 = 0b000;
pub const FUNCT3_SLL: u32 = 0b001;
pub const FUNCT3_SLT: u32 = 0b010;
pub const FUNCT3_SLTU: u32 = 0b011;
pub const FUNCT3_XOR: u32 = 0b100;
pub const FUNCT3_SRL_SRA: u32 = 0b101;
pub const FUNCT3_OR: u32 = 0b110;
pub const FUNCT3_AND: u32 = 0b111;

// M extension funct3
pub const FUNCT3_MUL: u32 = 0b000;
pub const FUNCT3_MULH: u32 = 0b001;
pub const FUNCT3_MULHSU: u32 = 0b010;
pub const FUNCT3_MULHU: u32 = 0b011;
pub const FUNCT3_DIV: u32 = 0b100;
pub const FUNCT3_DIVU: u32 = 0b101;
pub const FUNCT3_REM: u32 = 0b110;
pub const FUNCT3_REMU: u32 = 0b111;

// System funct3
pub const FUNCT3_PRIV: u32 = 0b000;
pub const FUNCT3_CSRRW: u32 = 0b001;
pub const FUNCT3_CSRRS: u32 = 0b010;
pub const FUNCT3_CSRRC: u32 = 0b011;
pub const FUNCT3_CSRRWI: u32 = 0b101;
pub const FUNCT3_CSRRSI: u32 = 0b110;
pub const FUNCT3_CSRRCI: u32 = 0b111;

// AMO funct5
pub const FUNCT5_LR: u32 = 0b00010;
pub const FUNCT5_SC: u32 = 0b00011;
pub const FUNCT5_AMOSWAP: u32 = 0b00001;
pub const FUNCT5_AMOADD: u32 = 0b00000;
pub const FUNCT5_AMOXOR: u32 = 0b00100;
pub const FUNCT5_AMOAND: u32 = 0b01100;
pub const FUNCT5_AMOOR: u32 = 0b01000;
pub const FUNCT5_AMOMIN: u32 = 0b10000;
pub const FUNCT5_AMOMAX: u32 = 0b10100;
pub const FUNCT5_AMOMINU: u32 = 0b11000;
pub const FUNCT5_AMOMAXU: u32 = 0b11100;

// User counters
pub const CSR_CYCLE: u16 = 0xC00;
pub const CSR_TIME: u16 = 0xC01;
pub const CSR_INSTRET: u16 = 0xC02;
pub const CSR_CYCLEH: u16 = 0xC80;
pub const CSR_TIMEH: u16 = 0xC81;
pub const CSR_INSTRETH: u16 = 0xC82;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::asm::{self, reg::*};
    use proptest::prelude::*;

    #[test]
    fn test_decode_basic() {
        let inst = decode(asm::addi(A0, A1, -5), 0x1000, ExecMode::empty()).unwrap();
        assert_eq!(inst.op, Op::AluImm { op: AluOp::Add, rd: 10, rs1: 11, imm: -5 });
        assert_eq!(inst.len, 4);
        assert_eq!(inst.next_pc(), 0x1004);

        let inst = decode(asm::bne(T0, T1, -8), 0, ExecMode::empty()).unwrap();
        assert_eq!(inst.op, Op::Branch { cond: BranchCond::Ne, rs1: 5, rs2: 6, offset: -8 });

        let inst = decode(asm::jal(RA, 2048), 0, ExecMode::empty()).unwrap();
        assert_eq!(inst.op, Op::Jal { rd: 1, offset: 2048 });

        assert_eq!(decode(asm::ecall(), 0, ExecMode::empty()).unwrap().op, Op::Ecall);
        assert_eq!(decode(asm::fence_i(), 0, ExecMode::empty()).unwrap().op, Op::FenceI);
    }

    #[test]
    fn test_decode_amo() {
        // amoadd.w a0, a2, (a1)
        let raw = (FUNCT5_AMOADD << 27) | (12 << 20) | (11 << 15) | (0b010 << 12) | (10 << 7) | OP_AMO;
        let inst = decode(raw, 0, ExecMode::empty()).unwrap();
        assert_eq!(inst.op, Op::Amo { op: AmoOp::Add, rd: 10, rs1: 11, rs2: 12 });
        // lr.w with nonzero rs2 is reserved
        let raw = (FUNCT5_LR << 27) | (1 << 20) | (11 << 15) | (0b010 << 12) | (10 << 7) | OP_AMO;
        assert!(decode(raw, 0, ExecMode::empty()).is_err());
    }

    #[test]
    fn test_compressed_needs_mode() {
        // c.li a0, 3
        let half = 0x450D;
        assert_eq!(decode(half, 0, ExecMode::empty()), Err(DecodeError::UnknownInstruction(half)));
        let inst = decode(half, 0x2000, ExecMode::COMPRESSED).unwrap();
        assert_eq!(inst.len, 2);
        assert_eq!(inst.op, Op::AluImm { op: AluOp::Add, rd: 10, rs1: 0, imm: 3 });
        assert_eq!(inst.next_pc(), 0x2002);
    }

    #[test]
    fn test_unknown_rejected() {
        assert_eq!(decode(0xFFFF_FFFF, 0, ExecMode::empty()), Err(DecodeError::UnknownInstruction(0xFFFF_FFFF)));
        // mret is privileged and not part of the user ISA
        assert!(decode(0x3020_0073, 0, ExecMode::empty()).is_err());
    }

    #[test]
    fn test_division_edge_cases() {
        assert_eq!(AluOp::Div.apply(7, 0), u32::MAX);
        assert_eq!(AluOp::Rem.apply(7, 0), 7);
        assert_eq!(AluOp::Div.apply(0x8000_0000, u32::MAX), 0x8000_0000);
        assert_eq!(AluOp::Rem.apply(0x8000_0000, u32::MAX), 0);
        assert_eq!(AluOp::Mulh.apply(u32::MAX, u32::MAX), 0);
        assert_eq!(AluOp::Mulhu.apply(u32::MAX, u32::MAX), 0xFFFF_FFFE);
    }

    proptest! {
        #[test]
        fn prop_decode_is_pure(raw in any::<u32>(), addr in any::<u32>()) {
            let addr = addr & !1;
            let a = decode(raw, addr, ExecMode::COMPRESSED);
            let b = decode(raw, addr, ExecMode::COMPRESSED);
            prop_assert_eq!(a, b);
        }
    }
}
