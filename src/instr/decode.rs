//! The instruction codec (C1): field extraction, sign-extension, and the
//! [`Instr`] enum both execution engines match on.

use crate::error::ExecutionError;
use crate::util::{bits, sext};

use super::opcodes::*;

/// Width and signedness of a load/store, shared by both engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    Byte,
    Halfword,
    Word,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOp {
    Eq,
    Ne,
    Lt,
    Ge,
    LtU,
    GeU,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Slt,
    SltU,
    Xor,
    Or,
    And,
    Sll,
    Srl,
    Sra,
}

/// A fully decoded RV32I instruction. Fields are already extracted and
/// sign-extended; neither engine needs to touch the raw 32-bit word again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    Lui { rd: u8, imm: i32 },
    Auipc { rd: u8, imm: i32 },
    Jal { rd: u8, imm: i32 },
    Jalr { rd: u8, rs1: u8, imm: i32 },
    Branch { op: BranchOp, rs1: u8, rs2: u8, imm: i32 },
    Load { width: Width, signed: bool, rd: u8, rs1: u8, imm: i32 },
    Store { width: Width, rs1: u8, rs2: u8, imm: i32 },
    AluImm { op: AluOp, rd: u8, rs1: u8, imm: i32 },
    ShiftImm { op: AluOp, rd: u8, rs1: u8, shamt: u32 },
    AluReg { op: AluOp, rd: u8, rs1: u8, rs2: u8 },
    Fence,
    Ecall,
    Ebreak,
}

fn rd(word: u32) -> u8 {
    bits(word, 11, 7) as u8
}
fn rs1(word: u32) -> u8 {
    bits(word, 19, 15) as u8
}
fn rs2(word: u32) -> u8 {
    bits(word, 24, 20) as u8
}
fn funct3(word: u32) -> u32 {
    bits(word, 14, 12)
}
fn funct7(word: u32) -> u32 {
    bits(word, 31, 25)
}
fn opcode(word: u32) -> u32 {
    bits(word, 6, 0)
}

fn imm_i(word: u32) -> i32 {
    sext(bits(word, 31, 20), 12)
}
fn imm_s(word: u32) -> i32 {
    let raw = (bits(word, 31, 25) << 5) | bits(word, 11, 7);
    sext(raw, 12)
}
fn imm_u(word: u32) -> i32 {
    (bits(word, 31, 12) << 12) as i32
}
fn imm_b(word: u32) -> i32 {
    let raw = (bits(word, 31, 31) << 12)
        | (bits(word, 7, 7) << 11)
        | (bits(word, 30, 25) << 5)
        | (bits(word, 11, 8) << 1);
    sext(raw, 13)
}
fn imm_j(word: u32) -> i32 {
    let raw = (bits(word, 31, 31) << 20)
        | (bits(word, 19, 12) << 12)
        | (bits(word, 20, 20) << 11)
        | (bits(word, 30, 21) << 1);
    sext(raw, 21)
}

/// Decode a 32-bit instruction word, or report the unknown-opcode /
/// illegal-funct error the interpreter and JIT driver both surface the
/// same way.
pub fn decode(word: u32, pc: u32) -> Result<Instr, ExecutionError> {
    let op = opcode(word);
    let f3 = funct3(word);
    let f7 = funct7(word);

    Ok(match op {
        OP_LUI => Instr::Lui { rd: rd(word), imm: imm_u(word) },
        OP_AUIPC => Instr::Auipc { rd: rd(word), imm: imm_u(word) },
        OP_JAL => Instr::Jal { rd: rd(word), imm: imm_j(word) },
        OP_JALR if f3 == FUNCT3_JALR => {
            Instr::Jalr { rd: rd(word), rs1: rs1(word), imm: imm_i(word) }
        }
        OP_BRANCH => {
            let branch_op = match f3 {
                FUNCT3_BEQ => BranchOp::Eq,
                FUNCT3_BNE => BranchOp::Ne,
                FUNCT3_BLT => BranchOp::Lt,
                FUNCT3_BGE => BranchOp::Ge,
                FUNCT3_BLTU => BranchOp::LtU,
                FUNCT3_BGEU => BranchOp::GeU,
                _ => return Err(ExecutionError::IllegalFunct { funct3: f3, funct7: f7, pc }),
            };
            Instr::Branch { op: branch_op, rs1: rs1(word), rs2: rs2(word), imm: imm_b(word) }
        }
        OP_LOAD => {
            let (width, signed) = match f3 {
                FUNCT3_LB => (Width::Byte, true),
                FUNCT3_LH => (Width::Halfword, true),
                FUNCT3_LW => (Width::Word, true),
                FUNCT3_LBU => (Width::Byte, false),
                FUNCT3_LHU => (Width::Halfword, false),
                _ => return Err(ExecutionError::IllegalFunct { funct3: f3, funct7: f7, pc }),
            };
            Instr::Load { width, signed, rd: rd(word), rs1: rs1(word), imm: imm_i(word) }
        }
        OP_STORE => {
            let width = match f3 {
                FUNCT3_SB => Width::Byte,
                FUNCT3_SH => Width::Halfword,
                FUNCT3_SW => Width::Word,
                _ => return Err(ExecutionError::IllegalFunct { funct3: f3, funct7: f7, pc }),
            };
            Instr::Store { width, rs1: rs1(word), rs2: rs2(word), imm: imm_s(word) }
        }
        OP_IMM => match f3 {
            FUNCT3_ADDI => Instr::AluImm { op: AluOp::Add, rd: rd(word), rs1: rs1(word), imm: imm_i(word) },
            FUNCT3_SLTI => Instr::AluImm { op: AluOp::Slt, rd: rd(word), rs1: rs1(word), imm: imm_i(word) },
            FUNCT3_SLTIU => Instr::AluImm { op: AluOp::SltU, rd: rd(word), rs1: rs1(word), imm: imm_i(word) },
            FUNCT3_XORI => Instr::AluImm { op: AluOp::Xor, rd: rd(word), rs1: rs1(word), imm: imm_i(word) },
            FUNCT3_ORI => Instr::AluImm { op: AluOp::Or, rd: rd(word), rs1: rs1(word), imm: imm_i(word) },
            FUNCT3_ANDI => Instr::AluImm { op: AluOp::And, rd: rd(word), rs1: rs1(word), imm: imm_i(word) },
            FUNCT3_SLLI if f7 == FUNCT7_ADD_SRL => {
                Instr::ShiftImm { op: AluOp::Sll, rd: rd(word), rs1: rs1(word), shamt: bits(word, 24, 20) }
            }
            FUNCT3_SRLI_SRAI if f7 == FUNCT7_ADD_SRL => {
                Instr::ShiftImm { op: AluOp::Srl, rd: rd(word), rs1: rs1(word), shamt: bits(word, 24, 20) }
            }
            FUNCT3_SRLI_SRAI if f7 == FUNCT7_SUB_SRA => {
                Instr::ShiftImm { op: AluOp::Sra, rd: rd(word), rs1: rs1(word), shamt: bits(word, 24, 20) }
            }
            _ => return Err(ExecutionError::IllegalFunct { funct3: f3, funct7: f7, pc }),
        },
        OP => {
            let alu_op = match (f3, f7) {
                (FUNCT3_ADD_SUB, FUNCT7_ADD_SRL) => AluOp::Add,
                (FUNCT3_ADD_SUB, FUNCT7_SUB_SRA) => AluOp::Sub,
                (FUNCT3_SLT, FUNCT7_ADD_SRL) => AluOp::Slt,
                (FUNCT3_SLTU, FUNCT7_ADD_SRL) => AluOp::SltU,
                (FUNCT3_XOR, FUNCT7_ADD_SRL) => AluOp::Xor,
                (FUNCT3_OR, FUNCT7_ADD_SRL) => AluOp::Or,
                (FUNCT3_AND, FUNCT7_ADD_SRL) => AluOp::And,
                (FUNCT3_SLL, FUNCT7_ADD_SRL) => AluOp::Sll,
                (FUNCT3_SRL_SRA, FUNCT7_ADD_SRL) => AluOp::Srl,
                (FUNCT3_SRL_SRA, FUNCT7_SUB_SRA) => AluOp::Sra,
                _ => return Err(ExecutionError::IllegalFunct { funct3: f3, funct7: f7, pc }),
            };
            Instr::AluReg { op: alu_op, rd: rd(word), rs1: rs1(word), rs2: rs2(word) }
        }
        OP_MISC_MEM => Instr::Fence,
        OP_SYSTEM if f3 == FUNCT3_ECALL_EBREAK => match bits(word, 31, 20) {
            IMM_ECALL => Instr::Ecall,
            IMM_EBREAK => Instr::Ebreak,
            _ => return Err(ExecutionError::IllegalFunct { funct3: f3, funct7: f7, pc }),
        },
        _ => return Err(ExecutionError::UnknownOpcode { opcode: op, pc }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn i_type(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    #[test]
    fn decodes_add() {
        let w = r_type(FUNCT7_ADD_SRL, 2, 1, FUNCT3_ADD_SUB, 3, OP);
        assert_eq!(
            decode(w, 0).unwrap(),
            Instr::AluReg { op: AluOp::Add, rd: 3, rs1: 1, rs2: 2 }
        );
    }

    #[test]
    fn decodes_sub_vs_add_by_funct7() {
        let w = r_type(FUNCT7_SUB_SRA, 2, 1, FUNCT3_ADD_SUB, 3, OP);
        assert_eq!(
            decode(w, 0).unwrap(),
            Instr::AluReg { op: AluOp::Sub, rd: 3, rs1: 1, rs2: 2 }
        );
    }

    #[test]
    fn decodes_addi_sign_extended_negative() {
        let w = i_type(0xFFF, 1, FUNCT3_ADDI, 2, OP_IMM);
        assert_eq!(
            decode(w, 0).unwrap(),
            Instr::AluImm { op: AluOp::Add, rd: 2, rs1: 1, imm: -1 }
        );
    }

    #[test]
    fn decodes_sltiu_with_sign_extended_immediate() {
        let w = i_type(0xFFF, 1, FUNCT3_SLTIU, 2, OP_IMM);
        // imm bits are all ones -> sign-extends to -1 (0xFFFFFFFF unsigned).
        assert_eq!(
            decode(w, 0).unwrap(),
            Instr::AluImm { op: AluOp::SltU, rd: 2, rs1: 1, imm: -1 }
        );
    }

    #[test]
    fn decodes_lui_upper_bits_only() {
        let w = (0xDEADB_u32 << 12) | (5 << 7) | OP_LUI;
        assert_eq!(decode(w, 0).unwrap(), Instr::Lui { rd: 5, imm: 0xDEADB000_u32 as i32 });
    }

    #[test]
    fn unknown_opcode_errors() {
        let w = 0b1111111;
        assert!(matches!(decode(w, 0x1000), Err(ExecutionError::UnknownOpcode { pc: 0x1000, .. })));
    }

    #[test]
    fn illegal_funct_on_op_errors() {
        let w = r_type(0b0000001, 2, 1, FUNCT3_ADD_SUB, 3, OP); // M-extension funct7, not RV32I
        assert!(matches!(decode(w, 0), Err(ExecutionError::IllegalFunct { .. })));
    }

    #[test]
    fn ecall_and_ebreak_distinguished() {
        let ecall = (IMM_ECALL << 20) | OP_SYSTEM;
        let ebreak = (IMM_EBREAK << 20) | OP_SYSTEM;
        assert_eq!(decode(ecall, 0).unwrap(), Instr::Ecall);
        assert_eq!(decode(ebreak, 0).unwrap(), Instr::Ebreak);
    }
}
