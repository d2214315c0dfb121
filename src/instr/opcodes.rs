//! RV32I opcode, funct3 and funct7 constants.
//!
//! Trimmed to the base integer subset: no RV64-only widenings (`*W`
//! opcodes), no M-extension funct7 (`0b0000001`).

pub const OP_LOAD: u32 = 0b0000011;
pub const OP_MISC_MEM: u32 = 0b0001111;
pub const OP_IMM: u32 = 0b0010011;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_STORE: u32 = 0b0100011;
pub const OP: u32 = 0b0110011;
pub const OP_LUI: u32 = 0b0110111;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_SYSTEM: u32 = 0b1110011;

pub const FUNCT3_JALR: u32 = 0b000;

pub const FUNCT3_BEQ: u32 = 0b000;
pub const FUNCT3_BNE: u32 = 0b001;
pub const FUNCT3_BLT: u32 = 0b100;
pub const FUNCT3_BGE: u32 = 0b101;
pub const FUNCT3_BLTU: u32 = 0b110;
pub const FUNCT3_BGEU: u32 = 0b111;

pub const FUNCT3_LB: u32 = 0b000;
pub const FUNCT3_LH: u32 = 0b001;
pub const FUNCT3_LW: u32 = 0b010;
pub const FUNCT3_LBU: u32 = 0b100;
pub const FUNCT3_LHU: u32 = 0b101;

pub const FUNCT3_SB: u32 = 0b000;
pub const FUNCT3_SH: u32 = 0b001;
pub const FUNCT3_SW: u32 = 0b010;

pub const FUNCT3_ADDI: u32 = 0b000;
pub const FUNCT3_SLLI: u32 = 0b001;
pub const FUNCT3_SLTI: u32 = 0b010;
pub const FUNCT3_SLTIU: u32 = 0b011;
pub const FUNCT3_XORI: u32 = 0b100;
pub const FUNCT3_SRLI_SRAI: u32 = 0b101;
pub const FUNCT3_ORI: u32 = 0b110;
pub const FUNCT3_ANDI: u32 = 0b111;

pub const FUNCT3_ADD_SUB: u32 = 0b000;
pub const FUNCT3_SLL: u32 = 0b001;
pub const FUNCT3_SLT: u32 = 0b010;
pub const FUNCT3_SLTU: u32 = 0b011;
pub const FUNCT3_XOR: u32 = 0b100;
pub const FUNCT3_SRL_SRA: u32 = 0b101;
pub const FUNCT3_OR: u32 = 0b110;
pub const FUNCT3_AND: u32 = 0b111;

pub const FUNCT7_ADD_SRL: u32 = 0b0000000;
pub const FUNCT7_SUB_SRA: u32 = 0b0100000;

pub const FUNCT3_ECALL_EBREAK: u32 = 0b000;
/// `I[31:20]` for ECALL.
pub const IMM_ECALL: u32 = 0b0000_0000_0000;
/// `I[31:20]` for EBREAK.
pub const IMM_EBREAK: u32 = 0b0000_0000_0001;
