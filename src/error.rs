//! Crate-wide error taxonomy, one enum per failure class.

use thiserror::Error;

/// Failures that can occur while constructing a [`crate::vm::Vm`].
#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("memory size {0} is not a power of two")]
    MemoryNotPowerOfTwo(u32),
}

/// Failures while parsing and loading a flat image.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image too short: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("bad magic: expected {expected:#x}, got {actual:#x}")]
    BadMagic { expected: u32, actual: u32 },
    #[error("unsupported image: 64-bit flag is set")]
    Unsupported64Bit,
    #[error("load address {load_addr:#x} plus image contents overflow a 32-bit address space")]
    AddressOverflow { load_addr: u32 },
    #[error(transparent)]
    Construction(#[from] ConstructionError),
}

/// Failures reported by the interpreter while stepping a guest program.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("unknown opcode {opcode:#09b} at pc {pc:#x}")]
    UnknownOpcode { opcode: u32, pc: u32 },
    #[error("illegal funct3/funct7 combination ({funct3:#05b}/{funct7:#09b}) at pc {pc:#x}")]
    IllegalFunct { funct3: u32, funct7: u32, pc: u32 },
    #[error("unknown ecall subcode {subcode} (a0={a0:#x}) at pc {pc:#x}")]
    UnknownEcall { subcode: u32, a0: u32, pc: u32 },
}

/// Failures reported by the JIT driver while translating a code section.
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("executable-memory buffer exhausted after {emitted} bytes")]
    BufferExhausted { emitted: usize },
    #[error("failed to allocate executable memory: {0}")]
    AllocationFailed(String),
}
