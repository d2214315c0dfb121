//! The ahead-of-execution x86 (32-bit) JIT: translate the whole guest
//! code section once, then run the result as native code until it halts.

pub mod codegen;
pub mod dispatch;
pub mod driver;
pub mod emit;
pub mod exec_mem;

pub use driver::run;
