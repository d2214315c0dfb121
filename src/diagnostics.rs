//! The diagnostic hook (C9): a single reporting entry point that logs
//! structured fields and never alters VM state.

use crate::vm::Vm;

/// Report an execution or translation failure. Does not mutate `vm`.
///
/// `instr` is the raw instruction word when available (the JIT driver has
/// it at emit time; the interpreter's error path may not, if the fetch
/// itself failed).
pub fn report_error(vm: &Vm, message: &str, pc: u32, instr: Option<u32>) {
    match instr {
        Some(word) => log::error!("pc={pc:#010x} instr={word:#010x}: {message}"),
        None => log::error!("pc={pc:#010x}: {message}"),
    }
    let _ = vm; // kept in the signature so integrators can inspect state to build a richer report
}

/// A debug-only diagnostic for a pre-mask out-of-bounds address. Compiled
/// to nothing in release builds; the mask is always applied regardless.
#[inline]
pub fn debug_report_unmasked_access(addr: u32, mask: u32) {
    #[cfg(debug_assertions)]
    {
        if addr > mask {
            log::debug!("access to {addr:#010x} exceeds memory size, masked to {:#010x}", addr & mask);
        }
    }
    #[cfg(not(debug_assertions))]
    {
        let _ = (addr, mask);
    }
}
