//! The JIT driver (C7): translates an entire code section once, then runs
//! the result as ordinary native code until it halts.
//!
//! Translation happens in a single pass with no re-emission: the
//! executable buffer is allocated first (fixing its host address), and
//! every absolute address the generated code needs -- the memory base,
//! the dispatch table base, the ecall trampoline -- is baked in as a
//! literal as each instruction is emitted. This only works because the
//! buffer's address is already final before a single byte is written.

use std::cell::RefCell;

use crate::ecall::{EcallHandler, EcallOutcome, HostIo};
use crate::error::{ExecutionError, TranslationError};
use crate::instr::decode;
use crate::interpreter::HaltReason;
use crate::vm::Vm;

use super::codegen::{
    self, CodegenCtx, EpilogPatches, PC_SLOT_DISP, STATUS_CONTINUE, STATUS_EBREAK, STATUS_ERROR,
    STATUS_EXIT, STATUS_FELL_THROUGH,
};
use super::dispatch::DispatchTable;
use super::emit::{Emitter, Reg, VMPTR};
use super::exec_mem::ExecBuffer;

/// Upper bound on the bytes a single instruction's snippet can emit.
/// `gen_store`'s four-byte loop is the largest: masked base address (18)
/// plus value load (6) plus four 25-byte iterations (100) comes to 124;
/// rounded up with headroom so one emission pass never has to resize.
const MAX_SNIPPET_BYTES: usize = 160;
const PROLOG_BYTES: usize = 24;
const EPILOG_BYTES: usize = 8;

/// Guest CPU image laid out exactly the way generated code expects to
/// find it through `VMPTR`: 32 registers, then `pc` at
/// [`PC_SLOT_DISP`].
#[repr(C)]
struct CpuImage {
    regs: [u32; 32],
    pc: u32,
}

const _: () = assert!(PC_SLOT_DISP as usize == std::mem::size_of::<[u32; 32]>());

struct TrampolineState {
    ecall: *mut dyn EcallHandler,
    io: *mut dyn HostIo,
    exit_code: Option<u8>,
    last_error: Option<ExecutionError>,
}

thread_local! {
    static TRAMPOLINE_STATE: RefCell<Option<TrampolineState>> = RefCell::new(None);
}

/// The only function whose address generated code ever calls. Reads
/// `a7`/`a0`/`pc` straight out of the CPU image (no `Vm` exists on this
/// side of the call) and dispatches to whatever `EcallHandler`/`HostIo`
/// pair `run` installed in [`TRAMPOLINE_STATE`] for the duration of the
/// call.
extern "C" fn ecall_trampoline(cpu: *mut u32) -> u32 {
    // Safety: `cpu` points at a live `CpuImage` for the duration of this
    // call; register 17 is a7, register 10 is a0, and the pc slot sits
    // at word index 32, per `CpuImage`'s layout.
    let (pc, a7, a0) = unsafe { (*cpu.add(32), *cpu.add(17), *cpu.add(10)) };
    TRAMPOLINE_STATE.with(|cell| {
        let mut guard = cell.borrow_mut();
        let state = guard
            .as_mut()
            .expect("ecall trampoline invoked outside of a JIT run");
        // Safety: both pointers were derived from live `&mut` references
        // held by `run` for exactly the duration of the compiled call.
        let ecall = unsafe { &mut *state.ecall };
        let io = unsafe { &mut *state.io };
        match ecall.ecall(pc, a7, a0, io) {
            Ok(EcallOutcome::Continue) => STATUS_CONTINUE,
            Ok(EcallOutcome::Exit(code)) => {
                state.exit_code = Some(code);
                STATUS_EXIT
            }
            Err(e) => {
                state.last_error = Some(e);
                STATUS_ERROR
            }
        }
    })
}

type CompiledFn = unsafe extern "C" fn(*mut u32) -> u32;

fn emit_prolog(em: &mut Emitter) {
    em.push(Reg::Ebp);
    em.mov_reg_reg(Reg::Ebp, Reg::Esp);
    em.push(VMPTR);
    em.push(super::emit::SCRATCH_D);
    // mov VMPTR, [ebp+8] -- the CPU image pointer, cdecl's first argument.
    em.load_mem_disp32(0x8B, VMPTR, Reg::Ebp, 8);
}

fn emit_epilog(em: &mut Emitter) -> u32 {
    let epilog_addr = em.current_abs_addr();
    em.pop(super::emit::SCRATCH_D);
    em.pop(VMPTR);
    em.pop(Reg::Ebp);
    em.ret();
    epilog_addr
}

/// Translate the guest code section into a single native function and the
/// dispatch table its internal jumps use.
fn translate(vm: &Vm) -> Result<(ExecBuffer, DispatchTable), TranslationError> {
    let sections = vm.sections;
    let code_offset = sections.code_offset;
    let code_size = if sections.code_size == 0 {
        vm.mem.size()
    } else {
        sections.code_size
    };
    let instr_count = (code_size / 4) as usize;

    let mut table = DispatchTable::new(code_offset, code_size);
    let dispatch_base = table.base_ptr() as u32;

    let capacity = PROLOG_BYTES + instr_count * MAX_SNIPPET_BYTES + EPILOG_BYTES;
    let mut exec_buf = ExecBuffer::new(capacity)?;
    let buffer_base = exec_buf.as_mut_ptr() as u32;

    let ctx = CodegenCtx {
        mem_base: vm.mem.base_ptr() as u32,
        mem_mask: vm.mem.mask(),
        dispatch_base,
        code_offset,
        ecall_trampoline: ecall_trampoline as usize as u32,
    };

    let mut em = Emitter::new(buffer_base);
    emit_prolog(&mut em);
    // Jump straight to the entry instruction's snippet; the prolog's
    // fallthrough would otherwise land on whichever snippet happens to be
    // emitted first, which is only `entry` when entry == code_offset.
    em.jmp_indirect_abs(codegen::dispatch_slot_addr(&ctx, vm.entry));

    let mut patches: EpilogPatches = Vec::new();
    let mut pc = code_offset;
    for _ in 0..instr_count {
        let word = vm.mem.fetch(pc);
        let snippet_addr = em.current_abs_addr();
        table.set(pc, snippet_addr);
        let instr = decode(word, pc)?;
        codegen::emit_instr(&mut em, &ctx, pc, instr, &mut patches);
        pc = pc.wrapping_add(4);
    }

    // Defensive fallthrough: a well-formed image always halts via
    // ECALL/EBREAK before reaching here.
    em.mov_reg_imm32(Reg::Eax, STATUS_FELL_THROUGH);
    let epilog_addr = emit_epilog(&mut em);
    for at in patches {
        em.patch_rel32(at, epilog_addr);
    }

    let bytes = em.into_bytes();
    if bytes.len() > capacity {
        return Err(TranslationError::BufferExhausted { emitted: bytes.len() });
    }
    log::debug!(
        "translated {instr_count} instructions into {} bytes (capacity {capacity})",
        bytes.len()
    );
    // Safety: `bytes.len() <= capacity`, and `exec_buf` is a fresh RWX
    // mapping of at least `capacity` bytes that nothing else references.
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), exec_buf.as_mut_ptr(), bytes.len());
    }

    Ok((exec_buf, table))
}

/// Translate `vm`'s code section and run it to completion. On return,
/// `vm`'s registers and `pc` reflect the guest state at the point
/// execution stopped, bit-for-bit identical to what
/// [`crate::interpreter::run`] would have produced for the same program.
pub fn run(vm: &mut Vm, ecall: &mut dyn EcallHandler, io: &mut dyn HostIo) -> Result<HaltReason, TranslationError> {
    let (exec_buf, _table) = translate(vm)?;

    let mut image = CpuImage { regs: [0; 32], pc: vm.pc };
    for i in 0..32u8 {
        image.regs[i as usize] = vm.regs.read(i);
    }

    TRAMPOLINE_STATE.with(|cell| {
        *cell.borrow_mut() = Some(TrampolineState {
            ecall: ecall as *mut dyn EcallHandler,
            io: io as *mut dyn HostIo,
            exit_code: None,
            last_error: None,
        });
    });

    // Safety: `exec_buf` holds a complete, self-contained function
    // (prolog through epilog) compiled for the host's own calling
    // convention; `&mut image` outlives the call.
    let compiled: CompiledFn = unsafe { std::mem::transmute(exec_buf.as_ptr()) };
    let status = unsafe { compiled(&mut image as *mut CpuImage as *mut u32) };

    let state = TRAMPOLINE_STATE.with(|cell| cell.borrow_mut().take()).expect("installed above");

    for i in 0..32u8 {
        vm.regs.write(i, image.regs[i as usize]);
    }
    vm.pc = image.pc & vm.mem.mask();

    match status {
        STATUS_EXIT => {
            let code = state.exit_code.expect("trampoline sets exit_code on STATUS_EXIT");
            log::debug!("jit halted: Exit({code})");
            Ok(HaltReason::Exit(code))
        }
        STATUS_EBREAK => {
            log::debug!("jit halted: Ebreak");
            Ok(HaltReason::Ebreak)
        }
        STATUS_ERROR => {
            let e = state.last_error.expect("trampoline sets last_error on STATUS_ERROR");
            crate::diagnostics::report_error(vm, &e.to_string(), vm.pc, None);
            Err(e.into())
        }
        _ => {
            // STATUS_FELL_THROUGH, or in principle STATUS_CONTINUE if a
            // future snippet ever left it in EAX by mistake.
            let e = ExecutionError::UnknownOpcode { opcode: 0, pc: vm.pc };
            crate::diagnostics::report_error(vm, "compiled code fell through without halting", vm.pc, None);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecall::{BufferIo, DefaultEcallHandler};
    use crate::instr::opcodes::*;
    use crate::vm::Sections;

    fn i_type(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }
    fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    #[test]
    fn add_chain_matches_interpreter() {
        let code = [
            i_type(10, 0, FUNCT3_ADDI, 11, OP_IMM),
            i_type(20, 0, FUNCT3_ADDI, 12, OP_IMM),
            r_type(FUNCT7_ADD_SRL, 12, 11, FUNCT3_ADD_SUB, 13, OP),
            i_type(0, 0, FUNCT3_ADDI, 17, OP_IMM),
            (IMM_ECALL << 20) | OP_SYSTEM,
        ];
        let sections = Sections { code_offset: 0, code_size: (code.len() * 4) as u32, ..Default::default() };
        let mut vm = Vm::new(64, 0, sections).unwrap();
        for (i, w) in code.iter().enumerate() {
            vm.mem.write(i as u32 * 4, crate::instr::Width::Word, *w);
        }
        let mut ecall = DefaultEcallHandler;
        let mut io = BufferIo::default();
        let halt = run(&mut vm, &mut ecall, &mut io).unwrap();
        assert_eq!(halt, HaltReason::Exit(0));
        assert_eq!(vm.regs.a3(), 30);
    }
}
