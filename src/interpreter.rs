//! The fetch-decode-execute loop (C3).

use crate::ecall::{EcallHandler, EcallOutcome, HostIo};
use crate::eei::Eei;
use crate::error::ExecutionError;
use crate::instr::{decode, Instr, Width};
use crate::isa;
use crate::vm::Vm;

impl Eei for Vm {
    fn x(&self, idx: u8) -> u32 {
        self.regs.read(idx)
    }

    fn set_x(&mut self, idx: u8, value: u32) {
        self.regs.write(idx, value)
    }

    fn pc(&self) -> u32 {
        self.pc
    }

    fn set_pc(&mut self, pc: u32) {
        self.pc = pc & self.mem.mask();
    }

    fn mask(&self) -> u32 {
        self.mem.mask()
    }

    fn load(&self, addr: u32, width: Width) -> u32 {
        self.mem.read(addr, width)
    }

    fn store(&mut self, addr: u32, width: Width, value: u32) {
        self.mem.write(addr, width, value)
    }
}

/// Why execution stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// `ecall` with `a7 == 0`; the low byte of `a0` is a host-defined
    /// status code, meaningless to the core itself.
    Exit(u8),
    Ebreak,
    /// The interpreter's step budget was exhausted; not an error, and
    /// the VM state is left intact for inspection.
    StepCapReached,
}

/// Result of a single `step()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    Halted(HaltReason),
}

/// Fetch, decode and execute exactly one instruction.
///
/// Conflates neither case the teacher's bare `Result<(), Exception>`
/// would: a guest-requested stop (ecall/ebreak) is `Ok(Halted(..))`, not
/// an error, and only a genuinely malformed instruction is `Err`.
pub fn step(
    vm: &mut Vm,
    ecall: &mut impl EcallHandler,
    io: &mut dyn HostIo,
) -> Result<StepOutcome, ExecutionError> {
    let cur = vm.pc;
    let word = vm.mem.fetch(cur);
    vm.pc = cur.wrapping_add(4) & vm.mem.mask();

    let instr = decode(word, cur)?;
    log::trace!("pc={cur:#010x} word={word:#010x} instr={instr:?}");

    match instr {
        Instr::Ecall => match ecall.ecall(cur, vm.regs.a7(), vm.regs.a0(), io)? {
            EcallOutcome::Continue => Ok(StepOutcome::Continue),
            EcallOutcome::Exit(code) => Ok(StepOutcome::Halted(HaltReason::Exit(code))),
        },
        Instr::Ebreak => Ok(StepOutcome::Halted(HaltReason::Ebreak)),
        other => {
            isa::execute(vm, cur, other);
            Ok(StepOutcome::Continue)
        }
    }
}

/// Run until halt, error, or `max_steps` is reached (if given).
pub fn run(
    vm: &mut Vm,
    ecall: &mut impl EcallHandler,
    io: &mut dyn HostIo,
    max_steps: Option<u64>,
) -> Result<HaltReason, ExecutionError> {
    let mut steps: u64 = 0;
    loop {
        if let Some(max) = max_steps {
            if steps >= max {
                log::debug!("interpreter stopped: step cap {max} reached");
                return Ok(HaltReason::StepCapReached);
            }
        }
        match step(vm, ecall, io) {
            Ok(StepOutcome::Continue) => {}
            Ok(StepOutcome::Halted(reason)) => {
                log::debug!("interpreter halted: {reason:?}");
                return Ok(reason);
            }
            Err(e) => {
                crate::diagnostics::report_error(vm, &e.to_string(), vm.pc, None);
                return Err(e);
            }
        }
        steps += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecall::{BufferIo, DefaultEcallHandler};
    use crate::vm::Sections;

    fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }
    fn i_type(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        ((imm & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    use crate::instr::opcodes::*;

    #[test]
    fn add_chain_scenario() {
        // addi a1, zero, 10
        // addi a2, zero, 20
        // add a3, a1, a2
        // addi a7, zero, 0   (ecall exit subcode)
        // ecall
        let code = [
            i_type(10, 0, FUNCT3_ADDI, 11, OP_IMM),
            i_type(20, 0, FUNCT3_ADDI, 12, OP_IMM),
            r_type(FUNCT7_ADD_SRL, 12, 11, FUNCT3_ADD_SUB, 13, OP),
            i_type(0, 0, FUNCT3_ADDI, 17, OP_IMM),
            (IMM_ECALL << 20) | OP_SYSTEM,
        ];
        let mut vm = Vm::new(64, 0, Sections::default()).unwrap();
        for (i, w) in code.iter().enumerate() {
            vm.mem.write(i as u32 * 4, Width::Word, *w);
        }
        let mut ecall = DefaultEcallHandler;
        let mut io = BufferIo::default();
        let halt = run(&mut vm, &mut ecall, &mut io, Some(100)).unwrap();
        assert_eq!(halt, HaltReason::Exit(0));
        assert_eq!(vm.regs.a3(), 30);
    }

    #[test]
    fn x0_stays_zero_after_step() {
        let mut vm = Vm::new(64, 0, Sections::default()).unwrap();
        vm.mem.write(0, Width::Word, i_type(5, 0, FUNCT3_ADDI, 0, OP_IMM));
        let mut ecall = DefaultEcallHandler;
        let mut io = BufferIo::default();
        step(&mut vm, &mut ecall, &mut io).unwrap();
        assert_eq!(vm.regs.read(0), 0);
    }

    #[test]
    fn step_cap_halts_without_error() {
        let mut vm = Vm::new(64, 0, Sections::default()).unwrap();
        // JAL x0, 0 -- infinite loop on itself
        let word = {
            // imm_j = 0 -> opcode JAL, rd=0
            OP_JAL
        };
        vm.mem.write(0, Width::Word, word);
        let mut ecall = DefaultEcallHandler;
        let mut io = BufferIo::default();
        let halt = run(&mut vm, &mut ecall, &mut io, Some(5)).unwrap();
        assert_eq!(halt, HaltReason::StepCapReached);
    }

    #[test]
    fn ebreak_halts() {
        let mut vm = Vm::new(64, 0, Sections::default()).unwrap();
        vm.mem.write(0, Width::Word, (IMM_EBREAK << 20) | OP_SYSTEM);
        let mut ecall = DefaultEcallHandler;
        let mut io = BufferIo::default();
        let halt = run(&mut vm, &mut ecall, &mut io, Some(5)).unwrap();
        assert_eq!(halt, HaltReason::Ebreak);
    }
}
