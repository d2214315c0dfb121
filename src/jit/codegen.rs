//! The code generator (C5): lowers one decoded [`Instr`] to an x86
//! snippet.
//!
//! Per-category `gen_*` functions mirror the dispatch-by-instruction-kind
//! convention of a RISC-V ahead-of-time code generator; semantics are
//! grounded on the same [`crate::isa`] functions the interpreter uses, so
//! the two engines cannot silently diverge. No register is cached across
//! snippets: every snippet reloads its sources from the register file and
//! writes its result back through [`emit::VMPTR`], which is why branches
//! and jumps can land on any emitted snippet without first reconciling
//! register state.

use crate::instr::{AluOp, BranchOp, Instr, Width};

use super::emit::{ArithOp, Cond, Emitter, Reg, ShiftOp, SCRATCH_A, SCRATCH_B, SCRATCH_C, SCRATCH_D};

/// Byte offset of the PC slot within the CPU image, immediately after the
/// 32-register file (`32 * 4` bytes).
pub const PC_SLOT_DISP: i32 = 128;

/// Everything the generator needs to know about addresses fixed before
/// translation starts.
#[derive(Debug, Clone, Copy)]
pub struct CodegenCtx {
    pub mem_base: u32,
    pub mem_mask: u32,
    pub dispatch_base: u32,
    pub code_offset: u32,
    pub ecall_trampoline: u32,
}

fn reg_disp(idx: u8) -> i32 {
    idx as i32 * 4
}

fn branch_cond(op: BranchOp) -> Cond {
    match op {
        BranchOp::Eq => Cond::Eq,
        BranchOp::Ne => Cond::NotEq,
        BranchOp::Lt => Cond::Lt,
        BranchOp::Ge => Cond::GeSigned,
        BranchOp::LtU => Cond::LtUnsigned,
        BranchOp::GeU => Cond::GeUnsigned,
    }
}

fn width_bytes(w: Width) -> u32 {
    match w {
        Width::Byte => 1,
        Width::Halfword => 2,
        Width::Word => 4,
    }
}

/// `SCRATCH_A <- (rs1 + imm) & mask`, the base address for a load/store,
/// before any per-byte rewrap.
fn emit_masked_base_addr(em: &mut Emitter, ctx: &CodegenCtx, rs1: u8, imm: i32) {
    em.mov_reg_from_vmptr(SCRATCH_A, reg_disp(rs1));
    if imm != 0 {
        em.alu_reg_imm32(ArithOp::Add, SCRATCH_A, imm as u32);
    }
    em.alu_reg_imm32(ArithOp::And, SCRATCH_A, ctx.mem_mask);
}

/// `dst <- (base + i) & mask`, the address of byte `i` of a multi-byte
/// access -- recomputed from the unmasked base every time rather than
/// `base + i`, so an access straddling the wrap boundary wraps exactly
/// the way [`crate::memory::Memory`] does.
fn emit_byte_addr(em: &mut Emitter, ctx: &CodegenCtx, dst: Reg, base: Reg, i: u32) {
    em.mov_reg_reg(dst, base);
    if i != 0 {
        em.alu_reg_imm32(ArithOp::Add, dst, i);
        em.alu_reg_imm32(ArithOp::And, dst, ctx.mem_mask);
    }
}

fn gen_load(em: &mut Emitter, ctx: &CodegenCtx, width: Width, signed: bool, rd: u8, rs1: u8, imm: i32) {
    emit_masked_base_addr(em, ctx, rs1, imm); // SCRATCH_A = masked base
    let n = width_bytes(width);
    for i in 0..n {
        emit_byte_addr(em, ctx, SCRATCH_C, SCRATCH_A, i); // SCRATCH_C = byte i's address
        em.movzx_mem_byte_disp32(SCRATCH_C, SCRATCH_C, ctx.mem_base as i32);
        if i != 0 {
            em.shift_reg_imm8(ShiftOp::Shl, SCRATCH_C, (8 * i) as u8);
        }
        if i == 0 {
            em.mov_reg_reg(SCRATCH_B, SCRATCH_C);
        } else {
            em.alu_reg_reg(ArithOp::Or, SCRATCH_B, SCRATCH_C);
        }
    }
    if signed {
        match width {
            Width::Byte => em.movsx_byte(SCRATCH_B),
            Width::Halfword => em.movsx_word(SCRATCH_B),
            Width::Word => {}
        }
    }
    if rd != 0 {
        em.mov_vmptr_from_reg(reg_disp(rd), SCRATCH_B);
    }
}

fn gen_store(em: &mut Emitter, ctx: &CodegenCtx, width: Width, rs1: u8, rs2: u8, imm: i32) {
    emit_masked_base_addr(em, ctx, rs1, imm); // SCRATCH_A = masked base, kept live all loop
    em.mov_reg_from_vmptr(SCRATCH_B, reg_disp(rs2)); // SCRATCH_B = value, kept live all loop
    let n = width_bytes(width);
    for i in 0..n {
        emit_byte_addr(em, ctx, SCRATCH_C, SCRATCH_A, i); // SCRATCH_C = byte i's address
        em.mov_reg_reg(SCRATCH_D, SCRATCH_B);
        if i != 0 {
            em.shift_reg_imm8(ShiftOp::Shr, SCRATCH_D, (8 * i) as u8);
        }
        em.mov_mem_byte_disp32(SCRATCH_C, ctx.mem_base as i32, SCRATCH_D);
    }
}

fn gen_alu_reg(em: &mut Emitter, op: AluOp, rd: u8, rs1: u8, rs2: u8) {
    if rd == 0 {
        return;
    }
    em.mov_reg_from_vmptr(SCRATCH_A, reg_disp(rs1));
    match op {
        AluOp::Sll | AluOp::Srl | AluOp::Sra => {
            // Shift count must be in CL (== SCRATCH_B's low byte); x86's
            // variable shift already masks it to 5 bits for 32-bit
            // operands, matching RV32I's `rs2 & 31` semantics with no
            // extra AND needed.
            em.mov_reg_from_vmptr(SCRATCH_B, reg_disp(rs2));
            let shift_op = match op {
                AluOp::Sll => ShiftOp::Shl,
                AluOp::Srl => ShiftOp::Shr,
                AluOp::Sra => ShiftOp::Sar,
                _ => unreachable!(),
            };
            em.shift_reg_cl(shift_op, SCRATCH_A);
        }
        AluOp::Slt => {
            em.mov_reg_from_vmptr(SCRATCH_B, reg_disp(rs2));
            em.cmp_reg_reg(SCRATCH_A, SCRATCH_B);
            em.setcc_zero_extend(Cond::Lt, SCRATCH_A);
        }
        AluOp::SltU => {
            em.mov_reg_from_vmptr(SCRATCH_B, reg_disp(rs2));
            em.cmp_reg_reg(SCRATCH_A, SCRATCH_B);
            em.setcc_zero_extend(Cond::LtUnsigned, SCRATCH_A);
        }
        AluOp::Add | AluOp::Sub | AluOp::Xor | AluOp::Or | AluOp::And => {
            em.mov_reg_from_vmptr(SCRATCH_B, reg_disp(rs2));
            let arith = match op {
                AluOp::Add => ArithOp::Add,
                AluOp::Sub => ArithOp::Sub,
                AluOp::Xor => ArithOp::Xor,
                AluOp::Or => ArithOp::Or,
                AluOp::And => ArithOp::And,
                _ => unreachable!(),
            };
            em.alu_reg_reg(arith, SCRATCH_A, SCRATCH_B);
        }
    }
    em.mov_vmptr_from_reg(reg_disp(rd), SCRATCH_A);
}

fn gen_alu_imm(em: &mut Emitter, op: AluOp, rd: u8, rs1: u8, imm: i32) {
    if rd == 0 {
        return;
    }
    em.mov_reg_from_vmptr(SCRATCH_A, reg_disp(rs1));
    match op {
        AluOp::Slt => {
            em.mov_reg_imm32(SCRATCH_B, imm as u32);
            em.cmp_reg_reg(SCRATCH_A, SCRATCH_B);
            em.setcc_zero_extend(Cond::Lt, SCRATCH_A);
        }
        AluOp::SltU => {
            em.mov_reg_imm32(SCRATCH_B, imm as u32);
            em.cmp_reg_reg(SCRATCH_A, SCRATCH_B);
            em.setcc_zero_extend(Cond::LtUnsigned, SCRATCH_A);
        }
        AluOp::Add => em.alu_reg_imm32(ArithOp::Add, SCRATCH_A, imm as u32),
        AluOp::Xor => em.alu_reg_imm32(ArithOp::Xor, SCRATCH_A, imm as u32),
        AluOp::Or => em.alu_reg_imm32(ArithOp::Or, SCRATCH_A, imm as u32),
        AluOp::And => em.alu_reg_imm32(ArithOp::And, SCRATCH_A, imm as u32),
        AluOp::Sub | AluOp::Sll | AluOp::Srl | AluOp::Sra => {
            unreachable!("decoder never produces these as AluImm")
        }
    }
    em.mov_vmptr_from_reg(reg_disp(rd), SCRATCH_A);
}

fn gen_shift_imm(em: &mut Emitter, op: AluOp, rd: u8, rs1: u8, shamt: u32) {
    if rd == 0 {
        return;
    }
    debug_assert!(shamt < 32, "shift amount masked to 5 bits at decode time");
    em.mov_reg_from_vmptr(SCRATCH_A, reg_disp(rs1));
    let shift_op = match op {
        AluOp::Sll => ShiftOp::Shl,
        AluOp::Srl => ShiftOp::Shr,
        AluOp::Sra => ShiftOp::Sar,
        _ => unreachable!("decoder never produces these as ShiftImm"),
    };
    em.shift_reg_imm8(shift_op, SCRATCH_A, shamt as u8);
    em.mov_vmptr_from_reg(reg_disp(rd), SCRATCH_A);
}

fn gen_lui(em: &mut Emitter, rd: u8, imm: i32) {
    if rd != 0 {
        em.mov_vmptr_imm32(reg_disp(rd), imm as u32);
    }
}

fn gen_auipc(em: &mut Emitter, rd: u8, cur: u32, imm: i32) {
    if rd != 0 {
        em.mov_vmptr_imm32(reg_disp(rd), cur.wrapping_add(imm as u32));
    }
}

/// Byte offset into the dispatch table for a *compile-time known* target
/// guest PC: a genuine host address, since `ctx.dispatch_base` is the
/// table's fixed runtime base, known before any instruction is emitted.
pub(crate) fn dispatch_slot_addr(ctx: &CodegenCtx, target_pc: u32) -> u32 {
    ctx.dispatch_base.wrapping_add(target_pc.wrapping_sub(ctx.code_offset))
}

fn gen_jal(em: &mut Emitter, ctx: &CodegenCtx, cur: u32, rd: u8, imm: i32) {
    if rd != 0 {
        em.mov_vmptr_imm32(reg_disp(rd), cur.wrapping_add(4));
    }
    let target = cur.wrapping_add(imm as u32) & ctx.mem_mask;
    em.jmp_indirect_abs(dispatch_slot_addr(ctx, target));
}

fn gen_jalr(em: &mut Emitter, ctx: &CodegenCtx, cur: u32, rd: u8, rs1: u8, imm: i32) {
    // Capture rs1 before any write-back: matters when rd == rs1.
    em.mov_reg_from_vmptr(SCRATCH_A, reg_disp(rs1));
    if rd != 0 {
        em.mov_vmptr_imm32(reg_disp(rd), cur.wrapping_add(4));
    }
    if imm != 0 {
        em.alu_reg_imm32(ArithOp::Add, SCRATCH_A, imm as u32);
    }
    em.alu_reg_imm32(ArithOp::And, SCRATCH_A, 0xFFFF_FFFE);
    em.alu_reg_imm32(ArithOp::And, SCRATCH_A, ctx.mem_mask);
    em.alu_reg_imm32(ArithOp::Sub, SCRATCH_A, ctx.code_offset);
    em.jmp_indirect_reg_disp32(SCRATCH_A, ctx.dispatch_base as i32);
}

fn gen_branch(em: &mut Emitter, ctx: &CodegenCtx, cur: u32, op: BranchOp, rs1: u8, rs2: u8, imm: i32) {
    em.mov_reg_from_vmptr(SCRATCH_A, reg_disp(rs1));
    em.mov_reg_from_vmptr(SCRATCH_B, reg_disp(rs2));
    em.cmp_reg_reg(SCRATCH_A, SCRATCH_B);
    // Skip the indirect jump (6 bytes: FF 25 <abs32>) unless taken.
    let skip = em.jcc_short_placeholder(branch_cond(op).inverse());
    let before = em.offset();
    let target = cur.wrapping_add(imm as u32) & ctx.mem_mask;
    em.jmp_indirect_abs(dispatch_slot_addr(ctx, target));
    let jump_len = (em.offset() - before) as i8;
    em.patch_rel8(skip, jump_len);
}

/// Forward references to the function epilog, collected while emitting
/// `ECALL`/`EBREAK` snippets and resolved by the driver once the epilog's
/// own offset is known.
pub type EpilogPatches = Vec<usize>;

/// Status codes the compiled function leaves in EAX for the driver to
/// read once the call returns. `CONTINUE` is not itself a return value --
/// it is the trampoline's "keep going" signal, tested and discarded
/// in-line without ever reaching the epilog.
pub const STATUS_CONTINUE: u32 = 0;
pub const STATUS_EXIT: u32 = 1;
pub const STATUS_ERROR: u32 = 2;
pub const STATUS_EBREAK: u32 = 3;
/// Left in EAX only if translated code runs off the end of the code
/// section without ever hitting ECALL/EBREAK -- a malformed image.
pub const STATUS_FELL_THROUGH: u32 = 4;

fn gen_ecall(em: &mut Emitter, ctx: &CodegenCtx, cur: u32, patches: &mut EpilogPatches) {
    em.mov_vmptr_imm32(PC_SLOT_DISP, cur);
    em.call_abs(ctx.ecall_trampoline);
    // The trampoline leaves its status in EAX: STATUS_CONTINUE to keep
    // going, anything else to stop. EAX already holds that value after
    // the call returns, so the jump tests it directly.
    em.test_reg_reg(Reg::Eax, Reg::Eax);
    patches.push(em.jcc_near_placeholder(Cond::NotEq));
}

fn gen_ebreak(em: &mut Emitter, cur: u32, patches: &mut EpilogPatches) {
    em.mov_vmptr_imm32(PC_SLOT_DISP, cur);
    em.mov_reg_imm32(Reg::Eax, STATUS_EBREAK);
    patches.push(em.jmp_near_placeholder());
}

/// Emit the snippet for one instruction at guest PC `cur`. Forward
/// references to the epilog created by `ECALL`/`EBREAK` are appended to
/// `patches`; the driver resolves them after the epilog is emitted.
pub fn emit_instr(em: &mut Emitter, ctx: &CodegenCtx, cur: u32, instr: Instr, patches: &mut EpilogPatches) {
    match instr {
        Instr::Lui { rd, imm } => gen_lui(em, rd, imm),
        Instr::Auipc { rd, imm } => gen_auipc(em, rd, cur, imm),
        Instr::Jal { rd, imm } => gen_jal(em, ctx, cur, rd, imm),
        Instr::Jalr { rd, rs1, imm } => gen_jalr(em, ctx, cur, rd, rs1, imm),
        Instr::Branch { op, rs1, rs2, imm } => gen_branch(em, ctx, cur, op, rs1, rs2, imm),
        Instr::Load { width, signed, rd, rs1, imm } => gen_load(em, ctx, width, signed, rd, rs1, imm),
        Instr::Store { width, rs1, rs2, imm } => gen_store(em, ctx, width, rs1, rs2, imm),
        Instr::AluImm { op, rd, rs1, imm } => gen_alu_imm(em, op, rd, rs1, imm),
        Instr::ShiftImm { op, rd, rs1, shamt } => gen_shift_imm(em, op, rd, rs1, shamt),
        Instr::AluReg { op, rd, rs1, rs2 } => gen_alu_reg(em, op, rd, rs1, rs2),
        Instr::Fence => {}
        Instr::Ecall => gen_ecall(em, ctx, cur, patches),
        Instr::Ebreak => gen_ebreak(em, cur, patches),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instr::AluOp;

    fn ctx() -> CodegenCtx {
        CodegenCtx {
            mem_base: 0x1000_0000,
            mem_mask: 0xFFFF,
            dispatch_base: 0x2000_0000,
            code_offset: 0,
            ecall_trampoline: 0x3000_0000,
        }
    }

    #[test]
    fn lui_to_x0_emits_nothing() {
        let mut em = Emitter::new(0);
        gen_lui(&mut em, 0, 0x1234);
        assert_eq!(em.offset(), 0);
    }

    #[test]
    fn lui_emits_direct_memory_store() {
        let mut em = Emitter::new(0);
        gen_lui(&mut em, 5, 0x1234_0000u32 as i32);
        // mov dword [esi+disp32], imm32 is 1 + 1 + 4 + 4 = 10 bytes.
        assert_eq!(em.offset(), 10);
    }

    #[test]
    fn jal_emits_link_write_and_indirect_jump() {
        let ctx = ctx();
        let mut em = Emitter::new(0);
        gen_jal(&mut em, &ctx, 0x100, 1, 0x10);
        assert_eq!(em.offset(), 16);
    }

    #[test]
    fn jal_to_x0_skips_link_write() {
        let ctx = ctx();
        let mut em = Emitter::new(0);
        gen_jal(&mut em, &ctx, 0x100, 0, 0x10);
        assert_eq!(em.offset(), 6);
    }

    #[test]
    fn branch_patches_short_jump_length() {
        let ctx = ctx();
        let mut em = Emitter::new(0);
        gen_branch(&mut em, &ctx, 0, crate::instr::BranchOp::Eq, 1, 2, 0x20);
        // cmp(2) + jcc(2) + jmp_indirect_abs(6) = 10 bytes total.
        assert_eq!(em.offset(), 10);
    }

    #[test]
    fn alu_reg_to_x0_emits_nothing() {
        let mut em = Emitter::new(0);
        gen_alu_reg(&mut em, AluOp::Add, 0, 1, 2);
        assert_eq!(em.offset(), 0);
    }

    #[test]
    fn ecall_records_a_forward_patch() {
        let ctx = ctx();
        let mut em = Emitter::new(0);
        let mut patches = EpilogPatches::new();
        gen_ecall(&mut em, &ctx, 0x100, &mut patches);
        assert_eq!(patches.len(), 1);
    }

    #[test]
    fn ebreak_records_a_forward_patch() {
        let mut em = Emitter::new(0);
        let mut patches = EpilogPatches::new();
        gen_ebreak(&mut em, 0x100, &mut patches);
        assert_eq!(patches.len(), 1);
    }
}
