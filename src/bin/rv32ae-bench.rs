//! Benchmark front end: run the same image on both engines and report
//! wall-clock time for each, so the JIT's payoff over the interpreter can
//! be seen directly rather than taken on faith.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use rv32ae::ecall::{BufferIo, DefaultEcallHandler};
use rv32ae::interpreter;
#[cfg(target_arch = "x86")]
use rv32ae::jit;
use rv32ae::loader::load_image;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a flat image file.
    image: PathBuf,

    /// Interpreter step cap; the JIT always runs to completion.
    #[arg(long, default_value_t = 10_000_000)]
    max_steps: u64,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let bytes = std::fs::read(&args.image).expect("failed to read image");

    let base_vm = load_image(&bytes).expect("failed to load image");

    let mut interp_vm = base_vm.clone();
    let mut ecall = DefaultEcallHandler;
    let mut io = BufferIo::default();
    let start = Instant::now();
    let interp_halt = interpreter::run(&mut interp_vm, &mut ecall, &mut io, Some(args.max_steps));
    let interp_elapsed = start.elapsed();
    println!("interpreter: {interp_halt:?} in {interp_elapsed:?}");

    #[cfg(target_arch = "x86")]
    {
        let mut jit_vm = base_vm.clone();
        let mut ecall = DefaultEcallHandler;
        let mut io = BufferIo::default();
        let start = Instant::now();
        let jit_halt = jit::run(&mut jit_vm, &mut ecall, &mut io);
        let jit_elapsed = start.elapsed();
        println!("jit: {jit_halt:?} in {jit_elapsed:?}");

        assert_eq!(interp_vm.regs.read(0), jit_vm.regs.read(0));
        if interp_halt.is_ok() && jit_halt.is_ok() {
            for i in 0..32u8 {
                assert_eq!(
                    interp_vm.regs.read(i),
                    jit_vm.regs.read(i),
                    "register x{i} diverged between engines"
                );
            }
        }
    }
    #[cfg(not(target_arch = "x86"))]
    {
        println!("jit: skipped, host is not an x86 (32-bit) target");
    }
}
