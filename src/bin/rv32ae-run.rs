//! Command-line front end (C10): load a flat image, run it on either
//! engine, and report how it halted.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use rv32ae::ecall::{DefaultEcallHandler, StdoutIo};
use rv32ae::interpreter::{self, HaltReason};
#[cfg(target_arch = "x86")]
use rv32ae::jit;
use rv32ae::loader::load_image;

/// Run a flat RV32I image on the interpreter or the JIT.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to a flat image file (see the `RV32` header format).
    image: PathBuf,

    /// Override the declared RAM size from the image header, e.g. `64k`,
    /// `4m`. Rounded up to the next power of two.
    #[arg(long, value_parser = parse_mem_size)]
    mem: Option<u32>,

    /// Use the ahead-of-execution x86 JIT instead of the interpreter.
    #[arg(long)]
    jit: bool,

    /// Stop after this many interpreter steps even if the guest has not
    /// halted. Ignored by the JIT, which runs to completion once compiled.
    #[arg(long)]
    max_steps: Option<u64>,
}

fn parse_mem_size(s: &str) -> Result<u32, String> {
    let (digits, multiplier) = match s.chars().last() {
        Some('k') | Some('K') => (&s[..s.len() - 1], 1024),
        Some('m') | Some('M') => (&s[..s.len() - 1], 1024 * 1024),
        _ => (s, 1),
    };
    let base: u32 = digits.parse().map_err(|_| format!("not a number: {digits}"))?;
    base.checked_mul(multiplier).ok_or_else(|| format!("{s} overflows a u32 byte count"))
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let bytes = match std::fs::read(&args.image) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("error: failed to read {}: {e}", args.image.display());
            return ExitCode::FAILURE;
        }
    };

    let mut vm = match load_image(&bytes) {
        Ok(vm) => vm,
        Err(e) => {
            eprintln!("error: failed to load image: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Some(declared) = args.mem {
        let wanted = rv32ae::util::next_power_of_two(declared);
        if wanted != vm.mem.size() {
            log::warn!(
                "--mem {declared} (rounded to {wanted}) overrides the image's declared RAM ({})",
                vm.mem.size()
            );
            if let Err(e) = vm.mem.resize(wanted) {
                eprintln!("error: failed to resize memory to {wanted}: {e}");
                return ExitCode::FAILURE;
            }
            vm.pc &= vm.mem.mask();
            vm.entry &= vm.mem.mask();
        }
    }

    let mut ecall = DefaultEcallHandler;
    let mut io = StdoutIo;

    #[cfg(target_arch = "x86")]
    let halt = if args.jit {
        jit::run(&mut vm, &mut ecall, &mut io).map_err(|e| e.to_string())
    } else {
        interpreter::run(&mut vm, &mut ecall, &mut io, args.max_steps).map_err(|e| e.to_string())
    };
    #[cfg(not(target_arch = "x86"))]
    let halt = if args.jit {
        Err("the JIT is only available on x86 (32-bit) hosts".to_string())
    } else {
        interpreter::run(&mut vm, &mut ecall, &mut io, args.max_steps).map_err(|e| e.to_string())
    };

    match halt {
        Ok(HaltReason::Exit(code)) => ExitCode::from(code),
        Ok(HaltReason::Ebreak) => {
            println!("halted on ebreak at pc={:#010x}", vm.pc);
            ExitCode::SUCCESS
        }
        Ok(HaltReason::StepCapReached) => {
            println!("step cap reached at pc={:#010x}", vm.pc);
            ExitCode::SUCCESS
        }
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}
