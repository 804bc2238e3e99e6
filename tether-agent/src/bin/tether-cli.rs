//! Command-line front end: attach to a controller and inspect or drive the target.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tether_core::{attach, CoreControl, EngineConfig, MemoryManager, TargetArch, TargetState};

#[derive(Parser)]
#[command(author, version, about = "Drive a target core controller", long_about = None)]
struct Cli {
    /// JSON engine configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Controller address (overrides the configuration)
    #[arg(long)]
    controller: Option<String>,

    /// Target architecture family (overrides the configuration)
    #[arg(long)]
    arch: Option<TargetArch>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get the target state
    Status,
    /// Halt the core
    Halt,
    /// Step one instruction
    Step,
    /// Read all registers
    Regs,
    /// Read memory
    Read {
        #[arg(value_parser = parse_address)]
        address: u64,
        length: usize,
    },
    /// Write memory
    Write {
        #[arg(value_parser = parse_address)]
        address: u64,
        data: String, // Hex string (e.g. "DEADBEEF")
    },
    /// Run until a breakpoint or the timeout
    Run {
        /// Breakpoint addresses
        #[arg(short, long = "break", value_parser = parse_address)]
        breakpoints: Vec<u64>,

        /// Halt the core if it is still running after this long
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

fn parse_address(s: &str) -> Result<u64, String> {
    tether_core::wire::scanner::parse_number(s)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| format!("'{s}' is not an address"))
}

fn parse_hex_bytes(s: &str) -> Result<Vec<u8>, hex::FromHexError> {
    hex::decode(s.trim_start_matches("0x"))
}

fn wait_for_halt(core: &mut impl CoreControl, timeout: Duration) -> Result<TargetState> {
    let deadline = Instant::now() + timeout;
    loop {
        let state = core.get_status()?;
        if state != TargetState::Running {
            return Ok(state);
        }
        if Instant::now() >= deadline {
            log::info!("still running after {timeout:?}, halting");
            core.halt()?;
            return Ok(TargetState::Halted);
        }
        thread::sleep(Duration::from_millis(10));
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(controller) = cli.controller {
        config.controller = controller;
    }
    if let Some(arch) = cli.arch {
        config.arch = arch;
    }
    let arch = config.arch;

    let mut core =
        attach(&config).with_context(|| format!("Failed to attach to controller at {}", config.controller))?;

    match cli.command {
        Commands::Status => {
            println!("Status: {}", core.get_status()?.keyword());
        }
        Commands::Halt => {
            core.halt()?;
            println!("Halted at {:#010x}", MemoryManager::read_pc(&mut core, arch)?);
        }
        Commands::Step => {
            core.insn_step()?;
            let state = wait_for_halt(&mut core, Duration::from_secs(1))?;
            if state != TargetState::Halted {
                bail!("target is {state} after the step");
            }
            println!("Stepped to {:#010x}", MemoryManager::read_pc(&mut core, arch)?);
        }
        Commands::Regs => {
            let values = core.reg_read(arch.all_registers())?;
            for (index, value) in arch.all_registers().indices().zip(values) {
                let name = arch.register_name(index).unwrap_or("?");
                println!("{name:>6}: {value:#010x}");
            }
        }
        Commands::Read { address, length } => {
            let data = MemoryManager::read_block(&mut core, address, length)?;
            println!("{address:#010x}: {}", hex::encode(data));
        }
        Commands::Write { address, data } => {
            let bytes = parse_hex_bytes(&data)?;
            core.mem_write(address, &bytes)?;
            println!("Written {} bytes.", bytes.len());
        }
        Commands::Run { breakpoints, timeout_ms } => {
            for &address in &breakpoints {
                core.set_break(address)?;
            }
            core.run()?;
            let state = wait_for_halt(&mut core, Duration::from_millis(timeout_ms))?;
            if state == TargetState::Dead {
                bail!("target died");
            }
            let pc = MemoryManager::read_pc(&mut core, arch)?;
            match core.last_halt_reason() {
                Some(reason) => println!("Halted at {pc:#010x} ({reason})"),
                None => println!("Halted at {pc:#010x}"),
            }
        }
    }

    core.close()?;
    Ok(())
}
