//! Target core controller daemon serving a simulated or probe-rs core.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info};
use std::net::TcpListener;
use tether_core::{Controller, CoreControl, SimCore, TargetArch};

#[derive(Parser, Debug)]
#[command(author, version, about = "Target core controller daemon", long_about = None)]
struct Args {
    /// Address to accept engine connections on
    #[arg(short, long, default_value = "127.0.0.1:5555")]
    listen: String,

    /// Serve a simulated core (no hardware required)
    #[arg(long)]
    mock: bool,

    /// Architecture of the simulated core
    #[arg(long, default_value = "x86")]
    arch: TargetArch,

    /// Raw image loaded into the simulated core before serving
    #[arg(long)]
    image: Option<std::path::PathBuf>,

    /// Load address of the image; also the initial pc
    #[arg(long, default_value = "0x0", value_parser = parse_address)]
    load_address: u64,

    /// Index of probe to use (default: 0)
    #[arg(long, default_value_t = 0)]
    probe_index: usize,

    /// Chip name passed to probe-rs
    #[arg(long, default_value = "auto")]
    chip: String,
}

fn parse_address(s: &str) -> Result<u64, String> {
    tether_core::wire::scanner::parse_number(s)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| format!("'{s}' is not an address"))
}

fn simulated_core(args: &Args) -> Result<SimCore> {
    let mut core = SimCore::new(args.arch);
    if let Some(path) = &args.image {
        let image = std::fs::read(path).with_context(|| format!("Failed to read image {}", path.display()))?;
        core.try_load(args.load_address, &image).with_context(|| {
            format!("Image {} ({} bytes) does not fit at {:#x}", path.display(), image.len(), args.load_address)
        })?;
        core.set_pc(args.load_address);
        info!("Loaded {} bytes at {:#x}", image.len(), args.load_address);
    }
    Ok(core)
}

#[cfg(feature = "hardware")]
fn hardware_core(args: &Args) -> Result<tether_core::ProbeCore> {
    let probe_manager = tether_core::ProbeManager::new();
    let probes = probe_manager.list_probes();
    let Some(probe) = probes.get(args.probe_index) else {
        bail!("Probe index {} out of range (found {} probes)", args.probe_index, probes.len());
    };
    info!("Connecting to probe: {}", probe.name());
    let session = probe_manager.attach(args.probe_index, &args.chip)?;
    info!("Attached to target: {}", session.target().name);
    Ok(tether_core::ProbeCore::new(session, 0))
}

#[cfg(not(feature = "hardware"))]
fn hardware_core(_args: &Args) -> Result<SimCore> {
    bail!("built without hardware support; use --mock")
}

fn serve<B: CoreControl + Send + 'static>(
    backend: B,
    listener: TcpListener,
) -> tokio::task::JoinHandle<std::io::Result<()>> {
    tokio::task::spawn_blocking(move || Controller::new(backend).listen(&listener))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("Starting Tether Daemon...");
    let listener = TcpListener::bind(&args.listen).with_context(|| format!("Failed to bind {}", args.listen))?;

    let server = if args.mock {
        info!("Starting in MOCK mode with a simulated {} core.", args.arch);
        serve(simulated_core(&args)?, listener)
    } else {
        serve(hardware_core(&args)?, listener)
    };

    tokio::select! {
        result = server => {
            if let Err(e) = result? {
                error!("Controller stopped: {e}");
                return Err(e.into());
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Unable to listen for shutdown signal")?;
            info!("Shutting down...");
            // The controller thread is blocked in accept().
            std::process::exit(0);
        }
    }
    Ok(())
}
