#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use ember_cpu_core::state::gpr;
use ember_cpu_core::{CpuConfig, PortIo, StepOutcome, Vcpu};
use ember_mem::PhysicalMemory;
use ember_snapshot::{restore_snapshot, save_snapshot, SaveOptions};
use ember_x86::{SegReg, Width};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Bochs-style debug console port.
const DEBUGCON_PORT: u16 = 0xe9;

#[derive(Debug, Parser)]
#[command(about = "Run a flat x86 binary on the ember CPU core")]
struct Args {
    /// Flat binary image copied into guest RAM at `--load-addr`.
    #[arg(long, required_unless_present = "snapshot_load")]
    image: Option<PathBuf>,

    /// Guest physical load address for `--image`.
    #[arg(long, default_value = "0x7c00", value_parser = parse_u32)]
    load_addr: u32,

    /// Guest RAM size in MiB.
    #[arg(long, default_value_t = 16)]
    ram: u64,

    /// Real-mode entry point as `CS:IP` (hex).
    #[arg(long, default_value = "0000:7c00", value_parser = parse_entry)]
    entry: (u16, u16),

    /// Stop after this many steps.
    #[arg(long, default_value_t = 1_000_000)]
    max_steps: u64,

    /// Save a snapshot on exit.
    #[arg(long)]
    snapshot_save: Option<PathBuf>,

    /// Restore a snapshot before running (replaces `--image` and `--entry`).
    #[arg(long)]
    snapshot_load: Option<PathBuf>,

    /// Log filter (tracing-subscriber EnvFilter syntax). Falls back to `RUST_LOG`, then `info`.
    #[arg(long)]
    log: Option<String>,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value {s:?}: {e}"))
}

fn parse_entry(s: &str) -> Result<(u16, u16), String> {
    let (cs, ip) = s
        .split_once(':')
        .ok_or_else(|| format!("expected CS:IP, got {s:?}"))?;
    let cs = u16::from_str_radix(cs, 16).map_err(|e| format!("invalid CS {cs:?}: {e}"))?;
    let ip = u16::from_str_radix(ip, 16).map_err(|e| format!("invalid IP {ip:?}: {e}"))?;
    Ok((cs, ip))
}

/// Collects bytes written to the debug console port; every other port floats.
#[derive(Debug, Default)]
struct DebugCon {
    out: Vec<u8>,
}

impl PortIo for DebugCon {
    fn io_read(&mut self, port: u16, width: Width) -> u32 {
        if port == DEBUGCON_PORT {
            return u32::from(DEBUGCON_PORT as u8);
        }
        width.mask()
    }

    fn io_write(&mut self, port: u16, _width: Width, value: u32) {
        if port == DEBUGCON_PORT {
            self.out.push(value as u8);
        }
    }
}

fn init_tracing(log: Option<&str>) {
    let filter = match log {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log.as_deref());

    let ram_bytes = args
        .ram
        .checked_mul(1024 * 1024)
        .context("RAM size overflow")?;
    let ram = PhysicalMemory::new(ram_bytes).context("failed to allocate guest RAM")?;
    let mut cpu = Vcpu::new(CpuConfig::default(), ram, DebugCon::default());

    if let Some(path) = &args.snapshot_load {
        let f = File::open(path)
            .with_context(|| format!("failed to open snapshot for load: {}", path.display()))?;
        restore_snapshot(&mut BufReader::new(f), &mut cpu)
            .with_context(|| format!("failed to restore snapshot: {}", path.display()))?;
        info!(path = %path.display(), eip = cpu.state.eip, "snapshot restored");
    } else if let Some(path) = &args.image {
        let image = std::fs::read(path)
            .with_context(|| format!("failed to read image: {}", path.display()))?;
        if image.is_empty() {
            bail!("image is empty: {}", path.display());
        }
        cpu.bus
            .load(u64::from(args.load_addr), &image)
            .with_context(|| format!("image does not fit at {:#x}", args.load_addr))?;
        let (cs, ip) = args.entry;
        cpu.state.load_real_segment(SegReg::Cs, cs);
        cpu.state.eip = u32::from(ip);
        info!(len = image.len(), load_addr = args.load_addr, cs, ip, "image loaded");
    }

    let summary = cpu.run(args.max_steps).context("execution stopped")?;
    match summary.last {
        Some(StepOutcome::Reset) => warn!("guest triple-faulted; processor was reset"),
        Some(StepOutcome::Halted) if cpu.state.halted => {
            info!(steps = summary.steps, "guest halted")
        }
        _ => info!(steps = summary.steps, "step budget exhausted"),
    }

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    out.write_all(&cpu.ports.out)?;
    print_registers(&mut out, &cpu)?;
    out.flush()?;

    if let Some(path) = &args.snapshot_save {
        let mut f = File::create(path).with_context(|| {
            format!("failed to create snapshot file for save: {}", path.display())
        })?;
        save_snapshot(&mut f, &cpu, SaveOptions::default())
            .with_context(|| format!("failed to save snapshot: {}", path.display()))?;
        info!(path = %path.display(), "snapshot saved");
    }

    Ok(())
}

fn print_registers<W: Write, P>(out: &mut W, cpu: &Vcpu<PhysicalMemory, P>) -> io::Result<()> {
    let s = &cpu.state;
    writeln!(
        out,
        "EAX={:08x} EBX={:08x} ECX={:08x} EDX={:08x}",
        s.gpr[gpr::EAX],
        s.gpr[gpr::EBX],
        s.gpr[gpr::ECX],
        s.gpr[gpr::EDX]
    )?;
    writeln!(
        out,
        "ESI={:08x} EDI={:08x} EBP={:08x} ESP={:08x}",
        s.gpr[gpr::ESI],
        s.gpr[gpr::EDI],
        s.gpr[gpr::EBP],
        s.gpr[gpr::ESP]
    )?;
    writeln!(out, "EIP={:08x} EFL={:08x} CPL={}", s.eip, s.eflags, s.cpl)?;
    for seg in SegReg::ALL {
        let cache = s.seg(seg);
        writeln!(
            out,
            "{:?}={:04x} base={:08x} limit={:08x}",
            seg, cache.selector, cache.base, cache.limit
        )?;
    }
    writeln!(
        out,
        "CR0={:08x} CR2={:08x} CR3={:08x} CR4={:08x}",
        s.cr0, s.cr2, s.cr3, s.cr4
    )?;
    writeln!(out, "mode={:?} halted={}", s.mode(), s.halted)?;
    let stats = cpu.mmu.stats();
    writeln!(
        out,
        "tlb lookups={} hits={} misses={} walks={}",
        stats.tlb_lookups, stats.tlb_hits, stats.tlb_misses, stats.page_walks
    )
}
