// SPDX-License-Identifier: AGPL-3.0-only

//! `npu`: command-line front end for NCP blobs and loopback sessions.
//!
//! ```text
//! USAGE:
//!   npu inspect <ncp>               Print header and resolved tables
//!   npu sample <out>                Write the reference NCP to a file
//!   npu run [--ncp <path>] [-n N]   Stream N frames through the loopback firmware
//! ```
//!
//! Driver settings come from the `NPU_*` environment variables; logging from
//! `RUST_LOG`.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use npu_driver::prelude::*;
use npu_ncp::{resolve, AddrInfo, MemoryType, NcpBase, NcpBuilder, NcpView};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "npu", about = "NCP inspection and loopback NPU sessions", version)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Print the header and resolved tables of an NCP blob.
    Inspect {
        /// Path to the NCP blob.
        ncp: PathBuf,
    },
    /// Write the reference network (1 IFM, 1 OFM, 1 weight) to a file.
    Sample {
        /// Output path.
        out: PathBuf,
    },
    /// Run a full session against the loopback firmware.
    Run {
        /// NCP blob to load; the reference network when omitted.
        #[arg(long)]
        ncp: Option<PathBuf>,
        /// Frames to stream.
        #[arg(short = 'n', long, default_value_t = 8)]
        frames: u32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Cmd::Inspect { ncp } => cmd_inspect(&ncp)?,
        Cmd::Sample { out } => cmd_sample(&out)?,
        Cmd::Run { ncp, frames } => cmd_run(ncp.as_deref(), frames)?,
    }

    Ok(())
}

fn reference_blob() -> Result<Vec<u8>> {
    Ok(NcpBuilder::new(2048)
        .feature_map(MemoryType::InputFeatureMap, 1024)
        .feature_map(MemoryType::OutputFeatureMap, 512)
        .weight(64, 256)
        .build()?)
}

fn read_blob(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn print_table(name: &str, infos: &[AddrInfo]) {
    println!("{name} ({}):", infos.len());
    for info in infos {
        println!(
            "  av {:>3}  {:>8} B  daddr {:#010x}  {}x{}x{} @{}bpp  {:?}",
            info.av_index,
            info.size,
            info.daddr,
            info.width,
            info.height,
            info.channels,
            info.pixel_format,
            info.memory_type
        );
    }
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let blob = read_blob(path)?;
    let view = NcpView::new(&blob).context("parsing NCP header")?;
    let header = view.header();
    println!("Blob         : {} ({} bytes)", path.display(), blob.len());
    println!("Header       : v{} magic {:#010x}", header.hdr_version, header.magic_number);
    println!(
        "Memory vec   : {} @ {:#x}",
        header.memory_vector_count, header.memory_vector_offset
    );
    println!(
        "Address vec  : {} @ {:#x}",
        header.address_vector_count, header.address_vector_offset
    );

    let base = NcpBase::new(npu_driver::memory::IOVA_BASE, 0);
    let resolved = resolve(&blob, base).context("resolving NCP")?;
    println!(
        "Classes      : IFM {} OFM {} IMB {} WGT {} (ignored {})",
        resolved.counts.ifm,
        resolved.counts.ofm,
        resolved.counts.imb,
        resolved.counts.weight,
        resolved.counts.ignored
    );
    println!("I/O table    : {} entries", resolved.io_vector_count());
    println!();
    print_table("IFM", &resolved.ifm);
    print_table("OFM", &resolved.ofm);
    print_table("IMB", &resolved.imb);
    print_table("WGT", &resolved.weights);
    Ok(())
}

fn cmd_sample(out: &Path) -> Result<()> {
    let blob = reference_blob()?;
    std::fs::write(out, &blob).with_context(|| format!("writing {}", out.display()))?;
    println!("Wrote {} ({} bytes)", out.display(), blob.len());
    Ok(())
}

fn cmd_run(path: Option<&Path>, frames: u32) -> Result<()> {
    let blob = match path {
        Some(path) => read_blob(path)?,
        None => reference_blob()?,
    };
    let handle = NcpHandle::new(&blob);
    let config = DriverConfig::from_env().context("driver configuration")?;
    let slots = config.io_slots;
    let device = NpuDevice::loopback(config).context("starting loopback device")?;

    let mut session = device.open()?;
    session.set_graph(&handle).context("set_graph")?;
    let (ifm, ofm) = match session.resolved() {
        Some(resolved) => (resolved.ifm.clone(), resolved.ofm.clone()),
        None => bail!("graph resolved to nothing"),
    };
    let input_layouts: Vec<Layout> = ifm.iter().map(Layout::of).collect();
    let output_layouts: Vec<Layout> = ofm.iter().map(Layout::of).collect();
    session.set_format(Direction::Input, &input_layouts).context("input format")?;
    session.set_format(Direction::Output, &output_layouts).context("output format")?;
    session.start()?;

    let memory = device.memory();
    let inputs = ifm
        .iter()
        .map(|info| memory.alloc(info.size as usize))
        .collect::<npu_driver::Result<Vec<_>>>()?;
    let outputs = ofm
        .iter()
        .map(|info| memory.alloc(info.size as usize))
        .collect::<npu_driver::Result<Vec<_>>>()?;

    for frame_id in 1..=frames {
        let slot = (frame_id as usize - 1) % slots;
        let input_bufs = inputs.iter().map(DeviceBuffer::of).collect::<npu_driver::Result<_>>()?;
        let output_bufs = outputs.iter().map(DeviceBuffer::of).collect::<npu_driver::Result<_>>()?;
        let input = BufferSet::new(Direction::Input, slot, frame_id, input_bufs);
        let output = BufferSet::new(Direction::Output, slot, frame_id, output_bufs);
        session.prepare(&input)?;
        session.prepare(&output)?;
        session.queue(&input, &output)?;
        session.dequeue(Direction::Input)?;
        let done = session.dequeue(Direction::Output)?;
        println!("frame {:>4}  slot {:>2}  {}", done.set.frame_id, done.set.index, done.result);
    }

    session.stop()?;
    session.close()?;
    device.power_down()?;
    tracing::info!(live = memory.live_buffers(), "Session closed");
    println!("Done         : {frames} frames over {slots} slots");
    Ok(())
}
