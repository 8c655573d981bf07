// CLASSIFICATION: COMMUNITY
// Filename: clcanary_selftest.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Run the detector end to end against the simulated runtime.
//!
//! Prints the number of overflows found. With `--exit-on-overflow` the
//! process instead ends with the configured exit code at the first one.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use clcanary::config::{DevicePreference, GpuStrategy};
use clcanary::runtime::image::{ChannelOrder, ChannelType, ImageDesc, ImageFormat};
use clcanary::runtime::sim::{SimKernelDef, SimRuntime};
use clcanary::runtime::{ArgValue, DeviceType, MemFlags, NdRange};
use clcanary::{hooks, Detector, DetectorConfig};

const DATA_LEN: usize = 64;
const IMAGE_SIDE: usize = 8;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    Single,
    Bulk,
    BulkPointer,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Device {
    Gpu,
    Cpu,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    Buffer,
    Svm,
    Image,
}

#[derive(Parser)]
#[command(name = "clcanary_selftest", about = "Canary detector self test", version = "0.1")]
struct Cli {
    #[arg(long, value_enum, default_value = "bulk")]
    strategy: Strategy,
    #[arg(long, value_enum, default_value = "gpu")]
    device: Device,
    #[arg(long, value_enum, default_value = "buffer")]
    scenario: Scenario,
    /// Make the kernel write past the end of its argument.
    #[arg(long)]
    inject_overflow: bool,
    #[arg(long)]
    exit_on_overflow: bool,
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    exit_code: i32,
    /// Check on the device even where the host would be chosen.
    #[arg(long)]
    force_gpu: bool,
}

fn write_kernel() -> SimKernelDef {
    SimKernelDef::new("scribble", &["out", "count"]).with_body(|l| {
        let n = l.scalar_u32(1) as usize;
        let out = l.buffer(0);
        let n = n.min(out.len());
        out[..n].fill(0x5a);
    })
}

fn svm_kernel() -> SimKernelDef {
    SimKernelDef::new("scribble_svm", &["out", "count"]).with_body(|l| {
        let n = l.scalar_u32(1) as usize;
        let out = l.svm(0);
        let n = n.min(out.len());
        out[..n].fill(0x5a);
    })
}

fn image_kernel() -> SimKernelDef {
    SimKernelDef::new("paint", &["img", "width"]).with_body(|l| {
        let w = l.scalar_u32(1) as usize;
        for x in 0..w {
            l.write_texel(0, [x, 0, 0], &[0x11]);
        }
    })
}

fn run(cli: &Cli) -> anyhow::Result<u64> {
    let mut config = DetectorConfig::from_env();
    config.gpu_strategy = match cli.strategy {
        Strategy::Single => GpuStrategy::SingleObject,
        Strategy::Bulk => GpuStrategy::BulkCopy,
        Strategy::BulkPointer => GpuStrategy::BulkPointer,
    };
    if cli.force_gpu {
        config.device_preference = DevicePreference::ForceGpu;
    }
    config.exit_on_overflow = cli.exit_on_overflow;
    config.exit_code = cli.exit_code;

    let sim = Arc::new(SimRuntime::new());
    let device = match cli.device {
        Device::Gpu => DeviceType::Gpu,
        Device::Cpu => DeviceType::Cpu,
    };
    let ctx = sim.create_context(device)?;
    let queue = sim.create_queue(ctx)?;
    let program = sim.create_program(ctx, vec![write_kernel(), svm_kernel(), image_kernel()])?;
    let det = hooks::install(Detector::new(sim, config))?;

    let extra = if cli.inject_overflow { 4 } else { 0 };
    match cli.scenario {
        Scenario::Buffer => {
            let buf = det.create_buffer(ctx, MemFlags::READ_WRITE, DATA_LEN, None)?;
            let k = det.create_kernel(program, "scribble")?;
            det.set_kernel_arg(k, 0, ArgValue::Mem(buf))?;
            det.set_kernel_arg(k, 1, ArgValue::Bytes(&((DATA_LEN + extra) as u32).to_ne_bytes()))?;
            det.enqueue_kernel(queue, k, &NdRange::linear(1, None), &[], false)?;
            det.release_kernel(k)?;
            det.release_mem(buf)?;
        }
        Scenario::Svm => {
            let ptr = det.svm_alloc(ctx, DATA_LEN).context("SVM allocation")?;
            let k = det.create_kernel(program, "scribble_svm")?;
            det.set_kernel_arg(k, 0, ArgValue::Svm(ptr))?;
            det.set_kernel_arg(k, 1, ArgValue::Bytes(&((DATA_LEN + extra) as u32).to_ne_bytes()))?;
            det.enqueue_kernel(queue, k, &NdRange::linear(1, None), &[], false)?;
            det.release_kernel(k)?;
            det.svm_free(ctx, ptr)?;
        }
        Scenario::Image => {
            let format = ImageFormat::new(ChannelOrder::R, ChannelType::UnsignedInt8);
            let desc = ImageDesc::image_2d(IMAGE_SIDE, IMAGE_SIDE);
            let img = det.create_image(ctx, MemFlags::READ_WRITE, &format, &desc, None)?;
            let k = det.create_kernel(program, "paint")?;
            det.set_kernel_arg(k, 0, ArgValue::Mem(img))?;
            det.set_kernel_arg(k, 1, ArgValue::Bytes(&((IMAGE_SIDE + extra) as u32).to_ne_bytes()))?;
            det.enqueue_kernel(queue, k, &NdRange::linear(1, None), &[], false)?;
            det.release_kernel(k)?;
            det.release_mem(img)?;
        }
    }
    let found = det.overflow_count();
    hooks::teardown()?;
    Ok(found)
}

fn main() -> anyhow::Result<()> {
    let _ = env_logger::builder().format_timestamp(None).try_init();
    let cli = Cli::parse();
    let found = run(&cli)?;
    println!("overflows: {}", found);
    Ok(())
}
