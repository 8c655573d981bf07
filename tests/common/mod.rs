// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

#![allow(dead_code)]

use std::sync::Arc;

use clcanary::runtime::sim::{SimKernelDef, SimRuntime};
use clcanary::runtime::{ContextHandle, DeviceType, ProgramHandle, QueueHandle};
use clcanary::{Detector, DetectorConfig};

pub struct Rig {
    pub sim: Arc<SimRuntime>,
    pub det: Detector,
    pub ctx: ContextHandle,
    pub queue: QueueHandle,
    pub program: ProgramHandle,
}

pub fn rig(device: DeviceType, config: DetectorConfig, kernels: Vec<SimKernelDef>) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = Arc::new(SimRuntime::new());
    let ctx = sim.create_context(device).unwrap();
    let queue = sim.create_queue(ctx).unwrap();
    let program = sim.create_program(ctx, kernels).unwrap();
    let det = Detector::new(sim.clone(), config);
    Rig {
        sim,
        det,
        ctx,
        queue,
        program,
    }
}

pub fn word(v: u32) -> [u8; 4] {
    v.to_ne_bytes()
}

/// Fills the first `count` bytes reachable from buffer argument 0.
pub fn scribble() -> SimKernelDef {
    SimKernelDef::new("scribble", &["out", "count"]).with_body(|l| {
        let n = l.scalar_u32(1) as usize;
        let out = l.buffer(0);
        let n = n.min(out.len());
        out[..n].fill(0x5a);
    })
}

/// Zeroes the single byte at offset `at` from buffer argument 0.
pub fn poke() -> SimKernelDef {
    SimKernelDef::new("poke", &["out", "at"]).with_body(|l| {
        let at = l.scalar_u32(1) as usize;
        if let Some(b) = l.buffer(0).get_mut(at) {
            *b = 0;
        }
    })
}
