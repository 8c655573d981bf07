// CLASSIFICATION: COMMUNITY
// Filename: host.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Blocking canary scan on the host.

use std::time::Instant;

use log::{debug, trace};

use super::{CanaryTarget, CheckScope, CheckTargets};
use crate::canary::first_corrupted_byte;
use crate::error::{DetectorError, DetectorResult};
use crate::runtime::{ComputeRuntime, EventHandle, QueueHandle};
use crate::stats::StatsSink;

/// Read the canary bytes of `target`, flattened for images.
pub fn read_canary(runtime: &dyn ComputeRuntime, queue: QueueHandle, target: &CanaryTarget) -> DetectorResult<Vec<u8>> {
    let mut out = vec![0u8; target.len()];
    match target {
        CanaryTarget::Buffer { mem, region, .. } => {
            let backing = mem.backing.ok_or(DetectorError::UnknownMemObject(mem.handle))?;
            runtime.read_buffer(queue, backing, region.offset, &mut out, &[])?;
        }
        CanaryTarget::Svm { alloc, region } => {
            runtime.read_svm(queue, alloc.base.offset(region.offset), &mut out, &[])?;
        }
        CanaryTarget::Image { mem, geometry, .. } => {
            for seg in geometry.segments() {
                let end = seg.offset + seg.bytes(geometry.pixel);
                runtime.read_image(queue, mem.handle, seg.origin, seg.region, &mut out[seg.offset..end], &[])?;
            }
        }
    }
    Ok(out)
}

/// Wait for `event`, then scan every target and act on the first
/// corrupted byte of each canary. Returns the number of findings.
pub fn verify(scope: &CheckScope, targets: &CheckTargets, event: EventHandle, stats: &StatsSink) -> DetectorResult<usize> {
    let runtime = &*scope.runtime;
    runtime.wait_for_events(&[event])?;
    let started = Instant::now();
    let all: Vec<CanaryTarget> = targets.linear_targets().into_iter().chain(targets.image_targets()).collect();
    let mut hits = Vec::new();
    for target in &all {
        let canary = read_canary(runtime, scope.queue, target)?;
        trace!("scanned {} canary bytes for {}", canary.len(), scope.kernel.name);
        if let Some(first_bad) = first_corrupted_byte(&canary) {
            hits.push((target, first_bad));
        }
    }
    let found = hits.len();
    scope.corruptions(&hits, true)?;
    stats.record_checker_time(started.elapsed())?;
    debug!("host check of {} found {} corrupted canaries", scope.kernel.name, found);
    Ok(found)
}
