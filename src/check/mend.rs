// CLASSIFICATION: COMMUNITY
// Filename: mend.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Restoring poison after a reported corruption.

use log::debug;

use super::CanaryTarget;
use crate::canary::{poison_region, POISON_FILL};
use crate::error::{DetectorError, DetectorResult};
use crate::runtime::{ComputeRuntime, EventHandle, QueueHandle};

fn enqueue_linear(
    runtime: &dyn ComputeRuntime,
    queue: QueueHandle,
    target: &CanaryTarget,
) -> DetectorResult<Option<EventHandle>> {
    let event = match target {
        CanaryTarget::Buffer { mem, region, .. } => {
            let backing = mem.backing.ok_or(DetectorError::UnknownMemObject(mem.handle))?;
            runtime.fill_buffer(queue, backing, POISON_FILL, region.offset, region.len, &[])?
        }
        CanaryTarget::Svm { alloc, region } => {
            runtime.fill_svm(queue, alloc.base.offset(region.offset), POISON_FILL, region.len, &[])?
        }
        CanaryTarget::Image { .. } => return Ok(None),
    };
    Ok(Some(event))
}

/// Re-poison `target` and wait for it.
pub(super) fn restore_blocking(
    runtime: &dyn ComputeRuntime,
    queue: QueueHandle,
    target: &CanaryTarget,
) -> DetectorResult<()> {
    if let CanaryTarget::Image { mem, geometry, .. } = target {
        let segments = geometry.segments();
        let largest = segments.iter().map(|s| s.bytes(geometry.pixel)).max().unwrap_or(0);
        let poison = poison_region(largest);
        for seg in segments {
            runtime.write_image(queue, mem.handle, seg.origin, seg.region, &poison[..seg.bytes(geometry.pixel)])?;
        }
        return Ok(());
    }
    if let Some(event) = enqueue_linear(runtime, queue, target)? {
        runtime.wait_for_events(&[event])?;
        runtime.release_event(event)?;
    }
    Ok(())
}

/// Enqueue a re-poison of a linear canary without waiting. Image canaries
/// are left as found; only the host verifier rewrites them.
pub(super) fn restore_enqueued(
    runtime: &dyn ComputeRuntime,
    queue: QueueHandle,
    target: &CanaryTarget,
) -> DetectorResult<()> {
    match enqueue_linear(runtime, queue, target)? {
        Some(event) => runtime.release_event(event),
        None => {
            debug!("image canary left unmended after device check");
            Ok(())
        }
    }
}
