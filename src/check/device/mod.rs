// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Canary checks run as checker kernels on the dispatch queue.
//!
//! Each pass fills a result array with one slot per canary, enqueues the
//! checker behind the application's kernel and reads the results back
//! without blocking. Findings are reported from the read's completion
//! callback. The returned event is a user event completed by the last of
//! those callbacks, so it also covers the reports and mends they enqueue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, error};

use super::kernels::{CheckerKernel, CHECKER_LOCAL_SIZE, NO_CORRUPTION};
use super::{CanaryTarget, CheckScope, CheckTargets};
use crate::canary::POISON_FILL;
use crate::config::GpuStrategy;
use crate::error::{DetectorError, DetectorResult, OrFatal};
use crate::runtime::{ArgValue, ComputeRuntime, EventHandle, MemFlags, MemHandle, NdRange, SvmPtr};

mod bulk;
mod single;

/// Argument of a checker dispatch.
#[derive(Clone, Copy, Debug)]
pub(crate) enum CheckerArg {
    U32(u32),
    Byte(u8),
    Mem(MemHandle),
    Svm(SvmPtr),
}

/// One enqueued checker pass awaiting its results.
pub(crate) struct PendingCheck {
    pub first: MemHandle,
    pub slots: Vec<CanaryTarget>,
    pub checker_event: EventHandle,
    /// Buffers only the checker reads; released once the read is queued.
    pub staging: Vec<MemHandle>,
    /// SVM staging area, freed after the results arrive.
    pub svm_staging: Option<SvmPtr>,
}

/// Completes `done` once every registered callback has run.
///
/// Starts with one hold for the enqueueing thread, so callbacks that run
/// while passes are still being queued cannot complete it early.
pub(crate) struct PassTracker {
    runtime: Arc<dyn ComputeRuntime>,
    done: EventHandle,
    outstanding: AtomicUsize,
    passes: AtomicUsize,
}

impl PassTracker {
    fn new(runtime: Arc<dyn ComputeRuntime>, done: EventHandle) -> Self {
        Self {
            runtime,
            done,
            outstanding: AtomicUsize::new(1),
            passes: AtomicUsize::new(0),
        }
    }

    fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn begin_pass(&self) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.begin();
    }

    /// Drop one hold; the last one completes and releases `done`.
    fn end(&self) -> DetectorResult<()> {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.runtime.complete_user_event(self.done)?;
            self.runtime.release_event(self.done)?;
        }
        Ok(())
    }

    fn passes(&self) -> usize {
        self.passes.load(Ordering::Relaxed)
    }
}

fn as_u32(value: usize) -> DetectorResult<u32> {
    u32::try_from(value).map_err(|_| DetectorError::ResourceExhausted(format!("{} exceeds checker range", value)))
}

/// Result array of `slots` entries, all "no corruption".
pub(crate) fn results_buffer(scope: &CheckScope, slots: usize) -> DetectorResult<MemHandle> {
    let init: Vec<u8> = (0..slots.max(1)).flat_map(|_| NO_CORRUPTION.to_ne_bytes()).collect();
    scope
        .runtime
        .create_buffer(scope.context, MemFlags::READ_WRITE, init.len(), Some(&init))
}

/// Bind `args` to the cached `checker` and enqueue it over `items` work-items.
pub(crate) fn dispatch(
    scope: &CheckScope,
    checker: CheckerKernel,
    args: &[CheckerArg],
    items: usize,
    waits: &[EventHandle],
) -> DetectorResult<EventHandle> {
    let runtime = &*scope.runtime;
    let kernel = runtime.checker_kernel(scope.context, checker)?;
    let _guard = scope.checker_lock.lock().map_err(|_| DetectorError::LockPoisoned)?;
    for (i, arg) in args.iter().enumerate() {
        let word: [u8; 4];
        let byte: [u8; 1];
        let value = match *arg {
            CheckerArg::U32(v) => {
                word = v.to_ne_bytes();
                ArgValue::Bytes(&word)
            }
            CheckerArg::Byte(b) => {
                byte = [b];
                ArgValue::Bytes(&byte)
            }
            CheckerArg::Mem(m) => ArgValue::Mem(m),
            CheckerArg::Svm(p) => ArgValue::Svm(p),
        };
        runtime.set_kernel_arg(kernel, i as u32, value)?;
    }
    let global = items.max(1).div_ceil(CHECKER_LOCAL_SIZE) * CHECKER_LOCAL_SIZE;
    runtime.enqueue_kernel(
        scope.queue,
        kernel,
        &NdRange::linear(global, Some(CHECKER_LOCAL_SIZE)),
        waits,
    )
}

/// Queue the result read for `pending` and report from its completion.
pub(crate) fn finish(scope: &CheckScope, pending: PendingCheck, tracker: &Arc<PassTracker>) -> DetectorResult<()> {
    let runtime = &*scope.runtime;
    let len = pending.slots.len() * 4;
    let readback = runtime.read_buffer_async(scope.queue, pending.first, 0, len, &[pending.checker_event])?;
    runtime.release_event(pending.checker_event)?;
    runtime.release_mem(pending.first)?;
    for mem in pending.staging {
        runtime.release_mem(mem)?;
    }
    let read = readback.event();
    let scope = scope.clone();
    let slots = pending.slots;
    let svm_staging = pending.svm_staging;
    let pass = tracker.clone();
    pass.begin_pass();
    let registered = runtime.on_complete(
        read,
        Box::new(move || {
            let results = readback.bytes().or_fatal();
            let hits: Vec<(&CanaryTarget, usize)> = slots
                .iter()
                .zip(results.chunks_exact(4))
                .map(|(target, cell)| (target, u32::from_ne_bytes([cell[0], cell[1], cell[2], cell[3]])))
                .filter(|&(_, first_bad)| first_bad != NO_CORRUPTION)
                .map(|(target, first_bad)| (target, first_bad as usize))
                .collect();
            scope.corruptions(&hits, false).or_fatal();
            if let Some(ptr) = svm_staging {
                scope.runtime.svm_free(scope.context, ptr).or_fatal();
            }
            scope.runtime.release_event(read).or_fatal();
            pass.end().or_fatal();
        }),
    );
    if let Err(e) = registered {
        tracker.end()?;
        return Err(e);
    }
    Ok(())
}

/// Stage image canaries back to back and scan them bytewise.
fn check_images(
    scope: &CheckScope,
    images: &[CanaryTarget],
    waits: &[EventHandle],
    tracker: &Arc<PassTracker>,
) -> DetectorResult<()> {
    let runtime = &*scope.runtime;
    let mut ends = Vec::with_capacity(images.len());
    let mut total = 0;
    for target in images {
        total += target.len();
        ends.push(as_u32(total)?);
    }
    let staging = runtime.create_buffer(scope.context, MemFlags::READ_WRITE, total.max(1), None)?;
    let mut copies = Vec::new();
    let mut base = 0;
    for target in images {
        if let CanaryTarget::Image { mem, geometry, .. } = target {
            for seg in geometry.segments() {
                copies.push(runtime.copy_image_to_buffer(
                    scope.queue,
                    mem.handle,
                    staging,
                    seg.origin,
                    seg.region,
                    base + seg.offset,
                    waits,
                )?);
            }
        }
        base += target.len();
    }
    let ends_bytes: Vec<u8> = ends.iter().flat_map(|e| e.to_ne_bytes()).collect();
    let ends_mem = runtime.create_buffer(scope.context, MemFlags::READ_ONLY, ends_bytes.len().max(4), Some(&ends_bytes))?;
    let first = results_buffer(scope, images.len())?;
    let checker_event = dispatch(
        scope,
        CheckerKernel::ImageCopy,
        &[
            CheckerArg::Byte(POISON_FILL),
            CheckerArg::U32(as_u32(images.len())?),
            CheckerArg::Mem(ends_mem),
            CheckerArg::Mem(staging),
            CheckerArg::Mem(first),
        ],
        total,
        &copies,
    )?;
    for e in copies {
        runtime.release_event(e)?;
    }
    finish(
        scope,
        PendingCheck {
            first,
            slots: images.to_vec(),
            checker_event,
            staging: vec![staging, ends_mem],
            svm_staging: None,
        },
        tracker,
    )
}

fn queue_passes(
    scope: &CheckScope,
    targets: &CheckTargets,
    waits: &[EventHandle],
    strategy: GpuStrategy,
    tracker: &Arc<PassTracker>,
) -> DetectorResult<()> {
    let linear = targets.linear_targets();
    let images = targets.image_targets();
    match strategy {
        GpuStrategy::SingleObject => {
            single::check_linear(scope, &linear, waits, tracker)?;
            for image in &images {
                check_images(scope, std::slice::from_ref(image), waits, tracker)?;
            }
        }
        GpuStrategy::BulkCopy => {
            bulk::check_linear_copy(scope, &linear, waits, tracker)?;
            if !images.is_empty() {
                check_images(scope, &images, waits, tracker)?;
            }
        }
        GpuStrategy::BulkPointer => {
            bulk::check_linear_pointer(scope, &linear, waits, tracker)?;
            if !images.is_empty() {
                check_images(scope, &images, waits, tracker)?;
            }
        }
    }
    debug!(
        "{:?} check of {}: {} linear, {} image canaries in {} passes",
        strategy,
        scope.kernel.name,
        linear.len(),
        images.len(),
        tracker.passes()
    );
    Ok(())
}

/// Enqueue checker passes for `targets` behind `event` and return an event
/// that completes after every pass has been read back, reported and mended.
pub fn verify(scope: &CheckScope, targets: &CheckTargets, event: EventHandle, strategy: GpuStrategy) -> DetectorResult<EventHandle> {
    let runtime = &*scope.runtime;
    let done = runtime.user_event(scope.context)?;
    runtime.retain_event(done)?;
    let tracker = Arc::new(PassTracker::new(scope.runtime.clone(), done));

    // The kernel itself holds `done` open, which matters when no pass is queued.
    runtime.retain_event(event)?;
    let kernel_hold = tracker.clone();
    let release_runtime = scope.runtime.clone();
    tracker.begin();
    if let Err(e) = runtime.on_complete(
        event,
        Box::new(move || {
            release_runtime.release_event(event).or_fatal();
            kernel_hold.end().or_fatal();
        }),
    ) {
        runtime.release_event(event)?;
        tracker.end()?;
        tracker.end()?;
        runtime.release_event(done)?;
        return Err(e);
    }

    let queued = queue_passes(scope, targets, &[event], strategy, &tracker);
    tracker.end()?;
    if let Err(e) = queued {
        error!("device check of {} stopped early: {}", scope.kernel.name, e);
        runtime.release_event(done)?;
        return Err(e);
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::SimRuntime;
    use crate::runtime::DeviceType;

    #[test]
    fn tracker_completes_after_the_last_hold() {
        let sim = Arc::new(SimRuntime::new());
        let ctx = sim.create_context(DeviceType::Gpu).unwrap();
        let done = sim.user_event(ctx).unwrap();
        let tracker = PassTracker::new(sim.clone(), done);
        tracker.begin_pass();
        tracker.begin_pass();
        tracker.end().unwrap();
        tracker.end().unwrap();
        assert_eq!(sim.pending_user_events(), 1);
        tracker.end().unwrap();
        assert_eq!(sim.pending_user_events(), 0);
        assert_eq!(tracker.passes(), 2);
    }
}
