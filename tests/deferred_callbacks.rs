// CLASSIFICATION: COMMUNITY
// Filename: deferred_callbacks.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Device checks when completion callbacks run late, as they do on a real
//! driver thread, instead of inline from `on_complete`.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use clcanary::canary::{POISON_FILL, POISON_FILL_LENGTH};
use clcanary::check::kernels::CheckerKernel;
use clcanary::config::{DevicePreference, GpuStrategy};
use clcanary::runtime::sim::SimRuntime;
use clcanary::runtime::{
    ArgValue, CompletionCallback, ComputeRuntime, ContextHandle, DeviceType, EventHandle, ImageDesc, ImageFormat,
    KernelHandle, MemFlags, MemHandle, NdRange, ProgramHandle, QueueHandle, Readback, SvmPtr,
};
use clcanary::{Detector, DetectorConfig, DetectorResult};
use common::{scribble, word};

const LEN: usize = 64;

/// Holds every completion callback until `fire` runs them, or until a
/// wait on a pending user event would otherwise block.
struct Deferred {
    sim: Arc<SimRuntime>,
    queued: Mutex<Vec<CompletionCallback>>,
    pending_user: Mutex<HashSet<EventHandle>>,
}

impl Deferred {
    fn new(sim: Arc<SimRuntime>) -> Arc<Self> {
        Arc::new(Self {
            sim,
            queued: Mutex::new(Vec::new()),
            pending_user: Mutex::new(HashSet::new()),
        })
    }

    fn queued(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    /// Run queued callbacks in registration order.
    fn fire(&self) {
        loop {
            let batch: Vec<CompletionCallback> = std::mem::take(&mut *self.queued.lock().unwrap());
            if batch.is_empty() {
                return;
            }
            for callback in batch {
                callback();
            }
        }
    }
}

impl ComputeRuntime for Deferred {
    fn kernel_num_args(&self, kernel: KernelHandle) -> DetectorResult<u32> {
        self.sim.kernel_num_args(kernel)
    }
    fn kernel_function_name(&self, kernel: KernelHandle) -> DetectorResult<String> {
        self.sim.kernel_function_name(kernel)
    }
    fn kernel_arg_name(&self, kernel: KernelHandle, index: u32) -> DetectorResult<Option<String>> {
        self.sim.kernel_arg_name(kernel, index)
    }
    fn kernel_context(&self, kernel: KernelHandle) -> DetectorResult<ContextHandle> {
        self.sim.kernel_context(kernel)
    }
    fn kernel_program(&self, kernel: KernelHandle) -> DetectorResult<ProgramHandle> {
        self.sim.kernel_program(kernel)
    }
    fn create_kernel(&self, program: ProgramHandle, name: &str) -> DetectorResult<KernelHandle> {
        self.sim.create_kernel(program, name)
    }
    fn retain_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        self.sim.retain_kernel(kernel)
    }
    fn release_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        self.sim.release_kernel(kernel)
    }
    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> DetectorResult<()> {
        self.sim.set_kernel_arg(kernel, index, value)
    }
    fn checker_kernel(&self, context: ContextHandle, checker: CheckerKernel) -> DetectorResult<KernelHandle> {
        self.sim.checker_kernel(context, checker)
    }
    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        range: &NdRange,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        self.sim.enqueue_kernel(queue, kernel, range, waits)
    }
    fn queue_context(&self, queue: QueueHandle) -> DetectorResult<ContextHandle> {
        self.sim.queue_context(queue)
    }
    fn queue_device_type(&self, queue: QueueHandle) -> DetectorResult<DeviceType> {
        self.sim.queue_device_type(queue)
    }
    fn internal_queue(&self, context: ContextHandle) -> DetectorResult<QueueHandle> {
        self.sim.internal_queue(context)
    }
    fn finish(&self, queue: QueueHandle) -> DetectorResult<()> {
        self.sim.finish(queue)
    }
    fn supports_svm(&self, context: ContextHandle) -> bool {
        self.sim.supports_svm(context)
    }
    fn create_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        self.sim.create_buffer(context, flags, size, init)
    }
    fn create_sub_buffer(&self, parent: MemHandle, flags: MemFlags, origin: usize, size: usize) -> DetectorResult<MemHandle> {
        self.sim.create_sub_buffer(parent, flags, origin, size)
    }
    fn create_image(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        format: &ImageFormat,
        desc: &ImageDesc,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        self.sim.create_image(context, flags, format, desc, init)
    }
    fn release_mem(&self, mem: MemHandle) -> DetectorResult<()> {
        self.sim.release_mem(mem)
    }
    fn svm_alloc(&self, context: ContextHandle, size: usize) -> DetectorResult<SvmPtr> {
        self.sim.svm_alloc(context, size)
    }
    fn svm_free(&self, context: ContextHandle, ptr: SvmPtr) -> DetectorResult<()> {
        self.sim.svm_free(context, ptr)
    }
    fn copy_buffer(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        self.sim.copy_buffer(queue, src, dst, src_offset, dst_offset, len, waits)
    }
    fn copy_image(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        region: [usize; 3],
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        self.sim.copy_image(queue, src, dst, region, waits)
    }
    fn copy_image_to_buffer(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        buffer: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        self.sim.copy_image_to_buffer(queue, image, buffer, origin, region, dst_offset, waits)
    }
    fn copy_svm(&self, queue: QueueHandle, dst: SvmPtr, src: SvmPtr, len: usize, waits: &[EventHandle]) -> DetectorResult<EventHandle> {
        self.sim.copy_svm(queue, dst, src, len, waits)
    }
    fn fill_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        byte: u8,
        offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        self.sim.fill_buffer(queue, mem, byte, offset, len, waits)
    }
    fn fill_svm(&self, queue: QueueHandle, ptr: SvmPtr, byte: u8, len: usize, waits: &[EventHandle]) -> DetectorResult<EventHandle> {
        self.sim.fill_svm(queue, ptr, byte, len, waits)
    }
    fn write_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &[u8]) -> DetectorResult<()> {
        self.sim.write_buffer(queue, mem, offset, data)
    }
    fn write_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DetectorResult<()> {
        self.sim.write_image(queue, image, origin, region, data)
    }
    fn read_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        out: &mut [u8],
        waits: &[EventHandle],
    ) -> DetectorResult<()> {
        self.sim.read_buffer(queue, mem, offset, out, waits)
    }
    fn read_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        out: &mut [u8],
        waits: &[EventHandle],
    ) -> DetectorResult<()> {
        self.sim.read_image(queue, image, origin, region, out, waits)
    }
    fn read_svm(&self, queue: QueueHandle, ptr: SvmPtr, out: &mut [u8], waits: &[EventHandle]) -> DetectorResult<()> {
        self.sim.read_svm(queue, ptr, out, waits)
    }
    fn read_buffer_async(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<Readback> {
        self.sim.read_buffer_async(queue, mem, offset, len, waits)
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> DetectorResult<()> {
        let blocks = {
            let pending = self.pending_user.lock().unwrap();
            events.iter().any(|e| pending.contains(e))
        };
        if blocks {
            self.fire();
        }
        self.sim.wait_for_events(events)
    }
    fn marker(&self, queue: QueueHandle, waits: &[EventHandle]) -> DetectorResult<EventHandle> {
        self.sim.marker(queue, waits)
    }
    fn completed_event(&self, context: ContextHandle) -> DetectorResult<EventHandle> {
        self.sim.completed_event(context)
    }
    fn release_event(&self, event: EventHandle) -> DetectorResult<()> {
        self.sim.release_event(event)
    }
    fn retain_event(&self, event: EventHandle) -> DetectorResult<()> {
        self.sim.retain_event(event)
    }
    fn user_event(&self, context: ContextHandle) -> DetectorResult<EventHandle> {
        let event = self.sim.user_event(context)?;
        self.pending_user.lock().unwrap().insert(event);
        Ok(event)
    }
    fn complete_user_event(&self, event: EventHandle) -> DetectorResult<()> {
        self.pending_user.lock().unwrap().remove(&event);
        self.sim.complete_user_event(event)
    }
    fn on_complete(&self, _event: EventHandle, callback: CompletionCallback) -> DetectorResult<()> {
        self.queued.lock().unwrap().push(callback);
        Ok(())
    }
}

struct DeferredRig {
    sim: Arc<SimRuntime>,
    rt: Arc<Deferred>,
    det: Detector,
    ctx: ContextHandle,
    queue: QueueHandle,
    program: ProgramHandle,
}

fn deferred_rig(strategy: GpuStrategy) -> DeferredRig {
    let _ = env_logger::builder().is_test(true).try_init();
    let sim = Arc::new(SimRuntime::new());
    let ctx = sim.create_context(DeviceType::Gpu).unwrap();
    let queue = sim.create_queue(ctx).unwrap();
    let program = sim.create_program(ctx, vec![scribble()]).unwrap();
    let rt = Deferred::new(sim.clone());
    let mut cfg = DetectorConfig::quiet();
    cfg.device_preference = DevicePreference::ForceGpu;
    cfg.gpu_strategy = strategy;
    let det = Detector::new(rt.clone(), cfg);
    DeferredRig {
        sim,
        rt,
        det,
        ctx,
        queue,
        program,
    }
}

const STRATEGIES: [GpuStrategy; 3] = [GpuStrategy::SingleObject, GpuStrategy::BulkCopy, GpuStrategy::BulkPointer];

#[test]
fn clone_outlives_late_mend() {
    for strategy in STRATEGIES {
        let r = deferred_rig(strategy);
        let buf = r.sim.create_buffer(r.ctx, MemFlags::READ_WRITE, LEN, None).unwrap();
        r.det.track_buffer(buf, r.ctx, MemFlags::READ_WRITE, LEN).unwrap();
        let k = r.det.create_kernel(r.program, "scribble").unwrap();
        r.det.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
        r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(LEN as u32 + 1))).unwrap();

        let live_before = r.sim.live_mem_objects();
        r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();

        assert_eq!(r.rt.queued(), 0, "{:?}", strategy);
        assert_eq!(r.sim.pending_user_events(), 0);
        assert_eq!(r.det.overflow_count(), 1, "{:?}", strategy);
        assert_eq!(r.sim.live_mem_objects(), live_before, "{:?}", strategy);
        assert_eq!(r.sim.mem_contents(buf).unwrap(), vec![0x5a; LEN]);
    }
}

#[test]
fn returned_event_covers_the_mend() {
    for strategy in STRATEGIES {
        let r = deferred_rig(strategy);
        let buf = r.det.create_buffer(r.ctx, MemFlags::READ_WRITE, LEN, None).unwrap();
        let k = r.det.create_kernel(r.program, "scribble").unwrap();
        r.det.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
        r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(LEN as u32 + 3))).unwrap();

        let done = r
            .det
            .enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], true)
            .unwrap()
            .unwrap();
        assert_eq!(r.det.overflow_count(), 0, "{:?}", strategy);
        assert_eq!(r.sim.pending_user_events(), 1);

        r.rt.wait_for_events(&[done]).unwrap();
        assert_eq!(r.det.overflow_count(), 1, "{:?}", strategy);
        let obj = r.det.registry().lock().unwrap().find_mem(buf).unwrap();
        let backing = r.sim.mem_contents(obj.backing.unwrap()).unwrap();
        assert_eq!(backing.len(), LEN + POISON_FILL_LENGTH);
        assert!(backing[LEN..].iter().all(|&b| b == POISON_FILL), "{:?}", strategy);
        r.rt.release_event(done).unwrap();
        r.det.release_mem(buf).unwrap();
        assert_eq!(r.sim.live_mem_objects(), 0);
    }
}

#[test]
fn unwanted_event_still_completes_later() {
    let r = deferred_rig(GpuStrategy::BulkCopy);
    let buf = r.det.create_buffer(r.ctx, MemFlags::READ_WRITE, LEN, None).unwrap();
    let k = r.det.create_kernel(r.program, "scribble").unwrap();
    r.det.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(LEN as u32 + 8))).unwrap();
    r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();
    assert_eq!(r.sim.pending_user_events(), 1);

    r.rt.fire();
    assert_eq!(r.sim.pending_user_events(), 0);
    assert_eq!(r.det.overflow_count(), 1);
}
