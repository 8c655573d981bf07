// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! The detector: tracked allocation, argument recording and checked
//! dispatch.
//!
//! An interception layer forwards the compute API calls it sees to a
//! [`Detector`]. Allocations made through it are padded with canaries;
//! [`Detector::enqueue_kernel`] resolves argument aliasing, picks a
//! verification strategy, swaps in a canaried clone where needed and runs
//! the host or device verifier after the kernel.

use std::mem::size_of;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, info};

use crate::canary::{BufferLayout, ImageGeometry, POISON_FILL};
use crate::check::{device, host, CheckScope, CheckTargets};
use crate::config::DetectorConfig;
use crate::error::{DetectorError, DetectorResult};
use crate::registry::{ArgBinding, ImageInfo, KernelArgument, KernelDescriptor, MemoryObject, Registry, RegistryTables, SvmRegion};
use crate::report::{capture_backtrace, KernelReportInfo, Reporter, ThreadId};
use crate::runtime::{
    ArgValue, ComputeRuntime, ContextHandle, EventHandle, ImageDesc, ImageFormat, ImageType, KernelHandle, MemFlags,
    MemHandle, NdRange, ProgramHandle, QueueHandle, SvmPtr,
};
use crate::stats::StatsSink;

pub mod clone;
pub mod dispatch;
pub mod dupes;

use clone::CloneEnv;
use dispatch::{choose_strategy, Strategy};
use dupes::DuplicateMap;

/// Canary-based overflow detector over one compute runtime.
pub struct Detector {
    runtime: Arc<dyn ComputeRuntime>,
    config: DetectorConfig,
    registry: Registry,
    reporter: Arc<Reporter>,
    stats: StatsSink,
    checker_lock: Arc<Mutex<()>>,
}

/// Binding for a by-value argument that holds the handle of a tracked
/// memory object, as `clSetKernelArg(k, i, sizeof(cl_mem), &mem)` passes it.
fn mem_from_bytes(tables: &RegistryTables, bytes: &[u8]) -> Option<ArgBinding> {
    let raw: [u8; size_of::<usize>()] = bytes.try_into().ok()?;
    tables
        .find_mem(MemHandle(usize::from_ne_bytes(raw)))
        .map(ArgBinding::Mem)
}

impl Detector {
    /// Detector over `runtime`; the log file opens on first use.
    pub fn new(runtime: Arc<dyn ComputeRuntime>, config: DetectorConfig) -> Self {
        info!(
            "canary detector up: device {:?}, strategy {:?}, underflow {}",
            config.device_preference, config.gpu_strategy, config.underflow_check
        );
        Self {
            reporter: Arc::new(Reporter::new(&config)),
            stats: StatsSink::new(config.stats, config.stats_file.clone()),
            runtime,
            config,
            registry: Registry::new(),
            checker_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Runtime all commands go through.
    pub fn runtime(&self) -> &Arc<dyn ComputeRuntime> {
        &self.runtime
    }

    /// Settings fixed at construction.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Tracked kernels, memory objects and SVM allocations.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Finding sink shared with completion callbacks.
    pub fn reporter(&self) -> &Arc<Reporter> {
        &self.reporter
    }

    /// Timing and memory statistics.
    pub fn stats(&self) -> &StatsSink {
        &self.stats
    }

    /// Corrupted canaries reported so far.
    pub fn overflow_count(&self) -> u64 {
        self.reporter.overflow_count()
    }

    fn clone_env(&self, queue: QueueHandle) -> CloneEnv<'_> {
        CloneEnv {
            runtime: &*self.runtime,
            registry: &self.registry,
            stats: &self.stats,
            queue,
            leading_canary: self.config.underflow_check,
        }
    }

    /// Allocate a buffer of `size` bytes with canaries around it.
    ///
    /// The returned handle is a sub-buffer over the padded allocation, so
    /// the application sees exactly `size` bytes. Host-pointer buffers
    /// cannot be padded; create those directly and [`track_buffer`](Self::track_buffer) them.
    pub fn create_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        if flags.contains(MemFlags::USE_HOST_PTR) {
            return Err(DetectorError::Unsupported("padding host-pointer buffers"));
        }
        if size == 0 {
            return Err(DetectorError::runtime("clCreateBuffer", -61));
        }
        let layout = BufferLayout::new(size, self.config.underflow_check);
        let raw = flags.without_host_ptr();
        let contents = layout.initial_contents(init);
        let backing = self
            .runtime
            .create_buffer(context, raw, layout.total_size(), Some(&contents))?;
        let handle = self
            .runtime
            .create_sub_buffer(backing, raw, layout.data_offset(), size)?;
        self.registry
            .lock()?
            .insert_mem(Arc::new(MemoryObject::padded_buffer(handle, backing, context, flags, layout)));
        self.stats.track_alloc(size, layout.overhead());
        Ok(handle)
    }

    /// Register a buffer the detector could not pad.
    pub fn track_buffer(&self, mem: MemHandle, context: ContextHandle, flags: MemFlags, size: usize) -> DetectorResult<()> {
        self.registry
            .lock()?
            .insert_mem(Arc::new(MemoryObject::plain_buffer(mem, context, flags, size)));
        self.stats.track_alloc(size, 0);
        Ok(())
    }

    /// Allocate an image padded with canary columns, rows and planes.
    /// `init`, when given, is laid out with `desc`'s pitches.
    pub fn create_image(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        format: &ImageFormat,
        desc: &ImageDesc,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        if flags.contains(MemFlags::USE_HOST_PTR) {
            return Err(DetectorError::Unsupported("padding host-pointer images"));
        }
        if desc.image_type == ImageType::Image1DBuffer {
            return Err(DetectorError::Unsupported("padding buffer-backed images"));
        }
        let geom = ImageGeometry::from_data(desc, format);
        let padded = geom.padded_desc(desc);
        let contents = geom.initial_contents(init, desc.row_pitch, desc.slice_pitch);
        let handle = self
            .runtime
            .create_image(context, flags.without_host_ptr(), format, &padded, Some(&contents))?;
        let info = ImageInfo {
            format: *format,
            desc: padded,
        };
        let obj = MemoryObject::image(handle, context, flags, info, true);
        self.stats.track_alloc(obj.size, obj.overhead());
        self.registry.lock()?.insert_mem(Arc::new(obj));
        Ok(handle)
    }

    /// Register an image the detector could not pad.
    pub fn track_image(
        &self,
        mem: MemHandle,
        context: ContextHandle,
        flags: MemFlags,
        format: &ImageFormat,
        desc: &ImageDesc,
    ) -> DetectorResult<()> {
        let info = ImageInfo {
            format: *format,
            desc: desc.normalized(),
        };
        let obj = MemoryObject::image(mem, context, flags, info, false);
        self.stats.track_alloc(obj.size, 0);
        self.registry.lock()?.insert_mem(Arc::new(obj));
        Ok(())
    }

    /// Release an application memory object and forget it.
    pub fn release_mem(&self, mem: MemHandle) -> DetectorResult<()> {
        let tracked = self.registry.lock()?.remove_mem(mem);
        self.runtime.release_mem(mem)?;
        if let Some(obj) = tracked {
            if let Some(backing) = obj.backing {
                self.runtime.release_mem(backing)?;
            }
            self.stats.track_free(obj.size, obj.overhead());
        }
        Ok(())
    }

    /// Allocate `size` bytes of SVM with poisoned canaries around them.
    pub fn svm_alloc(&self, context: ContextHandle, size: usize) -> DetectorResult<SvmPtr> {
        if !self.runtime.supports_svm(context) {
            return Err(DetectorError::Unsupported("shared virtual memory"));
        }
        let layout = BufferLayout::new(size, self.config.underflow_check);
        let base = self.runtime.svm_alloc(context, layout.total_size())?;
        let queue = self.runtime.internal_queue(context)?;
        let mut fills = Vec::new();
        for region in layout.regions() {
            fills.push(
                self.runtime
                    .fill_svm(queue, base.offset(region.offset), POISON_FILL, region.len, &[])?,
            );
        }
        self.runtime.wait_for_events(&fills)?;
        for e in fills {
            self.runtime.release_event(e)?;
        }
        let region = SvmRegion::new(base, context, layout);
        let ptr = region.ptr;
        self.registry.lock()?.insert_svm(Arc::new(region));
        self.stats.track_alloc(size, layout.overhead());
        debug!("svm alloc {:#x} ({} bytes) at base {:#x}", ptr.0, size, base.0);
        Ok(ptr)
    }

    /// Free an SVM allocation, whether or not the detector made it.
    pub fn svm_free(&self, context: ContextHandle, ptr: SvmPtr) -> DetectorResult<()> {
        let tracked = {
            let mut tables = self.registry.lock()?;
            match tables.find_svm(ptr) {
                Some(region) if region.ptr == ptr => tables.remove_svm(ptr),
                _ => None,
            }
        };
        match tracked {
            Some(region) => {
                self.runtime.svm_free(context, region.base)?;
                self.stats.track_free(region.size, region.layout().overhead());
                Ok(())
            }
            None => self.runtime.svm_free(context, ptr),
        }
    }

    /// Create a kernel and track it with a reference count of one.
    pub fn create_kernel(&self, program: ProgramHandle, name: &str) -> DetectorResult<KernelHandle> {
        let kernel = self.runtime.create_kernel(program, name)?;
        self.track_kernel(kernel)?;
        Ok(kernel)
    }

    /// Start tracking a kernel created outside the detector.
    pub fn track_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        if let Some(stale) = self.registry.lock()?.insert_kernel(KernelDescriptor::new(kernel)) {
            stale.delete();
        }
        Ok(())
    }

    /// Retain on the runtime and in the mirrored count.
    pub fn retain_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        self.runtime.retain_kernel(kernel)?;
        self.registry
            .lock()?
            .find_kernel_mut(kernel)
            .ok_or(DetectorError::UnknownKernel(kernel))?
            .retain();
        Ok(())
    }

    /// Drop one reference; the descriptor goes with the last one.
    pub fn release_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        self.runtime.release_kernel(kernel)?;
        let mut tables = self.registry.lock()?;
        let last = tables
            .find_kernel_mut(kernel)
            .ok_or(DetectorError::UnknownKernel(kernel))?
            .release();
        if last {
            if let Some(desc) = tables.remove_kernel(kernel) {
                desc.delete();
            }
        }
        Ok(())
    }

    /// Bind an argument on the runtime kernel and record it.
    pub fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> DetectorResult<()> {
        self.runtime.set_kernel_arg(kernel, index, value)?;
        self.record_kernel_arg(kernel, index, value)
    }

    /// Record an argument binding already applied to the runtime kernel.
    pub fn record_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> DetectorResult<()> {
        let mut tables = self.registry.lock()?;
        let binding = match value {
            ArgValue::Mem(mem) => tables
                .find_mem(mem)
                .map(ArgBinding::Mem)
                .unwrap_or(ArgBinding::Untracked(mem)),
            ArgValue::Svm(ptr) => ArgBinding::Svm {
                ptr,
                region: tables.find_svm(ptr),
            },
            ArgValue::Bytes(bytes) => mem_from_bytes(&tables, bytes).unwrap_or_else(|| ArgBinding::Value(bytes.to_vec())),
            ArgValue::Local(size) => ArgBinding::Local(size),
        };
        let desc = tables
            .find_kernel_mut(kernel)
            .ok_or(DetectorError::UnknownKernel(kernel))?;
        if desc.insert_arg(KernelArgument::new(index, binding)).is_some() {
            debug!("kernel {:?} arg {} rebound", kernel, index);
        }
        Ok(())
    }

    fn hand_back(&self, event: Option<EventHandle>, want_event: bool) -> DetectorResult<Option<EventHandle>> {
        match event {
            Some(e) if !want_event => {
                self.runtime.release_event(e)?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    /// Dispatch `kernel` with canary verification.
    ///
    /// Returns an event when `want_event` is set: for device checks one
    /// that completes once findings are reported and canaries mended, an
    /// already-complete event for host checks, or the kernel's own event
    /// when nothing needed checking.
    pub fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        range: &NdRange,
        waits: &[EventHandle],
        want_event: bool,
    ) -> DetectorResult<Option<EventHandle>> {
        let started = Instant::now();
        let rt = &*self.runtime;
        let context = rt.queue_context(queue)?;
        let num_args = rt.kernel_num_args(kernel)?;
        let (args, live_svm) = {
            let tables = self.registry.lock()?;
            let desc = tables.find_kernel(kernel).ok_or(DetectorError::UnknownKernel(kernel))?;
            (desc.args().clone(), tables.svm_in_context(context))
        };
        let dupes = DuplicateMap::resolve(num_args, &args);
        let counts = CheckTargets::collect(&args, &dupes, live_svm.clone()).counts();
        let device_type = rt.queue_device_type(queue)?;
        let strategy = choose_strategy(device_type, self.config.device_preference, self.config.gpu_strategy, counts);
        debug!("dispatch {:?}: {:?} on {:?} for {:?}", kernel, strategy, device_type, counts);

        if strategy == Strategy::None {
            let enqueue_started = Instant::now();
            let event = rt.enqueue_kernel(queue, kernel, range, waits)?;
            self.stats.record_dispatch(started.elapsed(), enqueue_started.elapsed())?;
            return self.hand_back(Some(event), want_event);
        }

        let mut report_info = KernelReportInfo::capture(rt, kernel)?;
        if self.config.print_backtrace {
            report_info = report_info.with_backtrace(capture_backtrace(self.config.backtrace_depth));
        }
        let report_info = Arc::new(report_info);
        let env = self.clone_env(queue);
        let checked = clone::create_poisoned_kernel(&env, kernel, &args, &dupes, waits)?;
        let enqueue_started = Instant::now();
        let event = rt.enqueue_kernel(queue, checked.handle, range, waits)?;
        let enqueue_time = enqueue_started.elapsed();

        let targets = CheckTargets::collect(&checked.args, &dupes, live_svm);
        let scope = CheckScope {
            runtime: self.runtime.clone(),
            context,
            queue,
            kernel: report_info,
            dupes: Arc::new(dupes.clone()),
            reporter: self.reporter.clone(),
            parent: ThreadId::current(),
            checker_lock: self.checker_lock.clone(),
        };
        let done = match strategy {
            Strategy::Device(gpu) => Some(device::verify(&scope, &targets, event, gpu)?),
            _ => {
                host::verify(&scope, &targets, event, &self.stats)?;
                None
            }
        };

        if checked.cloned {
            clone::copy_back(&env, &checked, &args, &dupes, &[event])?;
            if let Some(done) = done {
                rt.wait_for_events(&[done])?;
            }
            clone::release_poisoned_kernel(&env, checked, &dupes)?;
        }
        rt.release_event(event)?;

        let result = match done {
            Some(done) => Some(done),
            None if want_event => Some(rt.completed_event(context)?),
            None => None,
        };
        self.stats.record_dispatch(started.elapsed(), enqueue_time)?;
        self.hand_back(result, want_event)
    }

    /// Write the log summary and append the memory statistics.
    pub fn shutdown(&self) -> DetectorResult<()> {
        self.reporter.finalize();
        self.stats.write_memory_summary()?;
        info!("canary detector down after {} overflows", self.overflow_count());
        Ok(())
    }
}
