// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Compute runtime seam.
//!
//! The detector never talks to a driver directly. Everything it needs from
//! the compute API goes through [`ComputeRuntime`], implemented by
//! [`opencl::OpenClRuntime`] for real devices and [`sim::SimRuntime`] for an
//! in-process emulation.

use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::check::kernels::CheckerKernel;
use crate::error::{DetectorError, DetectorResult};

pub mod image;
pub mod opencl;
pub mod sim;

pub use image::{ChannelOrder, ChannelType, ImageDesc, ImageFormat, ImageType};

macro_rules! native_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub usize);

        impl $name {
            pub const NULL: Self = Self(0);

            pub fn is_null(self) -> bool {
                self.0 == 0
            }
        }
    };
}

native_handle!(
    /// Native `cl_context`.
    ContextHandle
);
native_handle!(
    /// Native `cl_command_queue`.
    QueueHandle
);
native_handle!(
    /// Native `cl_program`.
    ProgramHandle
);
native_handle!(
    /// Native `cl_kernel`.
    KernelHandle
);
native_handle!(
    /// Native `cl_mem` (buffer, sub-buffer or image).
    MemHandle
);
native_handle!(
    /// Native `cl_event`.
    EventHandle
);
native_handle!(
    /// Shared virtual memory address.
    SvmPtr
);

impl SvmPtr {
    pub fn offset(self, bytes: usize) -> SvmPtr {
        SvmPtr(self.0 + bytes)
    }
}

bitflags! {
    /// `cl_mem_flags` subset the detector inspects.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MemFlags: u64 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
    }
}

impl MemFlags {
    /// Flags for an internal copy: same access, no host pointer semantics.
    pub fn without_host_ptr(self) -> MemFlags {
        self - (MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR | MemFlags::ALLOC_HOST_PTR)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Accelerator,
    Other,
}

impl DeviceType {
    pub fn from_raw(bits: u64) -> Self {
        if bits & (1 << 1) != 0 {
            DeviceType::Cpu
        } else if bits & (1 << 2) != 0 {
            DeviceType::Gpu
        } else if bits & (1 << 3) != 0 {
            DeviceType::Accelerator
        } else {
            DeviceType::Other
        }
    }
}

/// Value bound to a kernel argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgValue<'a> {
    Mem(MemHandle),
    Svm(SvmPtr),
    Bytes(&'a [u8]),
    /// `__local` allocation of the given size.
    Local(usize),
}

/// Work-item space of a dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NdRange {
    pub work_dim: u32,
    pub offset: Option<[usize; 3]>,
    pub global: [usize; 3],
    pub local: Option<[usize; 3]>,
}

impl NdRange {
    pub fn linear(global: usize, local: Option<usize>) -> Self {
        Self {
            work_dim: 1,
            offset: None,
            global: [global, 1, 1],
            local: local.map(|l| [l, 1, 1]),
        }
    }

    pub fn global_items(&self) -> usize {
        self.global[..self.work_dim as usize].iter().product()
    }
}

/// Host memory filled by a non-blocking read once `event` completes.
#[derive(Clone, Debug)]
pub struct Readback {
    event: EventHandle,
    data: Arc<Mutex<Vec<u8>>>,
}

impl Readback {
    pub fn new(event: EventHandle, data: Arc<Mutex<Vec<u8>>>) -> Self {
        Self { event, data }
    }

    pub fn event(&self) -> EventHandle {
        self.event
    }

    /// Copy of the read bytes. Only meaningful after `event` completed.
    pub fn bytes(&self) -> DetectorResult<Vec<u8>> {
        self.data
            .lock()
            .map(|d| d.clone())
            .map_err(|_| DetectorError::LockPoisoned)
    }
}

pub type CompletionCallback = Box<dyn FnOnce() + Send + 'static>;

/// Compute API surface the detector relies on.
///
/// Commands returning an [`EventHandle`] are non-blocking; the caller owns
/// the returned event. Commands returning `()` block until done.
pub trait ComputeRuntime: Send + Sync {
    fn kernel_num_args(&self, kernel: KernelHandle) -> DetectorResult<u32>;
    fn kernel_function_name(&self, kernel: KernelHandle) -> DetectorResult<String>;
    /// `Ok(None)` when the program was built without argument info.
    fn kernel_arg_name(&self, kernel: KernelHandle, index: u32) -> DetectorResult<Option<String>>;
    fn kernel_context(&self, kernel: KernelHandle) -> DetectorResult<ContextHandle>;
    fn kernel_program(&self, kernel: KernelHandle) -> DetectorResult<ProgramHandle>;
    fn create_kernel(&self, program: ProgramHandle, name: &str) -> DetectorResult<KernelHandle>;
    fn retain_kernel(&self, kernel: KernelHandle) -> DetectorResult<()>;
    fn release_kernel(&self, kernel: KernelHandle) -> DetectorResult<()>;
    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> DetectorResult<()>;
    /// Build (or fetch from cache) one of the canary checker kernels.
    fn checker_kernel(&self, context: ContextHandle, checker: CheckerKernel) -> DetectorResult<KernelHandle>;
    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        range: &NdRange,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle>;

    fn queue_context(&self, queue: QueueHandle) -> DetectorResult<ContextHandle>;
    fn queue_device_type(&self, queue: QueueHandle) -> DetectorResult<DeviceType>;
    /// Queue on the first device of `context` for the detector's own commands.
    fn internal_queue(&self, context: ContextHandle) -> DetectorResult<QueueHandle>;
    fn finish(&self, queue: QueueHandle) -> DetectorResult<()>;
    fn supports_svm(&self, context: ContextHandle) -> bool;

    fn create_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle>;
    fn create_sub_buffer(&self, parent: MemHandle, flags: MemFlags, origin: usize, size: usize) -> DetectorResult<MemHandle>;
    fn create_image(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        format: &ImageFormat,
        desc: &ImageDesc,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle>;
    fn release_mem(&self, mem: MemHandle) -> DetectorResult<()>;
    fn svm_alloc(&self, context: ContextHandle, size: usize) -> DetectorResult<SvmPtr>;
    fn svm_free(&self, context: ContextHandle, ptr: SvmPtr) -> DetectorResult<()>;

    #[allow(clippy::too_many_arguments)]
    fn copy_buffer(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle>;
    /// Copy `region` from the origin of `src` to the origin of `dst`.
    fn copy_image(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        region: [usize; 3],
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle>;
    #[allow(clippy::too_many_arguments)]
    fn copy_image_to_buffer(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        buffer: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle>;
    fn copy_svm(
        &self,
        queue: QueueHandle,
        dst: SvmPtr,
        src: SvmPtr,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle>;
    fn fill_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        byte: u8,
        offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle>;
    fn fill_svm(
        &self,
        queue: QueueHandle,
        ptr: SvmPtr,
        byte: u8,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle>;
    fn write_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &[u8]) -> DetectorResult<()>;
    fn write_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DetectorResult<()>;
    fn read_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        out: &mut [u8],
        waits: &[EventHandle],
    ) -> DetectorResult<()>;
    fn read_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        out: &mut [u8],
        waits: &[EventHandle],
    ) -> DetectorResult<()>;
    fn read_svm(&self, queue: QueueHandle, ptr: SvmPtr, out: &mut [u8], waits: &[EventHandle]) -> DetectorResult<()>;
    fn read_buffer_async(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<Readback>;

    fn wait_for_events(&self, events: &[EventHandle]) -> DetectorResult<()>;
    fn marker(&self, queue: QueueHandle, waits: &[EventHandle]) -> DetectorResult<EventHandle>;
    /// An event that is already complete, for callers expecting one.
    fn completed_event(&self, context: ContextHandle) -> DetectorResult<EventHandle>;
    fn release_event(&self, event: EventHandle) -> DetectorResult<()>;
    fn retain_event(&self, event: EventHandle) -> DetectorResult<()>;
    /// A pending event that only `complete_user_event` completes.
    fn user_event(&self, context: ContextHandle) -> DetectorResult<EventHandle>;
    fn complete_user_event(&self, event: EventHandle) -> DetectorResult<()>;
    /// Run `callback` once `event` has completed.
    fn on_complete(&self, event: EventHandle, callback: CompletionCallback) -> DetectorResult<()>;
}
