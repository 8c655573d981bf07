// CLASSIFICATION: COMMUNITY
// Filename: opencl.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! OpenCL runtime loaded at run time from the platform ICD loader.
//!
//! Entry points are resolved once with `libloading` and kept as plain
//! function pointers next to the library handle. The SVM entry points are
//! optional; without them SVM allocation reports `Unsupported`.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CString};
use std::ptr;
use std::sync::{Arc, Mutex};

use libloading::Library;
use log::{debug, info, warn};

use super::{
    ArgValue, CompletionCallback, ComputeRuntime, ContextHandle, DeviceType, EventHandle, ImageDesc, ImageFormat,
    KernelHandle, MemFlags, MemHandle, NdRange, ProgramHandle, QueueHandle, Readback, SvmPtr,
};
use crate::check::kernels::CheckerKernel;
use crate::error::{check_status, DetectorError, DetectorResult};

type ClInt = i32;
type ClUint = u32;
type Raw = *mut c_void;

const CL_KERNEL_FUNCTION_NAME: ClUint = 0x1190;
const CL_KERNEL_NUM_ARGS: ClUint = 0x1191;
const CL_KERNEL_CONTEXT: ClUint = 0x1193;
const CL_KERNEL_PROGRAM: ClUint = 0x1194;
const CL_KERNEL_ARG_NAME: ClUint = 0x119A;
const CL_KERNEL_ARG_INFO_NOT_AVAILABLE: ClInt = -19;
const CL_QUEUE_CONTEXT: ClUint = 0x1090;
const CL_QUEUE_DEVICE: ClUint = 0x1091;
const CL_DEVICE_TYPE: ClUint = 0x1000;
const CL_CONTEXT_DEVICES: ClUint = 0x1081;
const CL_BUFFER_CREATE_TYPE_REGION: ClUint = 0x1220;
const CL_COMPLETE: ClInt = 0;
const CL_TRUE: ClUint = 1;
const CL_FALSE: ClUint = 0;
const CL_MEM_READ_WRITE: u64 = 1;

#[repr(C)]
struct ClImageFormat {
    order: ClUint,
    channel_type: ClUint,
}

#[repr(C)]
struct ClImageDesc {
    image_type: ClUint,
    width: usize,
    height: usize,
    depth: usize,
    array_size: usize,
    row_pitch: usize,
    slice_pitch: usize,
    num_mip_levels: ClUint,
    num_samples: ClUint,
    mem_object: Raw,
}

#[repr(C)]
struct ClBufferRegion {
    origin: usize,
    size: usize,
}

type GetInfoFn = unsafe extern "C" fn(Raw, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type GetKernelArgInfoFn = unsafe extern "C" fn(Raw, ClUint, ClUint, usize, *mut c_void, *mut usize) -> ClInt;
type HandleFn = unsafe extern "C" fn(Raw) -> ClInt;
type CreateKernelFn = unsafe extern "C" fn(Raw, *const c_char, *mut ClInt) -> Raw;
type SetKernelArgFn = unsafe extern "C" fn(Raw, ClUint, usize, *const c_void) -> ClInt;
type SetKernelArgSvmFn = unsafe extern "C" fn(Raw, ClUint, *const c_void) -> ClInt;
type CreateBufferFn = unsafe extern "C" fn(Raw, u64, usize, *mut c_void, *mut ClInt) -> Raw;
type CreateSubBufferFn = unsafe extern "C" fn(Raw, u64, ClUint, *const c_void, *mut ClInt) -> Raw;
type CreateImageFn =
    unsafe extern "C" fn(Raw, u64, *const ClImageFormat, *const ClImageDesc, *mut c_void, *mut ClInt) -> Raw;
type SvmAllocFn = unsafe extern "C" fn(Raw, u64, usize, ClUint) -> *mut c_void;
type SvmFreeFn = unsafe extern "C" fn(Raw, *mut c_void);
type CopyBufferFn =
    unsafe extern "C" fn(Raw, Raw, Raw, usize, usize, usize, ClUint, *const Raw, *mut Raw) -> ClInt;
type CopyImageFn = unsafe extern "C" fn(
    Raw,
    Raw,
    Raw,
    *const usize,
    *const usize,
    *const usize,
    ClUint,
    *const Raw,
    *mut Raw,
) -> ClInt;
type CopyImageToBufferFn =
    unsafe extern "C" fn(Raw, Raw, Raw, *const usize, *const usize, usize, ClUint, *const Raw, *mut Raw) -> ClInt;
type SvmMemcpyFn =
    unsafe extern "C" fn(Raw, ClUint, *mut c_void, *const c_void, usize, ClUint, *const Raw, *mut Raw) -> ClInt;
type SvmMemFillFn =
    unsafe extern "C" fn(Raw, *mut c_void, *const c_void, usize, usize, ClUint, *const Raw, *mut Raw) -> ClInt;
type FillBufferFn =
    unsafe extern "C" fn(Raw, Raw, *const c_void, usize, usize, usize, ClUint, *const Raw, *mut Raw) -> ClInt;
type WriteBufferFn =
    unsafe extern "C" fn(Raw, Raw, ClUint, usize, usize, *const c_void, ClUint, *const Raw, *mut Raw) -> ClInt;
type ReadBufferFn =
    unsafe extern "C" fn(Raw, Raw, ClUint, usize, usize, *mut c_void, ClUint, *const Raw, *mut Raw) -> ClInt;
type WriteImageFn = unsafe extern "C" fn(
    Raw,
    Raw,
    ClUint,
    *const usize,
    *const usize,
    usize,
    usize,
    *const c_void,
    ClUint,
    *const Raw,
    *mut Raw,
) -> ClInt;
type ReadImageFn = unsafe extern "C" fn(
    Raw,
    Raw,
    ClUint,
    *const usize,
    *const usize,
    usize,
    usize,
    *mut c_void,
    ClUint,
    *const Raw,
    *mut Raw,
) -> ClInt;
type EnqueueNdRangeFn = unsafe extern "C" fn(
    Raw,
    Raw,
    ClUint,
    *const usize,
    *const usize,
    *const usize,
    ClUint,
    *const Raw,
    *mut Raw,
) -> ClInt;
type WaitForEventsFn = unsafe extern "C" fn(ClUint, *const Raw) -> ClInt;
type MarkerFn = unsafe extern "C" fn(Raw, ClUint, *const Raw, *mut Raw) -> ClInt;
type CreateUserEventFn = unsafe extern "C" fn(Raw, *mut ClInt) -> Raw;
type SetUserEventStatusFn = unsafe extern "C" fn(Raw, ClInt) -> ClInt;
type EventNotifyFn = unsafe extern "C" fn(Raw, ClInt, *mut c_void);
type SetEventCallbackFn = unsafe extern "C" fn(Raw, ClInt, EventNotifyFn, *mut c_void) -> ClInt;
type CreateProgramWithSourceFn =
    unsafe extern "C" fn(Raw, ClUint, *const *const c_char, *const usize, *mut ClInt) -> Raw;
type BuildNotifyFn = unsafe extern "C" fn(Raw, *mut c_void);
type BuildProgramFn =
    unsafe extern "C" fn(Raw, ClUint, *const Raw, *const c_char, Option<BuildNotifyFn>, *mut c_void) -> ClInt;
type CreateCommandQueueFn = unsafe extern "C" fn(Raw, Raw, u64, *mut ClInt) -> Raw;

struct ClFns {
    get_kernel_info: GetInfoFn,
    get_kernel_arg_info: GetKernelArgInfoFn,
    get_queue_info: GetInfoFn,
    get_device_info: GetInfoFn,
    get_context_info: GetInfoFn,
    create_kernel: CreateKernelFn,
    retain_kernel: HandleFn,
    release_kernel: HandleFn,
    set_kernel_arg: SetKernelArgFn,
    finish: HandleFn,
    create_buffer: CreateBufferFn,
    create_sub_buffer: CreateSubBufferFn,
    create_image: CreateImageFn,
    release_mem: HandleFn,
    copy_buffer: CopyBufferFn,
    copy_image: CopyImageFn,
    copy_image_to_buffer: CopyImageToBufferFn,
    fill_buffer: FillBufferFn,
    write_buffer: WriteBufferFn,
    read_buffer: ReadBufferFn,
    write_image: WriteImageFn,
    read_image: ReadImageFn,
    enqueue_nd_range: EnqueueNdRangeFn,
    wait_for_events: WaitForEventsFn,
    marker: MarkerFn,
    create_user_event: CreateUserEventFn,
    set_user_event_status: SetUserEventStatusFn,
    release_event: HandleFn,
    retain_event: HandleFn,
    set_event_callback: SetEventCallbackFn,
    create_program_with_source: CreateProgramWithSourceFn,
    build_program: BuildProgramFn,
    release_program: HandleFn,
    create_command_queue: CreateCommandQueueFn,
    svm: Option<SvmFns>,
}

struct SvmFns {
    alloc: SvmAllocFn,
    free: SvmFreeFn,
    memcpy: SvmMemcpyFn,
    mem_fill: SvmMemFillFn,
    set_kernel_arg_svm: SetKernelArgSvmFn,
}

const LIBRARY_CANDIDATES: [&str; 4] = [
    "libOpenCL.so.1",
    "libOpenCL.so",
    "OpenCL.dll",
    "/System/Library/Frameworks/OpenCL.framework/OpenCL",
];

fn load_library() -> DetectorResult<Library> {
    for candidate in LIBRARY_CANDIDATES {
        // SAFETY: probing the ICD loader runs no code beyond its initialisers.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            info!("loaded OpenCL from {}", candidate);
            return Ok(lib);
        }
    }
    Err(DetectorError::LibraryUnavailable(format!(
        "tried {}",
        LIBRARY_CANDIDATES.join(", ")
    )))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static str) -> DetectorResult<T> {
    // SAFETY: every `T` used here matches the OpenCL 1.2/2.0 prototype of `name`.
    let symbol = unsafe { lib.get::<T>(name.as_bytes()) }.map_err(|_| DetectorError::MissingSymbol(name))?;
    Ok(*symbol)
}

fn load_svm(lib: &Library) -> Option<SvmFns> {
    let fns = (|| -> DetectorResult<SvmFns> {
        Ok(SvmFns {
            alloc: load_symbol(lib, "clSVMAlloc")?,
            free: load_symbol(lib, "clSVMFree")?,
            memcpy: load_symbol(lib, "clEnqueueSVMMemcpy")?,
            mem_fill: load_symbol(lib, "clEnqueueSVMMemFill")?,
            set_kernel_arg_svm: load_symbol(lib, "clSetKernelArgSVMPointer")?,
        })
    })();
    match fns {
        Ok(f) => Some(f),
        Err(e) => {
            warn!("shared virtual memory unavailable: {}", e);
            None
        }
    }
}

fn raw(handle: usize) -> Raw {
    handle as Raw
}

/// Event wait list kept alive for the duration of one call.
struct WaitList(Vec<Raw>);

impl WaitList {
    fn new(events: &[EventHandle]) -> Self {
        WaitList(events.iter().map(|e| raw(e.0)).collect())
    }

    fn len(&self) -> ClUint {
        self.0.len() as ClUint
    }

    fn ptr(&self) -> *const Raw {
        if self.0.is_empty() {
            ptr::null()
        } else {
            self.0.as_ptr()
        }
    }
}

unsafe extern "C" fn run_completion(_event: Raw, _status: ClInt, user: *mut c_void) {
    // SAFETY: `user` came from Box::into_raw in `on_complete` and the
    // runtime invokes each registered callback exactly once.
    let callback = unsafe { Box::from_raw(user as *mut CompletionCallback) };
    callback();
}

/// OpenCL driver accessed through the ICD loader.
pub struct OpenClRuntime {
    fns: ClFns,
    checkers: Mutex<HashMap<(ContextHandle, CheckerKernel), KernelHandle>>,
    queues: Mutex<HashMap<ContextHandle, QueueHandle>>,
    _lib: Library,
}

impl OpenClRuntime {
    /// Load the ICD loader and resolve every entry point the detector uses.
    pub fn load() -> DetectorResult<Self> {
        let lib = load_library()?;
        let fns = ClFns {
            get_kernel_info: load_symbol(&lib, "clGetKernelInfo")?,
            get_kernel_arg_info: load_symbol(&lib, "clGetKernelArgInfo")?,
            get_queue_info: load_symbol(&lib, "clGetCommandQueueInfo")?,
            get_device_info: load_symbol(&lib, "clGetDeviceInfo")?,
            get_context_info: load_symbol(&lib, "clGetContextInfo")?,
            create_kernel: load_symbol(&lib, "clCreateKernel")?,
            retain_kernel: load_symbol(&lib, "clRetainKernel")?,
            release_kernel: load_symbol(&lib, "clReleaseKernel")?,
            set_kernel_arg: load_symbol(&lib, "clSetKernelArg")?,
            finish: load_symbol(&lib, "clFinish")?,
            create_buffer: load_symbol(&lib, "clCreateBuffer")?,
            create_sub_buffer: load_symbol(&lib, "clCreateSubBuffer")?,
            create_image: load_symbol(&lib, "clCreateImage")?,
            release_mem: load_symbol(&lib, "clReleaseMemObject")?,
            copy_buffer: load_symbol(&lib, "clEnqueueCopyBuffer")?,
            copy_image: load_symbol(&lib, "clEnqueueCopyImage")?,
            copy_image_to_buffer: load_symbol(&lib, "clEnqueueCopyImageToBuffer")?,
            fill_buffer: load_symbol(&lib, "clEnqueueFillBuffer")?,
            write_buffer: load_symbol(&lib, "clEnqueueWriteBuffer")?,
            read_buffer: load_symbol(&lib, "clEnqueueReadBuffer")?,
            write_image: load_symbol(&lib, "clEnqueueWriteImage")?,
            read_image: load_symbol(&lib, "clEnqueueReadImage")?,
            enqueue_nd_range: load_symbol(&lib, "clEnqueueNDRangeKernel")?,
            wait_for_events: load_symbol(&lib, "clWaitForEvents")?,
            marker: load_symbol(&lib, "clEnqueueMarkerWithWaitList")?,
            create_user_event: load_symbol(&lib, "clCreateUserEvent")?,
            set_user_event_status: load_symbol(&lib, "clSetUserEventStatus")?,
            release_event: load_symbol(&lib, "clReleaseEvent")?,
            retain_event: load_symbol(&lib, "clRetainEvent")?,
            set_event_callback: load_symbol(&lib, "clSetEventCallback")?,
            create_program_with_source: load_symbol(&lib, "clCreateProgramWithSource")?,
            build_program: load_symbol(&lib, "clBuildProgram")?,
            release_program: load_symbol(&lib, "clReleaseProgram")?,
            create_command_queue: load_symbol(&lib, "clCreateCommandQueue")?,
            svm: load_svm(&lib),
        };
        Ok(Self {
            fns,
            checkers: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            _lib: lib,
        })
    }

    fn svm(&self) -> DetectorResult<&SvmFns> {
        self.fns
            .svm
            .as_ref()
            .ok_or(DetectorError::Unsupported("shared virtual memory"))
    }

    fn info_scalar<T: Copy + Default>(
        &self,
        call: &'static str,
        f: GetInfoFn,
        object: usize,
        param: ClUint,
    ) -> DetectorResult<T> {
        let mut value = T::default();
        // SAFETY: `value` is a writable `T` and its size is passed as the limit.
        let status = unsafe {
            f(
                raw(object),
                param,
                std::mem::size_of::<T>(),
                &mut value as *mut T as *mut c_void,
                ptr::null_mut(),
            )
        };
        check_status(call, status)?;
        Ok(value)
    }

    fn info_bytes(&self, call: &'static str, f: GetInfoFn, object: usize, param: ClUint) -> DetectorResult<Vec<u8>> {
        let mut size = 0usize;
        // SAFETY: size query with a null value pointer.
        check_status(call, unsafe { f(raw(object), param, 0, ptr::null_mut(), &mut size) })?;
        let mut out = vec![0u8; size];
        // SAFETY: `out` holds exactly `size` writable bytes.
        check_status(call, unsafe {
            f(raw(object), param, size, out.as_mut_ptr() as *mut c_void, ptr::null_mut())
        })?;
        Ok(out)
    }

    fn info_string(&self, call: &'static str, f: GetInfoFn, object: usize, param: ClUint) -> DetectorResult<String> {
        let bytes = self.info_bytes(call, f, object, param)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    fn build_checker(&self, context: ContextHandle, checker: CheckerKernel) -> DetectorResult<KernelHandle> {
        let source = checker.source();
        let src_ptr = source.as_ptr() as *const c_char;
        let src_len = source.len();
        let mut status = 0;
        // SAFETY: one source string with an explicit length.
        let program = unsafe { (self.fns.create_program_with_source)(raw(context.0), 1, &src_ptr, &src_len, &mut status) };
        check_status("clCreateProgramWithSource", status)?;
        let options = CString::new(checker.build_options()).map_err(|_| DetectorError::runtime("clBuildProgram", -30))?;
        // SAFETY: builds for every device of the context; no notify callback.
        let status = unsafe { (self.fns.build_program)(program, 0, ptr::null(), options.as_ptr(), None, ptr::null_mut()) };
        if let Err(e) = check_status("clBuildProgram", status) {
            // SAFETY: program was created above and is not used again.
            unsafe { (self.fns.release_program)(program) };
            return Err(e);
        }
        let name = CString::new(checker.function_name()).map_err(|_| DetectorError::runtime("clCreateKernel", -46))?;
        let mut status = 0;
        // SAFETY: valid program and nul-terminated name.
        let kernel = unsafe { (self.fns.create_kernel)(program, name.as_ptr(), &mut status) };
        // SAFETY: the kernel keeps its own reference on the program.
        unsafe { (self.fns.release_program)(program) };
        check_status("clCreateKernel", status)?;
        debug!("built checker {} for context {:?}", checker.function_name(), context);
        Ok(KernelHandle(kernel as usize))
    }
}

impl ComputeRuntime for OpenClRuntime {
    fn kernel_num_args(&self, kernel: KernelHandle) -> DetectorResult<u32> {
        self.info_scalar("clGetKernelInfo", self.fns.get_kernel_info, kernel.0, CL_KERNEL_NUM_ARGS)
    }

    fn kernel_function_name(&self, kernel: KernelHandle) -> DetectorResult<String> {
        self.info_string("clGetKernelInfo", self.fns.get_kernel_info, kernel.0, CL_KERNEL_FUNCTION_NAME)
    }

    fn kernel_arg_name(&self, kernel: KernelHandle, index: u32) -> DetectorResult<Option<String>> {
        let f = self.fns.get_kernel_arg_info;
        let mut size = 0usize;
        // SAFETY: size query with a null value pointer.
        let status = unsafe { f(raw(kernel.0), index, CL_KERNEL_ARG_NAME, 0, ptr::null_mut(), &mut size) };
        if status == CL_KERNEL_ARG_INFO_NOT_AVAILABLE {
            return Ok(None);
        }
        check_status("clGetKernelArgInfo", status)?;
        let mut out = vec![0u8; size];
        // SAFETY: `out` holds exactly `size` writable bytes.
        let status = unsafe {
            f(
                raw(kernel.0),
                index,
                CL_KERNEL_ARG_NAME,
                size,
                out.as_mut_ptr() as *mut c_void,
                ptr::null_mut(),
            )
        };
        check_status("clGetKernelArgInfo", status)?;
        let end = out.iter().position(|&b| b == 0).unwrap_or(out.len());
        Ok(Some(String::from_utf8_lossy(&out[..end]).into_owned()))
    }

    fn kernel_context(&self, kernel: KernelHandle) -> DetectorResult<ContextHandle> {
        self.info_scalar("clGetKernelInfo", self.fns.get_kernel_info, kernel.0, CL_KERNEL_CONTEXT)
            .map(ContextHandle)
    }

    fn kernel_program(&self, kernel: KernelHandle) -> DetectorResult<ProgramHandle> {
        self.info_scalar("clGetKernelInfo", self.fns.get_kernel_info, kernel.0, CL_KERNEL_PROGRAM)
            .map(ProgramHandle)
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> DetectorResult<KernelHandle> {
        let name = CString::new(name).map_err(|_| DetectorError::runtime("clCreateKernel", -46))?;
        let mut status = 0;
        // SAFETY: nul-terminated name; status written by the call.
        let kernel = unsafe { (self.fns.create_kernel)(raw(program.0), name.as_ptr(), &mut status) };
        check_status("clCreateKernel", status)?;
        Ok(KernelHandle(kernel as usize))
    }

    fn retain_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        // SAFETY: plain handle call.
        check_status("clRetainKernel", unsafe { (self.fns.retain_kernel)(raw(kernel.0)) })
    }

    fn release_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        // SAFETY: plain handle call.
        check_status("clReleaseKernel", unsafe { (self.fns.release_kernel)(raw(kernel.0)) })
    }

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> DetectorResult<()> {
        let k = raw(kernel.0);
        // SAFETY: every value pointer refers to `size` readable bytes for the call.
        let status = unsafe {
            match value {
                ArgValue::Mem(m) => {
                    let handle = raw(m.0);
                    (self.fns.set_kernel_arg)(
                        k,
                        index,
                        std::mem::size_of::<Raw>(),
                        &handle as *const Raw as *const c_void,
                    )
                }
                ArgValue::Svm(p) => (self.svm()?.set_kernel_arg_svm)(k, index, p.0 as *const c_void),
                ArgValue::Bytes(b) => (self.fns.set_kernel_arg)(k, index, b.len(), b.as_ptr() as *const c_void),
                ArgValue::Local(n) => (self.fns.set_kernel_arg)(k, index, n, ptr::null()),
            }
        };
        check_status("clSetKernelArg", status)
    }

    fn checker_kernel(&self, context: ContextHandle, checker: CheckerKernel) -> DetectorResult<KernelHandle> {
        let mut cache = self.checkers.lock().map_err(|_| DetectorError::LockPoisoned)?;
        if let Some(k) = cache.get(&(context, checker)) {
            return Ok(*k);
        }
        let kernel = self.build_checker(context, checker)?;
        cache.insert((context, checker), kernel);
        Ok(kernel)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        range: &NdRange,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        let waits = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        let offset = range.offset.as_ref().map_or(ptr::null(), |o| o.as_ptr());
        let local = range.local.as_ref().map_or(ptr::null(), |l| l.as_ptr());
        // SAFETY: range arrays hold three entries, at least `work_dim`.
        let status = unsafe {
            (self.fns.enqueue_nd_range)(
                raw(queue.0),
                raw(kernel.0),
                range.work_dim,
                offset,
                range.global.as_ptr(),
                local,
                waits.len(),
                waits.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueNDRangeKernel", status)?;
        Ok(EventHandle(event as usize))
    }

    fn queue_context(&self, queue: QueueHandle) -> DetectorResult<ContextHandle> {
        self.info_scalar("clGetCommandQueueInfo", self.fns.get_queue_info, queue.0, CL_QUEUE_CONTEXT)
            .map(ContextHandle)
    }

    fn queue_device_type(&self, queue: QueueHandle) -> DetectorResult<DeviceType> {
        let device: usize = self.info_scalar("clGetCommandQueueInfo", self.fns.get_queue_info, queue.0, CL_QUEUE_DEVICE)?;
        let bits: u64 = self.info_scalar("clGetDeviceInfo", self.fns.get_device_info, device, CL_DEVICE_TYPE)?;
        Ok(DeviceType::from_raw(bits))
    }

    fn internal_queue(&self, context: ContextHandle) -> DetectorResult<QueueHandle> {
        let mut cache = self.queues.lock().map_err(|_| DetectorError::LockPoisoned)?;
        if let Some(q) = cache.get(&context) {
            return Ok(*q);
        }
        let devices = self.info_bytes("clGetContextInfo", self.fns.get_context_info, context.0, CL_CONTEXT_DEVICES)?;
        let first = devices
            .get(..std::mem::size_of::<usize>())
            .map(|b| {
                let mut raw_dev = [0u8; std::mem::size_of::<usize>()];
                raw_dev.copy_from_slice(b);
                usize::from_ne_bytes(raw_dev)
            })
            .ok_or(DetectorError::runtime("clGetContextInfo", -33))?;
        let mut status = 0;
        // SAFETY: device belongs to `context`; default queue properties.
        let queue = unsafe { (self.fns.create_command_queue)(raw(context.0), raw(first), 0, &mut status) };
        check_status("clCreateCommandQueue", status)?;
        let queue = QueueHandle(queue as usize);
        cache.insert(context, queue);
        Ok(queue)
    }

    fn finish(&self, queue: QueueHandle) -> DetectorResult<()> {
        // SAFETY: plain handle call.
        check_status("clFinish", unsafe { (self.fns.finish)(raw(queue.0)) })
    }

    fn supports_svm(&self, _context: ContextHandle) -> bool {
        self.fns.svm.is_some()
    }

    fn create_buffer(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        let mut flags = flags.without_host_ptr();
        let host = match init {
            Some(data) if data.len() >= size => {
                flags |= MemFlags::COPY_HOST_PTR;
                data.as_ptr() as *mut c_void
            }
            _ => ptr::null_mut(),
        };
        let mut status = 0;
        // SAFETY: with COPY_HOST_PTR the runtime reads `size` bytes from `host` during the call.
        let mem = unsafe { (self.fns.create_buffer)(raw(context.0), flags.bits(), size, host, &mut status) };
        check_status("clCreateBuffer", status)?;
        Ok(MemHandle(mem as usize))
    }

    fn create_sub_buffer(&self, parent: MemHandle, flags: MemFlags, origin: usize, size: usize) -> DetectorResult<MemHandle> {
        let region = ClBufferRegion { origin, size };
        let mut status = 0;
        // SAFETY: `region` is a valid cl_buffer_region for the call.
        let mem = unsafe {
            (self.fns.create_sub_buffer)(
                raw(parent.0),
                flags.without_host_ptr().bits(),
                CL_BUFFER_CREATE_TYPE_REGION,
                &region as *const ClBufferRegion as *const c_void,
                &mut status,
            )
        };
        check_status("clCreateSubBuffer", status)?;
        Ok(MemHandle(mem as usize))
    }

    fn create_image(
        &self,
        context: ContextHandle,
        flags: MemFlags,
        format: &ImageFormat,
        desc: &ImageDesc,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        let fmt = ClImageFormat {
            order: format.order as ClUint,
            channel_type: format.channel_type as ClUint,
        };
        let cl_desc = ClImageDesc {
            image_type: desc.image_type as ClUint,
            width: desc.width,
            height: desc.height,
            depth: desc.depth,
            array_size: desc.array_size,
            row_pitch: if init.is_some() { desc.row_pitch } else { 0 },
            slice_pitch: if init.is_some() { desc.slice_pitch } else { 0 },
            num_mip_levels: 0,
            num_samples: 0,
            mem_object: ptr::null_mut(),
        };
        let mut flags = flags.without_host_ptr();
        let host = match init {
            Some(data) => {
                flags |= MemFlags::COPY_HOST_PTR;
                data.as_ptr() as *mut c_void
            }
            None => ptr::null_mut(),
        };
        let mut status = 0;
        // SAFETY: descriptor structs live across the call; host data covers the image.
        let mem = unsafe { (self.fns.create_image)(raw(context.0), flags.bits(), &fmt, &cl_desc, host, &mut status) };
        check_status("clCreateImage", status)?;
        Ok(MemHandle(mem as usize))
    }

    fn release_mem(&self, mem: MemHandle) -> DetectorResult<()> {
        // SAFETY: plain handle call.
        check_status("clReleaseMemObject", unsafe { (self.fns.release_mem)(raw(mem.0)) })
    }

    fn svm_alloc(&self, context: ContextHandle, size: usize) -> DetectorResult<SvmPtr> {
        // SAFETY: read-write coarse-grained allocation with default alignment.
        let p = unsafe { (self.svm()?.alloc)(raw(context.0), CL_MEM_READ_WRITE, size, 0) };
        if p.is_null() {
            return Err(DetectorError::ResourceExhausted(format!("clSVMAlloc of {} bytes", size)));
        }
        Ok(SvmPtr(p as usize))
    }

    fn svm_free(&self, context: ContextHandle, ptr: SvmPtr) -> DetectorResult<()> {
        // SAFETY: `ptr` was returned by clSVMAlloc on `context`.
        unsafe { (self.svm()?.free)(raw(context.0), ptr.0 as *mut c_void) };
        Ok(())
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
        let waits = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        // SAFETY: handles and offsets are validated by the runtime.
        let status = unsafe {
            (self.fns.copy_buffer)(
                raw(queue.0),
                raw(src.0),
                raw(dst.0),
                src_offset,
                dst_offset,
                len,
                waits.len(),
                waits.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueCopyBuffer", status)?;
        Ok(EventHandle(event as usize))
    }

    fn copy_image(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        region: [usize; 3],
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        let waits = WaitList::new(waits);
        let origin = [0usize; 3];
        let mut event: Raw = ptr::null_mut();
        // SAFETY: origin and region arrays hold three entries each.
        let status = unsafe {
            (self.fns.copy_image)(
                raw(queue.0),
                raw(src.0),
                raw(dst.0),
                origin.as_ptr(),
                origin.as_ptr(),
                region.as_ptr(),
                waits.len(),
                waits.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueCopyImage", status)?;
        Ok(EventHandle(event as usize))
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
        let waits = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        // SAFETY: origin and region arrays hold three entries each.
        let status = unsafe {
            (self.fns.copy_image_to_buffer)(
                raw(queue.0),
                raw(image.0),
                raw(buffer.0),
                origin.as_ptr(),
                region.as_ptr(),
                dst_offset,
                waits.len(),
                waits.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueCopyImageToBuffer", status)?;
        Ok(EventHandle(event as usize))
    }

    fn copy_svm(
        &self,
        queue: QueueHandle,
        dst: SvmPtr,
        src: SvmPtr,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        let svm = self.svm()?;
        let waits = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        // SAFETY: both ranges lie inside live SVM allocations.
        let status = unsafe {
            (svm.memcpy)(
                raw(queue.0),
                CL_FALSE,
                dst.0 as *mut c_void,
                src.0 as *const c_void,
                len,
                waits.len(),
                waits.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueSVMMemcpy", status)?;
        Ok(EventHandle(event as usize))
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
        let waits = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        // SAFETY: one-byte pattern copied by the runtime during the call.
        let status = unsafe {
            (self.fns.fill_buffer)(
                raw(queue.0),
                raw(mem.0),
                &byte as *const u8 as *const c_void,
                1,
                offset,
                len,
                waits.len(),
                waits.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueFillBuffer", status)?;
        Ok(EventHandle(event as usize))
    }

    fn fill_svm(
        &self,
        queue: QueueHandle,
        ptr: SvmPtr,
        byte: u8,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        let svm = self.svm()?;
        let waits = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        // SAFETY: one-byte pattern copied by the runtime during the call.
        let status = unsafe {
            (svm.mem_fill)(
                raw(queue.0),
                ptr.0 as *mut c_void,
                &byte as *const u8 as *const c_void,
                1,
                len,
                waits.len(),
                waits.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueSVMMemFill", status)?;
        Ok(EventHandle(event as usize))
    }

    fn write_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &[u8]) -> DetectorResult<()> {
        // SAFETY: blocking write; `data` outlives the call.
        let status = unsafe {
            (self.fns.write_buffer)(
                raw(queue.0),
                raw(mem.0),
                CL_TRUE,
                offset,
                data.len(),
                data.as_ptr() as *const c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        check_status("clEnqueueWriteBuffer", status)
    }

    fn write_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DetectorResult<()> {
        // SAFETY: blocking write of a tightly packed region.
        let status = unsafe {
            (self.fns.write_image)(
                raw(queue.0),
                raw(image.0),
                CL_TRUE,
                origin.as_ptr(),
                region.as_ptr(),
                0,
                0,
                data.as_ptr() as *const c_void,
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        check_status("clEnqueueWriteImage", status)
    }

    fn read_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        out: &mut [u8],
        waits: &[EventHandle],
    ) -> DetectorResult<()> {
        let waits = WaitList::new(waits);
        // SAFETY: blocking read into `out`, which outlives the call.
        let status = unsafe {
            (self.fns.read_buffer)(
                raw(queue.0),
                raw(mem.0),
                CL_TRUE,
                offset,
                out.len(),
                out.as_mut_ptr() as *mut c_void,
                waits.len(),
                waits.ptr(),
                ptr::null_mut(),
            )
        };
        check_status("clEnqueueReadBuffer", status)
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
        let waits = WaitList::new(waits);
        // SAFETY: blocking read of a tightly packed region into `out`.
        let status = unsafe {
            (self.fns.read_image)(
                raw(queue.0),
                raw(image.0),
                CL_TRUE,
                origin.as_ptr(),
                region.as_ptr(),
                0,
                0,
                out.as_mut_ptr() as *mut c_void,
                waits.len(),
                waits.ptr(),
                ptr::null_mut(),
            )
        };
        check_status("clEnqueueReadImage", status)
    }

    fn read_svm(&self, queue: QueueHandle, ptr: SvmPtr, out: &mut [u8], waits: &[EventHandle]) -> DetectorResult<()> {
        let svm = self.svm()?;
        let waits = WaitList::new(waits);
        // SAFETY: blocking copy out of a live SVM allocation.
        let status = unsafe {
            (svm.memcpy)(
                raw(queue.0),
                CL_TRUE,
                out.as_mut_ptr() as *mut c_void,
                ptr.0 as *const c_void,
                out.len(),
                waits.len(),
                waits.ptr(),
                std::ptr::null_mut(),
            )
        };
        check_status("clEnqueueSVMMemcpy", status)
    }

    fn read_buffer_async(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<Readback> {
        let data = Arc::new(Mutex::new(vec![0u8; len]));
        let dst = data.lock().map_err(|_| DetectorError::LockPoisoned)?.as_mut_ptr();
        let list = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        // SAFETY: the vector is never resized and a clone of `data` is held
        // by the completion callback below until the read has finished.
        let status = unsafe {
            (self.fns.read_buffer)(
                raw(queue.0),
                raw(mem.0),
                CL_FALSE,
                offset,
                len,
                dst as *mut c_void,
                list.len(),
                list.ptr(),
                &mut event,
            )
        };
        check_status("clEnqueueReadBuffer", status)?;
        let event = EventHandle(event as usize);
        let keep = Arc::clone(&data);
        self.on_complete(event, Box::new(move || drop(keep)))?;
        Ok(Readback::new(event, data))
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> DetectorResult<()> {
        if events.is_empty() {
            return Ok(());
        }
        let list = WaitList::new(events);
        // SAFETY: list of live events.
        check_status("clWaitForEvents", unsafe { (self.fns.wait_for_events)(list.len(), list.ptr()) })
    }

    fn marker(&self, queue: QueueHandle, waits: &[EventHandle]) -> DetectorResult<EventHandle> {
        let list = WaitList::new(waits);
        let mut event: Raw = ptr::null_mut();
        // SAFETY: list of live events.
        let status = unsafe { (self.fns.marker)(raw(queue.0), list.len(), list.ptr(), &mut event) };
        check_status("clEnqueueMarkerWithWaitList", status)?;
        Ok(EventHandle(event as usize))
    }

    fn completed_event(&self, context: ContextHandle) -> DetectorResult<EventHandle> {
        let event = self.user_event(context)?;
        self.complete_user_event(event)?;
        Ok(event)
    }

    fn user_event(&self, context: ContextHandle) -> DetectorResult<EventHandle> {
        let mut status = 0;
        // SAFETY: user event on a live context.
        let event = unsafe { (self.fns.create_user_event)(raw(context.0), &mut status) };
        check_status("clCreateUserEvent", status)?;
        Ok(EventHandle(event as usize))
    }

    fn complete_user_event(&self, event: EventHandle) -> DetectorResult<()> {
        // SAFETY: `event` came from `user_event` and is still referenced.
        check_status("clSetUserEventStatus", unsafe {
            (self.fns.set_user_event_status)(raw(event.0), CL_COMPLETE)
        })
    }

    fn retain_event(&self, event: EventHandle) -> DetectorResult<()> {
        // SAFETY: caller holds a reference to `event`.
        check_status("clRetainEvent", unsafe { (self.fns.retain_event)(raw(event.0)) })
    }

    fn release_event(&self, event: EventHandle) -> DetectorResult<()> {
        if event.is_null() {
            return Ok(());
        }
        // SAFETY: plain handle call.
        check_status("clReleaseEvent", unsafe { (self.fns.release_event)(raw(event.0)) })
    }

    fn on_complete(&self, event: EventHandle, callback: CompletionCallback) -> DetectorResult<()> {
        let user = Box::into_raw(Box::new(callback)) as *mut c_void;
        // SAFETY: `run_completion` consumes `user` exactly once.
        let status = unsafe { (self.fns.set_event_callback)(raw(event.0), CL_COMPLETE, run_completion, user) };
        if status != 0 {
            // SAFETY: registration failed, so the runtime never saw `user`.
            drop(unsafe { Box::from_raw(user as *mut CompletionCallback) });
        }
        check_status("clSetEventCallback", status)
    }
}
