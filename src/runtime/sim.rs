// CLASSIFICATION: COMMUNITY
// Filename: sim.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! In-process emulation of the compute runtime.
//!
//! Buffers, images and SVM live in host memory and every command completes
//! before it returns, so completion callbacks run immediately. Application
//! kernels are host closures; the checker kernels are emulated with the
//! semantics of their OpenCL C source. Sub-buffers are views into their
//! parent, so a kernel writing past the end of a sub-buffer lands in the
//! parent's bytes just as it would on a device.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use super::{
    ArgValue, CompletionCallback, ComputeRuntime, ContextHandle, DeviceType, EventHandle, ImageDesc, ImageFormat,
    KernelHandle, MemFlags, MemHandle, NdRange, ProgramHandle, QueueHandle, Readback, SvmPtr,
};
use crate::check::kernels::{CheckerKernel, NO_CORRUPTION};
use crate::error::{DetectorError, DetectorResult};

const CL_INVALID_VALUE: i32 = -30;
const CL_INVALID_CONTEXT: i32 = -34;
const CL_INVALID_COMMAND_QUEUE: i32 = -36;
const CL_INVALID_MEM_OBJECT: i32 = -38;
const CL_INVALID_PROGRAM: i32 = -44;
const CL_INVALID_KERNEL_NAME: i32 = -46;
const CL_INVALID_KERNEL: i32 = -48;
const CL_INVALID_ARG_INDEX: i32 = -49;
const CL_INVALID_KERNEL_ARGS: i32 = -52;
const CL_INVALID_BUFFER_SIZE: i32 = -61;
const CL_INVALID_EVENT: i32 = -58;

const SVM_BASE: usize = 0x7f00_0000_0000;
const SVM_GUARD: usize = 0x1000;

/// Host closure standing in for a device kernel.
pub type KernelBody = Arc<dyn Fn(&mut SimLaunch<'_>) + Send + Sync>;

/// A kernel exported by a simulated program.
#[derive(Clone)]
pub struct SimKernelDef {
    name: String,
    arg_names: Vec<String>,
    arg_info: bool,
    body: Option<KernelBody>,
}

impl SimKernelDef {
    pub fn new(name: &str, arg_names: &[&str]) -> Self {
        Self {
            name: name.into(),
            arg_names: arg_names.iter().map(|s| s.to_string()).collect(),
            arg_info: true,
            body: None,
        }
    }

    /// Behave like a program built without `-cl-kernel-arg-info`.
    pub fn without_arg_info(mut self) -> Self {
        self.arg_info = false;
        self
    }

    pub fn with_body<F>(mut self, body: F) -> Self
    where
        F: Fn(&mut SimLaunch<'_>) + Send + Sync + 'static,
    {
        self.body = Some(Arc::new(body));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum SimArg {
    Mem(MemHandle),
    Svm(SvmPtr),
    Bytes(Vec<u8>),
    Local(usize),
}

struct SimContext {
    device: DeviceType,
    svm: bool,
    queue: Option<QueueHandle>,
}

struct SimProgram {
    context: ContextHandle,
    kernels: HashMap<String, SimKernelDef>,
}

struct SimKernel {
    program: ProgramHandle,
    context: ContextHandle,
    def: SimKernelDef,
    checker: Option<CheckerKernel>,
    num_args: u32,
    args: BTreeMap<u32, SimArg>,
    refs: u32,
}

enum SimStorage {
    Buffer(Vec<u8>),
    SubBuffer { parent: MemHandle, origin: usize },
    Image { format: ImageFormat, desc: ImageDesc, bytes: Vec<u8> },
}

struct SimMem {
    context: ContextHandle,
    size: usize,
    storage: SimStorage,
    refs: u32,
}

struct SimSvm {
    context: ContextHandle,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct SimState {
    next_handle: usize,
    next_svm: usize,
    contexts: HashMap<ContextHandle, SimContext>,
    queues: HashMap<QueueHandle, ContextHandle>,
    programs: HashMap<ProgramHandle, SimProgram>,
    kernels: HashMap<KernelHandle, SimKernel>,
    checkers: HashMap<(ContextHandle, CheckerKernel), KernelHandle>,
    mems: HashMap<MemHandle, SimMem>,
    svm: BTreeMap<usize, SimSvm>,
    launches: Vec<String>,
    /// User events not yet completed, with callbacks waiting on them.
    user_events: HashMap<EventHandle, Vec<CompletionCallback>>,
}

fn err(call: &'static str, status: i32) -> DetectorError {
    DetectorError::runtime(call, status)
}

impl SimState {
    fn handle(&mut self) -> usize {
        self.next_handle += 1;
        self.next_handle * 0x10
    }

    fn event(&mut self) -> EventHandle {
        EventHandle(self.handle())
    }

    fn context(&self, call: &'static str, ctx: ContextHandle) -> DetectorResult<&SimContext> {
        self.contexts.get(&ctx).ok_or_else(|| err(call, CL_INVALID_CONTEXT))
    }

    fn queue(&self, call: &'static str, queue: QueueHandle) -> DetectorResult<ContextHandle> {
        self.queues.get(&queue).copied().ok_or_else(|| err(call, CL_INVALID_COMMAND_QUEUE))
    }

    fn kernel(&self, call: &'static str, kernel: KernelHandle) -> DetectorResult<&SimKernel> {
        self.kernels.get(&kernel).ok_or_else(|| err(call, CL_INVALID_KERNEL))
    }

    fn mem(&self, call: &'static str, mem: MemHandle) -> DetectorResult<&SimMem> {
        self.mems.get(&mem).ok_or_else(|| err(call, CL_INVALID_MEM_OBJECT))
    }

    /// Root storage handle and byte origin of `mem`.
    fn resolve(&self, call: &'static str, mem: MemHandle) -> DetectorResult<(MemHandle, usize)> {
        match self.mem(call, mem)?.storage {
            SimStorage::SubBuffer { parent, origin } => Ok((parent, origin)),
            _ => Ok((mem, 0)),
        }
    }

    fn root_bytes_mut(&mut self, call: &'static str, root: MemHandle) -> DetectorResult<&mut Vec<u8>> {
        match self.mems.get_mut(&root).map(|m| &mut m.storage) {
            Some(SimStorage::Buffer(bytes)) | Some(SimStorage::Image { bytes, .. }) => Ok(bytes),
            _ => Err(err(call, CL_INVALID_MEM_OBJECT)),
        }
    }

    /// Bytes from the start of `mem` to the end of its root allocation.
    fn tail_mut(&mut self, call: &'static str, mem: MemHandle) -> DetectorResult<&mut [u8]> {
        let (root, origin) = self.resolve(call, mem)?;
        let bytes = self.root_bytes_mut(call, root)?;
        bytes.get_mut(origin..).ok_or_else(|| err(call, CL_INVALID_VALUE))
    }

    /// `len` bytes at `offset` inside `mem`, bounded by its size.
    fn range_mut(&mut self, call: &'static str, mem: MemHandle, offset: usize, len: usize) -> DetectorResult<&mut [u8]> {
        let size = self.mem(call, mem)?.size;
        if offset + len > size {
            return Err(err(call, CL_INVALID_VALUE));
        }
        Ok(&mut self.tail_mut(call, mem)?[offset..offset + len])
    }

    fn image(&self, call: &'static str, mem: MemHandle) -> DetectorResult<(ImageFormat, ImageDesc)> {
        match self.mem(call, mem)?.storage {
            SimStorage::Image { format, desc, .. } => Ok((format, desc)),
            _ => Err(err(call, CL_INVALID_MEM_OBJECT)),
        }
    }

    fn image_row_offsets(
        &self,
        call: &'static str,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
    ) -> DetectorResult<(Vec<usize>, usize)> {
        let (format, desc) = self.image(call, image)?;
        let ext = desc.extents();
        let pixel = format.pixel_size();
        for d in 0..3 {
            if origin[d] + region[d] > ext[d] {
                return Err(err(call, CL_INVALID_VALUE));
            }
        }
        let mut rows = Vec::with_capacity(region[1] * region[2]);
        for z in 0..region[2] {
            for y in 0..region[1] {
                rows.push((((origin[2] + z) * ext[1] + origin[1] + y) * ext[0] + origin[0]) * pixel);
            }
        }
        Ok((rows, region[0] * pixel))
    }

    fn read_image_rows(
        &mut self,
        call: &'static str,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
    ) -> DetectorResult<Vec<u8>> {
        let (rows, row_len) = self.image_row_offsets(call, image, origin, region)?;
        let bytes = self.root_bytes_mut(call, image)?;
        let mut out = Vec::with_capacity(rows.len() * row_len);
        for at in rows {
            out.extend_from_slice(&bytes[at..at + row_len]);
        }
        Ok(out)
    }

    fn write_image_rows(
        &mut self,
        call: &'static str,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DetectorResult<()> {
        let (rows, row_len) = self.image_row_offsets(call, image, origin, region)?;
        if data.len() < rows.len() * row_len {
            return Err(err(call, CL_INVALID_VALUE));
        }
        let bytes = self.root_bytes_mut(call, image)?;
        for (i, at) in rows.into_iter().enumerate() {
            bytes[at..at + row_len].copy_from_slice(&data[i * row_len..(i + 1) * row_len]);
        }
        Ok(())
    }

    fn svm_tail_mut(&mut self, call: &'static str, ptr: SvmPtr) -> DetectorResult<&mut [u8]> {
        let (base, alloc) = self
            .svm
            .range_mut(..=ptr.0)
            .next_back()
            .ok_or_else(|| err(call, CL_INVALID_VALUE))?;
        let offset = ptr.0 - *base;
        alloc.bytes.get_mut(offset..).ok_or_else(|| err(call, CL_INVALID_VALUE))
    }

    fn svm_range_mut(&mut self, call: &'static str, ptr: SvmPtr, len: usize) -> DetectorResult<&mut [u8]> {
        self.svm_tail_mut(call, ptr)?
            .get_mut(..len)
            .ok_or_else(|| err(call, CL_INVALID_VALUE))
    }

    fn release_mem(&mut self, mem: MemHandle) -> DetectorResult<()> {
        let entry = self
            .mems
            .get_mut(&mem)
            .ok_or_else(|| err("clReleaseMemObject", CL_INVALID_MEM_OBJECT))?;
        entry.refs -= 1;
        if entry.refs == 0 {
            if let Some(SimMem {
                storage: SimStorage::SubBuffer { parent, .. },
                ..
            }) = self.mems.remove(&mem)
            {
                self.release_mem(parent)?;
            }
        }
        Ok(())
    }

    fn run_checker(&mut self, checker: CheckerKernel, args: &BTreeMap<u32, SimArg>, items: usize) -> DetectorResult<()> {
        const CALL: &str = "clEnqueueNDRangeKernel";
        let results = match checker {
            CheckerKernel::BufferCopy | CheckerKernel::BufferCopyNoSvm => {
                let words = arg_u32(args, 0)? as usize;
                let buff_end = arg_u32(args, 1)? as usize;
                let svm_end = arg_u32(args, 2)? as usize;
                let poison = arg_u32(args, 3)?;
                let staged = self.tail_mut(CALL, arg_mem(args, 4)?)?.to_vec();
                let svm_staged = match checker {
                    CheckerKernel::BufferCopy => match args.get(&5) {
                        Some(SimArg::Svm(ptr)) => self.svm_tail_mut(CALL, *ptr)?.to_vec(),
                        _ => return Err(err(CALL, CL_INVALID_KERNEL_ARGS)),
                    },
                    _ => Vec::new(),
                };
                let end = match checker {
                    CheckerKernel::BufferCopy => svm_end,
                    _ => svm_end.min(buff_end),
                };
                let mut found = Vec::new();
                for tid in 0..items.min(end) {
                    let ret = if tid < buff_end {
                        compare_word(poison, tid % words, &staged, tid)
                    } else {
                        compare_word(poison, tid % words, &svm_staged, tid - buff_end)
                    };
                    found.push((tid / words, ret));
                }
                found
            }
            CheckerKernel::SingleRegion => {
                let length = arg_u32(args, 0)? as usize;
                let region = arg_u32(args, 1)? as usize;
                let poison = arg_u32(args, 2)?;
                let offset = arg_u32(args, 3)? as usize;
                let target = match args.get(&4) {
                    Some(SimArg::Mem(m)) => self.tail_mut(CALL, *m)?,
                    Some(SimArg::Svm(p)) => self.svm_tail_mut(CALL, *p)?,
                    _ => return Err(err(CALL, CL_INVALID_KERNEL_ARGS)),
                };
                let target = target.get_mut(offset..).ok_or_else(|| err(CALL, CL_INVALID_VALUE))?;
                (0..items.min(length))
                    .map(|tid| (region, compare_and_mend_word(poison, tid, target, tid)))
                    .collect()
            }
            CheckerKernel::SvmPointer => {
                let length = arg_u32(args, 0)? as usize;
                let end_buffs = arg_u32(args, 1)? as usize;
                let end_svm = arg_u32(args, 2)? as usize;
                let poison = arg_u32(args, 3)?;
                let table: Vec<u64> = self
                    .tail_mut(CALL, arg_mem(args, 5)?)?
                    .chunks_exact(8)
                    .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                    .collect();
                let staged_mem = arg_mem(args, 4)?;
                let mut found = Vec::new();
                for tid in 0..items.min(end_svm) {
                    let local = tid % length;
                    let ret = if tid < end_buffs {
                        let staged = self.tail_mut(CALL, staged_mem)?;
                        compare_and_mend_word(poison, local, staged, tid)
                    } else {
                        let ptr = table
                            .get((tid - end_buffs) / length)
                            .copied()
                            .ok_or_else(|| err(CALL, CL_INVALID_VALUE))?;
                        let svm = self.svm_tail_mut(CALL, SvmPtr(ptr as usize))?;
                        compare_and_mend_word(poison, local, svm, local)
                    };
                    found.push((tid / length, ret));
                }
                found
            }
            CheckerKernel::ImageCopy => {
                let poison = match args.get(&0) {
                    Some(SimArg::Bytes(b)) if !b.is_empty() => b[0],
                    _ => return Err(err(CALL, CL_INVALID_KERNEL_ARGS)),
                };
                let count = arg_u32(args, 1)? as usize;
                let ends: Vec<usize> = self
                    .tail_mut(CALL, arg_mem(args, 2)?)?
                    .chunks_exact(4)
                    .take(count)
                    .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]) as usize)
                    .collect();
                let staged = self.tail_mut(CALL, arg_mem(args, 3)?)?.to_vec();
                let mut found = Vec::new();
                for tid in 0..items {
                    let Some(image) = ends.iter().position(|&e| tid < e) else {
                        continue;
                    };
                    let start = if image > 0 { ends[image - 1] } else { 0 };
                    if staged.get(tid).copied() != Some(poison) {
                        found.push((image, (tid - start) as u32));
                    }
                }
                found
            }
        };
        let first_arg = match checker {
            CheckerKernel::ImageCopy => 4,
            CheckerKernel::SingleRegion => 5,
            CheckerKernel::BufferCopyNoSvm => 5,
            CheckerKernel::BufferCopy | CheckerKernel::SvmPointer => 6,
        };
        let first = self.tail_mut(CALL, arg_mem(args, first_arg)?)?;
        for (slot, value) in results {
            if value == NO_CORRUPTION {
                continue;
            }
            let at = slot * 4;
            let cell = first.get_mut(at..at + 4).ok_or_else(|| err(CALL, CL_INVALID_VALUE))?;
            let current = u32::from_ne_bytes([cell[0], cell[1], cell[2], cell[3]]);
            if value < current {
                cell.copy_from_slice(&value.to_ne_bytes());
            }
        }
        Ok(())
    }
}

fn arg_u32(args: &BTreeMap<u32, SimArg>, index: u32) -> DetectorResult<u32> {
    match args.get(&index) {
        Some(SimArg::Bytes(b)) if b.len() >= 4 => Ok(u32::from_ne_bytes([b[0], b[1], b[2], b[3]])),
        _ => Err(err("clEnqueueNDRangeKernel", CL_INVALID_KERNEL_ARGS)),
    }
}

fn arg_mem(args: &BTreeMap<u32, SimArg>, index: u32) -> DetectorResult<MemHandle> {
    match args.get(&index) {
        Some(SimArg::Mem(m)) => Ok(*m),
        _ => Err(err("clEnqueueNDRangeKernel", CL_INVALID_KERNEL_ARGS)),
    }
}

fn word(bytes: &[u8], index: usize) -> Option<u32> {
    bytes
        .get(index * 4..index * 4 + 4)
        .map(|w| u32::from_ne_bytes([w[0], w[1], w[2], w[3]]))
}

fn compare_word(poison: u32, local_word: usize, bytes: &[u8], index: usize) -> u32 {
    match word(bytes, index) {
        Some(w) if w != poison => {
            let expected = poison.to_ne_bytes()[0];
            let at = bytes[index * 4..index * 4 + 4]
                .iter()
                .position(|&b| b != expected)
                .unwrap_or(0);
            (4 * local_word + at) as u32
        }
        _ => NO_CORRUPTION,
    }
}

fn compare_and_mend_word(poison: u32, local_word: usize, bytes: &mut [u8], index: usize) -> u32 {
    let ret = compare_word(poison, local_word, bytes, index);
    if ret != NO_CORRUPTION {
        bytes[index * 4..index * 4 + 4].copy_from_slice(&poison.to_ne_bytes());
    }
    ret
}

/// Argument access for a running simulated kernel.
pub struct SimLaunch<'a> {
    state: &'a mut SimState,
    args: &'a BTreeMap<u32, SimArg>,
    range: NdRange,
}

impl SimLaunch<'_> {
    pub fn global_size(&self) -> usize {
        self.range.global_items()
    }

    pub fn scalar_u32(&self, index: u32) -> u32 {
        arg_u32(self.args, index).unwrap_or(0)
    }

    /// Bytes of a buffer argument, from its start to the end of the
    /// underlying allocation.
    pub fn buffer(&mut self, index: u32) -> &mut [u8] {
        match self.args.get(&index) {
            Some(SimArg::Mem(m)) => self.state.tail_mut("kernel", *m).unwrap_or_default(),
            _ => &mut [],
        }
    }

    /// Bytes of an SVM argument, from the pointer to the end of its allocation.
    pub fn svm(&mut self, index: u32) -> &mut [u8] {
        match self.args.get(&index) {
            Some(SimArg::Svm(p)) => self.state.svm_tail_mut("kernel", *p).unwrap_or_default(),
            _ => &mut [],
        }
    }

    /// Bytes of an SVM allocation reached through a raw pointer.
    pub fn svm_at(&mut self, ptr: SvmPtr) -> &mut [u8] {
        self.state.svm_tail_mut("kernel", ptr).unwrap_or_default()
    }

    /// Store one element of an image argument. Coordinates outside the
    /// allocation are dropped, as image writes are on hardware.
    pub fn write_texel(&mut self, index: u32, coord: [usize; 3], texel: &[u8]) {
        let Some(SimArg::Mem(m)) = self.args.get(&index) else {
            return;
        };
        let _ = self.state.write_image_rows("kernel", *m, coord, [1, 1, 1], texel);
    }
}

/// Simulated compute runtime.
pub struct SimRuntime {
    state: Mutex<SimState>,
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRuntime {
    pub fn new() -> Self {
        let state = SimState {
            next_svm: SVM_BASE,
            ..SimState::default()
        };
        Self { state: Mutex::new(state) }
    }

    fn lock(&self) -> DetectorResult<MutexGuard<'_, SimState>> {
        self.state.lock().map_err(|_| DetectorError::LockPoisoned)
    }

    pub fn create_context(&self, device: DeviceType) -> DetectorResult<ContextHandle> {
        self.create_context_with(device, true)
    }

    pub fn create_context_with(&self, device: DeviceType, svm: bool) -> DetectorResult<ContextHandle> {
        let mut st = self.lock()?;
        let ctx = ContextHandle(st.handle());
        st.contexts.insert(ctx, SimContext { device, svm, queue: None });
        Ok(ctx)
    }

    pub fn create_queue(&self, context: ContextHandle) -> DetectorResult<QueueHandle> {
        let mut st = self.lock()?;
        st.context("clCreateCommandQueue", context)?;
        let queue = QueueHandle(st.handle());
        st.queues.insert(queue, context);
        Ok(queue)
    }

    pub fn create_program(&self, context: ContextHandle, kernels: Vec<SimKernelDef>) -> DetectorResult<ProgramHandle> {
        let mut st = self.lock()?;
        st.context("clCreateProgramWithSource", context)?;
        let program = ProgramHandle(st.handle());
        let kernels = kernels.into_iter().map(|k| (k.name.clone(), k)).collect();
        st.programs.insert(program, SimProgram { context, kernels });
        Ok(program)
    }

    /// Bytes a memory object exposes: the sub-buffer range, the whole
    /// buffer, or the packed image.
    pub fn mem_contents(&self, mem: MemHandle) -> DetectorResult<Vec<u8>> {
        let mut st = self.lock()?;
        let size = st.mem("read", mem)?.size;
        Ok(st.range_mut("read", mem, 0, size)?.to_vec())
    }

    /// Overwrite bytes at `offset` from the start of `mem`, allowed to run
    /// past its end into the parent allocation.
    pub fn poke_mem(&self, mem: MemHandle, offset: usize, bytes: &[u8]) -> DetectorResult<()> {
        let mut st = self.lock()?;
        let tail = st.tail_mut("poke", mem)?;
        tail.get_mut(offset..offset + bytes.len())
            .ok_or_else(|| err("poke", CL_INVALID_VALUE))?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn svm_contents(&self, ptr: SvmPtr, len: usize) -> DetectorResult<Vec<u8>> {
        let mut st = self.lock()?;
        Ok(st.svm_range_mut("read", ptr, len)?.to_vec())
    }

    pub fn poke_svm(&self, ptr: SvmPtr, bytes: &[u8]) -> DetectorResult<()> {
        let mut st = self.lock()?;
        st.svm_range_mut("poke", ptr, bytes.len())?.copy_from_slice(bytes);
        Ok(())
    }

    pub fn live_mem_objects(&self) -> usize {
        self.lock().map(|st| st.mems.len()).unwrap_or(0)
    }

    pub fn live_svm_allocations(&self) -> usize {
        self.lock().map(|st| st.svm.len()).unwrap_or(0)
    }

    /// User events created but not completed.
    pub fn pending_user_events(&self) -> usize {
        self.lock().map(|st| st.user_events.len()).unwrap_or(0)
    }

    /// Live application kernels, excluding cached checker kernels.
    pub fn live_kernels(&self) -> usize {
        self.lock()
            .map(|st| st.kernels.values().filter(|k| k.checker.is_none()).count())
            .unwrap_or(0)
    }

    /// Function names of every dispatched kernel, in order.
    pub fn launches(&self) -> Vec<String> {
        self.lock().map(|st| st.launches.clone()).unwrap_or_default()
    }
}

impl ComputeRuntime for SimRuntime {
    fn kernel_num_args(&self, kernel: KernelHandle) -> DetectorResult<u32> {
        Ok(self.lock()?.kernel("clGetKernelInfo", kernel)?.num_args)
    }

    fn kernel_function_name(&self, kernel: KernelHandle) -> DetectorResult<String> {
        Ok(self.lock()?.kernel("clGetKernelInfo", kernel)?.def.name.clone())
    }

    fn kernel_arg_name(&self, kernel: KernelHandle, index: u32) -> DetectorResult<Option<String>> {
        let st = self.lock()?;
        let k = st.kernel("clGetKernelArgInfo", kernel)?;
        if index >= k.num_args {
            return Err(err("clGetKernelArgInfo", CL_INVALID_ARG_INDEX));
        }
        if !k.def.arg_info {
            return Ok(None);
        }
        Ok(k.def.arg_names.get(index as usize).cloned())
    }

    fn kernel_context(&self, kernel: KernelHandle) -> DetectorResult<ContextHandle> {
        Ok(self.lock()?.kernel("clGetKernelInfo", kernel)?.context)
    }

    fn kernel_program(&self, kernel: KernelHandle) -> DetectorResult<ProgramHandle> {
        Ok(self.lock()?.kernel("clGetKernelInfo", kernel)?.program)
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> DetectorResult<KernelHandle> {
        let mut st = self.lock()?;
        let prog = st
            .programs
            .get(&program)
            .ok_or_else(|| err("clCreateKernel", CL_INVALID_PROGRAM))?;
        let def = prog
            .kernels
            .get(name)
            .cloned()
            .ok_or_else(|| err("clCreateKernel", CL_INVALID_KERNEL_NAME))?;
        let context = prog.context;
        let kernel = KernelHandle(st.handle());
        st.kernels.insert(
            kernel,
            SimKernel {
                program,
                context,
                num_args: def.arg_names.len() as u32,
                def,
                checker: None,
                args: BTreeMap::new(),
                refs: 1,
            },
        );
        Ok(kernel)
    }

    fn retain_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        let mut st = self.lock()?;
        let k = st
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| err("clRetainKernel", CL_INVALID_KERNEL))?;
        k.refs += 1;
        Ok(())
    }

    fn release_kernel(&self, kernel: KernelHandle) -> DetectorResult<()> {
        let mut st = self.lock()?;
        let k = st
            .kernels
            .get_mut(&kernel)
            .ok_or_else(|| err("clReleaseKernel", CL_INVALID_KERNEL))?;
        k.refs -= 1;
        if k.refs == 0 {
            st.kernels.remove(&kernel);
        }
        Ok(())
    }

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, value: ArgValue<'_>) -> DetectorResult<()> {
        const CALL: &str = "clSetKernelArg";
        let mut st = self.lock()?;
        let arg = match value {
            ArgValue::Mem(m) => {
                st.mem(CALL, m)?;
                SimArg::Mem(m)
            }
            ArgValue::Svm(p) => SimArg::Svm(p),
            ArgValue::Bytes(b) => SimArg::Bytes(b.to_vec()),
            ArgValue::Local(n) => SimArg::Local(n),
        };
        let k = st.kernels.get_mut(&kernel).ok_or_else(|| err(CALL, CL_INVALID_KERNEL))?;
        if index >= k.num_args {
            return Err(err(CALL, CL_INVALID_ARG_INDEX));
        }
        k.args.insert(index, arg);
        Ok(())
    }

    fn checker_kernel(&self, context: ContextHandle, checker: CheckerKernel) -> DetectorResult<KernelHandle> {
        let mut st = self.lock()?;
        if let Some(k) = st.checkers.get(&(context, checker)) {
            return Ok(*k);
        }
        st.context("clBuildProgram", context)?;
        let num_args = match checker {
            CheckerKernel::ImageCopy => 5,
            CheckerKernel::BufferCopyNoSvm | CheckerKernel::SingleRegion => 6,
            CheckerKernel::BufferCopy | CheckerKernel::SvmPointer => 7,
        };
        let program = ProgramHandle(st.handle());
        let def = SimKernelDef::new(checker.function_name(), &[]).without_arg_info();
        st.programs.insert(
            program,
            SimProgram {
                context,
                kernels: HashMap::from([(def.name.clone(), def.clone())]),
            },
        );
        let kernel = KernelHandle(st.handle());
        st.kernels.insert(
            kernel,
            SimKernel {
                program,
                context,
                def,
                checker: Some(checker),
                num_args,
                args: BTreeMap::new(),
                refs: 1,
            },
        );
        st.checkers.insert((context, checker), kernel);
        debug!("built checker {} for context {:?}", checker.function_name(), context);
        Ok(kernel)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueHandle,
        kernel: KernelHandle,
        range: &NdRange,
        _waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        const CALL: &str = "clEnqueueNDRangeKernel";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        let k = st.kernel(CALL, kernel)?;
        if (k.args.len() as u32) < k.num_args {
            return Err(err(CALL, CL_INVALID_KERNEL_ARGS));
        }
        let args = k.args.clone();
        let checker = k.checker;
        let body = k.def.body.clone();
        let name = k.def.name.clone();
        st.launches.push(name);
        match (checker, body) {
            (Some(c), _) => st.run_checker(c, &args, range.global_items())?,
            (None, Some(body)) => {
                let mut launch = SimLaunch {
                    state: &mut *st,
                    args: &args,
                    range: *range,
                };
                body(&mut launch);
            }
            (None, None) => {}
        }
        Ok(st.event())
    }

    fn queue_context(&self, queue: QueueHandle) -> DetectorResult<ContextHandle> {
        self.lock()?.queue("clGetCommandQueueInfo", queue)
    }

    fn queue_device_type(&self, queue: QueueHandle) -> DetectorResult<DeviceType> {
        let st = self.lock()?;
        let ctx = st.queue("clGetDeviceInfo", queue)?;
        Ok(st.context("clGetDeviceInfo", ctx)?.device)
    }

    fn internal_queue(&self, context: ContextHandle) -> DetectorResult<QueueHandle> {
        let mut st = self.lock()?;
        if let Some(q) = st.context("clCreateCommandQueue", context)?.queue {
            return Ok(q);
        }
        let queue = QueueHandle(st.handle());
        st.queues.insert(queue, context);
        if let Some(c) = st.contexts.get_mut(&context) {
            c.queue = Some(queue);
        }
        Ok(queue)
    }

    fn finish(&self, queue: QueueHandle) -> DetectorResult<()> {
        self.lock()?.queue("clFinish", queue).map(|_| ())
    }

    fn supports_svm(&self, context: ContextHandle) -> bool {
        self.lock()
            .ok()
            .and_then(|st| st.contexts.get(&context).map(|c| c.svm))
            .unwrap_or(false)
    }

    fn create_buffer(
        &self,
        context: ContextHandle,
        _flags: MemFlags,
        size: usize,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        const CALL: &str = "clCreateBuffer";
        let mut st = self.lock()?;
        st.context(CALL, context)?;
        if size == 0 {
            return Err(err(CALL, CL_INVALID_BUFFER_SIZE));
        }
        let mut bytes = vec![0u8; size];
        if let Some(src) = init {
            let n = src.len().min(size);
            bytes[..n].copy_from_slice(&src[..n]);
        }
        let mem = MemHandle(st.handle());
        st.mems.insert(
            mem,
            SimMem {
                context,
                size,
                storage: SimStorage::Buffer(bytes),
                refs: 1,
            },
        );
        Ok(mem)
    }

    fn create_sub_buffer(&self, parent: MemHandle, _flags: MemFlags, origin: usize, size: usize) -> DetectorResult<MemHandle> {
        const CALL: &str = "clCreateSubBuffer";
        let mut st = self.lock()?;
        let p = st.mem(CALL, parent)?;
        if !matches!(p.storage, SimStorage::Buffer(_)) {
            return Err(err(CALL, CL_INVALID_MEM_OBJECT));
        }
        if size == 0 || origin + size > p.size {
            return Err(err(CALL, CL_INVALID_VALUE));
        }
        let context = p.context;
        if let Some(p) = st.mems.get_mut(&parent) {
            p.refs += 1;
        }
        let mem = MemHandle(st.handle());
        st.mems.insert(
            mem,
            SimMem {
                context,
                size,
                storage: SimStorage::SubBuffer { parent, origin },
                refs: 1,
            },
        );
        Ok(mem)
    }

    fn create_image(
        &self,
        context: ContextHandle,
        _flags: MemFlags,
        format: &ImageFormat,
        desc: &ImageDesc,
        init: Option<&[u8]>,
    ) -> DetectorResult<MemHandle> {
        const CALL: &str = "clCreateImage";
        let mut st = self.lock()?;
        st.context(CALL, context)?;
        let ext = desc.extents();
        let pixel = format.pixel_size();
        let row = ext[0] * pixel;
        let size = ext.iter().product::<usize>() * pixel;
        let mut bytes = vec![0u8; size];
        if let Some(src) = init {
            let row_pitch = if desc.row_pitch == 0 { row } else { desc.row_pitch };
            let slice_pitch = if desc.slice_pitch == 0 {
                row_pitch * ext[1]
            } else {
                desc.slice_pitch
            };
            for z in 0..ext[2] {
                for y in 0..ext[1] {
                    let at = z * slice_pitch + y * row_pitch;
                    if let Some(s) = src.get(at..at + row) {
                        let dst = (z * ext[1] + y) * row;
                        bytes[dst..dst + row].copy_from_slice(s);
                    }
                }
            }
        }
        let mem = MemHandle(st.handle());
        st.mems.insert(
            mem,
            SimMem {
                context,
                size,
                storage: SimStorage::Image {
                    format: *format,
                    desc: *desc,
                    bytes,
                },
                refs: 1,
            },
        );
        Ok(mem)
    }

    fn release_mem(&self, mem: MemHandle) -> DetectorResult<()> {
        self.lock()?.release_mem(mem)
    }

    fn svm_alloc(&self, context: ContextHandle, size: usize) -> DetectorResult<SvmPtr> {
        let mut st = self.lock()?;
        if !st.context("clSVMAlloc", context)?.svm {
            return Err(DetectorError::Unsupported("shared virtual memory"));
        }
        let base = st.next_svm;
        st.next_svm += (size + SVM_GUARD - 1) / SVM_GUARD * SVM_GUARD + SVM_GUARD;
        st.svm.insert(
            base,
            SimSvm {
                context,
                bytes: vec![0u8; size],
            },
        );
        Ok(SvmPtr(base))
    }

    fn svm_free(&self, context: ContextHandle, ptr: SvmPtr) -> DetectorResult<()> {
        let mut st = self.lock()?;
        match st.svm.get(&ptr.0) {
            Some(a) if a.context == context => {
                st.svm.remove(&ptr.0);
                Ok(())
            }
            _ => Err(err("clSVMFree", CL_INVALID_VALUE)),
        }
    }

    fn copy_buffer(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        src_offset: usize,
        dst_offset: usize,
        len: usize,
        _waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        const CALL: &str = "clEnqueueCopyBuffer";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        let data = st.range_mut(CALL, src, src_offset, len)?.to_vec();
        st.range_mut(CALL, dst, dst_offset, len)?.copy_from_slice(&data);
        Ok(st.event())
    }

    fn copy_image(
        &self,
        queue: QueueHandle,
        src: MemHandle,
        dst: MemHandle,
        region: [usize; 3],
        _waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        const CALL: &str = "clEnqueueCopyImage";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        let data = st.read_image_rows(CALL, src, [0; 3], region)?;
        st.write_image_rows(CALL, dst, [0; 3], region, &data)?;
        Ok(st.event())
    }

    fn copy_image_to_buffer(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        buffer: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
        _waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        const CALL: &str = "clEnqueueCopyImageToBuffer";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        let data = st.read_image_rows(CALL, image, origin, region)?;
        st.range_mut(CALL, buffer, dst_offset, data.len())?.copy_from_slice(&data);
        Ok(st.event())
    }

    fn copy_svm(
        &self,
        queue: QueueHandle,
        dst: SvmPtr,
        src: SvmPtr,
        len: usize,
        _waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        const CALL: &str = "clEnqueueSVMMemcpy";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        let data = st.svm_range_mut(CALL, src, len)?.to_vec();
        st.svm_range_mut(CALL, dst, len)?.copy_from_slice(&data);
        Ok(st.event())
    }

    fn fill_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        byte: u8,
        offset: usize,
        len: usize,
        _waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        const CALL: &str = "clEnqueueFillBuffer";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        st.range_mut(CALL, mem, offset, len)?.fill(byte);
        Ok(st.event())
    }

    fn fill_svm(
        &self,
        queue: QueueHandle,
        ptr: SvmPtr,
        byte: u8,
        len: usize,
        _waits: &[EventHandle],
    ) -> DetectorResult<EventHandle> {
        const CALL: &str = "clEnqueueSVMMemFill";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        st.svm_range_mut(CALL, ptr, len)?.fill(byte);
        Ok(st.event())
    }

    fn write_buffer(&self, queue: QueueHandle, mem: MemHandle, offset: usize, data: &[u8]) -> DetectorResult<()> {
        const CALL: &str = "clEnqueueWriteBuffer";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        st.range_mut(CALL, mem, offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn write_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        data: &[u8],
    ) -> DetectorResult<()> {
        const CALL: &str = "clEnqueueWriteImage";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        st.write_image_rows(CALL, image, origin, region, data)
    }

    fn read_buffer(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        out: &mut [u8],
        _waits: &[EventHandle],
    ) -> DetectorResult<()> {
        const CALL: &str = "clEnqueueReadBuffer";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        out.copy_from_slice(st.range_mut(CALL, mem, offset, out.len())?);
        Ok(())
    }

    fn read_image(
        &self,
        queue: QueueHandle,
        image: MemHandle,
        origin: [usize; 3],
        region: [usize; 3],
        out: &mut [u8],
        _waits: &[EventHandle],
    ) -> DetectorResult<()> {
        const CALL: &str = "clEnqueueReadImage";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        let data = st.read_image_rows(CALL, image, origin, region)?;
        if out.len() != data.len() {
            return Err(err(CALL, CL_INVALID_VALUE));
        }
        out.copy_from_slice(&data);
        Ok(())
    }

    fn read_svm(&self, queue: QueueHandle, ptr: SvmPtr, out: &mut [u8], _waits: &[EventHandle]) -> DetectorResult<()> {
        const CALL: &str = "clEnqueueSVMMemcpy";
        let mut st = self.lock()?;
        st.queue(CALL, queue)?;
        out.copy_from_slice(st.svm_range_mut(CALL, ptr, out.len())?);
        Ok(())
    }

    fn read_buffer_async(
        &self,
        queue: QueueHandle,
        mem: MemHandle,
        offset: usize,
        len: usize,
        waits: &[EventHandle],
    ) -> DetectorResult<Readback> {
        let mut out = vec![0u8; len];
        self.read_buffer(queue, mem, offset, &mut out, waits)?;
        let event = self.lock()?.event();
        Ok(Readback::new(event, Arc::new(Mutex::new(out))))
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> DetectorResult<()> {
        let st = self.lock()?;
        // Nothing else could complete a pending user event, so the wait would never return.
        if events.iter().any(|e| st.user_events.contains_key(e)) {
            return Err(err("clWaitForEvents", CL_INVALID_EVENT));
        }
        Ok(())
    }

    fn marker(&self, queue: QueueHandle, _waits: &[EventHandle]) -> DetectorResult<EventHandle> {
        let mut st = self.lock()?;
        st.queue("clEnqueueMarkerWithWaitList", queue)?;
        Ok(st.event())
    }

    fn completed_event(&self, context: ContextHandle) -> DetectorResult<EventHandle> {
        let mut st = self.lock()?;
        st.context("clCreateUserEvent", context)?;
        Ok(st.event())
    }

    fn release_event(&self, _event: EventHandle) -> DetectorResult<()> {
        Ok(())
    }

    fn retain_event(&self, _event: EventHandle) -> DetectorResult<()> {
        Ok(())
    }

    fn user_event(&self, context: ContextHandle) -> DetectorResult<EventHandle> {
        let mut st = self.lock()?;
        st.context("clCreateUserEvent", context)?;
        let event = st.event();
        st.user_events.insert(event, Vec::new());
        Ok(event)
    }

    fn complete_user_event(&self, event: EventHandle) -> DetectorResult<()> {
        let callbacks = self
            .lock()?
            .user_events
            .remove(&event)
            .ok_or_else(|| err("clSetUserEventStatus", CL_INVALID_EVENT))?;
        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    fn on_complete(&self, event: EventHandle, callback: CompletionCallback) -> DetectorResult<()> {
        let mut st = self.lock()?;
        if let Some(waiting) = st.user_events.get_mut(&event) {
            waiting.push(callback);
            return Ok(());
        }
        drop(st);
        callback();
        Ok(())
    }
}
