// CLASSIFICATION: COMMUNITY
// Filename: clone.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Kernel cloning and canary insertion.
//!
//! A kernel whose canonical memory arguments all carry canaries is checked
//! as is. Otherwise a clone of the kernel is bound to canary-padded
//! internal copies of the uncanaried objects; the clone is dispatched in
//! place of the original and its copies are written back afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use super::dupes::DuplicateMap;
use crate::canary::{BufferLayout, ImageGeometry};
use crate::error::{DetectorError, DetectorResult};
use crate::registry::{ArgBinding, ImageInfo, KernelArgument, MemoryObject, Registry};
use crate::runtime::{ComputeRuntime, EventHandle, KernelHandle, MemFlags, QueueHandle};
use crate::stats::StatsSink;

/// The kernel to dispatch and the bindings it carries.
#[derive(Debug)]
pub struct CheckedKernel {
    pub handle: KernelHandle,
    /// `true` when `handle` is a clone owned by the detector.
    pub cloned: bool,
    pub args: BTreeMap<u32, KernelArgument>,
}

/// Collaborators cloning needs besides the runtime.
pub struct CloneEnv<'a> {
    pub runtime: &'a dyn ComputeRuntime,
    pub registry: &'a Registry,
    pub stats: &'a StatsSink,
    pub queue: QueueHandle,
    pub leading_canary: bool,
}

fn needs_canary(index: u32, arg: &KernelArgument, dupes: &DuplicateMap) -> bool {
    dupes.is_canonical(index) && arg.memory().map_or(false, |m| !m.has_canary)
}

/// Canary-padded internal copy of `orig`, with the copy command (if any)
/// appended to `copies`.
fn internal_copy(
    env: &CloneEnv<'_>,
    orig: &MemoryObject,
    waits: &[EventHandle],
    copies: &mut Vec<EventHandle>,
) -> DetectorResult<Arc<MemoryObject>> {
    let rt = env.runtime;
    let flags = orig.flags.without_host_ptr();
    let (obj, overhead) = match orig.image {
        Some(info) => {
            let geom = ImageGeometry::from_data(&info.desc, &info.format);
            let padded = geom.padded_desc(&info.desc);
            let contents = geom.initial_contents(None, 0, 0);
            let handle = rt.create_image(orig.context, flags, &info.format, &padded, Some(&contents))?;
            copies.push(rt.copy_image(env.queue, orig.handle, handle, geom.dat, waits)?);
            let info = ImageInfo {
                format: info.format,
                desc: padded,
            };
            (MemoryObject::image(handle, orig.context, flags, info, true), geom.total_bytes())
        }
        None => {
            let layout = BufferLayout::new(orig.size, env.leading_canary);
            let mirror = if orig.flags.contains(MemFlags::USE_HOST_PTR) {
                let mut shadow = vec![0u8; orig.size].into_boxed_slice();
                rt.read_buffer(env.queue, orig.handle, 0, &mut shadow, waits)?;
                Some(shadow)
            } else {
                None
            };
            let contents = layout.initial_contents(mirror.as_deref());
            let backing = rt.create_buffer(orig.context, flags, layout.total_size(), Some(&contents))?;
            let handle = rt.create_sub_buffer(backing, flags, layout.data_offset(), orig.size)?;
            if mirror.is_none() {
                copies.push(rt.copy_buffer(env.queue, orig.handle, handle, 0, 0, orig.size, waits)?);
            }
            let mut obj = MemoryObject::padded_buffer(handle, backing, orig.context, flags, layout);
            if let Some(shadow) = mirror {
                obj = obj.with_host_mirror(shadow);
            }
            (obj, layout.total_size())
        }
    };
    let obj = Arc::new(obj.into_internal());
    env.registry.lock()?.insert_mem(obj.clone());
    env.stats.track_alloc(0, overhead);
    Ok(obj)
}

/// Return a kernel whose canonical memory arguments all carry canaries.
///
/// Without uncanaried arguments this is `kernel` itself. Otherwise a new
/// kernel of the same program and entry point is created and bound: by-value
/// and SVM arguments are replayed, canaried objects are shared, uncanaried
/// ones are replaced by filled internal copies, and aliases follow their
/// canonical argument. All copies have completed when this returns.
pub fn create_poisoned_kernel(
    env: &CloneEnv<'_>,
    kernel: KernelHandle,
    args: &BTreeMap<u32, KernelArgument>,
    dupes: &DuplicateMap,
    waits: &[EventHandle],
) -> DetectorResult<CheckedKernel> {
    if !args.iter().any(|(&i, a)| needs_canary(i, a, dupes)) {
        return Ok(CheckedKernel {
            handle: kernel,
            cloned: false,
            args: args.clone(),
        });
    }
    let rt = env.runtime;
    let program = rt.kernel_program(kernel)?;
    let name = rt.kernel_function_name(kernel)?;
    let clone = rt.create_kernel(program, &name)?;
    let mut bound: BTreeMap<u32, KernelArgument> = BTreeMap::new();
    let mut copies = Vec::new();
    for (&index, arg) in args {
        let binding = if !dupes.is_canonical(index) {
            let canonical = dupes.canonical(index);
            bound
                .get(&canonical)
                .map(|a| a.binding.clone())
                .unwrap_or_else(|| arg.binding.clone())
        } else {
            match &arg.binding {
                ArgBinding::Mem(orig) if !orig.has_canary => {
                    ArgBinding::Mem(internal_copy(env, orig, waits, &mut copies)?)
                }
                other => other.clone(),
            }
        };
        let replayed = KernelArgument::new(index, binding);
        rt.set_kernel_arg(clone, index, replayed.value())?;
        bound.insert(index, replayed);
    }
    rt.wait_for_events(&copies)?;
    for e in copies {
        rt.release_event(e)?;
    }
    debug!("cloned kernel {} as {:?} with {} args", name, clone, bound.len());
    Ok(CheckedKernel {
        handle: clone,
        cloned: true,
        args: bound,
    })
}

/// Write the clone's internal copies back into the application's objects.
pub fn copy_back(
    env: &CloneEnv<'_>,
    checked: &CheckedKernel,
    original: &BTreeMap<u32, KernelArgument>,
    dupes: &DuplicateMap,
    waits: &[EventHandle],
) -> DetectorResult<()> {
    if !checked.cloned {
        return Ok(());
    }
    let rt = env.runtime;
    let mut copies = Vec::new();
    for (&index, arg) in &checked.args {
        if !dupes.is_canonical(index) {
            continue;
        }
        let (Some(internal), Some(orig)) = (arg.memory(), original.get(&index).and_then(|a| a.memory())) else {
            continue;
        };
        if !internal.internal {
            continue;
        }
        match (internal.data_extents(), orig.data_extents()) {
            (Some(a), Some(b)) => {
                let region = [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])];
                copies.push(rt.copy_image(env.queue, internal.handle, orig.handle, region, waits)?);
            }
            _ => {
                let len = internal.size.min(orig.size);
                copies.push(rt.copy_buffer(env.queue, internal.handle, orig.handle, 0, 0, len, waits)?);
            }
        }
    }
    rt.wait_for_events(&copies)?;
    for e in copies {
        rt.release_event(e)?;
    }
    Ok(())
}

/// Free the internal copies bound to a clone, then the clone itself.
/// A kernel that was not cloned is left alone.
pub fn release_poisoned_kernel(env: &CloneEnv<'_>, checked: CheckedKernel, dupes: &DuplicateMap) -> DetectorResult<()> {
    if !checked.cloned {
        return Ok(());
    }
    let rt = env.runtime;
    for (&index, arg) in &checked.args {
        if !dupes.is_canonical(index) {
            continue;
        }
        let Some(mem) = arg.memory().filter(|m| m.internal) else {
            continue;
        };
        env.registry
            .lock()?
            .remove_mem(mem.handle)
            .ok_or(DetectorError::UnknownMemObject(mem.handle))?;
        drop(mem.take_host_mirror());
        rt.release_mem(mem.handle)?;
        let total = match mem.backing {
            Some(backing) => {
                rt.release_mem(backing)?;
                mem.layout().total_size()
            }
            None => mem.geometry().map_or(mem.size, |g| g.total_bytes()),
        };
        env.stats.track_free(0, total);
    }
    rt.release_kernel(checked.handle)?;
    debug!("released clone {:?}", checked.handle);
    Ok(())
}
