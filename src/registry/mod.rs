// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Bookkeeping for live kernels, memory objects and SVM allocations.
//!
//! All tables sit behind one mutex. Callers take the lock for the whole
//! find/modify sequence that must see a consistent snapshot, then drop it
//! before calling into the compute runtime where they can.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;

use crate::error::{DetectorError, DetectorResult};
use crate::runtime::{ContextHandle, KernelHandle, MemHandle, SvmPtr};

pub mod kernel;
pub mod memory;

pub use kernel::{ArgBinding, KernelArgument, KernelDescriptor, RefCount};
pub use memory::{ImageInfo, MemoryObject, SvmRegion};

/// Tables guarded by [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryTables {
    kernels: HashMap<KernelHandle, KernelDescriptor>,
    mems: HashMap<MemHandle, Arc<MemoryObject>>,
    svm: BTreeMap<SvmPtr, Arc<SvmRegion>>,
}

impl RegistryTables {
    /// Track a kernel, returning any stale descriptor under the same handle.
    pub fn insert_kernel(&mut self, desc: KernelDescriptor) -> Option<KernelDescriptor> {
        self.kernels.insert(desc.handle, desc)
    }

    pub fn find_kernel(&self, kernel: KernelHandle) -> Option<&KernelDescriptor> {
        self.kernels.get(&kernel)
    }

    pub fn find_kernel_mut(&mut self, kernel: KernelHandle) -> Option<&mut KernelDescriptor> {
        self.kernels.get_mut(&kernel)
    }

    /// Detach a kernel descriptor; the caller decides when to delete it.
    pub fn remove_kernel(&mut self, kernel: KernelHandle) -> Option<KernelDescriptor> {
        self.kernels.remove(&kernel)
    }

    /// Track a buffer or image, replacing any entry under the same handle.
    pub fn insert_mem(&mut self, mem: Arc<MemoryObject>) {
        debug!("tracking mem {:?} ({} bytes, canary {})", mem.handle, mem.size, mem.has_canary);
        self.mems.insert(mem.handle, mem);
    }

    pub fn find_mem(&self, mem: MemHandle) -> Option<Arc<MemoryObject>> {
        self.mems.get(&mem).cloned()
    }

    pub fn remove_mem(&mut self, mem: MemHandle) -> Option<Arc<MemoryObject>> {
        self.mems.remove(&mem)
    }

    /// Track an SVM allocation keyed by the pointer handed to the application.
    pub fn insert_svm(&mut self, region: Arc<SvmRegion>) {
        self.svm.insert(region.ptr, region);
    }

    /// The allocation whose data contains `ptr`.
    pub fn find_svm(&self, ptr: SvmPtr) -> Option<Arc<SvmRegion>> {
        self.svm
            .range(..=ptr)
            .next_back()
            .filter(|(_, r)| r.contains(ptr))
            .map(|(_, r)| r.clone())
    }

    /// Untrack the allocation starting exactly at `ptr`.
    pub fn remove_svm(&mut self, ptr: SvmPtr) -> Option<Arc<SvmRegion>> {
        self.svm.remove(&ptr)
    }

    /// Application SVM allocations of `context`, in address order.
    pub fn svm_in_context(&self, context: ContextHandle) -> Vec<Arc<SvmRegion>> {
        self.svm
            .values()
            .filter(|r| r.context == context && !r.internal)
            .cloned()
            .collect()
    }

    pub fn kernel_count(&self) -> usize {
        self.kernels.len()
    }

    pub fn mem_count(&self) -> usize {
        self.mems.len()
    }

    pub fn svm_count(&self) -> usize {
        self.svm.len()
    }
}

/// Process-wide metadata registry.
#[derive(Debug, Default)]
pub struct Registry {
    tables: Mutex<RegistryTables>,
}

impl Registry {
    /// Empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock every table at once.
    pub fn lock(&self) -> DetectorResult<MutexGuard<'_, RegistryTables>> {
        self.tables.lock().map_err(|_| DetectorError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::BufferLayout;
    use crate::runtime::MemFlags;

    #[test]
    fn find_never_fabricates_entries() {
        let reg = Registry::new();
        let tables = reg.lock().unwrap();
        assert!(tables.find_kernel(KernelHandle(0x40)).is_none());
        assert!(tables.find_mem(MemHandle(0x10)).is_none());
        assert!(tables.find_svm(SvmPtr(0x1000)).is_none());
        assert_eq!(tables.kernel_count(), 0);
    }

    #[test]
    fn remove_detaches_then_delete_frees() {
        let reg = Registry::new();
        let mut tables = reg.lock().unwrap();
        tables.insert_kernel(KernelDescriptor::new(KernelHandle(0x40)));
        let detached = tables.remove_kernel(KernelHandle(0x40)).unwrap();
        assert!(tables.find_kernel(KernelHandle(0x40)).is_none());
        detached.delete();
        assert!(tables.remove_kernel(KernelHandle(0x40)).is_none());
    }

    #[test]
    fn svm_lookup_by_interior_pointer() {
        let reg = Registry::new();
        let mut tables = reg.lock().unwrap();
        let ctx = ContextHandle(0x20);
        let a = Arc::new(SvmRegion::new(SvmPtr(0x10000), ctx, BufferLayout::new(256, false)));
        let mut internal = SvmRegion::new(SvmPtr(0x40000), ctx, BufferLayout::new(64, false));
        internal.internal = true;
        tables.insert_svm(a.clone());
        tables.insert_svm(Arc::new(internal));
        assert_eq!(tables.find_svm(SvmPtr(0x10000 + 100)).unwrap().ptr, a.ptr);
        assert!(tables.find_svm(SvmPtr(0x10000 + 256)).is_none());
        assert_eq!(tables.svm_in_context(ctx).len(), 1);
        assert!(tables.svm_in_context(ContextHandle(0x30)).is_empty());
    }

    #[test]
    fn mem_entries_are_shared() {
        let reg = Registry::new();
        let mut tables = reg.lock().unwrap();
        let obj = Arc::new(MemoryObject::plain_buffer(
            MemHandle(0x10),
            ContextHandle(0x20),
            MemFlags::READ_WRITE,
            32,
        ));
        tables.insert_mem(obj.clone());
        assert!(Arc::ptr_eq(&tables.find_mem(MemHandle(0x10)).unwrap(), &obj));
        assert_eq!(tables.mem_count(), 1);
        tables.remove_mem(MemHandle(0x10));
        assert_eq!(tables.mem_count(), 0);
    }
}
