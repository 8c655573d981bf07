// CLASSIFICATION: COMMUNITY
// Filename: kernel.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Kernel descriptors and their recorded argument bindings.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use super::memory::{MemoryObject, SvmRegion};
use crate::runtime::{ArgValue, KernelHandle, MemHandle, SvmPtr};

/// What a kernel argument is bound to.
#[derive(Clone, Debug)]
pub enum ArgBinding {
    /// By-value bytes, replayed verbatim onto clones.
    Value(Vec<u8>),
    /// `__local` allocation size.
    Local(usize),
    Mem(Arc<MemoryObject>),
    /// A memory object created outside the detector.
    Untracked(MemHandle),
    Svm { ptr: SvmPtr, region: Option<Arc<SvmRegion>> },
}

#[derive(Clone, Debug)]
/// What one kernel argument is bound to.
pub struct KernelArgument {
    pub index: u32,
    pub binding: ArgBinding,
}

impl KernelArgument {
    pub fn new(index: u32, binding: ArgBinding) -> Self {
        Self { index, binding }
    }

    /// The value to hand to `set_kernel_arg` to reproduce this binding.
    pub fn value(&self) -> ArgValue<'_> {
        match &self.binding {
            ArgBinding::Value(bytes) => ArgValue::Bytes(bytes),
            ArgBinding::Local(size) => ArgValue::Local(*size),
            ArgBinding::Mem(m) => ArgValue::Mem(m.handle),
            ArgBinding::Untracked(m) => ArgValue::Mem(*m),
            ArgBinding::Svm { ptr, .. } => ArgValue::Svm(*ptr),
        }
    }

    /// Handle of the bound buffer or image, if any.
    pub fn mem_handle(&self) -> Option<MemHandle> {
        match &self.binding {
            ArgBinding::Mem(m) => Some(m.handle),
            ArgBinding::Untracked(m) => Some(*m),
            _ => None,
        }
    }

    /// The tracked buffer or image, if the binding has one.
    pub fn memory(&self) -> Option<&Arc<MemoryObject>> {
        match &self.binding {
            ArgBinding::Mem(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_svm(&self) -> bool {
        matches!(self.binding, ArgBinding::Svm { .. })
    }
}

/// Mirror of the runtime's reference count on a kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RefCount(u32);

impl RefCount {
    /// Count of a freshly created kernel.
    pub fn one() -> Self {
        RefCount(1)
    }

    pub fn get(self) -> u32 {
        self.0
    }

    pub fn retain(&mut self) {
        self.0 += 1;
    }

    /// Drop one reference; `true` when none remain.
    pub fn release(&mut self) -> bool {
        self.0 = self.0.saturating_sub(1);
        self.0 == 0
    }
}

/// One live kernel and the arguments currently set on it.
#[derive(Debug)]
pub struct KernelDescriptor {
    pub handle: KernelHandle,
    refs: RefCount,
    args: BTreeMap<u32, KernelArgument>,
}

impl KernelDescriptor {
    /// Descriptor for a kernel just created, with no arguments set.
    pub fn new(handle: KernelHandle) -> Self {
        Self {
            handle,
            refs: RefCount::one(),
            args: BTreeMap::new(),
        }
    }

    pub fn refs(&self) -> u32 {
        self.refs.get()
    }

    pub fn retain(&mut self) {
        self.refs.retain();
    }

    /// Drop one reference; `true` when it was the last.
    pub fn release(&mut self) -> bool {
        self.refs.release()
    }

    /// Set an argument, returning the binding it replaced.
    pub fn insert_arg(&mut self, arg: KernelArgument) -> Option<KernelArgument> {
        self.args.insert(arg.index, arg)
    }

    pub fn find_arg(&self, index: u32) -> Option<&KernelArgument> {
        self.args.get(&index)
    }

    pub fn remove_arg(&mut self, index: u32) -> Option<KernelArgument> {
        self.args.remove(&index)
    }

    /// Recorded arguments by index.
    pub fn args(&self) -> &BTreeMap<u32, KernelArgument> {
        &self.args
    }

    /// Free a descriptor already detached from the registry.
    pub fn delete(self) {
        debug!("deleting kernel descriptor {:?} with {} args", self.handle, self.args.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContextHandle, MemFlags};

    #[test]
    fn refcount_reaches_zero_once() {
        let mut desc = KernelDescriptor::new(KernelHandle(0x40));
        desc.retain();
        assert!(!desc.release());
        assert!(desc.release());
        assert_eq!(desc.refs(), 0);
    }

    #[test]
    fn replacing_argument_returns_previous_binding() {
        let mem = Arc::new(MemoryObject::plain_buffer(
            MemHandle(0x10),
            ContextHandle(0x20),
            MemFlags::READ_WRITE,
            16,
        ));
        let mut desc = KernelDescriptor::new(KernelHandle(0x40));
        assert!(desc.insert_arg(KernelArgument::new(0, ArgBinding::Mem(mem.clone()))).is_none());
        let old = desc
            .insert_arg(KernelArgument::new(0, ArgBinding::Value(vec![1, 2, 3, 4])))
            .unwrap();
        assert_eq!(old.mem_handle(), Some(MemHandle(0x10)));
        drop(old);
        assert_eq!(Arc::strong_count(&mem), 1);
        assert_eq!(desc.find_arg(0).unwrap().value(), ArgValue::Bytes(&[1, 2, 3, 4]));
    }
}
