// CLASSIFICATION: COMMUNITY
// Filename: memory.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Descriptors for tracked buffers, images and SVM allocations.

use std::sync::Mutex;

use crate::canary::{BufferLayout, ImageGeometry};
use crate::runtime::{ContextHandle, ImageDesc, ImageFormat, MemFlags, MemHandle, SvmPtr};

/// Format and descriptor of an image allocation.
///
/// For canaried images `desc` holds the padded extents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub desc: ImageDesc,
}

/// One buffer or image known to the detector.
#[derive(Debug)]
pub struct MemoryObject {
    /// Handle the application (or a cloned kernel) binds.
    pub handle: MemHandle,
    /// Padded allocation holding the canaries of a linear buffer.
    pub backing: Option<MemHandle>,
    pub context: ContextHandle,
    pub flags: MemFlags,
    /// Logical size in bytes, without padding.
    pub size: usize,
    pub image: Option<ImageInfo>,
    pub has_canary: bool,
    pub leading_canary: bool,
    /// Allocated by the detector rather than the application.
    pub internal: bool,
    host_mirror: Mutex<Option<Box<[u8]>>>,
}

impl MemoryObject {
    /// A buffer the detector could not pad.
    pub fn plain_buffer(handle: MemHandle, context: ContextHandle, flags: MemFlags, size: usize) -> Self {
        Self {
            handle,
            backing: None,
            context,
            flags,
            size,
            image: None,
            has_canary: false,
            leading_canary: false,
            internal: false,
            host_mirror: Mutex::new(None),
        }
    }

    /// A sub-buffer view `handle` over the padded allocation `backing`.
    pub fn padded_buffer(
        handle: MemHandle,
        backing: MemHandle,
        context: ContextHandle,
        flags: MemFlags,
        layout: BufferLayout,
    ) -> Self {
        Self {
            backing: Some(backing),
            has_canary: true,
            leading_canary: layout.leading,
            ..Self::plain_buffer(handle, context, flags, layout.size)
        }
    }

    pub fn image(
        handle: MemHandle,
        context: ContextHandle,
        flags: MemFlags,
        info: ImageInfo,
        has_canary: bool,
    ) -> Self {
        let geom = if has_canary {
            ImageGeometry::from_padded(&info.desc, &info.format)
        } else {
            ImageGeometry::from_data(&info.desc, &info.format)
        };
        Self {
            image: Some(info),
            has_canary,
            ..Self::plain_buffer(handle, context, flags, geom.data_bytes())
        }
    }

    pub fn into_internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn with_host_mirror(self, mirror: Box<[u8]>) -> Self {
        if let Ok(mut slot) = self.host_mirror.lock() {
            *slot = Some(mirror);
        }
        self
    }

    pub fn is_image(&self) -> bool {
        self.image.is_some()
    }

    pub fn layout(&self) -> BufferLayout {
        BufferLayout::new(self.size, self.leading_canary)
    }

    /// Image geometry; padded extents only when the image carries canaries.
    pub fn geometry(&self) -> Option<ImageGeometry> {
        let info = self.image?;
        Some(if self.has_canary {
            ImageGeometry::from_padded(&info.desc, &info.format)
        } else {
            ImageGeometry::from_data(&info.desc, &info.format)
        })
    }

    /// Extents of the application-visible data.
    pub fn data_extents(&self) -> Option<[usize; 3]> {
        self.geometry().map(|g| g.dat)
    }

    /// Bytes of canary padding this object adds.
    pub fn overhead(&self) -> usize {
        if !self.has_canary {
            return 0;
        }
        match self.geometry() {
            Some(g) => g.total_bytes() - g.data_bytes(),
            None => self.layout().overhead(),
        }
    }

    pub fn has_host_mirror(&self) -> bool {
        self.host_mirror.lock().map(|m| m.is_some()).unwrap_or(false)
    }

    /// Detach the host shadow so it can be freed.
    pub fn take_host_mirror(&self) -> Option<Box<[u8]>> {
        self.host_mirror.lock().ok().and_then(|mut m| m.take())
    }
}

/// One shared virtual memory allocation made through the detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SvmRegion {
    /// Pointer handed to the application.
    pub ptr: SvmPtr,
    /// Start of the padded allocation.
    pub base: SvmPtr,
    pub context: ContextHandle,
    pub size: usize,
    pub leading_canary: bool,
    pub internal: bool,
}

impl SvmRegion {
    pub fn new(base: SvmPtr, context: ContextHandle, layout: BufferLayout) -> Self {
        Self {
            ptr: base.offset(layout.data_offset()),
            base,
            context,
            size: layout.size,
            leading_canary: layout.leading,
            internal: false,
        }
    }

    pub fn layout(&self) -> BufferLayout {
        BufferLayout::new(self.size, self.leading_canary)
    }

    /// Whether `ptr` points into the data of this allocation.
    pub fn contains(&self, ptr: SvmPtr) -> bool {
        ptr.0 >= self.ptr.0 && ptr.0 < self.ptr.0 + self.size.max(1)
    }
}
