// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Canary verification after a kernel completes.
//!
//! [`host`] scans canaries with blocking reads; [`device`] stages them for
//! checker kernels and reports from a completion callback. Both resolve a
//! corrupted byte to a [`CanaryTarget`] and hand it to
//! [`CheckScope::corruption`], so findings read the same either way.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::canary::{CanaryRegion, ImageGeometry};
use crate::detect::dispatch::CheckCounts;
use crate::detect::dupes::DuplicateMap;
use crate::error::DetectorResult;
use crate::registry::{ArgBinding, KernelArgument, MemoryObject, SvmRegion};
use crate::report::{KernelReportInfo, OverflowSubject, Reporter, ThreadId};
use crate::runtime::{ComputeRuntime, ContextHandle, QueueHandle};

pub mod device;
pub mod host;
pub mod kernels;
mod mend;

/// Canonical objects of one dispatch that carry canaries.
#[derive(Clone, Debug, Default)]
pub struct CheckTargets {
    pub buffers: Vec<(u32, Arc<MemoryObject>)>,
    pub images: Vec<(u32, Arc<MemoryObject>)>,
    pub svm: Vec<Arc<SvmRegion>>,
}

impl CheckTargets {
    /// Gather the canonical buffer and image arguments. When any canonical
    /// argument is an SVM pointer every allocation in `live_svm` is
    /// included, since SVM data can hold pointers into other allocations.
    pub fn collect(
        args: &BTreeMap<u32, KernelArgument>,
        dupes: &DuplicateMap,
        live_svm: Vec<Arc<SvmRegion>>,
    ) -> Self {
        let mut targets = CheckTargets::default();
        let mut any_svm = false;
        for (&index, arg) in args {
            if !dupes.is_canonical(index) {
                continue;
            }
            match &arg.binding {
                ArgBinding::Mem(mem) if mem.is_image() => targets.images.push((index, mem.clone())),
                ArgBinding::Mem(mem) => targets.buffers.push((index, mem.clone())),
                ArgBinding::Svm { .. } => any_svm = true,
                _ => {}
            }
        }
        if any_svm {
            targets.svm = live_svm;
        }
        targets
    }

    pub fn counts(&self) -> CheckCounts {
        CheckCounts {
            buffers: self.buffers.len(),
            images: self.images.len(),
            svm: self.svm.len(),
        }
    }

    /// Linear canary regions: buffers in argument order, then SVM.
    pub fn linear_targets(&self) -> Vec<CanaryTarget> {
        let mut out = Vec::new();
        for (index, mem) in &self.buffers {
            if !mem.has_canary || mem.backing.is_none() {
                continue;
            }
            for region in mem.layout().regions() {
                out.push(CanaryTarget::Buffer {
                    index: *index,
                    mem: mem.clone(),
                    region,
                });
            }
        }
        for alloc in &self.svm {
            for region in alloc.layout().regions() {
                out.push(CanaryTarget::Svm {
                    alloc: alloc.clone(),
                    region,
                });
            }
        }
        out
    }

    /// Canaried images with a non-empty canary.
    pub fn image_targets(&self) -> Vec<CanaryTarget> {
        self.images
            .iter()
            .filter(|(_, mem)| mem.has_canary)
            .filter_map(|(index, mem)| {
                let geometry = mem.geometry()?;
                (geometry.canary_len() > 0).then(|| CanaryTarget::Image {
                    index: *index,
                    mem: mem.clone(),
                    geometry,
                })
            })
            .collect()
    }
}

/// One canary a verifier inspects. Linear region offsets are relative to
/// the padded allocation.
#[derive(Clone, Debug)]
pub enum CanaryTarget {
    Buffer {
        index: u32,
        mem: Arc<MemoryObject>,
        region: CanaryRegion,
    },
    Svm {
        alloc: Arc<SvmRegion>,
        region: CanaryRegion,
    },
    Image {
        index: u32,
        mem: Arc<MemoryObject>,
        geometry: ImageGeometry,
    },
}

impl CanaryTarget {
    /// Canary length in bytes.
    pub fn len(&self) -> usize {
        match self {
            CanaryTarget::Buffer { region, .. } | CanaryTarget::Svm { region, .. } => region.len,
            CanaryTarget::Image { geometry, .. } => geometry.canary_len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything a verifier needs to act on a finding, shareable with a
/// completion callback.
#[derive(Clone)]
pub struct CheckScope {
    pub runtime: Arc<dyn ComputeRuntime>,
    pub context: ContextHandle,
    pub queue: QueueHandle,
    pub kernel: Arc<KernelReportInfo>,
    pub dupes: Arc<DuplicateMap>,
    pub reporter: Arc<Reporter>,
    /// Thread that issued the dispatch.
    pub parent: ThreadId,
    /// Serialises argument setup and enqueue on shared checker kernels.
    pub checker_lock: Arc<Mutex<()>>,
}

impl CheckScope {
    /// Act on the corrupted canaries found by one check pass: report each,
    /// warn about aliased arguments and apply the kill policy once, then
    /// restore the poison. Host passes mend blocking, device passes
    /// enqueue the restore.
    pub fn corruptions(&self, hits: &[(&CanaryTarget, usize)], blocking: bool) -> DetectorResult<()> {
        if hits.is_empty() {
            return Ok(());
        }
        for &(target, first_bad) in hits {
            self.report(target, first_bad)?;
        }
        self.reporter.report_alias_warning(&self.kernel, &self.dupes)?;
        self.reporter.apply_kill_policy(Some(self.parent));
        for &(target, _) in hits {
            if blocking {
                mend::restore_blocking(&*self.runtime, self.queue, target)?;
            } else {
                mend::restore_enqueued(&*self.runtime, self.queue, target)?;
            }
        }
        Ok(())
    }

    fn report(&self, target: &CanaryTarget, first_bad: usize) -> DetectorResult<()> {
        match target {
            CanaryTarget::Buffer { index, region, .. } => {
                self.reporter
                    .report_scalar_overflow(&self.kernel, OverflowSubject::Argument(*index), region, first_bad)?
            }
            CanaryTarget::Svm { alloc, region } => {
                self.reporter
                    .report_scalar_overflow(&self.kernel, OverflowSubject::Svm(alloc.ptr), region, first_bad)?
            }
            CanaryTarget::Image { index, geometry, .. } => {
                self.reporter
                    .report_image_overflow(&self.kernel, *index, geometry, first_bad)?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canary::{BufferLayout, CanarySide};
    use crate::runtime::{ChannelOrder, ChannelType, ImageDesc, ImageFormat, MemFlags, MemHandle, SvmPtr};
    use crate::registry::ImageInfo;

    fn padded(handle: usize, size: usize) -> Arc<MemoryObject> {
        Arc::new(MemoryObject::padded_buffer(
            MemHandle(handle),
            MemHandle(handle + 1),
            ContextHandle(0x20),
            MemFlags::READ_WRITE,
            BufferLayout::new(size, false),
        ))
    }

    #[test]
    fn aliases_are_collected_once() {
        let mem = padded(0x100, 64);
        let args: BTreeMap<u32, KernelArgument> = [
            (0, KernelArgument::new(0, ArgBinding::Mem(mem.clone()))),
            (1, KernelArgument::new(1, ArgBinding::Value(vec![0; 4]))),
            (2, KernelArgument::new(2, ArgBinding::Mem(mem))),
        ]
        .into_iter()
        .collect();
        let dupes = DuplicateMap::resolve(3, &args);
        let targets = CheckTargets::collect(&args, &dupes, Vec::new());
        assert_eq!(targets.counts(), CheckCounts { buffers: 1, images: 0, svm: 0 });
        let linear = targets.linear_targets();
        assert_eq!(linear.len(), 1);
        assert!(matches!(
            linear[0],
            CanaryTarget::Buffer { index: 0, region: CanaryRegion { side: CanarySide::Trailing, offset: 64, .. }, .. }
        ));
    }

    #[test]
    fn any_svm_argument_pulls_in_every_allocation() {
        let ctx = ContextHandle(0x20);
        let live = vec![
            Arc::new(SvmRegion::new(SvmPtr(0x1000), ctx, BufferLayout::new(32, false))),
            Arc::new(SvmRegion::new(SvmPtr(0x9000), ctx, BufferLayout::new(32, true))),
        ];
        let args: BTreeMap<u32, KernelArgument> = [(
            0,
            KernelArgument::new(
                0,
                ArgBinding::Svm {
                    ptr: SvmPtr(0x1000),
                    region: Some(live[0].clone()),
                },
            ),
        )]
        .into_iter()
        .collect();
        let dupes = DuplicateMap::resolve(1, &args);
        let targets = CheckTargets::collect(&args, &dupes, live);
        assert_eq!(targets.counts().svm, 2);
        assert_eq!(targets.linear_targets().len(), 3);
    }

    #[test]
    fn unpadded_images_are_skipped() {
        let format = ImageFormat::new(ChannelOrder::R, ChannelType::UnsignedInt8);
        let info = ImageInfo {
            format,
            desc: ImageDesc::new(crate::runtime::ImageType::Image2D, 1, 1, 1, 1),
        };
        let mem = Arc::new(MemoryObject::image(MemHandle(0x10), ContextHandle(0x20), MemFlags::READ_WRITE, info, true));
        let args: BTreeMap<u32, KernelArgument> =
            [(0, KernelArgument::new(0, ArgBinding::Mem(mem)))].into_iter().collect();
        let dupes = DuplicateMap::resolve(1, &args);
        let targets = CheckTargets::collect(&args, &dupes, Vec::new());
        assert_eq!(targets.counts().images, 1);
        assert!(targets.image_targets().is_empty());
    }
}
