// CLASSIFICATION: COMMUNITY
// Filename: dispatch.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Verification strategy decision table.

use crate::config::{DevicePreference, GpuStrategy};
use crate::runtime::DeviceType;

/// How a dispatch gets its canaries checked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// Nothing to check.
    None,
    /// Blocking scan on the host after the kernel completes.
    Host,
    /// Checker kernels on the dispatch queue.
    Device(GpuStrategy),
}

/// Canonical objects a dispatch would check.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckCounts {
    pub buffers: usize,
    pub images: usize,
    pub svm: usize,
}

impl CheckCounts {
    pub fn total(&self) -> usize {
        self.buffers + self.images + self.svm
    }
}

/// Pick the verification strategy for one dispatch.
///
/// CPU devices are always checked on the host. Elsewhere images and SVM
/// go to the device unless the host is forced, and plain buffers go to
/// the device only when the device is forced.
pub fn choose_strategy(
    device: DeviceType,
    preference: DevicePreference,
    gpu: GpuStrategy,
    counts: CheckCounts,
) -> Strategy {
    if counts.total() == 0 {
        return Strategy::None;
    }
    if device == DeviceType::Cpu {
        return Strategy::Host;
    }
    let special = counts.svm > 0 || counts.images > 0;
    if (special && preference != DevicePreference::ForceCpu) || preference == DevicePreference::ForceGpu {
        Strategy::Device(gpu)
    } else {
        Strategy::Host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BUFFERS: CheckCounts = CheckCounts {
        buffers: 2,
        images: 0,
        svm: 0,
    };
    const IMAGES: CheckCounts = CheckCounts {
        buffers: 1,
        images: 1,
        svm: 0,
    };
    const SVM: CheckCounts = CheckCounts {
        buffers: 0,
        images: 0,
        svm: 3,
    };

    #[test]
    fn nothing_to_check() {
        let s = choose_strategy(
            DeviceType::Gpu,
            DevicePreference::ForceGpu,
            GpuStrategy::BulkCopy,
            CheckCounts::default(),
        );
        assert_eq!(s, Strategy::None);
    }

    #[test]
    fn cpu_devices_always_use_host() {
        for pref in [DevicePreference::Auto, DevicePreference::ForceCpu, DevicePreference::ForceGpu] {
            for counts in [BUFFERS, IMAGES, SVM] {
                assert_eq!(
                    choose_strategy(DeviceType::Cpu, pref, GpuStrategy::SingleObject, counts),
                    Strategy::Host
                );
            }
        }
    }

    #[test]
    fn auto_sends_images_and_svm_to_device() {
        let g = GpuStrategy::BulkPointer;
        assert_eq!(choose_strategy(DeviceType::Gpu, DevicePreference::Auto, g, BUFFERS), Strategy::Host);
        assert_eq!(choose_strategy(DeviceType::Gpu, DevicePreference::Auto, g, IMAGES), Strategy::Device(g));
        assert_eq!(
            choose_strategy(DeviceType::Accelerator, DevicePreference::Auto, g, SVM),
            Strategy::Device(g)
        );
    }

    #[test]
    fn preferences_override_object_kinds() {
        let g = GpuStrategy::SingleObject;
        assert_eq!(choose_strategy(DeviceType::Gpu, DevicePreference::ForceCpu, g, IMAGES), Strategy::Host);
        assert_eq!(choose_strategy(DeviceType::Gpu, DevicePreference::ForceCpu, g, SVM), Strategy::Host);
        assert_eq!(
            choose_strategy(DeviceType::Gpu, DevicePreference::ForceGpu, g, BUFFERS),
            Strategy::Device(g)
        );
    }
}
