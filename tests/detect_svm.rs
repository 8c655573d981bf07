// CLASSIFICATION: COMMUNITY
// Filename: detect_svm.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

mod common;

use clcanary::canary::{CanarySide, POISON_FILL, POISON_FILL_LENGTH};
use clcanary::config::GpuStrategy;
use clcanary::report::{FindingKind, OverflowSubject};
use clcanary::runtime::sim::SimKernelDef;
use clcanary::runtime::{ArgValue, DeviceType, NdRange, SvmPtr};
use clcanary::{DetectorConfig, DetectorError};
use common::{rig, word};

const LEN: usize = 128;

fn scribble_svm() -> SimKernelDef {
    SimKernelDef::new("scribble_svm", &["data", "count"]).with_body(|l| {
        let n = l.scalar_u32(1) as usize;
        let out = l.svm(0);
        let n = n.min(out.len());
        out[..n].fill(0x33);
    })
}

#[test]
fn svm_overflow_is_reported_by_pointer() {
    for (device, strategy) in [
        (DeviceType::Cpu, GpuStrategy::BulkCopy),
        (DeviceType::Gpu, GpuStrategy::SingleObject),
        (DeviceType::Gpu, GpuStrategy::BulkCopy),
        (DeviceType::Gpu, GpuStrategy::BulkPointer),
    ] {
        let mut cfg = DetectorConfig::quiet();
        cfg.gpu_strategy = strategy;
        let r = rig(device, cfg, vec![scribble_svm()]);
        let ptr = r.det.svm_alloc(r.ctx, LEN).unwrap();
        let k = r.det.create_kernel(r.program, "scribble_svm").unwrap();
        r.det.set_kernel_arg(k, 0, ArgValue::Svm(ptr)).unwrap();
        r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(LEN as u32 + 4))).unwrap();
        r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();

        let findings = r.det.reporter().findings();
        assert_eq!(findings.len(), 1, "{:?}", strategy);
        assert_eq!(findings[0].subject, OverflowSubject::Svm(ptr));
        assert_eq!(findings[0].label, format!("{:#x}", ptr.0));
        assert_eq!(
            findings[0].kind,
            FindingKind::Linear {
                side: CanarySide::Trailing,
                first_bad: 0,
                distance: 1
            }
        );
        let canary = r.sim.svm_contents(ptr.offset(LEN), POISON_FILL_LENGTH).unwrap();
        assert!(canary.iter().all(|&b| b == POISON_FILL), "{:?}", strategy);
        r.det.svm_free(r.ctx, ptr).unwrap();
        assert_eq!(r.sim.live_svm_allocations(), 0);
    }
}

#[test]
fn allocations_reached_indirectly_are_checked() {
    let holder: std::sync::Arc<std::sync::Mutex<SvmPtr>> = Default::default();
    let target = holder.clone();
    let chase = SimKernelDef::new("chase", &["table"]).with_body(move |l| {
        let ptr = *target.lock().unwrap();
        l.svm_at(ptr)[LEN] = 0;
    });
    let r = rig(DeviceType::Cpu, DetectorConfig::quiet(), vec![chase]);
    let table = r.det.svm_alloc(r.ctx, LEN).unwrap();
    let hidden = r.det.svm_alloc(r.ctx, LEN).unwrap();
    *holder.lock().unwrap() = hidden;
    let k = r.det.create_kernel(r.program, "chase").unwrap();
    r.det.set_kernel_arg(k, 0, ArgValue::Svm(table)).unwrap();
    r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();

    let findings = r.det.reporter().findings();
    assert_eq!(findings.len(), 1);
    assert_eq!(findings[0].subject, OverflowSubject::Svm(hidden));
}

#[test]
fn context_without_svm_rejects_allocation() {
    let r = rig(DeviceType::Gpu, DetectorConfig::quiet(), vec![scribble_svm()]);
    let plain = r.sim.create_context_with(DeviceType::Gpu, false).unwrap();
    assert!(matches!(r.det.svm_alloc(plain, LEN), Err(DetectorError::Unsupported(_))));
    assert!(r.det.svm_alloc(r.ctx, LEN).is_ok());
}
