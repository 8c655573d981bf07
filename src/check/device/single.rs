// CLASSIFICATION: COMMUNITY
// Filename: single.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! One checker dispatch per linear canary region, read in place.

use std::sync::Arc;

use super::{as_u32, dispatch, finish, results_buffer, CheckerArg, PassTracker, PendingCheck};
use crate::canary::POISON_WORD;
use crate::check::kernels::CheckerKernel;
use crate::check::{CanaryTarget, CheckScope};
use crate::error::{DetectorError, DetectorResult};
use crate::runtime::EventHandle;

pub(super) fn check_linear(
    scope: &CheckScope,
    targets: &[CanaryTarget],
    waits: &[EventHandle],
    tracker: &Arc<PassTracker>,
) -> DetectorResult<()> {
    if targets.is_empty() {
        return Ok(());
    }
    let runtime = &*scope.runtime;
    let first = results_buffer(scope, targets.len())?;
    let mut passes = Vec::with_capacity(targets.len());
    for (slot, target) in targets.iter().enumerate() {
        let (object, region) = match target {
            CanaryTarget::Buffer { mem, region, .. } => {
                let backing = mem.backing.ok_or(DetectorError::UnknownMemObject(mem.handle))?;
                (CheckerArg::Mem(backing), region)
            }
            CanaryTarget::Svm { alloc, region } => (CheckerArg::Svm(alloc.base), region),
            CanaryTarget::Image { .. } => continue,
        };
        let words = region.len / 4;
        passes.push(dispatch(
            scope,
            CheckerKernel::SingleRegion,
            &[
                CheckerArg::U32(as_u32(words)?),
                CheckerArg::U32(as_u32(slot)?),
                CheckerArg::U32(POISON_WORD),
                CheckerArg::U32(as_u32(region.offset)?),
                object,
                CheckerArg::Mem(first),
            ],
            words,
            waits,
        )?);
    }
    let checker_event = runtime.marker(scope.queue, &passes)?;
    for e in passes {
        runtime.release_event(e)?;
    }
    finish(
        scope,
        PendingCheck {
            first,
            slots: targets.to_vec(),
            checker_event,
            staging: Vec::new(),
            svm_staging: None,
        },
        tracker,
    )
}
