// CLASSIFICATION: COMMUNITY
// Filename: bulk.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Gather every linear canary of a dispatch and check them in one pass.
//!
//! Buffer canaries are copied into one staging buffer. SVM canaries are
//! either copied into an SVM staging area or, for the pointer variant,
//! read in place through a table of their addresses.

use std::sync::Arc;

use super::{as_u32, dispatch, finish, results_buffer, CheckerArg, PassTracker, PendingCheck};
use crate::canary::{POISON_FILL_LENGTH, POISON_WORD};
use crate::check::kernels::CheckerKernel;
use crate::check::{CanaryTarget, CheckScope};
use crate::error::{DetectorError, DetectorResult};
use crate::runtime::{EventHandle, MemFlags, MemHandle, SvmPtr};

const CANARY_WORDS: usize = POISON_FILL_LENGTH / 4;

/// Copy the buffer canaries into a fresh staging buffer, one
/// [`POISON_FILL_LENGTH`] block per region.
fn stage_buffers(
    scope: &CheckScope,
    targets: &[CanaryTarget],
    waits: &[EventHandle],
    copies: &mut Vec<EventHandle>,
) -> DetectorResult<(MemHandle, usize)> {
    let runtime = &*scope.runtime;
    let count = targets
        .iter()
        .filter(|t| matches!(t, CanaryTarget::Buffer { .. }))
        .count();
    let staging = runtime.create_buffer(
        scope.context,
        MemFlags::READ_WRITE,
        count.max(1) * POISON_FILL_LENGTH,
        None,
    )?;
    let mut slot = 0;
    for target in targets {
        if let CanaryTarget::Buffer { mem, region, .. } = target {
            let backing = mem.backing.ok_or(DetectorError::UnknownMemObject(mem.handle))?;
            copies.push(runtime.copy_buffer(
                scope.queue,
                backing,
                staging,
                region.offset,
                slot * POISON_FILL_LENGTH,
                region.len,
                waits,
            )?);
            slot += 1;
        }
    }
    Ok((staging, count))
}

/// SVM canary start addresses, in target order.
fn svm_canaries(targets: &[CanaryTarget]) -> Vec<SvmPtr> {
    targets
        .iter()
        .filter_map(|t| match t {
            CanaryTarget::Svm { alloc, region } => Some(alloc.base.offset(region.offset)),
            _ => None,
        })
        .collect()
}

pub(super) fn check_linear_copy(
    scope: &CheckScope,
    targets: &[CanaryTarget],
    waits: &[EventHandle],
    tracker: &Arc<PassTracker>,
) -> DetectorResult<()> {
    if targets.is_empty() {
        return Ok(());
    }
    let runtime = &*scope.runtime;
    let mut copies = Vec::new();
    let (staging, buffers) = stage_buffers(scope, targets, waits, &mut copies)?;
    let svm = svm_canaries(targets);
    let svm_staging = if svm.is_empty() {
        None
    } else {
        let area = runtime.svm_alloc(scope.context, svm.len() * POISON_FILL_LENGTH)?;
        for (i, src) in svm.iter().enumerate() {
            copies.push(runtime.copy_svm(
                scope.queue,
                area.offset(i * POISON_FILL_LENGTH),
                *src,
                POISON_FILL_LENGTH,
                waits,
            )?);
        }
        Some(area)
    };
    let buff_end = buffers * CANARY_WORDS;
    let svm_end = buff_end + svm.len() * CANARY_WORDS;
    let first = results_buffer(scope, targets.len())?;
    let head = [
        CheckerArg::U32(as_u32(CANARY_WORDS)?),
        CheckerArg::U32(as_u32(buff_end)?),
        CheckerArg::U32(as_u32(svm_end)?),
        CheckerArg::U32(POISON_WORD),
        CheckerArg::Mem(staging),
    ];
    let checker_event = match svm_staging {
        Some(area) => {
            let mut args = head.to_vec();
            args.extend([CheckerArg::Svm(area), CheckerArg::Mem(first)]);
            dispatch(scope, CheckerKernel::BufferCopy, &args, svm_end, &copies)?
        }
        None => {
            let mut args = head.to_vec();
            args.push(CheckerArg::Mem(first));
            dispatch(scope, CheckerKernel::BufferCopyNoSvm, &args, buff_end, &copies)?
        }
    };
    for e in copies {
        runtime.release_event(e)?;
    }
    finish(
        scope,
        PendingCheck {
            first,
            slots: targets.to_vec(),
            checker_event,
            staging: vec![staging],
            svm_staging,
        },
        tracker,
    )
}

pub(super) fn check_linear_pointer(
    scope: &CheckScope,
    targets: &[CanaryTarget],
    waits: &[EventHandle],
    tracker: &Arc<PassTracker>,
) -> DetectorResult<()> {
    if targets.is_empty() {
        return Ok(());
    }
    let runtime = &*scope.runtime;
    let mut copies = Vec::new();
    let (staging, buffers) = stage_buffers(scope, targets, waits, &mut copies)?;
    let svm = svm_canaries(targets);
    let table: Vec<u8> = svm.iter().flat_map(|p| (p.0 as u64).to_ne_bytes()).collect();
    let table_mem = runtime.create_buffer(scope.context, MemFlags::READ_ONLY, table.len().max(8), Some(&table))?;
    let buff_end = buffers * CANARY_WORDS;
    let svm_end = buff_end + svm.len() * CANARY_WORDS;
    let first = results_buffer(scope, targets.len())?;
    let mut waits_all = copies.clone();
    waits_all.extend_from_slice(waits);
    let checker_event = dispatch(
        scope,
        CheckerKernel::SvmPointer,
        &[
            CheckerArg::U32(as_u32(CANARY_WORDS)?),
            CheckerArg::U32(as_u32(buff_end)?),
            CheckerArg::U32(as_u32(svm_end)?),
            CheckerArg::U32(POISON_WORD),
            CheckerArg::Mem(staging),
            CheckerArg::Mem(table_mem),
            CheckerArg::Mem(first),
        ],
        svm_end,
        &waits_all,
    )?;
    for e in copies {
        runtime.release_event(e)?;
    }
    finish(
        scope,
        PendingCheck {
            first,
            slots: targets.to_vec(),
            checker_event,
            staging: vec![staging, table_mem],
            svm_staging: None,
        },
        tracker,
    )
}
