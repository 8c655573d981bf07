// CLASSIFICATION: COMMUNITY
// Filename: error.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Crate error type and the fatal-exit adapter used at hook boundaries.

use std::panic::Location;

use log::error;
use thiserror::Error;

use crate::runtime::{KernelHandle, MemHandle, SvmPtr};

/// Errors raised while tracking or verifying compute objects.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("{call} failed with status {status} ({})", status_name(*.status))]
    Runtime { call: &'static str, status: i32 },
    #[error("compute runtime library unavailable: {0}")]
    LibraryUnavailable(String),
    #[error("compute runtime symbol {0} missing")]
    MissingSymbol(&'static str),
    #[error("kernel {0:?} is not tracked")]
    UnknownKernel(KernelHandle),
    #[error("memory object {0:?} is not tracked")]
    UnknownMemObject(MemHandle),
    #[error("svm region {0:?} is not tracked")]
    UnknownSvm(SvmPtr),
    #[error("{0} not supported by this runtime")]
    Unsupported(&'static str),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("detector state lock poisoned")]
    LockPoisoned,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DetectorResult<T> = Result<T, DetectorError>;

impl DetectorError {
    /// Shorthand for a failed runtime call.
    pub fn runtime(call: &'static str, status: i32) -> Self {
        DetectorError::Runtime { call, status }
    }
}

/// Turn a non-zero runtime status into an error.
pub fn check_status(call: &'static str, status: i32) -> DetectorResult<()> {
    if status == 0 {
        Ok(())
    } else {
        Err(DetectorError::runtime(call, status))
    }
}

/// Symbolic name of an OpenCL status code.
pub fn status_name(status: i32) -> &'static str {
    match status {
        0 => "CL_SUCCESS",
        -1 => "CL_DEVICE_NOT_FOUND",
        -2 => "CL_DEVICE_NOT_AVAILABLE",
        -3 => "CL_COMPILER_NOT_AVAILABLE",
        -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
        -5 => "CL_OUT_OF_RESOURCES",
        -6 => "CL_OUT_OF_HOST_MEMORY",
        -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
        -8 => "CL_MEM_COPY_OVERLAP",
        -9 => "CL_IMAGE_FORMAT_MISMATCH",
        -10 => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
        -11 => "CL_BUILD_PROGRAM_FAILURE",
        -12 => "CL_MAP_FAILURE",
        -13 => "CL_MISALIGNED_SUB_BUFFER_OFFSET",
        -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
        -19 => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
        -30 => "CL_INVALID_VALUE",
        -33 => "CL_INVALID_DEVICE",
        -34 => "CL_INVALID_CONTEXT",
        -36 => "CL_INVALID_COMMAND_QUEUE",
        -37 => "CL_INVALID_HOST_PTR",
        -38 => "CL_INVALID_MEM_OBJECT",
        -39 => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
        -40 => "CL_INVALID_IMAGE_SIZE",
        -44 => "CL_INVALID_PROGRAM",
        -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
        -46 => "CL_INVALID_KERNEL_NAME",
        -48 => "CL_INVALID_KERNEL",
        -49 => "CL_INVALID_ARG_INDEX",
        -50 => "CL_INVALID_ARG_VALUE",
        -51 => "CL_INVALID_ARG_SIZE",
        -52 => "CL_INVALID_KERNEL_ARGS",
        -53 => "CL_INVALID_WORK_DIMENSION",
        -54 => "CL_INVALID_WORK_GROUP_SIZE",
        -55 => "CL_INVALID_WORK_ITEM_SIZE",
        -56 => "CL_INVALID_GLOBAL_OFFSET",
        -57 => "CL_INVALID_EVENT_WAIT_LIST",
        -58 => "CL_INVALID_EVENT",
        -59 => "CL_INVALID_OPERATION",
        -61 => "CL_INVALID_BUFFER_SIZE",
        -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
        -64 => "CL_INVALID_PROPERTY",
        -65 => "CL_INVALID_IMAGE_DESCRIPTOR",
        _ => "unknown status",
    }
}

/// Adapter that terminates the process on error, reporting the caller.
///
/// Used where a failed runtime call leaves the tracked object graph in a
/// state that cannot be navigated any further.
pub trait OrFatal<T> {
    #[track_caller]
    fn or_fatal(self) -> T;
}

impl<T> OrFatal<T> for DetectorResult<T> {
    #[track_caller]
    fn or_fatal(self) -> T {
        match self {
            Ok(v) => v,
            Err(e) => {
                let caller = Location::caller();
                eprintln!("{} at {}:{}", e, caller.file(), caller.line());
                error!("fatal: {} at {}:{}", e, caller.file(), caller.line());
                std::process::exit(-1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_error_names_status() {
        let err = DetectorError::runtime("clEnqueueReadBuffer", -38);
        assert_eq!(
            err.to_string(),
            "clEnqueueReadBuffer failed with status -38 (CL_INVALID_MEM_OBJECT)"
        );
    }

    #[test]
    fn check_status_accepts_success() {
        assert!(check_status("clFinish", 0).is_ok());
        assert!(matches!(
            check_status("clFinish", -36),
            Err(DetectorError::Runtime { status: -36, .. })
        ));
    }

    #[test]
    fn or_fatal_passes_values_through() {
        let v: DetectorResult<u32> = Ok(7);
        assert_eq!(v.or_fatal(), 7);
    }
}
