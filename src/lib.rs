// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Canary-based out-of-bounds write detection for OpenCL compute kernels.
//!
//! Every buffer, image and shared-virtual-memory allocation the detector
//! manages is padded with a poison region. Kernel dispatches are routed
//! through [`detect::Detector::enqueue_kernel`], which swaps in a clone of
//! the kernel whose arguments all carry canaries, runs it, and verifies the
//! canaries afterwards either on the host or with a checker kernel on the
//! device.

/// Error types and the fatal-exit helper.
pub mod error;

/// Environment-driven detector configuration.
pub mod config;

/// Poison constants, canary layouts and image canary geometry.
pub mod canary;

/// Compute runtime seam plus the OpenCL and simulated implementations.
pub mod runtime;

/// Kernel, argument and memory object bookkeeping.
pub mod registry;

/// Dispatch interception, kernel cloning and duplicate resolution.
pub mod detect;

/// Host and device canary verification.
pub mod check;

/// Overflow reports, the log sink and the kill policy.
pub mod report;

/// Optional timing and memory statistics.
pub mod stats;

/// Process-wide entry points used by an interception layer.
pub mod hooks;

pub use config::{get_config, set_config, DetectorConfig};
pub use detect::Detector;
pub use error::{DetectorError, DetectorResult, OrFatal};
