// CLASSIFICATION: COMMUNITY
// Filename: hooks.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Process-wide detector instance.
//!
//! An interception layer calls [`detector`] from each hooked API entry
//! point. The first call loads the system OpenCL library and reads the
//! configuration; tests and embedders can [`install`] their own instance
//! beforehand.

use std::sync::{Arc, RwLock};

use log::info;
use once_cell::sync::Lazy;

use crate::config::get_config;
use crate::detect::Detector;
use crate::error::{DetectorError, DetectorResult, OrFatal};
use crate::runtime::opencl::OpenClRuntime;

static DETECTOR: Lazy<RwLock<Option<Arc<Detector>>>> = Lazy::new(|| RwLock::new(None));

/// Make `detector` the process-wide instance, replacing any previous one.
pub fn install(detector: Detector) -> DetectorResult<Arc<Detector>> {
    let detector = Arc::new(detector);
    let mut slot = DETECTOR.write().map_err(|_| DetectorError::LockPoisoned)?;
    *slot = Some(detector.clone());
    Ok(detector)
}

/// The process-wide instance, created over the system OpenCL library on
/// first use.
pub fn try_detector() -> DetectorResult<Arc<Detector>> {
    if let Some(d) = DETECTOR.read().map_err(|_| DetectorError::LockPoisoned)?.as_ref() {
        return Ok(d.clone());
    }
    let mut slot = DETECTOR.write().map_err(|_| DetectorError::LockPoisoned)?;
    if let Some(d) = slot.as_ref() {
        return Ok(d.clone());
    }
    let runtime = OpenClRuntime::load()?;
    info!("loaded system OpenCL library");
    let detector = Arc::new(Detector::new(Arc::new(runtime), get_config()?));
    *slot = Some(detector.clone());
    Ok(detector)
}

/// Like [`try_detector`], exiting the process when no runtime is available.
pub fn detector() -> Arc<Detector> {
    try_detector().or_fatal()
}

/// Shut down and drop the process-wide instance, if any.
pub fn teardown() -> DetectorResult<()> {
    let taken = DETECTOR.write().map_err(|_| DetectorError::LockPoisoned)?.take();
    match taken {
        Some(d) => d.shutdown(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DetectorConfig;
    use crate::runtime::sim::SimRuntime;
    use serial_test::serial;

    #[test]
    #[serial]
    fn installed_detector_is_returned() {
        let det = install(Detector::new(Arc::new(SimRuntime::new()), DetectorConfig::quiet())).unwrap();
        let got = try_detector().unwrap();
        assert!(Arc::ptr_eq(&det, &got));
        teardown().unwrap();
        assert!(DETECTOR.read().unwrap().is_none());
    }

    #[test]
    #[serial]
    fn teardown_without_instance_is_noop() {
        teardown().unwrap();
        teardown().unwrap();
    }
}
