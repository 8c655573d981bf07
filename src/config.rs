// CLASSIFICATION: COMMUNITY
// Filename: config.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

use once_cell::sync::Lazy;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::{DetectorError, DetectorResult};
use crate::stats::StatsFlags;

/// Where canary verification should run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DevicePreference {
    /// Pick per dispatch from device type and object kinds.
    #[default]
    Auto,
    /// Always scan canaries on the host.
    ForceCpu,
    /// Use checker kernels whenever anything needs checking.
    ForceGpu,
}

impl DevicePreference {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "cpu" | "2" => DevicePreference::ForceCpu,
            "gpu" | "1" => DevicePreference::ForceGpu,
            _ => DevicePreference::Auto,
        }
    }
}

/// Which checker-kernel variant the device verifier uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GpuStrategy {
    /// One checker dispatch per canary region.
    SingleObject,
    /// Gather all canaries into a staging buffer, check once.
    #[default]
    BulkCopy,
    /// Like `BulkCopy`, but SVM canaries are read through a pointer table.
    BulkPointer,
}

impl GpuStrategy {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "single" | "2" => GpuStrategy::SingleObject,
            "bulk-pointer" | "pointer" | "0" => GpuStrategy::BulkPointer,
            _ => GpuStrategy::BulkCopy,
        }
    }
}

/// Detector settings, read from the environment by `Default`.
#[derive(Clone, Debug)]
pub struct DetectorConfig {
    pub log_location: Option<PathBuf>,
    pub exit_on_overflow: bool,
    pub exit_code: i32,
    pub print_backtrace: bool,
    pub backtrace_depth: usize,
    pub device_preference: DevicePreference,
    pub gpu_strategy: GpuStrategy,
    pub stats: StatsFlags,
    pub stats_file: PathBuf,
    pub underflow_check: bool,
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(v) => {
            let v = v.trim();
            !(v.is_empty() || v == "0")
        }
        Err(_) => false,
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(fallback)
}

impl DetectorConfig {
    /// Settings with every option off, independent of the environment.
    pub fn quiet() -> Self {
        Self {
            log_location: None,
            exit_on_overflow: false,
            exit_code: -1,
            print_backtrace: false,
            backtrace_depth: 8,
            device_preference: DevicePreference::Auto,
            gpu_strategy: GpuStrategy::BulkCopy,
            stats: StatsFlags::empty(),
            stats_file: PathBuf::from("clcanary_stats.csv"),
            underflow_check: false,
        }
    }

    /// Read settings from the `CLCANARY_*` environment variables.
    pub fn from_env() -> Self {
        let base = Self::quiet();
        Self {
            log_location: std::env::var("CLCANARY_LOG_LOCATION")
                .ok()
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            exit_on_overflow: env_flag("CLCANARY_EXIT_ON_OVERFLOW"),
            exit_code: env_parse("CLCANARY_ERROR_EXITCODE", base.exit_code),
            print_backtrace: env_flag("CLCANARY_PRINT_BACKTRACE"),
            backtrace_depth: env_parse("CLCANARY_BACKTRACE_DEPTH", base.backtrace_depth),
            device_preference: std::env::var("CLCANARY_DEVICE_SELECT")
                .map(|v| DevicePreference::parse(&v))
                .unwrap_or_default(),
            gpu_strategy: std::env::var("CLCANARY_GPU_STRATEGY")
                .map(|v| GpuStrategy::parse(&v))
                .unwrap_or_default(),
            stats: StatsFlags::from_bits_truncate(env_parse("CLCANARY_STATS_MODE", 0u32)),
            stats_file: std::env::var("CLCANARY_STATS_FILE")
                .map(PathBuf::from)
                .unwrap_or(base.stats_file),
            underflow_check: env_flag("CLCANARY_UNDERFLOW_CHECK"),
        }
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

static CONFIG: Lazy<RwLock<DetectorConfig>> = Lazy::new(|| RwLock::new(DetectorConfig::default()));

/// Replace the process-wide detector configuration.
pub fn set_config(cfg: DetectorConfig) -> DetectorResult<()> {
    let mut guard = CONFIG.write().map_err(|_| DetectorError::LockPoisoned)?;
    *guard = cfg;
    Ok(())
}

/// Get a clone of the process-wide configuration.
pub fn get_config() -> DetectorResult<DetectorConfig> {
    CONFIG
        .read()
        .map_err(|_| DetectorError::LockPoisoned)
        .map(|g| g.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "CLCANARY_LOG_LOCATION",
        "CLCANARY_EXIT_ON_OVERFLOW",
        "CLCANARY_ERROR_EXITCODE",
        "CLCANARY_PRINT_BACKTRACE",
        "CLCANARY_BACKTRACE_DEPTH",
        "CLCANARY_DEVICE_SELECT",
        "CLCANARY_GPU_STRATEGY",
        "CLCANARY_STATS_MODE",
        "CLCANARY_STATS_FILE",
        "CLCANARY_UNDERFLOW_CHECK",
    ];

    fn clear_env() {
        for v in VARS {
            std::env::remove_var(v);
        }
    }

    #[test]
    #[serial]
    fn defaults_without_environment() {
        clear_env();
        let cfg = DetectorConfig::from_env();
        assert!(cfg.log_location.is_none());
        assert!(!cfg.exit_on_overflow);
        assert_eq!(cfg.exit_code, -1);
        assert_eq!(cfg.backtrace_depth, 8);
        assert_eq!(cfg.device_preference, DevicePreference::Auto);
        assert_eq!(cfg.gpu_strategy, GpuStrategy::BulkCopy);
        assert!(cfg.stats.is_empty());
        assert!(!cfg.underflow_check);
    }

    #[test]
    #[serial]
    fn reads_named_options() {
        clear_env();
        std::env::set_var("CLCANARY_LOG_LOCATION", "/tmp/canary.log");
        std::env::set_var("CLCANARY_EXIT_ON_OVERFLOW", "1");
        std::env::set_var("CLCANARY_ERROR_EXITCODE", "42");
        std::env::set_var("CLCANARY_DEVICE_SELECT", "gpu");
        std::env::set_var("CLCANARY_GPU_STRATEGY", "single");
        std::env::set_var("CLCANARY_STATS_MODE", "6");
        let cfg = DetectorConfig::from_env();
        clear_env();
        assert_eq!(cfg.log_location, Some(PathBuf::from("/tmp/canary.log")));
        assert!(cfg.exit_on_overflow);
        assert_eq!(cfg.exit_code, 42);
        assert_eq!(cfg.device_preference, DevicePreference::ForceGpu);
        assert_eq!(cfg.gpu_strategy, GpuStrategy::SingleObject);
        assert!(cfg.stats.contains(StatsFlags::CHECKER_TIME));
        assert!(cfg.stats.contains(StatsFlags::MEMORY_OVERHEAD));
        assert!(!cfg.stats.contains(StatsFlags::DISPATCH_TIME));
    }

    #[test]
    #[serial]
    fn malformed_values_fall_back() {
        clear_env();
        std::env::set_var("CLCANARY_ERROR_EXITCODE", "not-a-number");
        std::env::set_var("CLCANARY_DEVICE_SELECT", "fpga");
        std::env::set_var("CLCANARY_GPU_STRATEGY", "0");
        std::env::set_var("CLCANARY_EXIT_ON_OVERFLOW", "0");
        let cfg = DetectorConfig::from_env();
        clear_env();
        assert_eq!(cfg.exit_code, -1);
        assert_eq!(cfg.device_preference, DevicePreference::Auto);
        assert_eq!(cfg.gpu_strategy, GpuStrategy::BulkPointer);
        assert!(!cfg.exit_on_overflow);
    }

    #[test]
    #[serial]
    fn global_config_round_trip() {
        let mut cfg = DetectorConfig::quiet();
        cfg.backtrace_depth = 3;
        set_config(cfg).unwrap();
        assert_eq!(get_config().unwrap().backtrace_depth, 3);
        set_config(DetectorConfig::quiet()).unwrap();
    }
}
