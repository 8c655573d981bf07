// CLASSIFICATION: COMMUNITY
// Filename: log_and_stats.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

mod common;

use clcanary::runtime::{ArgValue, DeviceType, MemFlags, NdRange};
use clcanary::stats::StatsFlags;
use clcanary::DetectorConfig;
use common::{rig, scribble, word};
use serial_test::serial;
use tempfile::tempdir;

#[test]
#[serial]
fn log_file_records_run() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("canary.log");
    let mut cfg = DetectorConfig::quiet();
    cfg.log_location = Some(log.clone());
    let r = rig(DeviceType::Cpu, cfg, vec![scribble()]);
    let buf = r.det.create_buffer(r.ctx, MemFlags::READ_WRITE, 32, None).unwrap();
    let k = r.det.create_kernel(r.program, "scribble").unwrap();
    r.det.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(36))).unwrap();
    r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();
    r.det.shutdown().unwrap();
    r.det.shutdown().unwrap();

    let text = std::fs::read_to_string(&log).unwrap();
    assert!(text.starts_with("Beginning buffer overflow detection run."));
    assert!(text.contains("Kernel: scribble, Buffer: out"));
    assert!(text.contains("   First observed writing 4 byte(s) past the end."));
    assert!(text.contains("Buffer overflow detection complete."));
    assert_eq!(text.matches("Found a total of 1 errors.").count(), 1);
}

#[test]
#[serial]
fn memory_statistics_are_appended() {
    let dir = tempdir().unwrap();
    let stats = dir.path().join("stats.csv");
    let mut cfg = DetectorConfig::quiet();
    cfg.stats = StatsFlags::MEMORY_OVERHEAD | StatsFlags::DISPATCH_TIME;
    cfg.stats_file = stats.clone();
    let r = rig(DeviceType::Cpu, cfg, vec![scribble()]);
    let buf = r.det.create_buffer(r.ctx, MemFlags::READ_WRITE, 100, None).unwrap();
    let k = r.det.create_kernel(r.program, "scribble").unwrap();
    r.det.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(100))).unwrap();
    r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();
    r.det.release_mem(buf).unwrap();
    r.det.shutdown().unwrap();

    let (user, _overhead) = r.det.stats().memory().unwrap();
    assert_eq!(user.current, 0);
    assert_eq!(user.high_water, 100);
    let text = std::fs::read_to_string(&stats).unwrap();
    assert!(text.contains("user_bytes, 0, 100, 100"));
}

#[inline(never)]
fn overflow_from_caller(r: &common::Rig) {
    let buf = r.det.create_buffer(r.ctx, MemFlags::READ_WRITE, 16, None).unwrap();
    let k = r.det.create_kernel(r.program, "scribble").unwrap();
    r.det.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(20))).unwrap();
    r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();
}

fn frame_lines(text: &str) -> Vec<&str> {
    text.lines()
        .filter(|l| {
            l.trim_start()
                .split_once(": ")
                .map_or(false, |(idx, _)| idx.parse::<usize>().is_ok())
        })
        .collect()
}

#[test]
#[serial]
fn backtrace_starts_at_the_dispatching_caller() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("canary.log");
    let mut cfg = DetectorConfig::quiet();
    cfg.log_location = Some(log.clone());
    cfg.print_backtrace = true;
    cfg.backtrace_depth = 2;
    let r = rig(DeviceType::Gpu, cfg, vec![scribble()]);
    overflow_from_caller(&r);
    assert_eq!(r.det.overflow_count(), 1);

    let text = std::fs::read_to_string(&log).unwrap();
    let frames = frame_lines(&text);
    assert_eq!(frames.len(), 2, "{}", text);
    assert!(frames[0].contains("overflow_from_caller"), "{}", text);
    assert!(frames.iter().all(|f| !f.contains("clcanary::")));
}

#[test]
#[serial]
fn checker_time_is_one_line_per_host_check() {
    let dir = tempdir().unwrap();
    let stats = dir.path().join("stats.csv");
    let mut cfg = DetectorConfig::quiet();
    cfg.stats = StatsFlags::CHECKER_TIME;
    cfg.stats_file = stats.clone();
    let r = rig(DeviceType::Cpu, cfg, vec![scribble()]);
    let buf = r.det.create_buffer(r.ctx, MemFlags::READ_WRITE, 64, None).unwrap();
    let k = r.det.create_kernel(r.program, "scribble").unwrap();
    r.det.set_kernel_arg(k, 0, ArgValue::Mem(buf)).unwrap();
    r.det.set_kernel_arg(k, 1, ArgValue::Bytes(&word(64))).unwrap();
    r.det.enqueue_kernel(r.queue, k, &NdRange::linear(1, None), &[], false).unwrap();

    let text = std::fs::read_to_string(&stats).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 1, "{}", text);
    assert!(lines[0].trim().parse::<u128>().is_ok(), "{}", lines[0]);
}
