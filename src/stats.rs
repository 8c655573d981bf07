// CLASSIFICATION: COMMUNITY
// Filename: stats.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Optional timing and memory statistics appended to a plain text file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use bitflags::bitflags;
use log::debug;

use crate::error::{DetectorError, DetectorResult};

bitflags! {
    /// Which statistics are collected.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StatsFlags: u32 {
        const DISPATCH_TIME = 1 << 0;
        const CHECKER_TIME = 1 << 1;
        const MEMORY_OVERHEAD = 1 << 2;
    }
}

/// Current, peak and cumulative byte counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryTally {
    pub current: u64,
    pub high_water: u64,
    pub total: u64,
}

impl MemoryTally {
    fn add(&mut self, bytes: u64) {
        self.current += bytes;
        self.total += bytes;
        self.high_water = self.high_water.max(self.current);
    }

    fn sub(&mut self, bytes: u64) {
        self.current = self.current.saturating_sub(bytes);
    }
}

#[derive(Default)]
struct MemoryCounters {
    user: MemoryTally,
    overhead: MemoryTally,
}

/// Destination for statistics lines.
pub struct StatsSink {
    flags: StatsFlags,
    path: PathBuf,
    memory: Mutex<MemoryCounters>,
    file: Mutex<()>,
}

impl StatsSink {
    pub fn new(flags: StatsFlags, path: impl Into<PathBuf>) -> Self {
        Self {
            flags,
            path: path.into(),
            memory: Mutex::new(MemoryCounters::default()),
            file: Mutex::new(()),
        }
    }

    pub fn enabled(&self, flag: StatsFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append_line(&self, line: &str) -> DetectorResult<()> {
        let _guard = self.file.lock().map_err(|_| DetectorError::LockPoisoned)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(f, "{}", line)?;
        Ok(())
    }

    /// One host verification pass, in microseconds.
    pub fn record_checker_time(&self, elapsed: Duration) -> DetectorResult<()> {
        if !self.enabled(StatsFlags::CHECKER_TIME) {
            return Ok(());
        }
        self.append_line(&elapsed.as_micros().to_string())
    }

    /// Whole dispatch and the application enqueue inside it.
    pub fn record_dispatch(&self, total: Duration, enqueue: Duration) -> DetectorResult<()> {
        if !self.enabled(StatsFlags::DISPATCH_TIME) {
            return Ok(());
        }
        let total_us = total.as_micros();
        let enq_us = enqueue.as_micros();
        self.append_line(&format!("{}, {}, {}", total_us, enq_us, total_us.saturating_sub(enq_us)))
    }

    pub fn track_alloc(&self, user: usize, overhead: usize) {
        if let Ok(mut m) = self.memory.lock() {
            m.user.add(user as u64);
            m.overhead.add(overhead as u64);
        }
    }

    pub fn track_free(&self, user: usize, overhead: usize) {
        if let Ok(mut m) = self.memory.lock() {
            m.user.sub(user as u64);
            m.overhead.sub(overhead as u64);
        }
    }

    /// `(user, overhead)` byte tallies.
    pub fn memory(&self) -> DetectorResult<(MemoryTally, MemoryTally)> {
        let m = self.memory.lock().map_err(|_| DetectorError::LockPoisoned)?;
        Ok((m.user, m.overhead))
    }

    /// Append the memory tallies; called once at teardown.
    pub fn write_memory_summary(&self) -> DetectorResult<()> {
        if !self.enabled(StatsFlags::MEMORY_OVERHEAD) {
            return Ok(());
        }
        let (user, overhead) = self.memory()?;
        debug!("memory overhead {:?} for user bytes {:?}", overhead, user);
        self.append_line(&format!(
            "user_bytes, {}, {}, {}",
            user.current, user.high_water, user.total
        ))?;
        self.append_line(&format!(
            "overhead_bytes, {}, {}, {}",
            overhead.current, overhead.high_water, overhead.total
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tally_tracks_high_water() {
        let sink = StatsSink::new(StatsFlags::MEMORY_OVERHEAD, "unused");
        sink.track_alloc(100, 8192);
        sink.track_alloc(50, 8192);
        sink.track_free(100, 8192);
        let (user, overhead) = sink.memory().unwrap();
        assert_eq!(user, MemoryTally { current: 50, high_water: 150, total: 150 });
        assert_eq!(overhead.current, 8192);
        assert_eq!(overhead.high_water, 16384);
    }

    #[test]
    fn disabled_flags_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        let sink = StatsSink::new(StatsFlags::empty(), &path);
        sink.record_checker_time(Duration::from_micros(5)).unwrap();
        sink.record_dispatch(Duration::from_micros(9), Duration::from_micros(4)).unwrap();
        sink.write_memory_summary().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn lines_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.csv");
        let sink = StatsSink::new(StatsFlags::all(), &path);
        sink.record_checker_time(Duration::from_micros(42)).unwrap();
        sink.record_dispatch(Duration::from_micros(10), Duration::from_micros(3)).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "42\n10, 3, 7\n");
    }
}
