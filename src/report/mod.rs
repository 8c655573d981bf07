// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Overflow reports, alias warnings, the optional log file and the kill
//! policy.
//!
//! Reports go to standard error and, when a log location is configured, to
//! a log file opened on first use. They do not go through `log`, so their
//! format does not depend on how the host application sets up logging.

use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use log::{error, warn};

use crate::canary::{overflow_distance, CanaryRegion, CanarySide, ImageCanaryHit, ImageGeometry};
use crate::config::DetectorConfig;
use crate::detect::dupes::DuplicateMap;
use crate::error::{DetectorError, DetectorResult};
use crate::runtime::{ComputeRuntime, KernelHandle, SvmPtr};

const RED_BG: &str = "\x1b[41m";
const YELLOW_BG: &str = "\x1b[43m";
const CYAN_TEXT: &str = "\x1b[36m";
const BLACK_TEXT: &str = "\x1b[30m";
const RESET_TEXT: &str = "\x1b[0m";

/// Names needed to describe a kernel in a report, captured while the
/// kernel is still alive, plus the dispatching call stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelReportInfo {
    pub name: String,
    arg_names: BTreeMap<u32, String>,
    /// Printed after each finding; empty unless backtraces are enabled.
    pub backtrace: Vec<String>,
}

impl KernelReportInfo {
    /// Query the function and argument names of `kernel`.
    pub fn capture(runtime: &dyn ComputeRuntime, kernel: KernelHandle) -> DetectorResult<Self> {
        let name = runtime.kernel_function_name(kernel)?;
        let mut arg_names = BTreeMap::new();
        for i in 0..runtime.kernel_num_args(kernel)? {
            if let Some(n) = runtime.kernel_arg_name(kernel, i)? {
                arg_names.insert(i, n);
            }
        }
        Ok(Self {
            name,
            arg_names,
            backtrace: Vec::new(),
        })
    }

    pub fn with_backtrace(mut self, lines: Vec<String>) -> Self {
        self.backtrace = lines;
        self
    }

    /// Argument name, or `Argument N` when the program lacks argument info.
    pub fn arg_name(&self, index: u32) -> String {
        self.arg_names
            .get(&index)
            .cloned()
            .unwrap_or_else(|| format!("Argument {}", index))
    }
}

/// The object a finding is attributed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowSubject {
    /// Buffer or image bound at this argument index.
    Argument(u32),
    /// SVM allocation, named by the pointer the application holds.
    Svm(SvmPtr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FindingKind {
    Linear { side: CanarySide, first_bad: usize, distance: usize },
    Image(ImageCanaryHit),
}

/// One reported corruption, kept for inspection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Finding {
    pub kernel: String,
    pub subject: OverflowSubject,
    /// Argument name or formatted pointer as printed.
    pub label: String,
    pub kind: FindingKind,
}

struct LogSink {
    path: Option<PathBuf>,
    file: Option<File>,
    opened: bool,
    finalized: bool,
}

impl LogSink {
    fn file(&mut self) -> Option<&mut File> {
        if !self.opened {
            self.opened = true;
            if let Some(path) = &self.path {
                match File::create(path) {
                    Ok(mut f) => {
                        let _ = writeln!(f, "Beginning buffer overflow detection run. ({})", Utc::now().to_rfc3339());
                        self.file = Some(f);
                    }
                    Err(e) => {
                        eprintln!("Could not open detector log file: {}", path.display());
                        eprintln!("   {}", e);
                        warn!("log file {} unavailable: {}", path.display(), e);
                    }
                }
            }
        }
        self.file.as_mut()
    }
}

fn frame_symbol(line: &str) -> Option<&str> {
    let (index, symbol) = line.trim_start().split_once(": ")?;
    index.parse::<usize>().ok()?;
    Some(symbol)
}

fn detector_frame(symbol: &str) -> bool {
    symbol.starts_with("std::backtrace")
        || symbol.starts_with("<std::backtrace")
        || symbol.starts_with("clcanary::")
        || symbol.starts_with("<clcanary::")
}

/// Call stack of the caller, without the detector's own frames, limited
/// to `depth` frames. Each frame keeps its source location lines.
pub fn capture_backtrace(depth: usize) -> Vec<String> {
    let trace = Backtrace::force_capture().to_string();
    let mut out = Vec::new();
    let mut frames = 0;
    let mut skipping = true;
    for line in trace.lines() {
        if let Some(symbol) = frame_symbol(line) {
            if skipping && detector_frame(symbol) {
                continue;
            }
            skipping = false;
            frames += 1;
            if frames > depth {
                break;
            }
        } else if skipping {
            continue;
        }
        out.push(line.to_string());
    }
    out
}

/// Formats findings and applies the kill policy.
pub struct Reporter {
    exit_on_overflow: bool,
    exit_code: i32,
    log: Mutex<LogSink>,
    overflows: AtomicU64,
    findings: Mutex<Vec<Finding>>,
}

impl Reporter {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            exit_on_overflow: config.exit_on_overflow,
            exit_code: config.exit_code,
            log: Mutex::new(LogSink {
                path: config.log_location.clone(),
                file: None,
                opened: false,
                finalized: false,
            }),
            overflows: AtomicU64::new(0),
            findings: Mutex::new(Vec::new()),
        }
    }

    /// Corruptions reported so far.
    pub fn overflow_count(&self) -> u64 {
        self.overflows.load(Ordering::SeqCst)
    }

    /// Copy of every finding reported so far, in report order.
    pub fn findings(&self) -> Vec<Finding> {
        self.findings.lock().map(|f| f.clone()).unwrap_or_default()
    }

    /// Print a block to stderr and the log file under one lock.
    fn emit(&self, header: &str, lines: &[String]) -> DetectorResult<()> {
        let mut sink = self.log.lock().map_err(|_| DetectorError::LockPoisoned)?;
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(stderr);
        let _ = writeln!(stderr, "{}", header);
        for line in lines {
            let _ = writeln!(stderr, "{}", line);
        }
        if let Some(f) = sink.file() {
            for line in lines {
                writeln!(f, "{}", line)?;
            }
            f.flush()?;
        }
        Ok(())
    }

    fn record(&self, kernel: &KernelReportInfo, finding: Finding, lines: Vec<String>) -> DetectorResult<()> {
        let header = format!("{}{}ATTENTION:{}", CYAN_TEXT, RED_BG, RESET_TEXT);
        self.overflows.fetch_add(1, Ordering::SeqCst);
        let mut lines = lines;
        lines.extend(kernel.backtrace.iter().cloned());
        lines.push(String::new());
        self.emit(&header, &lines)?;
        self.findings.lock().map_err(|_| DetectorError::LockPoisoned)?.push(finding);
        Ok(())
    }

    /// Report a corrupted linear canary; `first_bad` is relative to the region.
    pub fn report_scalar_overflow(
        &self,
        kernel: &KernelReportInfo,
        subject: OverflowSubject,
        region: &CanaryRegion,
        first_bad: usize,
    ) -> DetectorResult<()> {
        let distance = overflow_distance(region, first_bad);
        let label = match subject {
            OverflowSubject::Argument(i) => kernel.arg_name(i),
            OverflowSubject::Svm(p) => format!("{:#x}", p.0),
        };
        let target = match subject {
            OverflowSubject::Argument(_) => format!("Kernel: {}, Buffer: {}", kernel.name, label),
            OverflowSubject::Svm(_) => format!("Kernel: {}, SVM pointer: {}", kernel.name, label),
        };
        let where_ = match region.side {
            CanarySide::Trailing => "past the end",
            CanarySide::Leading => "before the start",
        };
        let lines = vec![
            "************* Buffer overflow detected ***********".to_string(),
            target,
            format!("   First observed writing {} byte(s) {}.", distance, where_),
        ];
        let finding = Finding {
            kernel: kernel.name.clone(),
            subject,
            label,
            kind: FindingKind::Linear {
                side: region.side,
                first_bad,
                distance,
            },
        };
        self.record(kernel, finding, lines)
    }

    /// Report a corrupted image canary; `first_bad` indexes the flattened canary.
    pub fn report_image_overflow(
        &self,
        kernel: &KernelReportInfo,
        index: u32,
        geometry: &ImageGeometry,
        first_bad: usize,
    ) -> DetectorResult<()> {
        let hit = geometry.locate(first_bad);
        let label = kernel.arg_name(index);
        let detail = match hit {
            ImageCanaryHit::Row { x, y, z } => format!(
                "   First dimension overflow at row {}, depth {}, {} column(s) past end.",
                y,
                z,
                x + 1
            ),
            ImageCanaryHit::Column { y, z } => {
                format!("   Second dimension overflow at depth {}, {} row(s) past end.", z, y + 1)
            }
            ImageCanaryHit::Depth { z } => format!("   Third dimension overflow {} slice(s) past end.", z + 1),
            ImageCanaryHit::Unresolved => format!("   Canary byte {} is outside the image padding.", first_bad),
        };
        let lines = vec![
            "************* Buffer overflow detected ***********".to_string(),
            format!("Kernel: {}, Buffer: {}", kernel.name, label),
            detail,
        ];
        let finding = Finding {
            kernel: kernel.name.clone(),
            subject: OverflowSubject::Argument(index),
            label,
            kind: FindingKind::Image(hit),
        };
        self.record(kernel, finding, lines)
    }

    /// Warn that aliased arguments may misattribute an overflow. Returns
    /// whether anything was printed.
    pub fn report_alias_warning(&self, kernel: &KernelReportInfo, dupes: &DuplicateMap) -> DetectorResult<bool> {
        if !dupes.has_aliases() {
            return Ok(false);
        }
        let mut lines = vec![
            "Some of this kernel's arguments point to identical buffers.".to_string(),
            "An overflow in one argument may therefore be detected in the other argument with identical buffer."
                .to_string(),
        ];
        for (i, j) in dupes.aliases() {
            lines.push(format!(
                "    {} (argument {}) is the same buffer as {} (argument {})",
                kernel.arg_name(i),
                i,
                kernel.arg_name(j),
                j
            ));
        }
        let header = format!("{}{}WARNING:{}", BLACK_TEXT, YELLOW_BG, RESET_TEXT);
        self.emit(&header, &lines)?;
        Ok(true)
    }

    /// Terminate the process if configured to; otherwise return.
    ///
    /// `parent` is the thread that issued the dispatch when the check runs
    /// on another thread; it is signalled before exiting.
    pub fn apply_kill_policy(&self, parent: Option<ThreadId>) {
        if !self.exit_on_overflow {
            return;
        }
        eprintln!("Exiting application because of buffer overflow.");
        error!("exiting with status {} after buffer overflow", self.exit_code);
        self.finalize();
        if let Some(parent) = parent {
            parent.signal_if_other();
        }
        std::process::exit(self.exit_code);
    }

    /// Write the summary line and close the log file. Later calls are no-ops.
    pub fn finalize(&self) {
        let Ok(mut sink) = self.log.lock() else {
            return;
        };
        if sink.finalized {
            return;
        }
        sink.finalized = true;
        let total = self.overflow_count();
        if let Some(f) = sink.file() {
            let _ = writeln!(f, "Buffer overflow detection complete. ({})", Utc::now().to_rfc3339());
            let _ = writeln!(f, "Found a total of {} errors.", total);
            let _ = f.flush();
        }
        sink.file = None;
    }
}

/// Native id of the thread that dispatched a checked kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThreadId(usize);

impl ThreadId {
    #[cfg(unix)]
    pub fn current() -> Self {
        // SAFETY: pthread_self has no preconditions.
        ThreadId(unsafe { libc::pthread_self() } as usize)
    }

    #[cfg(not(unix))]
    pub fn current() -> Self {
        ThreadId(0)
    }

    #[cfg(unix)]
    fn signal_if_other(self) {
        let target = self.0 as libc::pthread_t;
        // SAFETY: the id came from pthread_self on a thread of this process.
        unsafe {
            if libc::pthread_equal(target, libc::pthread_self()) == 0 {
                libc::pthread_kill(target, libc::SIGHUP);
            }
        }
    }

    #[cfg(not(unix))]
    fn signal_if_other(self) {}
}
