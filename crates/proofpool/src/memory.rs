//! Memory probing and admission control.
//!
//! Admission is a local, synchronous check performed before a task enters the
//! queue: it compares current memory usage against the configured threshold
//! and never blocks waiting for memory to free. Rejecting at the door keeps
//! an already-dangerous memory condition from being amplified by unbounded
//! queue growth.

use crate::config::{MEMORY_CRITICAL_FRACTION, MEMORY_WARN_FRACTION};
use parking_lot::Mutex;
use sysinfo::System;

/// Source of the memory usage reading consulted by admission control and the
/// health monitor.
///
/// Abstracted behind a trait so tests can force a fixed reading.
pub trait MemoryMonitor: Send + Sync + 'static {
    /// Current memory usage in bytes.
    fn used_bytes(&self) -> u64;
}

/// [`MemoryMonitor`] backed by [`sysinfo`], reporting system-wide used
/// memory.
#[derive(Debug, Default)]
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl MemoryMonitor for SystemMemory {
    fn used_bytes(&self) -> u64 {
        let mut system = self.system.lock();
        system.refresh_memory();
        system.used_memory()
    }
}

/// Outcome of the admission check for a single submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AdmissionDecision {
    /// Usage is below the warning band; admit silently.
    Admit,
    /// Usage is elevated but not critical; admit and emit a warning. No task
    /// is dropped in this band.
    AdmitWithWarning { used: u64 },
    /// Usage is at or above the critical fraction of the threshold; reject
    /// immediately rather than queue.
    Reject { used: u64 },
}

/// Compares a memory reading against the configured threshold.
pub(crate) fn admission_decision(used: u64, threshold_bytes: u64) -> AdmissionDecision {
    let warn = (threshold_bytes as f64 * MEMORY_WARN_FRACTION) as u64;
    let critical = (threshold_bytes as f64 * MEMORY_CRITICAL_FRACTION) as u64;

    if used >= critical {
        AdmissionDecision::Reject { used }
    } else if used >= warn {
        AdmissionDecision::AdmitWithWarning { used }
    } else {
        AdmissionDecision::Admit
    }
}
