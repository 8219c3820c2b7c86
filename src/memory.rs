//! Memory usage reporting between remote batches.
//!
//! Rust frees buffers as soon as each file's work ends, so there is nothing to
//! reclaim between batches. The report only makes memory growth over a long
//! run visible in the log.

use serde::Serialize;
use std::fmt;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MemoryReport {
    pub used_bytes: u64,
    pub total_bytes: u64,
    /// Resident memory of this process, when the platform reports it.
    pub process_bytes: Option<u64>,
}

impl MemoryReport {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "system {} / {} ({:.1}%)",
            format_mib(self.used_bytes),
            format_mib(self.total_bytes),
            self.used_percent()
        )?;
        if let Some(process) = self.process_bytes {
            write!(f, ", process {}", format_mib(process))?;
        }
        Ok(())
    }
}

fn format_mib(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / (1024.0 * 1024.0))
}

pub fn memory_report() -> MemoryReport {
    let mut sys = System::new();
    sys.refresh_memory();

    let process_bytes = sysinfo::get_current_pid().ok().and_then(|pid| {
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            ProcessRefreshKind::new().with_memory(),
        );
        sys.process(pid).map(|p| p.memory())
    });

    MemoryReport {
        used_bytes: sys.used_memory(),
        total_bytes: sys.total_memory(),
        process_bytes,
    }
}
