// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! MEM_INFO snapshot of the supervisor host.

use sysinfo::System;
use tasklane_protocol::MemoryInfo;

const MB: u64 = 1024 * 1024;

/// Collect host and process memory usage.
///
/// Blocks while sysinfo refreshes; call from `spawn_blocking`.
pub fn collect_memory_info(running_jobs: usize) -> MemoryInfo {
    let mut sys = System::new_all();
    sys.refresh_all();

    let process_memory_mb = sysinfo::get_current_pid()
        .ok()
        .and_then(|pid| sys.process(pid))
        .map(|p| p.memory() / MB)
        .unwrap_or(0);

    let total = sys.total_memory();
    let used = sys.used_memory();

    MemoryInfo {
        total_memory_mb: total / MB,
        used_memory_mb: used / MB,
        free_memory_mb: total.saturating_sub(used) / MB,
        process_memory_mb,
        cpu_count: sys.cpus().len(),
        running_jobs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_is_consistent() {
        let info = collect_memory_info(3);
        assert!(info.total_memory_mb > 0);
        assert!(info.used_memory_mb <= info.total_memory_mb);
        assert_eq!(info.running_jobs, 3);
    }
}
