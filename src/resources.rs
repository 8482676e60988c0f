//! Host memory and scratch-disk usage for `GET /resources`.

use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct ResourceReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskUsage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskUsage {
    pub path: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub percent: f64,
}

pub fn collect(scratch_root: &Path) -> ResourceReport {
    ResourceReport {
        memory: memory(),
        disk: disk(scratch_root),
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (used as f64 * 1000.0 / total as f64).round() / 10.0
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn memory() -> Option<MemoryUsage> {
    let info = nix::sys::sysinfo::sysinfo().ok()?;
    let total = info.ram_total();
    let free = info.ram_unused();
    let used = total.saturating_sub(free);
    Some(MemoryUsage {
        total,
        free,
        used,
        percent: percent(used, total),
    })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn memory() -> Option<MemoryUsage> {
    None
}

#[cfg(unix)]
fn disk(path: &Path) -> Option<DiskUsage> {
    // The scratch root may not exist before the first job; its parent sits on
    // the same filesystem.
    let probe = path.ancestors().find(|p| p.exists())?;
    let stat = nix::sys::statvfs::statvfs(probe).ok()?;
    let unit = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * unit;
    let free = stat.blocks_available() as u64 * unit;
    let used = total.saturating_sub(stat.blocks_free() as u64 * unit);
    Some(DiskUsage {
        path: probe.display().to_string(),
        total,
        used,
        free,
        percent: percent(used, total),
    })
}

#[cfg(not(unix))]
fn disk(_path: &Path) -> Option<DiskUsage> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_rounded_to_one_decimal() {
        assert_eq!(percent(1, 3), 33.3);
        assert_eq!(percent(0, 0), 0.0);
    }

    #[cfg(unix)]
    #[test]
    fn disk_usage_of_missing_root_uses_nearest_parent() {
        let dir = tempfile::tempdir().unwrap();
        let report = collect(&dir.path().join("not/yet/created"));
        let disk = report.disk.expect("statvfs on a temp dir");
        assert_eq!(disk.path, dir.path().display().to_string());
        assert!(disk.total >= disk.free);
    }
}
