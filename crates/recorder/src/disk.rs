//! Disk guardian
//!
//! Watches usage of the video filesystem and evicts archived segments, oldest
//! first, once usage crosses the high-water mark or free space drops below the
//! floor. Eviction continues until usage is [`DiskPolicy::HYSTERESIS`] below
//! the mark and the floor is met again. Files under `current/` are never
//! touched.

use crate::recorder::SEGMENT_EXTENSION;
use crate::{DiskPolicy, RecorderError, VideoPaths};
use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, error, info, warn};
use worker::{WorkerError, WorkerSet};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Filesystem usage in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub used: u64,
    /// Available to unprivileged writers
    pub free: u64,
}

impl DiskUsage {
    pub fn used_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used as f64 / self.total as f64
    }

    pub fn free_gb(&self) -> f64 {
        self.free as f64 / BYTES_PER_GB
    }
}

/// Source of filesystem usage
pub trait UsageSource: Send {
    fn usage(&self, path: &Path) -> io::Result<DiskUsage>;
}

/// `statvfs(3)` usage source
pub struct StatvfsUsage;

impl UsageSource for StatvfsUsage {
    // Field widths differ between targets.
    #[allow(clippy::unnecessary_cast)]
    fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: statvfs is plain old data; zeroed is a valid initial value.
        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL-terminated and st is a valid out-pointer.
        let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut st) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }

        let frsize = st.f_frsize as u64;
        let total = st.f_blocks as u64 * frsize;
        let used = (st.f_blocks as u64).saturating_sub(st.f_bfree as u64) * frsize;
        let free = st.f_bavail as u64 * frsize;
        Ok(DiskUsage { total, used, free })
    }
}

/// Result of one eviction pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: Vec<PathBuf>,
    pub bytes: u64,
}

/// Periodic usage check and eviction
pub struct DiskGuardian {
    policy: DiskPolicy,
    paths: VideoPaths,
    source: Box<dyn UsageSource>,
}

impl DiskGuardian {
    pub fn new(policy: DiskPolicy, paths: VideoPaths, source: Box<dyn UsageSource>) -> Self {
        Self {
            policy,
            paths,
            source,
        }
    }

    /// Usage is past the mark or free space is below the floor
    pub fn needs_cleanup(&self, usage: &DiskUsage) -> bool {
        usage.used_fraction() > self.policy.high_water_mark || usage.free_gb() < self.policy.min_free_gb
    }

    /// Usage is back inside the hysteresis band
    pub fn is_satisfied(&self, usage: &DiskUsage) -> bool {
        usage.used_fraction() <= self.policy.high_water_mark - DiskPolicy::HYSTERESIS
            && usage.free_gb() >= self.policy.min_free_gb
    }

    fn usage(&self) -> Result<DiskUsage, RecorderError> {
        Ok(self.source.usage(&self.paths.root)?)
    }

    /// Sample usage and evict if needed
    pub fn check(&self) -> Result<CleanupReport, RecorderError> {
        let usage = self.usage()?;
        debug!(
            "Disk usage {:.1}%, {:.1}GB free",
            usage.used_fraction() * 100.0,
            usage.free_gb()
        );
        if !self.needs_cleanup(&usage) {
            return Ok(CleanupReport::default());
        }
        warn!(
            "Disk usage high: {:.1}% used, {:.1}GB free",
            usage.used_fraction() * 100.0,
            usage.free_gb()
        );
        self.cleanup()
    }

    /// Archived segments, oldest modification time first
    pub fn archived_segments(&self) -> Result<Vec<(SystemTime, PathBuf)>, RecorderError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.paths.archive)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
                continue;
            }
            let meta = entry.metadata()?;
            if meta.is_file() {
                files.push((meta.modified()?, path));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Delete oldest archived segments until usage is back in the band
    pub fn cleanup(&self) -> Result<CleanupReport, RecorderError> {
        let mut report = CleanupReport::default();
        for (_, path) in self.archived_segments()? {
            if self.is_satisfied(&self.usage()?) {
                break;
            }
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if let Err(e) = fs::remove_file(&path) {
                warn!("Could not delete {}: {}", path.display(), e);
                continue;
            }
            info!(
                "Deleted: {}",
                path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
            );
            report.bytes += size;
            report.deleted.push(path);
        }

        if !report.deleted.is_empty() {
            info!(
                "Cleanup: deleted {} files ({:.1}MB)",
                report.deleted.len(),
                report.bytes as f64 / (1024.0 * 1024.0)
            );
        }
        Ok(report)
    }

    /// Check on the policy interval until the set is shut down
    pub fn spawn(self, workers: &mut WorkerSet) -> Result<(), WorkerError> {
        let interval = self.policy.check_interval();
        workers.spawn("disk-guardian", move |token| {
            while token.sleep(interval) {
                if let Err(e) = self.check() {
                    error!("Disk check failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs::File;
    use std::io::Write;
    use std::time::Duration;

    /// Usage derived from the bytes actually present in the video tree
    struct TreeUsage {
        total: u64,
        /// Used by everything outside the video tree
        baseline: u64,
        /// Each file byte counts as this many disk bytes
        scale: u64,
    }

    fn tree_bytes(dir: &Path) -> u64 {
        let mut sum = 0;
        for entry in fs::read_dir(dir).unwrap() {
            let entry = entry.unwrap();
            let meta = entry.metadata().unwrap();
            sum += if meta.is_dir() { tree_bytes(&entry.path()) } else { meta.len() };
        }
        sum
    }

    impl UsageSource for TreeUsage {
        fn usage(&self, path: &Path) -> io::Result<DiskUsage> {
            let used = self.baseline + tree_bytes(path) * self.scale;
            Ok(DiskUsage {
                total: self.total,
                used,
                free: self.total - used,
            })
        }
    }

    fn write_file(path: &Path, len: usize, age_secs: u64) {
        let mut file = File::create(path).unwrap();
        file.write_all(&vec![0u8; len]).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(age_secs))
            .unwrap();
    }

    fn setup() -> (tempfile::TempDir, VideoPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = VideoPaths::under(dir.path());
        paths.create().unwrap();
        (dir, paths)
    }

    fn names(paths: &[PathBuf]) -> Vec<String> {
        paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_evicts_oldest_first_down_to_band() {
        let (_dir, paths) = setup();
        // 10 segments of 10 bytes, oldest is seg_00
        for i in 0..10 {
            write_file(&paths.archive.join(format!("seg_{:02}.h264", i)), 10, 1000 - i * 10);
        }
        // In-progress segment, older than everything
        write_file(&paths.current.join("live.h264"), 10, 5000);

        let source = TreeUsage {
            total: 200,
            baseline: 50,
            scale: 1,
        };
        let policy = DiskPolicy {
            high_water_mark: 0.75,
            min_free_gb: 0.0,
            ..Default::default()
        };
        let guardian = DiskGuardian::new(policy, paths.clone(), Box::new(source));

        // 160/200 = 0.80 > 0.75
        let report = guardian.check().unwrap();
        // Needs <= 0.70 = 140 bytes: two deletions
        assert_eq!(names(&report.deleted), vec!["seg_00.h264", "seg_01.h264"]);
        assert_eq!(report.bytes, 20);
        assert!(paths.current.join("live.h264").exists());

        let after = guardian.usage().unwrap();
        assert!(guardian.is_satisfied(&after));

        // Inside the band: nothing more to do
        assert!(guardian.check().unwrap().deleted.is_empty());
    }

    #[test]
    fn test_free_space_floor_triggers_cleanup() {
        let (_dir, paths) = setup();
        for i in 0..4 {
            write_file(&paths.archive.join(format!("seg_{}.h264", i)), 1, 100 - i * 10);
        }
        let gb = BYTES_PER_GB as u64;
        // Four 1-byte files each standing for 2 GB: 24 of 32 GB used, 8 GB free
        let source = TreeUsage {
            total: 32 * gb,
            baseline: 16 * gb,
            scale: 2 * gb,
        };
        let guardian = DiskGuardian::new(DiskPolicy::default(), paths, Box::new(source));

        let usage = guardian.usage().unwrap();
        assert!(usage.used_fraction() <= 0.75);
        assert!(guardian.needs_cleanup(&usage));

        let report = guardian.check().unwrap();
        assert_eq!(names(&report.deleted), vec!["seg_0.h264"]);
    }

    #[test]
    fn test_ignores_foreign_files() {
        let (_dir, paths) = setup();
        write_file(&paths.archive.join("notes.txt"), 50, 9000);
        write_file(&paths.archive.join("old.h264"), 50, 10);

        let source = TreeUsage {
            total: 100,
            baseline: 0,
            scale: 1,
        };
        let policy = DiskPolicy {
            min_free_gb: 0.0,
            ..Default::default()
        };
        let guardian = DiskGuardian::new(policy, paths.clone(), Box::new(source));
        let report = guardian.check().unwrap();
        assert_eq!(names(&report.deleted), vec!["old.h264"]);
        assert!(paths.archive.join("notes.txt").exists());
    }

    #[test]
    fn test_stops_when_archive_is_exhausted() {
        let (_dir, paths) = setup();
        write_file(&paths.archive.join("a.h264"), 1, 10);
        write_file(&paths.current.join("b.h264"), 1, 20);
        let source = TreeUsage {
            total: 100,
            baseline: 99,
            scale: 0,
        };
        let policy = DiskPolicy {
            min_free_gb: 0.0,
            ..Default::default()
        };
        let guardian = DiskGuardian::new(policy, paths.clone(), Box::new(source));
        let report = guardian.check().unwrap();
        assert_eq!(report.deleted.len(), 1);
        assert!(paths.current.join("b.h264").exists());
    }

    #[test]
    fn test_statvfs_usage() {
        let dir = tempfile::tempdir().unwrap();
        let usage = StatvfsUsage.usage(dir.path()).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
        assert!(StatvfsUsage.usage(Path::new("/nonexistent/videos")).is_err());
    }

    #[test]
    fn test_usage_fraction() {
        let usage = DiskUsage {
            total: 0,
            used: 0,
            free: 0,
        };
        assert_eq!(usage.used_fraction(), 0.0);
    }

    proptest! {
        #[test]
        fn prop_satisfied_never_needs_cleanup(
            total in 1u64..1 << 40,
            used_permille in 0u64..=1000,
            mark in 0.1f64..0.95,
            min_free_gb in 0.0f64..20.0,
        ) {
            let used = total / 1000 * used_permille;
            let usage = DiskUsage {
                total,
                used,
                free: total - used,
            };
            let policy = DiskPolicy {
                high_water_mark: mark,
                min_free_gb,
                ..Default::default()
            };
            let source = TreeUsage {
                total,
                baseline: 0,
                scale: 0,
            };
            let guardian =
                DiskGuardian::new(policy, VideoPaths::under(Path::new("/nonexistent")), Box::new(source));
            if guardian.is_satisfied(&usage) {
                prop_assert!(!guardian.needs_cleanup(&usage));
            }
        }
    }
}
