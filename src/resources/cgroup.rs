//! Cgroup v2 discovery and limit application
//!
//! The trampoline calls [`enter_limited_subtree`] before exec: it finds the
//! cgroup2 mount, creates the `overseer` subtree, writes whichever limits are
//! set and finally moves the calling process into the subtree.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use crate::errors::{OverseerError, Result};
use crate::resources::ResourceLimits;

/// Name of the subtree created under the cgroup2 mount
pub const CONTROL_SUBTREE: &str = "overseer";

const MOUNTS_PATH: &str = "/proc/self/mounts";
const BLOCK_DEV_DIR: &str = "/sys/block";

/// Locate the cgroup v2 mount point by scanning the mount table
pub fn cgroup2_mount_point() -> Result<PathBuf> {
    let mounts = fs::File::open(MOUNTS_PATH)?;
    // TODO: try to mount it before giving up
    find_cgroup2_mount(BufReader::new(mounts)).ok_or(OverseerError::CgroupNotMounted)
}

fn find_cgroup2_mount<R: BufRead>(mounts: R) -> Option<PathBuf> {
    for line in mounts.lines().map_while(|line| line.ok()) {
        let mut fields = line.split_whitespace();
        let _source = fields.next()?;
        let target = fields.next()?;
        if fields.next() == Some("cgroup2") {
            return Some(PathBuf::from(target));
        }
    }

    None
}

/// Configure the `overseer` subtree with the given limits and move the
/// current process into it.
pub fn enter_limited_subtree(limits: &ResourceLimits) -> Result<()> {
    let root = cgroup2_mount_point()?;
    let devices = if limits.has_io_limits() {
        block_devices(Path::new(BLOCK_DEV_DIR))?
    } else {
        Vec::new()
    };

    apply_limits_at(&root, limits, &devices, std::process::id())
}

/// Create the subtree under `root`, write the set limits and append `pid` to
/// `cgroup.procs`.
fn apply_limits_at(
    root: &Path,
    limits: &ResourceLimits,
    devices: &[String],
    pid: u32,
) -> Result<()> {
    let subtree = root.join(CONTROL_SUBTREE);

    match DirBuilder::new().mode(0o755).create(&subtree) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            return Err(OverseerError::Syscall(format!(
                "failed to create cgroup subtree {}: {e}",
                subtree.display()
            )));
        }
    }

    if let Some(cpu_max) = &limits.cpu_max {
        write_control(&subtree.join("cpu.max"), cpu_max)?;
    }

    if let Some(memory_max) = &limits.memory_max {
        write_control(&subtree.join("memory.max"), memory_max)?;
    }

    if let Some(suffix) = io_limit_suffix(limits) {
        for device in devices {
            write_control(&subtree.join("io.max"), &format!("{device}{suffix}"))?;
        }
    }

    write_control(&subtree.join("cgroup.procs"), &pid.to_string())
}

/// Per-device tail of an `io.max` line, e.g. `" rbps=5000000 wbps=5000000"`;
/// `None` when neither bound is set.
fn io_limit_suffix(limits: &ResourceLimits) -> Option<String> {
    let mut suffix = String::new();

    if let Some(rbps) = &limits.io_max_rbps {
        suffix.push_str(&format!(" rbps={rbps}"));
    }
    if let Some(wbps) = &limits.io_max_wbps {
        suffix.push_str(&format!(" wbps={wbps}"));
    }

    if suffix.is_empty() {
        None
    } else {
        Some(suffix)
    }
}

/// Enumerate block devices as `major:minor` strings
fn block_devices(base: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(base).map_err(|e| {
        OverseerError::Syscall(format!("failed to list {}: {e}", base.display()))
    })?;

    let mut devices = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            OverseerError::Syscall(format!("failed to list {}: {e}", base.display()))
        })?;
        let dev_file = entry.path().join("dev");
        let numbers = fs::read_to_string(&dev_file).map_err(|e| {
            OverseerError::Syscall(format!("failed to read {}: {e}", dev_file.display()))
        })?;
        devices.push(numbers.trim().to_string());
    }
    devices.sort();

    Ok(devices)
}

fn write_control(path: &Path, value: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o700)
        .open(path)
        .map_err(|e| {
            OverseerError::Syscall(format!("failed to open {}: {e}", path.display()))
        })?;

    write!(file, "{value}").map_err(|e| {
        OverseerError::Syscall(format!("failed to write {}: {e}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::tempdir;

    const SAMPLE_MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
tmpfs /run tmpfs rw,nosuid,nodev,size=402292k,mode=755 0 0
cgroup2 /sys/fs/cgroup cgroup2 rw,nosuid,nodev,noexec,relatime 0 0
/dev/sda1 / ext4 rw,relatime 0 0
";

    #[test]
    fn test_find_cgroup2_mount_in_table() {
        let found = find_cgroup2_mount(Cursor::new(SAMPLE_MOUNTS)).unwrap();
        assert_eq!(found, PathBuf::from("/sys/fs/cgroup"));
    }

    #[test]
    fn test_find_cgroup2_mount_ignores_v1_controllers() {
        let table = "\
cgroup /sys/fs/cgroup/cpu cgroup rw,cpu 0 0
cgroup /sys/fs/cgroup/memory cgroup rw,memory 0 0
";
        assert!(find_cgroup2_mount(Cursor::new(table)).is_none());
    }

    #[test]
    fn test_find_cgroup2_mount_missing() {
        assert!(find_cgroup2_mount(Cursor::new("proc /proc proc rw 0 0\n")).is_none());
    }

    #[test]
    fn test_io_limit_suffix_both_bounds() {
        let limits = ResourceLimits {
            io_max_rbps: Some("1111".to_string()),
            io_max_wbps: Some("3333".to_string()),
            ..Default::default()
        };
        assert_eq!(
            io_limit_suffix(&limits).unwrap(),
            " rbps=1111 wbps=3333"
        );
    }

    #[test]
    fn test_io_limit_suffix_single_bound() {
        let limits = ResourceLimits {
            io_max_wbps: Some("3333".to_string()),
            ..Default::default()
        };
        assert_eq!(io_limit_suffix(&limits).unwrap(), " wbps=3333");
    }

    #[test]
    fn test_io_limit_suffix_unset() {
        assert!(io_limit_suffix(&ResourceLimits::default()).is_none());
    }

    #[test]
    fn test_apply_limits_writes_control_files() {
        let tmp = tempdir().unwrap();
        let limits = ResourceLimits {
            cpu_max: Some("20000 100000".to_string()),
            memory_max: Some("8388608".to_string()),
            io_max_rbps: Some("1111".to_string()),
            io_max_wbps: Some("3333".to_string()),
        };
        let devices = vec!["253:0".to_string(), "8:0".to_string()];

        apply_limits_at(tmp.path(), &limits, &devices, 4242).unwrap();

        let subtree = tmp.path().join(CONTROL_SUBTREE);
        assert_eq!(
            fs::read_to_string(subtree.join("cpu.max")).unwrap(),
            "20000 100000"
        );
        assert_eq!(
            fs::read_to_string(subtree.join("memory.max")).unwrap(),
            "8388608"
        );
        // One line per device; the last write survives the truncating open
        assert_eq!(
            fs::read_to_string(subtree.join("io.max")).unwrap(),
            "8:0 rbps=1111 wbps=3333"
        );
        assert_eq!(
            fs::read_to_string(subtree.join("cgroup.procs")).unwrap(),
            "4242"
        );
    }

    #[test]
    fn test_apply_limits_skips_unset_controls() {
        let tmp = tempdir().unwrap();
        let limits = ResourceLimits {
            memory_max: Some("max".to_string()),
            ..Default::default()
        };

        apply_limits_at(tmp.path(), &limits, &[], 1).unwrap();

        let subtree = tmp.path().join(CONTROL_SUBTREE);
        assert!(!subtree.join("cpu.max").exists());
        assert!(!subtree.join("io.max").exists());
        assert_eq!(fs::read_to_string(subtree.join("memory.max")).unwrap(), "max");
        assert_eq!(fs::read_to_string(subtree.join("cgroup.procs")).unwrap(), "1");
    }

    #[test]
    fn test_apply_limits_tolerates_existing_subtree() {
        let tmp = tempdir().unwrap();
        fs::create_dir(tmp.path().join(CONTROL_SUBTREE)).unwrap();

        apply_limits_at(tmp.path(), &ResourceLimits::default(), &[], 7).unwrap();
        apply_limits_at(tmp.path(), &ResourceLimits::default(), &[], 8).unwrap();

        let procs = tmp.path().join(CONTROL_SUBTREE).join("cgroup.procs");
        assert_eq!(fs::read_to_string(procs).unwrap(), "8");
    }

    #[test]
    fn test_block_devices_reads_major_minor() {
        let tmp = tempdir().unwrap();
        for (name, dev) in [("sda", "8:0\n"), ("dm-0", "253:0\n")] {
            let dir = tmp.path().join(name);
            fs::create_dir(&dir).unwrap();
            fs::write(dir.join("dev"), dev).unwrap();
        }

        let devices = block_devices(tmp.path()).unwrap();
        assert_eq!(devices, vec!["253:0".to_string(), "8:0".to_string()]);
    }

    #[test]
    fn test_block_devices_missing_dir() {
        assert!(block_devices(Path::new("/nonexistent/sys/block")).is_err());
    }
}
