//! Loop device binding and partition device node synthesis.
//!
//! Inside containers there is usually no udev, so the partition nodes
//! (`/dev/loopNpM`) of a freshly bound loop device may be missing. They are
//! created here from the `MAJ:MIN` numbers the kernel reports through `lsblk`.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Cause, ImageError, Result};
use crate::process::{Cmd, Runner};

/// Mode bits of synthesized partition nodes.
const NODE_MODE: libc::mode_t = 0o644;

/// Path of partition `index` (1-based) of `loop_device`, e.g. `/dev/loop0p2`.
pub fn partition_path(loop_device: &Path, index: usize) -> PathBuf {
    let mut path = loop_device.as_os_str().to_os_string();
    path.push(format!("p{}", index));
    PathBuf::from(path)
}

/// Parse the `MAJ:MIN` pair for `index` out of `lsblk --raw --output MAJ:MIN
/// --noheadings` output. Line 0 is the parent device, line N is partition N.
pub fn parse_device_numbers(lsblk_output: &str, index: usize) -> std::result::Result<(u32, u32), String> {
    let lines: Vec<&str> = lsblk_output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let line = lines
        .get(index)
        .ok_or_else(|| format!("no block device entry for partition {} in {:?}", index, lines))?;

    let (major, minor) = line
        .split_once(':')
        .ok_or_else(|| format!("malformed MAJ:MIN entry {:?}", line))?;

    let major = major
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("failed to parse major {:?}: {}", major, e))?;
    let minor = minor
        .trim()
        .parse::<u32>()
        .map_err(|e| format!("failed to parse minor {:?}: {}", minor, e))?;

    Ok((major, minor))
}

/// Loop device operations backed by `losetup`, `lsblk` and `mknod(2)`.
pub struct BlockDevices<'r> {
    runner: &'r dyn Runner,
}

impl<'r> BlockDevices<'r> {
    pub fn new(runner: &'r dyn Runner) -> Self {
        Self { runner }
    }

    /// Bind `image` to a free loop device with partition scanning enabled.
    pub fn attach_loop(&self, image: &Path) -> Result<PathBuf> {
        let out = Cmd::new("losetup")
            .args(["-P", "-f", "--show"])
            .arg_path(image)
            .error_msg("Failed to setup loop device")
            .run(self.runner)
            .map_err(|e| ImageError::Attach {
                image: image.to_path_buf(),
                source: e.into(),
            })?;

        let device = out.stdout.trim();
        if device.is_empty() {
            return Err(ImageError::Attach {
                image: image.to_path_buf(),
                source: Cause::Invalid("losetup printed no device path".into()),
            });
        }

        info!(image = %image.display(), device, "Attached loop device");
        Ok(PathBuf::from(device))
    }

    /// Create a block special file for partition `index` of `loop_device` at
    /// `expected`, unless something already exists there.
    pub fn ensure_partition_node(
        &self,
        loop_device: &Path,
        index: usize,
        expected: &Path,
    ) -> Result<()> {
        if expected.exists() {
            return Ok(());
        }

        let node_err = |source: Cause| ImageError::DeviceNode {
            path: expected.to_path_buf(),
            source,
        };

        let out = Cmd::new("lsblk")
            .args(["--raw", "--output", "MAJ:MIN", "--noheadings"])
            .arg_path(loop_device)
            .error_msg("Failed to list block devices")
            .run(self.runner)
            .map_err(|e| node_err(e.into()))?;

        let (major, minor) =
            parse_device_numbers(&out.stdout, index).map_err(|msg| node_err(Cause::Invalid(msg)))?;

        make_block_node(expected, major, minor).map_err(|e| node_err(e.into()))?;
        debug!(path = %expected.display(), major, minor, "Created partition device node");
        Ok(())
    }

    /// Unbind `loop_device`. A device that no longer exists counts as detached.
    pub fn detach_loop(&self, loop_device: &Path) -> Result<()> {
        if !loop_device.exists() {
            return Ok(());
        }

        Cmd::new("losetup")
            .arg("-d")
            .arg_path(loop_device)
            .error_msg("Failed to detach loop device")
            .run(self.runner)
            .map_err(|e| ImageError::Detach {
                device: loop_device.to_path_buf(),
                source: e.into(),
            })?;

        info!(device = %loop_device.display(), "Detached loop device");
        Ok(())
    }

    /// Delete a partition node if present.
    pub fn remove_partition_node(&self, path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ImageError::DeviceNode {
                path: path.to_path_buf(),
                source: e.into(),
            }),
        }
    }
}

fn make_block_node(path: &Path, major: u32, minor: u32) -> io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: `c_path` is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe {
        let dev = libc::makedev(major, minor);
        libc::mknod(c_path.as_ptr(), libc::S_IFBLK | NODE_MODE, dev)
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    use tempfile::TempDir;

    const LSBLK: &str = "7:0\n7:1\n7:2\n";

    fn is_root() -> bool {
        // SAFETY: geteuid has no preconditions.
        unsafe { libc::geteuid() == 0 }
    }

    #[test]
    fn test_partition_path() {
        assert_eq!(
            partition_path(Path::new("/dev/loop3"), 2),
            PathBuf::from("/dev/loop3p2")
        );
    }

    #[test]
    fn test_parse_device_numbers() {
        assert_eq!(parse_device_numbers(LSBLK, 1).unwrap(), (7, 1));
        assert_eq!(parse_device_numbers(LSBLK, 2).unwrap(), (7, 2));
        assert_eq!(parse_device_numbers(" 259:4 \n259:5\n", 1).unwrap(), (259, 5));
    }

    #[test]
    fn test_parse_device_numbers_errors() {
        assert!(parse_device_numbers(LSBLK, 3).unwrap_err().contains("partition 3"));
        assert!(parse_device_numbers("7:0\nbogus\n", 1).unwrap_err().contains("malformed"));
        assert!(parse_device_numbers("7:0\nx:1\n", 1).unwrap_err().contains("major"));
    }

    #[test]
    fn test_attach_loop_returns_trimmed_device() {
        let host = FakeHost::new();
        host.respond("losetup", "/dev/loop9\n");
        let devices = BlockDevices::new(&host);
        let device = devices.attach_loop(Path::new("/tmp/disk.img")).unwrap();
        assert_eq!(device, PathBuf::from("/dev/loop9"));
        assert_eq!(
            host.calls()[0],
            vec!["losetup", "-P", "-f", "--show", "/tmp/disk.img"]
        );
    }

    #[test]
    fn test_attach_loop_failure() {
        let host = FakeHost::new();
        host.fail_on("losetup", None);
        let devices = BlockDevices::new(&host);
        let err = devices.attach_loop(Path::new("/tmp/disk.img")).unwrap_err();
        assert!(matches!(err, ImageError::Attach { .. }));
    }

    #[test]
    fn test_ensure_partition_node_noop_when_present() {
        let temp = TempDir::new().unwrap();
        let node = temp.path().join("loop7p1");
        fs::write(&node, "").unwrap();

        let host = FakeHost::new();
        let devices = BlockDevices::new(&host);
        devices
            .ensure_partition_node(&temp.path().join("loop7"), 1, &node)
            .unwrap();
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_ensure_partition_node_rejects_bad_listing() {
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new();
        host.respond("lsblk", "7:0\n");
        let devices = BlockDevices::new(&host);
        let err = devices
            .ensure_partition_node(&temp.path().join("loop7"), 1, &temp.path().join("loop7p1"))
            .unwrap_err();
        assert!(matches!(err, ImageError::DeviceNode { .. }));
    }

    #[test]
    fn test_ensure_partition_node_creates_block_devices() {
        if !is_root() {
            return;
        }
        let temp = TempDir::new().unwrap();
        let host = FakeHost::new();
        host.respond("lsblk", LSBLK);
        let devices = BlockDevices::new(&host);
        let loop_device = temp.path().join("loop7");

        for index in [1, 2] {
            let node = partition_path(&loop_device, index);
            devices.ensure_partition_node(&loop_device, index, &node).unwrap();

            let meta = fs::metadata(&node).unwrap();
            assert!(meta.file_type().is_block_device());
            let rdev = meta.rdev();
            assert_eq!(libc::major(rdev), 7);
            assert_eq!(libc::minor(rdev), index as u32);
        }
    }

    #[test]
    fn test_detach_missing_device_is_noop() {
        let host = FakeHost::new();
        let devices = BlockDevices::new(&host);
        devices
            .detach_loop(Path::new("/nonexistent_path_12345/loop0"))
            .unwrap();
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_remove_partition_node_idempotent() {
        let temp = TempDir::new().unwrap();
        let node = temp.path().join("loop7p2");
        fs::write(&node, "").unwrap();

        let host = FakeHost::new();
        let devices = BlockDevices::new(&host);
        devices.remove_partition_node(&node).unwrap();
        assert!(!node.exists());
        devices.remove_partition_node(&node).unwrap();
    }
}
