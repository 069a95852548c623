//! Preflight checks for build validation.
//!
//! Validates that the host has the tools a build definition needs before
//! anything is mounted or attached. This prevents half-finished builds that
//! leave loop devices behind.
//!
//! # Example
//!
//! ```rust
//! use distro_imager::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("sgdisk") {
//!     println!("gdisk not installed");
//! }
//!
//! let tools = &[("rsync", "rsync"), ("xz", "xz")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::config::{BuildConfig, SourceKind};
use crate::disk::RootFilesystem;

/// Check if a command exists in PATH.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Tools every unpack needs.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mountpoint", "util-linux"),
    ("findmnt", "util-linux"),
    ("rsync", "rsync"),
];

/// Extra tools for raw disk image sources.
pub const RAW_SOURCE_TOOLS: &[(&str, &str)] = &[("fdisk", "util-linux"), ("xz", "xz")];

/// Extra tools for producing a VM disk image.
pub const DISK_TOOLS: &[(&str, &str)] = &[
    ("sgdisk", "gdisk"),
    ("losetup", "util-linux"),
    ("lsblk", "util-linux"),
    ("blkid", "util-linux"),
    ("mkfs.vfat", "dosfstools"),
];

/// Tools needed to run the build described by `config`.
pub fn tools_for(config: &BuildConfig) -> Vec<(&'static str, &'static str)> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    if config.source.kind == SourceKind::Raw {
        tools.extend_from_slice(RAW_SOURCE_TOOLS);
    }
    if let Some(disk) = &config.disk {
        tools.extend_from_slice(DISK_TOOLS);
        match disk.filesystem {
            RootFilesystem::Ext4 => tools.push(("mkfs.ext4", "e2fsprogs")),
            RootFilesystem::Btrfs => {
                tools.push(("mkfs.btrfs", "btrfs-progs"));
                tools.push(("btrfs", "btrfs-progs"));
            }
        }
    }
    tools
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` with list of missing tools and their packages
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Check everything `config` needs, including that the process can mount.
pub fn check_build(config: &BuildConfig) -> Result<()> {
    check_required_tools(&tools_for(config))?;
    if !is_root() {
        bail!("building images needs root privileges (mount, chroot and loop devices)");
    }
    if !config.source.path.is_file() {
        bail!("source '{}' does not exist", config.source.path.display());
    }
    Ok(())
}

fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DiskConfig, InstallMethod, SourceConfig};
    use std::path::PathBuf;

    fn config(kind: SourceKind, disk: Option<RootFilesystem>) -> BuildConfig {
        BuildConfig {
            config_path: PathBuf::from("/defs/build.toml"),
            source: SourceConfig {
                kind,
                path: PathBuf::from("/nonexistent_path_12345/media.iso"),
            },
            rootfs: PathBuf::from("/defs/rootfs"),
            scratch: PathBuf::from("/defs/cache"),
            disk: disk.map(|filesystem| DiskConfig {
                image: PathBuf::from("/defs/disk.img"),
                size: 0,
                filesystem,
            }),
            install: InstallMethod::Script(PathBuf::from("/defs/install.sh")),
            env: Vec::new(),
        }
    }

    fn names(tools: &[(&str, &str)]) -> Vec<String> {
        tools.iter().map(|(t, _)| t.to_string()).collect()
    }

    #[test]
    fn test_command_exists() {
        // 'ls' should exist on any Unix system
        assert!(command_exists("ls"));
        assert!(!command_exists("definitely_not_a_real_command_12345"));
    }

    #[test]
    fn test_check_required_tools() {
        assert!(check_required_tools(&[("ls", "coreutils"), ("cat", "coreutils")]).is_ok());

        let err = check_required_tools(&[("nonexistent_command_xyz", "fake-package")]).unwrap_err();
        assert!(err.to_string().contains("nonexistent_command_xyz (install: fake-package)"));
    }

    #[test]
    fn test_tools_for_container_iso() {
        let tools = names(&tools_for(&config(SourceKind::Iso, None)));
        assert_eq!(tools, vec!["mount", "umount", "mountpoint", "findmnt", "rsync"]);
    }

    #[test]
    fn test_tools_for_raw_btrfs_disk() {
        let tools = names(&tools_for(&config(SourceKind::Raw, Some(RootFilesystem::Btrfs))));
        for tool in ["fdisk", "xz", "sgdisk", "losetup", "mkfs.vfat", "mkfs.btrfs", "btrfs"] {
            assert!(tools.contains(&tool.to_string()), "missing {tool}");
        }
        assert!(!tools.contains(&"mkfs.ext4".to_string()));
    }

    #[test]
    fn test_check_build_reports_missing_source() {
        let config = config(SourceKind::Iso, None);
        if check_required_tools(&tools_for(&config)).is_ok() && is_root() {
            let err = check_build(&config).unwrap_err();
            assert!(err.to_string().contains("does not exist"));
        } else {
            assert!(check_build(&config).is_err());
        }
    }
}
