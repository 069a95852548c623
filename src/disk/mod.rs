//! Raw GPT disk images for virtual machines.
//!
//! A [`DiskImage`] owns a sparse backing file with a fixed two-partition
//! layout (see [`layout`]): an EFI System Partition and a root partition
//! formatted as ext4 or btrfs. The image is attached to a loop device for
//! formatting and mounting, and detached afterwards.
//!
//! ```text
//! create_backing_file → partition → attach → format_root/format_uefi
//!     → mount_root/mount_uefi → unmount → detach
//! ```
//!
//! Attachment is always judged by live state: the stored loop device only
//! counts while its device node still exists.

pub mod layout;

use std::fmt;
use std::fs::{self, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use tracing::{info, warn};

use crate::block::{partition_path, BlockDevices};
use crate::error::{Cause, ImageError, Result};
use crate::mount;
use crate::process::{Cmd, Runner};

use layout::{
    BTRFS_ROOT_SUBVOLUME, DEFAULT_DISK_SIZE, EFI_LABEL, EFI_PARTITION, EXT4_RESIZE_BYTES,
    ROOT_LABEL, ROOT_PARTITION,
};

/// Filesystem of the root partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootFilesystem {
    #[default]
    Ext4,
    Btrfs,
}

impl fmt::Display for RootFilesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RootFilesystem::Ext4 => write!(f, "ext4"),
            RootFilesystem::Btrfs => write!(f, "btrfs"),
        }
    }
}

impl FromStr for RootFilesystem {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "" | "ext4" => Ok(RootFilesystem::Ext4),
            "btrfs" => Ok(RootFilesystem::Btrfs),
            other => Err(format!("unsupported root filesystem '{}'; expected ext4 or btrfs", other)),
        }
    }
}

/// A VM disk image and its loop device binding.
pub struct DiskImage<'r> {
    runner: &'r dyn Runner,
    devices: BlockDevices<'r>,
    image_file: PathBuf,
    size: u64,
    root_fs: RootFilesystem,
    target_dir: PathBuf,
    loop_device: Option<PathBuf>,
}

impl<'r> DiskImage<'r> {
    /// Describe a disk image at `image_file` whose root partition will be
    /// mounted at `target_dir`. A `size` of 0 selects 4 GiB.
    pub fn new(
        runner: &'r dyn Runner,
        image_file: impl Into<PathBuf>,
        target_dir: impl Into<PathBuf>,
        root_fs: RootFilesystem,
        size: u64,
    ) -> Self {
        Self {
            runner,
            devices: BlockDevices::new(runner),
            image_file: image_file.into(),
            size: if size == 0 { DEFAULT_DISK_SIZE } else { size },
            root_fs,
            target_dir: target_dir.into(),
            loop_device: None,
        }
    }

    pub fn image_file(&self) -> &Path {
        &self.image_file
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn root_filesystem(&self) -> RootFilesystem {
        self.root_fs
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Loop device the image is bound to, if any.
    pub fn loop_device(&self) -> Option<&Path> {
        self.loop_device.as_deref()
    }

    /// Whether the image is bound to a loop device that still exists.
    pub fn is_attached(&self) -> bool {
        self.loop_device.as_deref().is_some_and(Path::exists)
    }

    /// Device path of the root partition while attached.
    pub fn root_device(&self) -> Option<PathBuf> {
        self.loop_device
            .as_deref()
            .map(|dev| partition_path(dev, ROOT_PARTITION))
    }

    /// Device path of the EFI System Partition while attached.
    pub fn uefi_device(&self) -> Option<PathBuf> {
        self.loop_device
            .as_deref()
            .map(|dev| partition_path(dev, EFI_PARTITION))
    }

    /// Create the backing file (mode 0600) and make it sparse at the declared size.
    pub fn create_backing_file(&self) -> Result<()> {
        let io_err = |e| ImageError::io(&self.image_file, e);

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.image_file)
            .map_err(io_err)?;
        file.set_permissions(fs::Permissions::from_mode(0o600))
            .map_err(io_err)?;
        file.set_len(self.size).map_err(io_err)?;

        info!(image = %self.image_file.display(), size = self.size, "Created sparse disk image");
        Ok(())
    }

    /// Wipe any partition table and write the fixed EFI + root GPT layout.
    pub fn partition(&self) -> Result<()> {
        for step in layout::sgdisk_steps() {
            Cmd::new("sgdisk")
                .arg_path(&self.image_file)
                .args(&step)
                .error_msg("Failed to create partitions")
                .run(self.runner)
                .map_err(|e| ImageError::Partition {
                    image: self.image_file.clone(),
                    source: e.into(),
                })?;
        }
        info!(image = %self.image_file.display(), "Partitioned disk image");
        Ok(())
    }

    /// Bind the image to a loop device and make sure both partition nodes
    /// exist. Does nothing while already attached.
    pub fn attach(&mut self) -> Result<()> {
        if self.is_attached() {
            return Ok(());
        }

        let device = self.devices.attach_loop(&self.image_file)?;
        self.loop_device = Some(device.clone());

        for index in [EFI_PARTITION, ROOT_PARTITION] {
            let node = partition_path(&device, index);
            self.devices.ensure_partition_node(&device, index, &node)?;
        }
        Ok(())
    }

    /// Unbind the loop device and remove the partition nodes. Does nothing
    /// when not attached; a loop device that vanished externally only has its
    /// stale partition nodes removed.
    pub fn detach(&mut self) -> Result<()> {
        let Some(device) = self.loop_device.clone() else {
            return Ok(());
        };

        if device.exists() {
            self.devices.detach_loop(&device)?;
        }

        for index in [EFI_PARTITION, ROOT_PARTITION] {
            self.devices
                .remove_partition_node(&partition_path(&device, index))?;
        }

        self.loop_device = None;
        Ok(())
    }

    fn attached_device(&self, index: usize) -> std::result::Result<PathBuf, Cause> {
        match self.loop_device.as_deref() {
            Some(dev) if dev.exists() => Ok(partition_path(dev, index)),
            _ => Err(Cause::NotAttached),
        }
    }

    /// Partition device path, or `err(image_file, NotAttached)`.
    fn device_or<F>(&self, index: usize, err: F) -> Result<PathBuf>
    where
        F: FnOnce(PathBuf, Cause) -> ImageError,
    {
        self.attached_device(index)
            .map_err(|cause| err(self.image_file.clone(), cause))
    }

    /// Create the root filesystem. For btrfs this also creates the `@`
    /// subvolume that every later mount uses as root.
    pub fn format_root(&self) -> Result<()> {
        let device = self.device_or(ROOT_PARTITION, |device, source| ImageError::Format {
            device,
            source,
        })?;
        let format_err = |source: Cause| ImageError::Format {
            device: device.clone(),
            source,
        };

        match self.root_fs {
            RootFilesystem::Ext4 => {
                Cmd::new("mkfs.ext4")
                    .args(["-F", "-b", "4096", "-i", "8192", "-m", "0", "-L", ROOT_LABEL])
                    .args(["-E", &format!("resize={}", EXT4_RESIZE_BYTES)])
                    .arg_path(&device)
                    .error_msg("Failed to create ext4 filesystem")
                    .run(self.runner)
                    .map_err(|e| format_err(e.into()))?;
            }
            RootFilesystem::Btrfs => {
                Cmd::new("mkfs.btrfs")
                    .args(["-f", "-L", ROOT_LABEL])
                    .arg_path(&device)
                    .error_msg("Failed to create btrfs filesystem")
                    .run(self.runner)
                    .map_err(|e| format_err(e.into()))?;

                fs::create_dir_all(&self.target_dir)
                    .map_err(|e| ImageError::io(&self.target_dir, e))?;
                mount::mount_with_options(self.runner, &device, &self.target_dir, None)?;

                let subvolume = self.target_dir.join(BTRFS_ROOT_SUBVOLUME);
                let created = Cmd::new("btrfs")
                    .args(["subvolume", "create"])
                    .arg_path(&subvolume)
                    .error_msg("Failed to create root subvolume")
                    .run(self.runner)
                    .map_err(|e| format_err(e.into()));

                let unmounted = mount::unmount(self.runner, &self.target_dir);
                created?;
                unmounted?;
            }
        }

        info!(device = %device.display(), filesystem = %self.root_fs, "Formatted root partition");
        Ok(())
    }

    /// Create the FAT32 filesystem of the EFI System Partition.
    pub fn format_uefi(&self) -> Result<()> {
        let device = self.device_or(EFI_PARTITION, |device, source| ImageError::Format {
            device,
            source,
        })?;

        Cmd::new("mkfs.vfat")
            .args(["-F", "32", "-n", EFI_LABEL])
            .arg_path(&device)
            .error_msg("Failed to create FAT32 filesystem")
            .run(self.runner)
            .map_err(|e| ImageError::Format {
                device: device.clone(),
                source: e.into(),
            })?;

        info!(device = %device.display(), "Formatted EFI partition");
        Ok(())
    }

    /// Mount the root partition at the target directory.
    pub fn mount_root(&self) -> Result<()> {
        let device = self.device_or(ROOT_PARTITION, |source_path, source| ImageError::Mount {
            source_path,
            target: self.target_dir.clone(),
            source,
        })?;

        fs::create_dir_all(&self.target_dir).map_err(|e| ImageError::io(&self.target_dir, e))?;
        let options = match self.root_fs {
            RootFilesystem::Btrfs => Some("defaults,subvol=/@"),
            RootFilesystem::Ext4 => None,
        };
        mount::mount_with_options(self.runner, &device, &self.target_dir, options)
    }

    /// Mount the EFI System Partition at `<target>/boot/efi`.
    pub fn mount_uefi(&self) -> Result<()> {
        let mountpoint = self.target_dir.join("boot").join("efi");
        let device = self.device_or(EFI_PARTITION, |source_path, source| ImageError::Mount {
            source_path,
            target: mountpoint.clone(),
            source,
        })?;

        fs::create_dir_all(&mountpoint).map_err(|e| ImageError::io(&mountpoint, e))?;
        fs::set_permissions(&mountpoint, fs::Permissions::from_mode(0o755))
            .map_err(|e| ImageError::io(&mountpoint, e))?;
        mount::mount_with_options(self.runner, &device, &mountpoint, None)
    }

    /// Unmount `<target>/boot/efi` and then the root partition, skipping
    /// whichever is not currently mounted.
    pub fn unmount(&self) -> Result<()> {
        let efi = self.target_dir.join("boot").join("efi");
        for path in [efi.as_path(), self.target_dir.as_path()] {
            if mount::is_mountpoint(self.runner, path) {
                mount::unmount(self.runner, path)?;
            }
        }
        Ok(())
    }

    pub fn root_partition_uuid(&self) -> Result<String> {
        self.partition_uuid(ROOT_PARTITION)
    }

    pub fn uefi_partition_uuid(&self) -> Result<String> {
        self.partition_uuid(EFI_PARTITION)
    }

    fn partition_uuid(&self, index: usize) -> Result<String> {
        let device = self.device_or(index, |device, source| ImageError::Query { device, source })?;
        let query_err = |source: Cause| ImageError::Query {
            device: device.clone(),
            source,
        };

        let out = Cmd::new("blkid")
            .args(["-s", "PARTUUID", "-o", "value"])
            .arg_path(&device)
            .error_msg("Failed to query partition UUID")
            .run(self.runner)
            .map_err(|e| query_err(e.into()))?;

        let uuid = out.stdout.trim();
        if uuid.is_empty() {
            return Err(query_err(Cause::Invalid("blkid reported no PARTUUID".into())));
        }
        Ok(uuid.to_string())
    }
}

impl Drop for DiskImage<'_> {
    fn drop(&mut self) {
        if self.loop_device.is_none() {
            return;
        }
        if let Err(e) = self.detach() {
            warn!(image = %self.image_file.display(), error = %e, "Failed to detach disk image on drop");
        }
    }
}
