//! Fixed GPT layout of produced disk images.

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Default disk image size (4 GiB, sparse).
pub const DEFAULT_DISK_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// EFI System Partition size in MiB.
pub const EFI_SIZE_MB: u64 = 100;

/// Partition index of the EFI System Partition.
pub const EFI_PARTITION: usize = 1;

/// Partition index of the root filesystem.
pub const ROOT_PARTITION: usize = 2;

/// GPT type code of the EFI System Partition.
pub const EFI_TYPE_CODE: &str = "EF00";

/// GPT type code of a Linux filesystem partition.
pub const LINUX_TYPE_CODE: &str = "8300";

/// Filesystem label of the root partition.
pub const ROOT_LABEL: &str = "rootfs";

/// Filesystem label of the EFI System Partition.
pub const EFI_LABEL: &str = "UEFI";

/// Reserved ext4 growth for online resize (512 MiB).
pub const EXT4_RESIZE_BYTES: u64 = 512 * 1024 * 1024;

/// Name of the btrfs subvolume holding the root filesystem.
pub const BTRFS_ROOT_SUBVOLUME: &str = "@";

/// The `sgdisk` invocations that produce the layout, in order. The first
/// wipes any existing partition table.
pub fn sgdisk_steps() -> Vec<Vec<String>> {
    vec![
        vec!["--zap-all".to_string()],
        vec![
            format!("--new={}::+{}M", EFI_PARTITION, EFI_SIZE_MB),
            format!("--typecode={}:{}", EFI_PARTITION, EFI_TYPE_CODE),
        ],
        vec![
            format!("--new={}::", ROOT_PARTITION),
            format!("--typecode={}:{}", ROOT_PARTITION, LINUX_TYPE_CODE),
        ],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(SECTOR_SIZE, 512);
        assert_eq!(DEFAULT_DISK_SIZE, 4_294_967_296);
        assert_eq!(EXT4_RESIZE_BYTES, 536_870_912);
    }

    #[test]
    fn test_sgdisk_steps_describe_two_partitions() {
        let steps = sgdisk_steps();
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], vec!["--zap-all"]);
        assert_eq!(steps[1], vec!["--new=1::+100M", "--typecode=1:EF00"]);
        assert_eq!(steps[2], vec!["--new=2::", "--typecode=2:8300"]);
    }
}
