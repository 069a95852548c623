//! Raw disk image unpacking.
//!
//! A raw image is expected to hold a single partition. It is loop mounted at
//! the partition's byte offset, which avoids binding a full loop device with
//! partition scanning.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use super::repo::StagedRepo;
use super::{clear_dir_contents, merge_rootfs, Unpacker};
use crate::cleanup::{Cleanup, Outcome};
use crate::disk::layout::SECTOR_SIZE;
use crate::error::{Cause, ImageError, Result};
use crate::install::InstallStrategy;
use crate::mount::{contents_of, rsync_local};
use crate::process::{Cmd, Runner};

/// Suffix of xz compressed images.
pub const XZ_SUFFIX: &str = ".xz";

/// Byte offset of the partition reported on the last data row of
/// `fdisk -l -o Start` output.
pub fn parse_partition_offset(fdisk_output: &str) -> std::result::Result<u64, String> {
    let last = fdisk_output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .ok_or_else(|| "empty partition table listing".to_string())?;
    let start: u64 = last
        .parse()
        .map_err(|_| format!("unexpected start sector '{}'", last))?;
    start
        .checked_mul(SECTOR_SIZE)
        .ok_or_else(|| format!("start sector {} out of range", start))
}

/// Query the partition offset of `image`.
pub fn partition_offset(runner: &dyn Runner, image: &Path) -> Result<u64> {
    let out = Cmd::new("fdisk")
        .args(["-l", "-o", "Start"])
        .arg_path(image)
        .error_msg("Failed to read partition table")
        .run(runner)
        .map_err(|e| ImageError::unpack(image, "partition offset", e))?;
    parse_partition_offset(&out.stdout)
        .map_err(|msg| ImageError::unpack(image, "partition offset", Cause::Invalid(msg)))
}

/// Decompress an `.xz` image next to itself and return the raw path.
///
/// The compressed file is only removed after `xz` succeeded and the raw file
/// is present. Uncompressed images are returned unchanged.
pub fn decompress(runner: &dyn Runner, image: &Path) -> Result<PathBuf> {
    let Some(raw) = image
        .to_str()
        .and_then(|s| s.strip_suffix(XZ_SUFFIX))
        .map(PathBuf::from)
    else {
        return Ok(image.to_path_buf());
    };

    info!(image = %image.display(), "Decompressing raw image");
    Cmd::new("xz")
        .args(["--decompress", "--keep", "--force"])
        .arg_path(image)
        .error_msg("Failed to decompress image")
        .run(runner)
        .map_err(|e| ImageError::unpack(image, "decompress", e))?;

    if !raw.is_file() {
        return Err(ImageError::unpack(
            image,
            "decompress",
            Cause::Invalid(format!("{} missing after decompression", raw.display())),
        ));
    }
    fs::remove_file(image).map_err(|e| ImageError::io(image, e))?;
    Ok(raw)
}

impl Unpacker<'_> {
    /// Unpack a raw disk `image` into `target`. The strategy gets no
    /// repository; raw images are self-contained.
    ///
    /// Existing content of `target` is removed before the merge, the same as
    /// for installer ISOs, so the result never mixes with an earlier build.
    pub fn unpack_raw(&self, image: &Path, target: &Path, strategy: &dyn InstallStrategy) -> Outcome<()> {
        let mut cleanup = Cleanup::new(self.runner);
        let result = self.unpack_raw_in(&mut cleanup, image, target, strategy);
        cleanup.finish(result)
    }

    fn unpack_raw_in(
        &self,
        cleanup: &mut Cleanup<'_>,
        image: &Path,
        target: &Path,
        strategy: &dyn InstallStrategy,
    ) -> Result<()> {
        let raw = decompress(self.runner, image)?;
        let offset = partition_offset(self.runner, &raw)?;

        let mount_dir = cleanup.scratch_dir(&self.scratch)?;
        let working_root = cleanup.scratch_dir(&self.scratch)?;

        info!(image = %raw.display(), offset, "Mounting raw image partition");
        cleanup.mount_with_options(&raw, &mount_dir, &format!("ro,loop,offset={}", offset))?;
        rsync_local(self.runner, &contents_of(&mount_dir), &working_root)
            .map_err(|e| ImageError::unpack(&raw, "copy root image", e))?;

        clear_dir_contents(target)?;
        self.install_in_sandbox(cleanup, &raw, &working_root, &StagedRepo::none(), strategy)?;
        merge_rootfs(self.runner, &raw, &working_root, target)
    }
}
