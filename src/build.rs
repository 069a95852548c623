//! Top-level build driver.
//!
//! A container build unpacks straight into the rootfs directory. A VM build
//! first prepares a [`DiskImage`], mounts its root partition at the rootfs
//! directory and unpacks into that; the image is unmounted and detached again
//! whether or not the unpack succeeded.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::cleanup::{CleanupWarning, Outcome};
use crate::config::{BuildConfig, DiskConfig, SourceKind};
use crate::disk::DiskImage;
use crate::install::InstallStrategy;
use crate::process::Runner;
use crate::sandbox::Sandbox;
use crate::unpack::Unpacker;

/// Partition identifiers of a produced disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskReport {
    pub image: PathBuf,
    pub root_partuuid: String,
    pub efi_partuuid: String,
}

#[derive(Debug)]
pub struct BuildReport {
    pub rootfs: PathBuf,
    pub disk: Option<DiskReport>,
    /// Non-fatal cleanup failures; leftovers may need manual removal.
    pub warnings: Vec<CleanupWarning>,
}

/// Run the build described by `config` with its configured install strategy.
pub fn run(config: &BuildConfig, runner: &dyn Runner, sandbox: &dyn Sandbox) -> Result<BuildReport> {
    let strategy = config.strategy()?;
    run_with_strategy(config, runner, sandbox, strategy.as_ref())
}

pub fn run_with_strategy(
    config: &BuildConfig,
    runner: &dyn Runner,
    sandbox: &dyn Sandbox,
    strategy: &dyn InstallStrategy,
) -> Result<BuildReport> {
    let unpacker = Unpacker::new(runner, sandbox, &config.scratch).with_env(config.env.clone());

    match &config.disk {
        None => {
            let warnings = unpack(config, &unpacker, strategy)?;
            Ok(BuildReport {
                rootfs: config.rootfs.clone(),
                disk: None,
                warnings,
            })
        }
        Some(disk) => build_disk(config, disk, runner, &unpacker, strategy),
    }
}

fn unpack(
    config: &BuildConfig,
    unpacker: &Unpacker<'_>,
    strategy: &dyn InstallStrategy,
) -> Result<Vec<CleanupWarning>> {
    let source = &config.source.path;
    info!(source = %source.display(), rootfs = %config.rootfs.display(), "Unpacking");

    let Outcome { result, warnings } = match config.source.kind {
        SourceKind::Iso => unpacker.unpack_iso(source, &config.rootfs, strategy),
        SourceKind::Raw => unpacker.unpack_raw(source, &config.rootfs, strategy),
    };
    for warning in &warnings {
        warn!(%warning, "Cleanup step failed");
    }
    result.with_context(|| format!("unpacking '{}'", source.display()))?;
    Ok(warnings)
}

fn build_disk(
    config: &BuildConfig,
    disk_config: &DiskConfig,
    runner: &dyn Runner,
    unpacker: &Unpacker<'_>,
    strategy: &dyn InstallStrategy,
) -> Result<BuildReport> {
    let mut disk = DiskImage::new(
        runner,
        &disk_config.image,
        &config.rootfs,
        disk_config.filesystem,
        disk_config.size,
    );

    info!(image = %disk_config.image.display(), size = disk.size(), "Creating disk image");
    disk.create_backing_file()?;
    disk.partition()?;
    disk.attach()?;

    let populated = populate_disk(config, &disk, unpacker, strategy);

    let unmounted = disk.unmount();
    let detached = disk.detach();

    let (report, warnings) = populated?;
    unmounted.context("unmounting disk image")?;
    detached.context("detaching disk image")?;

    info!(
        image = %report.image.display(),
        root = %report.root_partuuid,
        efi = %report.efi_partuuid,
        "Disk image ready"
    );
    Ok(BuildReport {
        rootfs: config.rootfs.clone(),
        disk: Some(report),
        warnings,
    })
}

fn populate_disk(
    config: &BuildConfig,
    disk: &DiskImage<'_>,
    unpacker: &Unpacker<'_>,
    strategy: &dyn InstallStrategy,
) -> Result<(DiskReport, Vec<CleanupWarning>)> {
    disk.format_root()?;
    disk.format_uefi()?;
    disk.mount_root()?;

    let warnings = unpack(config, unpacker, strategy)?;
    disk.mount_uefi()?;

    let report = DiskReport {
        image: disk.image_file().to_path_buf(),
        root_partuuid: disk.root_partition_uuid()?,
        efi_partuuid: disk.uefi_partition_uuid()?,
    };
    Ok((report, warnings))
}
