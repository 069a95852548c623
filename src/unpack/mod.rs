//! Installer media unpacking.
//!
//! Both pipelines follow the same shape: stack read-only mounts in a scratch
//! area, copy the root image into a writable working root, run an
//! [`InstallStrategy`] inside the sandbox, then merge `rootfs/` from the
//! working root into the target directory. Every mount and scratch directory
//! is registered with a [`Cleanup`] stack and released before the call
//! returns, on success and on failure alike.
//!
//! - [`iso`] - installer ISO with squashfs or `install.img` layouts
//! - [`raw`] - single partition raw disk images, optionally xz compressed
//! - [`layout`] - media layout detection
//! - [`repo`] - package repository staging at `mnt/cdrom`

pub mod iso;
pub mod layout;
pub mod raw;
pub mod repo;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::cleanup::Cleanup;
use crate::error::{Cause, ImageError, Result};
use crate::install::{InstallContext, InstallStrategy, ROOTFS_DIR};
use crate::mount::{contents_of, rsync_local};
use crate::process::Runner;
use crate::sandbox::Sandbox;

use repo::StagedRepo;

/// Runs the unpack pipelines against a scratch area.
///
/// Scratch directories are created as `temp_*` children of `scratch`, so two
/// unpackers with distinct scratch areas never share state.
pub struct Unpacker<'a> {
    runner: &'a dyn Runner,
    sandbox: &'a dyn Sandbox,
    scratch: PathBuf,
    env: Vec<(String, String)>,
}

impl<'a> Unpacker<'a> {
    pub fn new(runner: &'a dyn Runner, sandbox: &'a dyn Sandbox, scratch: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            sandbox,
            scratch: scratch.into(),
            env: Vec::new(),
        }
    }

    /// Environment exported inside the sandbox.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> Self {
        self.env = env;
        self
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    /// Mount `image` read-only and copy its tree into `working_root`.
    ///
    /// When the mounted image itself carries `LiveOS/rootfs.img`, that inner
    /// image is what gets copied. The mounts are released before returning.
    fn copy_root_image(&self, cleanup: &mut Cleanup<'_>, image: &Path, working_root: &Path) -> Result<()> {
        let mut scope = Cleanup::new(self.runner);
        let result = self.copy_root_image_in(&mut scope, image, working_root);
        cleanup.absorb(scope.finish(result))
    }

    fn copy_root_image_in(&self, scope: &mut Cleanup<'_>, image: &Path, working_root: &Path) -> Result<()> {
        let image_dir = scope.scratch_dir(&self.scratch)?;
        scope.mount_ro(image, &image_dir)?;

        let nested = image_dir.join(layout::ROOTFS_IMAGE);
        let source = if nested.is_file() {
            info!(image = %nested.display(), "Found nested root image");
            let nested_dir = scope.scratch_dir(&self.scratch)?;
            scope.mount_ro(&nested, &nested_dir)?;
            nested_dir
        } else {
            image_dir
        };

        info!(from = %source.display(), to = %working_root.display(), "Copying root image");
        rsync_local(self.runner, &contents_of(&source), working_root)
            .map_err(|e| ImageError::unpack(image, "copy root image", e))
    }

    /// Enter the sandbox, run `strategy`, leave again.
    ///
    /// The sandbox is left even when the strategy fails. If leaving fails the
    /// working root is marked busy so cleanup does not delete through live
    /// pseudo-filesystem mounts.
    fn install_in_sandbox(
        &self,
        cleanup: &mut Cleanup<'_>,
        file: &Path,
        working_root: &Path,
        repo: &StagedRepo,
        strategy: &dyn InstallStrategy,
    ) -> Result<()> {
        let session = self.sandbox.enter(working_root, &self.env)?;

        let installed = {
            let ctx = InstallContext {
                runner: self.runner,
                root: session.root(),
                repo_hint: &repo.hint,
                staged_repo: repo.staged,
            };
            info!(root = %working_root.display(), "Running install step");
            strategy.install(&ctx)
        };

        let left = session.leave();
        if left.is_err() {
            cleanup.mark_busy(working_root);
        }

        match (installed, left) {
            (Err(e), left) => {
                if let Err(leave_err) = left {
                    warn!(error = %leave_err, "Leaving sandbox failed after install error");
                }
                Err(ImageError::unpack(file, "install", Cause::Install(e)))
            }
            (Ok(()), left) => left,
        }
    }
}

/// Remove everything inside `target`, keeping the directory itself so a
/// mountpoint stays usable. A missing target is created.
pub fn clear_dir_contents(target: &Path) -> Result<()> {
    if !target.exists() {
        fs::create_dir_all(target).map_err(|e| ImageError::io(target, e))?;
        return Ok(());
    }
    if !target.is_dir() {
        return Err(ImageError::io(
            target,
            std::io::Error::other("target exists and is not a directory"),
        ));
    }
    for entry in fs::read_dir(target).map_err(|e| ImageError::io(target, e))? {
        let path = entry.map_err(|e| ImageError::io(target, e))?.path();
        let removed = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        removed.map_err(|e| ImageError::io(&path, e))?;
    }
    Ok(())
}

/// Copy `working_root/rootfs/` into `target`.
pub fn merge_rootfs(runner: &dyn Runner, file: &Path, working_root: &Path, target: &Path) -> Result<()> {
    let rootfs = working_root.join(ROOTFS_DIR);
    if !rootfs.is_dir() {
        return Err(ImageError::unpack(
            file,
            "merge",
            Cause::Invalid(format!(
                "install step left no root filesystem at {}",
                rootfs.display()
            )),
        ));
    }
    fs::create_dir_all(target).map_err(|e| ImageError::io(target, e))?;
    info!(target = %target.display(), "Merging installed root filesystem");
    rsync_local(runner, &contents_of(&rootfs), target).map_err(|e| ImageError::unpack(file, "merge", e))
}
