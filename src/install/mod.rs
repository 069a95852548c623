//! Distribution install strategies.
//!
//! The unpack pipelines are agnostic to how the final root filesystem is
//! produced: they enter the sandbox and hand control to an
//! [`InstallStrategy`], which must leave the installed system in
//! `/rootfs` inside the sandbox.
//!
//! - [`ScriptInstall`] runs a user supplied shell script
//! - [`cdrom::CdromRepoInstall`] bootstraps a yum/dnf system from the
//!   repository staged at `/mnt/cdrom`
//!
//! Any `Fn(&InstallContext) -> anyhow::Result<()>` is a strategy as well.

pub mod cdrom;

pub use cdrom::CdromRepoInstall;

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

use crate::process::{Cmd, Runner};

/// Directory, relative to the sandbox root, where the installed system is
/// expected after a strategy returns.
pub const ROOTFS_DIR: &str = "rootfs";

/// Directory, relative to the sandbox root, holding the staged repository.
pub const STAGED_REPO_DIR: &str = "mnt/cdrom";

/// What a strategy gets to work with while the sandbox is active.
pub struct InstallContext<'a> {
    pub runner: &'a dyn Runner,
    /// Sandbox root as reachable from this process.
    pub root: &'a Path,
    /// Space separated `file://` URIs of staged signing keys; empty if none.
    pub repo_hint: &'a str,
    /// Whether a package repository was staged at [`STAGED_REPO_DIR`].
    pub staged_repo: bool,
}

impl InstallContext<'_> {
    /// Where the installed system must end up.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.root.join(ROOTFS_DIR)
    }

    /// The staged repository, if any.
    pub fn repo_dir(&self) -> Option<PathBuf> {
        self.staged_repo.then(|| self.root.join(STAGED_REPO_DIR))
    }
}

/// Produces the minimal installed system inside an active sandbox.
pub trait InstallStrategy {
    fn install(&self, ctx: &InstallContext<'_>) -> Result<()>;
}

impl<F> InstallStrategy for F
where
    F: Fn(&InstallContext<'_>) -> Result<()>,
{
    fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        self(ctx)
    }
}

/// Runs a shell script inside the sandbox.
///
/// The script sees `REPO_GPG_KEYS` (the repository hint) and, when a
/// repository was staged, `REPO_DIR=/mnt/cdrom`.
#[derive(Debug, Clone)]
pub struct ScriptInstall {
    script: String,
}

impl ScriptInstall {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let script = fs::read_to_string(path)
            .with_context(|| format!("reading install script '{}'", path.display()))?;
        Ok(Self::new(script))
    }

    pub fn script(&self) -> &str {
        &self.script
    }
}

impl InstallStrategy for ScriptInstall {
    fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        run_script(ctx, &self.script)
    }
}

/// Write `script` to the sandbox's `/tmp` and run it with `/bin/sh`.
pub(crate) fn run_script(ctx: &InstallContext<'_>, script: &str) -> Result<()> {
    let tmp = ctx.root.join("tmp");
    fs::create_dir_all(&tmp).with_context(|| format!("creating '{}'", tmp.display()))?;

    let mut file = tempfile::Builder::new()
        .prefix("imager-install-")
        .suffix(".sh")
        .tempfile_in(&tmp)
        .with_context(|| format!("creating install script in '{}'", tmp.display()))?;
    file.write_all(script.as_bytes())
        .context("writing install script")?;
    file.flush().context("writing install script")?;
    fs::set_permissions(file.path(), fs::Permissions::from_mode(0o700))
        .context("making install script executable")?;

    let mut cmd = Cmd::new("/bin/sh")
        .arg_path(file.path())
        .env("REPO_GPG_KEYS", ctx.repo_hint)
        .error_msg("Install script failed");
    if ctx.staged_repo {
        cmd = cmd.env("REPO_DIR", format!("/{}", STAGED_REPO_DIR));
    }

    let out = cmd.run(ctx.runner)?;
    debug!(output = %out.combined(), "Install script finished");
    Ok(())
}
