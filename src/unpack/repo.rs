//! Package repository staging.
//!
//! Installer media that carries `Packages/` and `repodata/` (at the top level
//! or under `BaseOS/`) gets a copy of both, plus any `RPM-GPG-KEY-*` files,
//! under `mnt/cdrom` of the working root.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Cause, ImageError, Result};
use crate::install::STAGED_REPO_DIR;
use crate::mount::rsync_local;
use crate::process::Runner;

pub const PACKAGES_DIR: &str = "Packages";
pub const REPODATA_DIR: &str = "repodata";
pub const BASEOS_DIR: &str = "BaseOS";
pub const GPG_KEY_PREFIX: &str = "RPM-GPG-KEY-";

/// Repository directories found on the media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLayout {
    pub packages: PathBuf,
    pub repodata: PathBuf,
}

/// Result of staging, as handed to the install strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedRepo {
    /// Space separated `file:///mnt/cdrom/<key>` URIs.
    pub hint: String,
    pub staged: bool,
}

impl StagedRepo {
    pub fn none() -> Self {
        Self::default()
    }
}

fn locate(media_root: &Path, name: &str) -> PathBuf {
    let top = media_root.join(name);
    if top.exists() {
        top
    } else {
        media_root.join(BASEOS_DIR).join(name)
    }
}

/// Find `Packages` and `repodata`, each falling back to `BaseOS/` on its own.
pub fn find_repository(media_root: &Path) -> Option<RepoLayout> {
    let packages = locate(media_root, PACKAGES_DIR);
    let repodata = locate(media_root, REPODATA_DIR);
    (packages.is_dir() && repodata.is_dir()).then_some(RepoLayout { packages, repodata })
}

/// Signing keys at the media root, sorted by name.
pub fn find_gpg_keys(media_root: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!(
        "{}/{}*",
        glob::Pattern::escape(&media_root.display().to_string()),
        GPG_KEY_PREFIX
    );
    let entries = glob::glob(&pattern).map_err(|e| {
        ImageError::unpack(media_root, "stage repository", Cause::Invalid(e.to_string()))
    })?;

    let mut keys = Vec::new();
    for entry in entries {
        let path = entry.map_err(|e| ImageError::io(media_root, e.into_error()))?;
        if path.is_file() {
            keys.push(path);
        }
    }
    keys.sort();
    Ok(keys)
}

/// Copy the media repository into `working_root/mnt/cdrom`.
///
/// Media without a recognisable repository is not an error: nothing is
/// staged and the hint is empty.
pub fn stage(runner: &dyn Runner, media_root: &Path, working_root: &Path) -> Result<StagedRepo> {
    let Some(layout) = find_repository(media_root) else {
        info!(media = %media_root.display(), "No package repository on media");
        return Ok(StagedRepo::none());
    };

    let dest = working_root.join(STAGED_REPO_DIR);
    fs::create_dir_all(&dest).map_err(|e| ImageError::io(&dest, e))?;

    info!(
        packages = %layout.packages.display(),
        repodata = %layout.repodata.display(),
        "Staging package repository"
    );
    for dir in [&layout.packages, &layout.repodata] {
        rsync_local(runner, &dir.display().to_string(), &dest)
            .map_err(|e| ImageError::unpack(dir, "stage repository", e))?;
    }

    let mut uris = Vec::new();
    for key in find_gpg_keys(media_root)? {
        rsync_local(runner, &key.display().to_string(), &dest)
            .map_err(|e| ImageError::unpack(&key, "stage repository", e))?;
        if let Some(name) = key.file_name() {
            uris.push(format!("file:///{}/{}", STAGED_REPO_DIR, name.to_string_lossy()));
        }
    }
    debug!(keys = uris.len(), "Staged signing keys");

    Ok(StagedRepo {
        hint: uris.join(" "),
        staged: true,
    })
}
