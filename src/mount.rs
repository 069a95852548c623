//! Mount and copy primitives shared by the disk and unpack code.

use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use crate::error::{Cause, ImageError, Result};
use crate::process::{Cmd, Runner};

/// Mount `source` read-only at `target`.
pub fn mount_ro(runner: &dyn Runner, source: &Path, target: &Path) -> Result<()> {
    mount_with_options(runner, source, target, Some("ro"))
}

/// Mount `source` at `target`, passing `options` through `-o` when given.
pub fn mount_with_options(
    runner: &dyn Runner,
    source: &Path,
    target: &Path,
    options: Option<&str>,
) -> Result<()> {
    let mut cmd = Cmd::new("mount");
    if let Some(options) = options {
        cmd = cmd.args(["-o", options]);
    }
    cmd.arg_path(source)
        .arg_path(target)
        .error_msg(&format!("Failed to mount {}", source.display()))
        .run(runner)
        .map_err(|e| ImageError::Mount {
            source_path: source.to_path_buf(),
            target: target.to_path_buf(),
            source: e.into(),
        })?;
    Ok(())
}

/// Mount a pseudo filesystem of `fstype` at `target`.
pub fn mount_fstype(runner: &dyn Runner, fstype: &str, target: &Path) -> Result<()> {
    Cmd::new("mount")
        .args(["-t", fstype, fstype])
        .arg_path(target)
        .run(runner)
        .map_err(|e| ImageError::Mount {
            source_path: fstype.into(),
            target: target.to_path_buf(),
            source: e.into(),
        })?;
    Ok(())
}

/// Bind mount `source` at `target`.
pub fn bind_mount(runner: &dyn Runner, source: &Path, target: &Path) -> Result<()> {
    Cmd::new("mount")
        .arg("--bind")
        .arg_path(source)
        .arg_path(target)
        .run(runner)
        .map_err(|e| ImageError::Mount {
            source_path: source.to_path_buf(),
            target: target.to_path_buf(),
            source: e.into(),
        })?;
    Ok(())
}

pub fn unmount(runner: &dyn Runner, target: &Path) -> Result<()> {
    Cmd::new("umount")
        .arg_path(target)
        .run(runner)
        .map_err(|e| ImageError::Unmount {
            target: target.to_path_buf(),
            source: e.into(),
        })?;
    Ok(())
}

/// Whether `path` is currently a mountpoint, asked of the live mount table.
pub fn is_mountpoint(runner: &dyn Runner, path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    Cmd::new("mountpoint")
        .arg("-q")
        .arg_path(path)
        .allow_fail()
        .run(runner)
        .map(|out| out.success())
        .unwrap_or(false)
}

/// Mount targets at or below `dir`, read from the live mount table.
pub fn mounts_under(runner: &dyn Runner, dir: &Path) -> std::result::Result<Vec<PathBuf>, Cause> {
    let out = Cmd::new("findmnt")
        .args(["--raw", "--noheadings", "--output", "TARGET"])
        .error_msg("Failed to read mount table")
        .run(runner)?;

    let canonical = fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    Ok(out
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(unescape_mount_target)
        .filter(|target| target.starts_with(dir) || target.starts_with(&canonical))
        .collect())
}

/// Decode the `\xNN` escapes `findmnt --raw` uses for blanks and
/// non-printable bytes.
fn unescape_mount_target(raw: &str) -> PathBuf {
    let bytes = raw.trim_end_matches(['\n', '\r']).as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') && i + 4 <= bytes.len() {
            let byte = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = byte {
                decoded.push(byte);
                i += 4;
                continue;
            }
        }
        decoded.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(decoded))
}

/// Recursively copy `source` into `dest` preserving ownership, permissions,
/// hard links, ACLs, xattrs, sparseness and device files.
///
/// A `source` ending in `/` copies its contents rather than the directory.
pub fn rsync_local(
    runner: &dyn Runner,
    source: &str,
    dest: &Path,
) -> std::result::Result<(), Cause> {
    Cmd::new("rsync")
        .args(["-aHASX", "--devices"])
        .arg(source)
        .arg_path(dest)
        .error_msg(&format!("Failed to copy {}", source))
        .run(runner)?;
    Ok(())
}

/// `path` rendered with a trailing slash, selecting rsync's copy-contents mode.
pub fn contents_of(path: &Path) -> String {
    let rendered = path.display().to_string();
    if rendered.ends_with('/') {
        rendered
    } else {
        format!("{}/", rendered)
    }
}
