//! Ordered teardown of mounts and scratch directories.
//!
//! Each acquired resource pushes an undo action onto a [`Cleanup`] stack.
//! [`Cleanup::unwind`] runs the actions in reverse on every exit path and
//! collects failures as [`CleanupWarning`]s instead of replacing the primary
//! error.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ImageError, Result};
use crate::mount;
use crate::process::Runner;

/// A single undo action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Undo {
    Unmount(PathBuf),
    RemoveDir(PathBuf),
}

/// Non-fatal failure encountered while tearing down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupWarning {
    pub action: Undo,
    pub message: String,
}

impl fmt::Display for CleanupWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Undo::Unmount(path) => write!(f, "unmount {}: {}", path.display(), self.message),
            Undo::RemoveDir(path) => write!(f, "remove {}: {}", path.display(), self.message),
        }
    }
}

/// Primary result of an operation plus the warnings raised while cleaning up
/// after it.
#[must_use]
#[derive(Debug)]
pub struct Outcome<T> {
    pub result: Result<T>,
    pub warnings: Vec<CleanupWarning>,
}

impl<T> Outcome<T> {
    /// Log the warnings and return the primary result.
    pub fn into_result(self) -> Result<T> {
        for warning in &self.warnings {
            warn!(%warning, "Cleanup step failed");
        }
        self.result
    }
}

/// Stack of undo actions, unwound in reverse order of acquisition.
pub struct Cleanup<'r> {
    runner: &'r dyn Runner,
    actions: Vec<Undo>,
    busy: Vec<PathBuf>,
    carried: Vec<CleanupWarning>,
    unwound: bool,
}

impl<'r> Cleanup<'r> {
    pub fn new(runner: &'r dyn Runner) -> Self {
        Self {
            runner,
            actions: Vec::new(),
            busy: Vec::new(),
            carried: Vec::new(),
            unwound: false,
        }
    }

    pub fn push(&mut self, action: Undo) {
        self.actions.push(action);
    }

    /// Pending actions, oldest first.
    pub fn actions(&self) -> &[Undo] {
        &self.actions
    }

    /// Create a fresh `temp_*` directory under `parent` and register its
    /// removal.
    pub fn scratch_dir(&mut self, parent: &Path) -> Result<PathBuf> {
        fs::create_dir_all(parent).map_err(|e| ImageError::io(parent, e))?;
        let dir = tempfile::Builder::new()
            .prefix("temp_")
            .tempdir_in(parent)
            .map_err(|e| ImageError::io(parent, e))?
            .keep();
        self.push(Undo::RemoveDir(dir.clone()));
        Ok(dir)
    }

    /// Mount `source` read-only at `target` and register the unmount.
    pub fn mount_ro(&mut self, source: &Path, target: &Path) -> Result<()> {
        self.mount_with_options(source, target, "ro")
    }

    /// Mount with explicit options and register the unmount.
    pub fn mount_with_options(&mut self, source: &Path, target: &Path, options: &str) -> Result<()> {
        mount::mount_with_options(self.runner, source, target, Some(options))?;
        self.push(Undo::Unmount(target.to_path_buf()));
        Ok(())
    }

    /// Never recursively delete `path` or anything containing it; it may still
    /// have live mounts underneath.
    pub fn mark_busy(&mut self, path: &Path) {
        self.busy.push(path.to_path_buf());
    }

    /// Take over the warnings of a finished nested scope and return its
    /// primary result.
    pub fn absorb<T>(&mut self, outcome: Outcome<T>) -> Result<T> {
        self.carried.extend(outcome.warnings);
        outcome.result
    }

    fn is_busy(&self, dir: &Path) -> bool {
        self.busy.iter().any(|busy| busy.starts_with(dir))
    }

    /// Remove a scratch directory unless something is still mounted at or
    /// below it, judged by the live mount table. An unreadable mount table
    /// also leaves the directory in place.
    fn remove_dir(&mut self, dir: &Path) -> std::result::Result<(), String> {
        if !dir.exists() {
            return Ok(());
        }
        if self.is_busy(dir) {
            return Err("still holds a mount, left in place".to_string());
        }
        match mount::mounts_under(self.runner, dir) {
            Ok(live) if live.is_empty() => fs::remove_dir_all(dir).map_err(|e| e.to_string()),
            Ok(live) => {
                let message = format!("live mount at {}, left in place", live[0].display());
                self.busy.extend(live);
                Err(message)
            }
            Err(e) => Err(format!("mount table unavailable ({}), left in place", e)),
        }
    }

    /// Run every pending action in reverse order.
    pub fn unwind(mut self) -> Vec<CleanupWarning> {
        self.unwind_inner()
    }

    /// Finish an operation: unwind, then pair the result with the warnings.
    pub fn finish<T>(self, result: Result<T>) -> Outcome<T> {
        let warnings = self.unwind();
        Outcome { result, warnings }
    }

    fn unwind_inner(&mut self) -> Vec<CleanupWarning> {
        self.unwound = true;
        let mut warnings = std::mem::take(&mut self.carried);

        while let Some(action) = self.actions.pop() {
            let outcome = match &action {
                Undo::Unmount(target) => match mount::unmount(self.runner, target) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        self.busy.push(target.clone());
                        Err(e.to_string())
                    }
                },
                Undo::RemoveDir(dir) => self.remove_dir(dir),
            };

            match outcome {
                Ok(()) => debug!(?action, "Cleanup step done"),
                Err(message) => warnings.push(CleanupWarning { action, message }),
            }
        }

        warnings
    }
}

impl Drop for Cleanup<'_> {
    fn drop(&mut self) {
        if self.unwound {
            return;
        }
        for warning in self.unwind_inner() {
            warn!(%warning, "Cleanup step failed");
        }
    }
}
