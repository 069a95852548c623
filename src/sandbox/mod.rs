//! Chroot sandbox contract.
//!
//! A [`Sandbox`] prepares a directory tree to act as the process root and
//! hands back a [`SandboxSession`] that undoes the preparation. Install
//! strategies run while a session is active.
//!
//! - [`chroot`] - [`ChrootSandbox`], the real implementation backed by
//!   `chroot(2)` and pseudo-filesystem mounts

pub mod chroot;

pub use chroot::ChrootSandbox;

use std::path::Path;

use crate::error::Result;

/// Enters a sandbox rooted at a directory.
pub trait Sandbox {
    /// Bind the essential pseudo-filesystems into `root`, export `env` and
    /// make `root` the process root.
    fn enter<'a>(
        &'a self,
        root: &Path,
        env: &[(String, String)],
    ) -> Result<Box<dyn SandboxSession + 'a>>;
}

/// An active sandbox. Consumed by [`SandboxSession::leave`], so it can only be
/// left once.
pub trait SandboxSession {
    /// Path under which the sandbox root is reachable from this process while
    /// the session is active (`/` for a real chroot).
    fn root(&self) -> &Path;

    /// Restore the previous process root and unwind every mount made by
    /// `enter`. Best-effort: all steps are attempted and the first failure is
    /// reported.
    fn leave(self: Box<Self>) -> Result<()>;
}
