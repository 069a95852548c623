//! `chroot(2)` backed sandbox.
//!
//! Changing the process root is process-global state, so only one session may
//! be active per process at a time.

use std::env;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{Sandbox, SandboxSession};
use crate::error::{Cause, ImageError, Result};
use crate::mount;
use crate::process::Runner;

const HOST_RESOLV_CONF: &str = "/etc/resolv.conf";
const RESOLV_CONF: &str = "etc/resolv.conf";
const RESOLV_CONF_BACKUP: &str = "etc/resolv.conf.imager-backup";
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

enum PseudoFs {
    /// Fresh instance of a kernel filesystem type.
    Kernel(&'static str),
    /// Bind of the host path of the same name.
    Bind(&'static str),
}

/// Mounted inside the sandbox root, in this order.
const PSEUDO_MOUNTS: &[(&str, PseudoFs)] = &[
    ("proc", PseudoFs::Kernel("proc")),
    ("sys", PseudoFs::Kernel("sysfs")),
    ("dev", PseudoFs::Bind("/dev")),
    ("dev/pts", PseudoFs::Bind("/dev/pts")),
];

/// Sandbox that mounts `proc`, `sys`, `dev` and `dev/pts` into the root,
/// installs the host's DNS configuration and `chroot`s into it.
pub struct ChrootSandbox<'r> {
    runner: &'r dyn Runner,
}

impl<'r> ChrootSandbox<'r> {
    pub fn new(runner: &'r dyn Runner) -> Self {
        Self { runner }
    }
}

impl Sandbox for ChrootSandbox<'_> {
    fn enter<'a>(
        &'a self,
        root: &Path,
        env: &[(String, String)],
    ) -> Result<Box<dyn SandboxSession + 'a>> {
        if !root.is_dir() {
            return Err(ImageError::Sandbox {
                root: root.to_path_buf(),
                source: Cause::Invalid("sandbox root is not a directory".into()),
            });
        }

        let mut session = ChrootSession {
            runner: self.runner,
            root: root.to_path_buf(),
            visible_root: PathBuf::from("/"),
            mounts: Vec::new(),
            resolv: ResolvState::default(),
            saved_env: Vec::new(),
            saved_root: None,
            saved_cwd: None,
            done: false,
        };

        if let Err(e) = session.setup(env) {
            if let Err(unwind_err) = session.unwind() {
                warn!(root = %root.display(), error = %unwind_err, "Failed to unwind partial sandbox");
            }
            session.done = true;
            return Err(e);
        }

        info!(root = %root.display(), "Entered chroot sandbox");
        Ok(Box::new(session))
    }
}

#[derive(Default)]
struct ResolvState {
    installed: bool,
    backed_up: bool,
}

struct ChrootSession<'r> {
    runner: &'r dyn Runner,
    root: PathBuf,
    visible_root: PathBuf,
    mounts: Vec<PathBuf>,
    resolv: ResolvState,
    saved_env: Vec<(String, Option<OsString>)>,
    saved_root: Option<File>,
    saved_cwd: Option<PathBuf>,
    done: bool,
}

impl ChrootSession<'_> {
    fn sandbox_err(&self, source: impl Into<Cause>) -> ImageError {
        ImageError::Sandbox {
            root: self.root.clone(),
            source: source.into(),
        }
    }

    fn setup(&mut self, env: &[(String, String)]) -> Result<()> {
        for (dir, fs_kind) in PSEUDO_MOUNTS {
            let target = self.root.join(dir);
            fs::create_dir_all(&target).map_err(|e| ImageError::io(&target, e))?;
            match fs_kind {
                PseudoFs::Kernel(fstype) => mount::mount_fstype(self.runner, fstype, &target)?,
                PseudoFs::Bind(source) => mount::bind_mount(self.runner, Path::new(source), &target)?,
            }
            self.mounts.push(target);
        }

        self.install_resolv_conf()?;

        let mut vars = env.to_vec();
        if !vars.iter().any(|(key, _)| key == "PATH") {
            vars.push(("PATH".to_string(), DEFAULT_PATH.to_string()));
        }
        for (key, value) in vars {
            self.saved_env.push((key.clone(), env::var_os(&key)));
            env::set_var(&key, value);
        }

        self.saved_cwd = env::current_dir().ok();
        let saved_root = File::open("/").map_err(|e| self.sandbox_err(e))?;
        self.saved_root = Some(saved_root);

        std::os::unix::fs::chroot(&self.root).map_err(|e| self.sandbox_err(e))?;
        env::set_current_dir("/").map_err(|e| self.sandbox_err(e))?;
        Ok(())
    }

    fn install_resolv_conf(&mut self) -> Result<()> {
        let host = Path::new(HOST_RESOLV_CONF);
        if !host.exists() {
            return Ok(());
        }
        let target = self.root.join(RESOLV_CONF);
        let backup = self.root.join(RESOLV_CONF_BACKUP);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| ImageError::io(parent, e))?;
        }
        if target.exists() || target.is_symlink() {
            fs::rename(&target, &backup).map_err(|e| ImageError::io(&target, e))?;
            self.resolv.backed_up = true;
        }
        fs::copy(host, &target).map_err(|e| ImageError::io(&target, e))?;
        self.resolv.installed = true;
        Ok(())
    }

    fn leave_root(&mut self) -> io::Result<()> {
        let Some(saved_root) = self.saved_root.take() else {
            return Ok(());
        };
        // SAFETY: the descriptor is owned by `saved_root` and open for the call.
        let rc = unsafe { libc::fchdir(saved_root.as_raw_fd()) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        std::os::unix::fs::chroot(".")?;
        if let Some(cwd) = self.saved_cwd.take() {
            env::set_current_dir(cwd)?;
        }
        Ok(())
    }

    /// Undo `setup` in reverse. Stops early only when the old root cannot be
    /// restored, since every later path would resolve inside the sandbox.
    fn unwind(&mut self) -> Result<()> {
        if let Err(e) = self.leave_root() {
            return Err(self.sandbox_err(e));
        }

        let mut first_err: Option<ImageError> = None;

        for (key, value) in self.saved_env.drain(..).rev() {
            match value {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }

        let target = self.root.join(RESOLV_CONF);
        if self.resolv.installed {
            if let Err(e) = fs::remove_file(&target) {
                first_err.get_or_insert(ImageError::io(&target, e));
            }
            self.resolv.installed = false;
        }
        if self.resolv.backed_up {
            let backup = self.root.join(RESOLV_CONF_BACKUP);
            if let Err(e) = fs::rename(&backup, &target) {
                first_err.get_or_insert(ImageError::io(&backup, e));
            }
            self.resolv.backed_up = false;
        }

        while let Some(target) = self.mounts.pop() {
            if let Err(e) = mount::unmount(self.runner, &target) {
                warn!(target = %target.display(), error = %e, "Failed to unmount sandbox mount");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl SandboxSession for ChrootSession<'_> {
    fn root(&self) -> &Path {
        &self.visible_root
    }

    fn leave(mut self: Box<Self>) -> Result<()> {
        self.done = true;
        let result = self.unwind();
        debug!(root = %self.root.display(), ok = result.is_ok(), "Left chroot sandbox");
        result
    }
}

impl Drop for ChrootSession<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Err(e) = self.unwind() {
            warn!(root = %self.root.display(), error = %e, "Failed to leave sandbox on drop");
        }
    }
}
