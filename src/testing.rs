//! Test doubles for the host: a recording [`Runner`] that simulates mounts and
//! copies, and a [`Sandbox`] that records enter/leave without changing root.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Cause, ImageError, Result};
use crate::process::{Cmd, CommandOutput, Runner};
use crate::sandbox::{Sandbox, SandboxSession};

struct Mounted {
    target: PathBuf,
    populated: bool,
}

/// Fake host. Image files are plain files whose content is a marker string;
/// mounting one materialises the fixture tree registered for that marker.
#[derive(Default)]
pub(crate) struct FakeHost {
    calls: RefCell<Vec<Vec<String>>>,
    images: RefCell<HashMap<String, PathBuf>>,
    mounted: RefCell<Vec<Mounted>>,
    responses: RefCell<HashMap<String, String>>,
    failures: RefCell<Vec<(String, Option<String>)>>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Mounting a file containing `marker` exposes the contents of `tree`.
    pub(crate) fn register_image(&self, marker: &str, tree: &Path) {
        self.images
            .borrow_mut()
            .insert(marker.to_string(), tree.to_path_buf());
    }

    /// Answer every invocation of `program` with `stdout`.
    pub(crate) fn respond(&self, program: &str, stdout: &str) {
        self.responses
            .borrow_mut()
            .insert(program.to_string(), stdout.to_string());
    }

    /// Fail invocations of `program`, optionally only those mentioning `needle`.
    pub(crate) fn fail_on(&self, program: &str, needle: Option<&str>) {
        self.failures
            .borrow_mut()
            .push((program.to_string(), needle.map(str::to_string)));
    }

    pub(crate) fn calls(&self) -> Vec<Vec<String>> {
        self.calls.borrow().clone()
    }

    pub(crate) fn calls_for(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .borrow()
            .iter()
            .filter(|call| call[0] == program)
            .cloned()
            .collect()
    }

    pub(crate) fn mounted(&self) -> Vec<PathBuf> {
        self.mounted
            .borrow()
            .iter()
            .map(|m| m.target.clone())
            .collect()
    }

    fn should_fail(&self, program: &str, args: &[String]) -> bool {
        self.failures.borrow().iter().any(|(p, needle)| {
            p == program
                && match needle {
                    Some(needle) => args.iter().any(|a| a.contains(needle.as_str())),
                    None => true,
                }
        })
    }

    fn mount(&self, args: &[String]) -> io::Result<CommandOutput> {
        let mut positional = Vec::new();
        let mut special = false;
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-o" => {
                    iter.next();
                }
                "-t" => {
                    special = true;
                    iter.next();
                }
                "--bind" => special = true,
                other => positional.push(other.to_string()),
            }
        }
        if positional.len() != 2 {
            return Ok(CommandOutput::failed(1, "mount: bad usage"));
        }
        let source = Path::new(&positional[0]);
        let target = PathBuf::from(&positional[1]);
        if !target.is_dir() {
            return Ok(CommandOutput::failed(32, "mount: mount point does not exist"));
        }

        let mut populated = false;
        if !special {
            if !source.is_file() {
                return Ok(CommandOutput::failed(32, "mount: special device does not exist"));
            }
            let marker = fs::read_to_string(source)?;
            let marker = marker.trim();
            if !marker.is_empty() {
                let Some(tree) = self.images.borrow().get(marker).cloned() else {
                    return Ok(CommandOutput::failed(32, "mount: wrong fs type"));
                };
                copy_contents(&tree, &target)?;
                populated = true;
            }
        }

        self.mounted.borrow_mut().push(Mounted { target, populated });
        Ok(CommandOutput::ok(""))
    }

    fn umount(&self, args: &[String]) -> io::Result<CommandOutput> {
        let Some(target) = args.last().map(PathBuf::from) else {
            return Ok(CommandOutput::failed(1, "umount: bad usage"));
        };
        let mut mounted = self.mounted.borrow_mut();
        let Some(index) = mounted.iter().rposition(|m| m.target == target) else {
            return Ok(CommandOutput::failed(32, "umount: not mounted"));
        };
        let entry = mounted.remove(index);
        if entry.populated {
            for child in fs::read_dir(&entry.target)? {
                let path = child?.path();
                if path.is_dir() && !path.is_symlink() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }
        Ok(CommandOutput::ok(""))
    }

    fn rsync(&self, args: &[String]) -> io::Result<CommandOutput> {
        let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();
        if positional.len() != 2 {
            return Ok(CommandOutput::failed(1, "rsync: bad usage"));
        }
        let source = positional[0];
        let dest = Path::new(positional[1]);
        if source.ends_with('/') {
            let source = Path::new(source.trim_end_matches('/'));
            if !source.is_dir() {
                return Ok(CommandOutput::failed(23, "rsync: change_dir failed"));
            }
            copy_contents(source, dest)?;
        } else {
            let source = Path::new(source);
            let Some(name) = source.file_name() else {
                return Ok(CommandOutput::failed(1, "rsync: bad source"));
            };
            if source.is_dir() {
                copy_contents(source, &dest.join(name))?;
            } else if source.is_file() {
                fs::create_dir_all(dest)?;
                fs::copy(source, dest.join(name))?;
            } else {
                return Ok(CommandOutput::failed(23, "rsync: link_stat failed"));
            }
        }
        Ok(CommandOutput::ok(""))
    }

    fn xz(&self, args: &[String]) -> io::Result<CommandOutput> {
        let Some(file) = args.iter().find(|a| !a.starts_with('-')) else {
            return Ok(CommandOutput::failed(1, "xz: no file"));
        };
        let Some(raw) = file.strip_suffix(".xz") else {
            return Ok(CommandOutput::failed(1, "xz: unknown suffix"));
        };
        fs::copy(file, raw)?;
        if !args.iter().any(|a| a == "--keep") {
            fs::remove_file(file)?;
        }
        Ok(CommandOutput::ok(""))
    }
}

impl Runner for FakeHost {
    fn execute(&self, cmd: &Cmd) -> io::Result<CommandOutput> {
        let args = cmd.args_lossy();
        let mut call = vec![cmd.program().to_string()];
        call.extend(args.iter().cloned());
        self.calls.borrow_mut().push(call);

        if self.should_fail(cmd.program(), &args) {
            return Ok(CommandOutput::failed(1, format!("{}: simulated failure", cmd.program())));
        }

        match cmd.program() {
            "mount" => self.mount(&args),
            "umount" => self.umount(&args),
            "rsync" => self.rsync(&args),
            "xz" => self.xz(&args),
            "findmnt" if !self.responses.borrow().contains_key("findmnt") => {
                let table: String = self
                    .mounted
                    .borrow()
                    .iter()
                    .map(|m| format!("{}\n", m.target.display()))
                    .collect();
                Ok(CommandOutput::ok(table))
            }
            "mountpoint" => {
                let path = args.last().map(PathBuf::from).unwrap_or_default();
                if self.mounted.borrow().iter().any(|m| m.target == path) {
                    Ok(CommandOutput::ok(""))
                } else {
                    Ok(CommandOutput::failed(32, ""))
                }
            }
            program => Ok(CommandOutput::ok(
                self.responses
                    .borrow()
                    .get(program)
                    .cloned()
                    .unwrap_or_default(),
            )),
        }
    }
}

/// Copy the contents of `source` into `dest`, creating `dest` if needed.
pub(crate) fn copy_contents(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        let Ok(rel) = entry.path().strip_prefix(source) else {
            continue;
        };
        let target = dest.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            let _ = fs::remove_file(&target);
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Write an image file that the fake host will mount as `marker`'s fixture.
pub(crate) fn write_image(path: &Path, marker: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, marker).unwrap();
}

/// Sandbox that records calls and exposes the root path unchanged.
#[derive(Default)]
pub(crate) struct FakeSandbox {
    pub(crate) entered: Cell<usize>,
    pub(crate) left: Cell<usize>,
    pub(crate) fail_enter: bool,
    pub(crate) fail_leave: bool,
    pub(crate) last_env: RefCell<Vec<(String, String)>>,
}

struct FakeSession<'a> {
    sandbox: &'a FakeSandbox,
    root: PathBuf,
}

impl Sandbox for FakeSandbox {
    fn enter<'a>(
        &'a self,
        root: &Path,
        env: &[(String, String)],
    ) -> Result<Box<dyn SandboxSession + 'a>> {
        if self.fail_enter {
            return Err(ImageError::Sandbox {
                root: root.to_path_buf(),
                source: Cause::Invalid("simulated enter failure".into()),
            });
        }
        self.entered.set(self.entered.get() + 1);
        *self.last_env.borrow_mut() = env.to_vec();
        Ok(Box::new(FakeSession {
            sandbox: self,
            root: root.to_path_buf(),
        }))
    }
}

impl SandboxSession for FakeSession<'_> {
    fn root(&self) -> &Path {
        &self.root
    }

    fn leave(self: Box<Self>) -> Result<()> {
        self.sandbox.left.set(self.sandbox.left.get() + 1);
        if self.sandbox.fail_leave {
            return Err(ImageError::Sandbox {
                root: self.root.clone(),
                source: Cause::Invalid("simulated leave failure".into()),
            });
        }
        Ok(())
    }
}
