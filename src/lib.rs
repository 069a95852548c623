//! Root filesystem and VM disk image assembly from distribution installer
//! media.
//!
//! - **Block devices** - loop device binding and partition node synthesis
//! - **Disk images** - sparse GPT images with an EFI and a root partition
//! - **Unpack pipelines** - installer ISOs and raw images unpacked through a
//!   chroot sandbox into a target root filesystem
//! - **Install strategies** - pluggable distro-specific install step
//! - **Preflight checks** - host tool validation before builds
//!
//! # Architecture
//!
//! ```text
//! build (driver)
//!     │
//!     ├── disk::DiskImage ──── block::BlockDevices
//!     │
//!     └── unpack::Unpacker
//!             ├── unpack_iso / unpack_raw
//!             ├── cleanup::Cleanup (undo stack)
//!             ├── sandbox::Sandbox ──── install::InstallStrategy
//!             └── mount / process::Runner
//! ```
//!
//! Every external tool runs through a [`process::Runner`], so the whole
//! pipeline can be driven against a fake host.

pub mod block;
pub mod build;
pub mod cleanup;
pub mod config;
pub mod disk;
pub mod error;
pub mod install;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod sandbox;
pub mod unpack;

#[cfg(test)]
mod testing;

pub use cleanup::{CleanupWarning, Outcome};
pub use disk::{DiskImage, RootFilesystem};
pub use error::{Cause, CommandError, ImageError, Result};
pub use install::{InstallContext, InstallStrategy};
pub use sandbox::{Sandbox, SandboxSession};
pub use unpack::Unpacker;
