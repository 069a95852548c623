//! Installer media layout detection.

use std::path::{Path, PathBuf};

/// Squashfs container shipped by live media.
pub const SQUASHFS_IMAGE: &str = "LiveOS/squashfs.img";

/// Root image inside the squashfs container (and sometimes inside
/// `install.img`).
pub const ROOTFS_IMAGE: &str = "LiveOS/rootfs.img";

/// Root image shipped directly on classic installer media.
pub const INSTALL_IMAGE: &str = "images/install.img";

/// How the root image is reached from the media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaLayout {
    /// `LiveOS/squashfs.img` must be mounted first; the root image is
    /// `LiveOS/rootfs.img` beneath that mount.
    Squashfs { container: PathBuf },
    /// `images/install.img` is the root image.
    InstallImage { image: PathBuf },
}

impl MediaLayout {
    /// Inspect a mounted media tree.
    pub fn detect(media_root: &Path) -> Self {
        let container = media_root.join(SQUASHFS_IMAGE);
        if container.exists() {
            MediaLayout::Squashfs { container }
        } else {
            MediaLayout::InstallImage {
                image: media_root.join(INSTALL_IMAGE),
            }
        }
    }

    /// The root image path, given where the squashfs container is mounted.
    pub fn root_image(&self, container_mount: &Path) -> PathBuf {
        match self {
            MediaLayout::Squashfs { .. } => container_mount.join(ROOTFS_IMAGE),
            MediaLayout::InstallImage { image } => image.clone(),
        }
    }
}
