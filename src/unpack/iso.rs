//! Installer ISO unpacking.

use std::path::Path;

use tracing::info;

use super::layout::MediaLayout;
use super::{clear_dir_contents, merge_rootfs, repo, Unpacker};
use crate::cleanup::{Cleanup, Outcome};
use crate::error::{Cause, ImageError, Result};
use crate::install::InstallStrategy;

impl Unpacker<'_> {
    /// Unpack installer `media` into `target`, with `strategy` producing the
    /// installed system inside the sandbox.
    ///
    /// All mounts and scratch directories are gone when this returns.
    /// Failures while tearing them down are reported in
    /// [`Outcome::warnings`].
    pub fn unpack_iso(&self, media: &Path, target: &Path, strategy: &dyn InstallStrategy) -> Outcome<()> {
        let mut cleanup = Cleanup::new(self.runner);
        let result = self.unpack_iso_in(&mut cleanup, media, target, strategy);
        cleanup.finish(result)
    }

    fn unpack_iso_in(
        &self,
        cleanup: &mut Cleanup<'_>,
        media: &Path,
        target: &Path,
        strategy: &dyn InstallStrategy,
    ) -> Result<()> {
        let media_dir = cleanup.scratch_dir(&self.scratch)?;
        let container_dir = cleanup.scratch_dir(&self.scratch)?;
        let working_root = cleanup.scratch_dir(&self.scratch)?;

        info!(media = %media.display(), "Mounting installer media");
        cleanup.mount_ro(media, &media_dir)?;

        let layout = MediaLayout::detect(&media_dir);
        if let MediaLayout::Squashfs { container } = &layout {
            info!(container = %container.display(), "Mounting squashfs container");
            cleanup.mount_ro(container, &container_dir)?;
        }
        let root_image = layout.root_image(&container_dir);
        if !root_image.is_file() {
            return Err(ImageError::unpack(
                media,
                "detect layout",
                Cause::Invalid(format!("no root image at {}", root_image.display())),
            ));
        }

        self.copy_root_image(cleanup, &root_image, &working_root)?;
        clear_dir_contents(target)?;
        let staged = repo::stage(self.runner, &media_dir, &working_root)?;
        self.install_in_sandbox(cleanup, media, &working_root, &staged, strategy)?;
        merge_rootfs(self.runner, media, &working_root, target)
    }
}
