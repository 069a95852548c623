//! yum/dnf bootstrap from the repository staged off the installer media.

use anyhow::{bail, Result};

use super::{run_script, InstallContext, InstallStrategy};

/// Installs a package set into `/rootfs` using the installer media's own
/// repository, registered as a disabled-by-default `cdrom` repo.
///
/// Requires a staged repository and has no bootstrap of its own; media
/// without `Packages`/`repodata` need a [`ScriptInstall`](super::ScriptInstall).
#[derive(Debug, Clone)]
pub struct CdromRepoInstall {
    packages: Vec<String>,
    official_gpg_key: Option<String>,
}

impl CdromRepoInstall {
    pub fn new(packages: Vec<String>, official_gpg_key: Option<String>) -> Result<Self> {
        if packages.is_empty() {
            bail!("cdrom install needs at least one package");
        }
        for package in &packages {
            let valid = !package.is_empty()
                && package
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_.+:".contains(c));
            if !valid {
                bail!("invalid package name '{}'", package);
            }
        }
        if let Some(key) = &official_gpg_key {
            if key.chars().any(|c| c.is_whitespace() || c == '\'' || c == '"') {
                bail!("invalid gpg key URI '{}'", key);
            }
        }
        Ok(Self {
            packages,
            official_gpg_key,
        })
    }

    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    /// The shell script run inside the sandbox.
    pub fn render(&self) -> String {
        let official = self.official_gpg_key.as_deref().unwrap_or("");
        format!(
            r#"#!/bin/sh
set -eux

touch /etc/mtab /etc/fstab
mkdir -p /etc/yum.repos.d

if ! command -v dnf >/dev/null 2>&1 && ! command -v yum >/dev/null 2>&1; then
	cd /mnt/cdrom/Packages
	rpm -ivh --nodeps $(ls rpm-*.rpm | head -n1)
	rpm -ivh --nodeps $(ls yum-*.rpm | head -n1)
	cd /
fi

if command -v dnf >/dev/null 2>&1; then
	pm=dnf
else
	pm=yum
fi

cat > /etc/yum.repos.d/cdrom.repo <<EOF
[cdrom]
name=Install CD-ROM
baseurl=file:///mnt/cdrom
enabled=0
EOF

official_keys="{official}"
if [ -n "${{REPO_GPG_KEYS:-}}" ]; then
	echo gpgcheck=1 >> /etc/yum.repos.d/cdrom.repo
	echo gpgkey=${{official_keys}} ${{REPO_GPG_KEYS}} >> /etc/yum.repos.d/cdrom.repo
else
	echo gpgcheck=0 >> /etc/yum.repos.d/cdrom.repo
fi

${{pm}} --disablerepo='*' --enablerepo=cdrom -y install yum

mkdir -p /rootfs
${{pm}} --disablerepo='*' --enablerepo=cdrom --installroot=/rootfs -y --skip-broken install {packages}

rm -rf /rootfs/var/cache/yum /rootfs/var/cache/dnf
rm -f /etc/yum.repos.d/cdrom.repo
rm -rf /mnt/cdrom
"#,
            official = official,
            packages = self.packages.join(" "),
        )
    }
}

impl InstallStrategy for CdromRepoInstall {
    fn install(&self, ctx: &InstallContext<'_>) -> Result<()> {
        if !ctx.staged_repo {
            bail!(
                "installer media carries no Packages/repodata repository; \
                 cdrom install cannot bootstrap without it, use an install \
                 script ([install] script = ...) for this media"
            );
        }
        run_script(ctx, &self.render())
    }
}
