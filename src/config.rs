//! TOML build definitions.
//!
//! ```toml
//! [source]
//! kind = "iso"
//! path = "openEuler-22.03-LTS-x86_64-dvd.iso"
//!
//! [target]
//! rootfs = "build/rootfs"
//! scratch = "build/cache"
//!
//! [disk]
//! image = "build/disk.img"
//! filesystem = "btrfs"
//!
//! [install]
//! script = "install.sh"
//! env = { LANG = "C" }
//! ```
//!
//! Relative paths resolve against the directory holding the definition.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::disk::RootFilesystem;
use crate::install::{CdromRepoInstall, InstallStrategy, ScriptInstall};

/// Kind of installer media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Iso,
    Raw,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: PathBuf,
}

/// Present when a VM disk image should be produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskConfig {
    pub image: PathBuf,
    /// Bytes; 0 selects the default size.
    pub size: u64,
    pub filesystem: RootFilesystem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallMethod {
    Script(PathBuf),
    Cdrom {
        packages: Vec<String>,
        official_gpg_key: Option<String>,
    },
}

/// A loaded and validated build definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub config_path: PathBuf,
    pub source: SourceConfig,
    pub rootfs: PathBuf,
    pub scratch: PathBuf,
    pub disk: Option<DiskConfig>,
    pub install: InstallMethod,
    pub env: Vec<(String, String)>,
}

impl BuildConfig {
    /// Build the install strategy described by `[install]`.
    pub fn strategy(&self) -> Result<Box<dyn InstallStrategy>> {
        match &self.install {
            InstallMethod::Script(path) => Ok(Box::new(ScriptInstall::from_file(path)?)),
            InstallMethod::Cdrom {
                packages,
                official_gpg_key,
            } => Ok(Box::new(CdromRepoInstall::new(
                packages.clone(),
                official_gpg_key.clone(),
            )?)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    source: SourceToml,
    target: TargetToml,
    disk: Option<DiskToml>,
    install: InstallToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourceToml {
    kind: String,
    path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TargetToml {
    rootfs: String,
    scratch: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DiskToml {
    image: String,
    size: Option<u64>,
    filesystem: Option<RootFilesystem>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstallToml {
    script: Option<String>,
    cdrom: Option<CdromToml>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CdromToml {
    packages: Vec<String>,
    official_gpg_key: Option<String>,
}

/// Resolve `raw` against `base` unless it is already absolute.
fn resolve(base: &Path, raw: &str) -> PathBuf {
    let candidate = Path::new(raw);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base.join(candidate)
    }
}

/// Load a build definition from `config_path`.
pub fn load(config_path: &Path) -> Result<BuildConfig> {
    let text = fs::read_to_string(config_path)
        .with_context(|| format!("reading build definition '{}'", config_path.display()))?;
    parse(&text, config_path)
}

/// Parse a build definition; `config_path` anchors relative paths and names
/// the file in errors.
pub fn parse(text: &str, config_path: &Path) -> Result<BuildConfig> {
    let parsed: BuildToml = toml::from_str(text)
        .with_context(|| format!("parsing build definition '{}'", config_path.display()))?;
    let base = config_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();

    let kind = match parsed.source.kind.trim().to_ascii_lowercase().as_str() {
        "iso" => SourceKind::Iso,
        "raw" => SourceKind::Raw,
        other => bail!(
            "invalid build definition '{}': unsupported source kind '{}' (expected 'iso' or 'raw')",
            config_path.display(),
            other
        ),
    };
    if parsed.source.path.trim().is_empty() {
        bail!(
            "invalid build definition '{}': source.path is empty",
            config_path.display()
        );
    }
    if parsed.target.rootfs.trim().is_empty() {
        bail!(
            "invalid build definition '{}': target.rootfs is empty",
            config_path.display()
        );
    }

    let rootfs = resolve(&base, &parsed.target.rootfs);
    let scratch = match &parsed.target.scratch {
        Some(raw) => resolve(&base, raw),
        None => rootfs.with_file_name("cache"),
    };
    if scratch.starts_with(&rootfs) {
        bail!(
            "invalid build definition '{}': scratch area '{}' lies inside the rootfs target",
            config_path.display(),
            scratch.display()
        );
    }

    let install = match (parsed.install.script, parsed.install.cdrom) {
        (Some(script), None) => InstallMethod::Script(resolve(&base, &script)),
        (None, Some(cdrom)) => InstallMethod::Cdrom {
            packages: cdrom.packages,
            official_gpg_key: cdrom.official_gpg_key,
        },
        (Some(_), Some(_)) => bail!(
            "invalid build definition '{}': install.script and install.cdrom are mutually exclusive",
            config_path.display()
        ),
        (None, None) => bail!(
            "invalid build definition '{}': [install] needs either script or cdrom",
            config_path.display()
        ),
    };

    let disk = parsed.disk.map(|disk| DiskConfig {
        image: resolve(&base, &disk.image),
        size: disk.size.unwrap_or(0),
        filesystem: disk.filesystem.unwrap_or_default(),
    });

    Ok(BuildConfig {
        config_path: config_path.to_path_buf(),
        source: SourceConfig {
            kind,
            path: resolve(&base, &parsed.source.path),
        },
        rootfs,
        scratch,
        disk,
        install,
        env: parsed.install.env.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ISO_DEFINITION: &str = r#"
[source]
kind = "iso"
path = "media/openEuler.iso"

[target]
rootfs = "build/rootfs"
scratch = "/var/tmp/imager"

[install]
script = "install.sh"
env = { LANG = "C", HOME = "/root" }
"#;

    #[test]
    fn test_parse_iso_definition() {
        let config = parse(ISO_DEFINITION, Path::new("/defs/openeuler.toml")).unwrap();
        assert_eq!(config.source.kind, SourceKind::Iso);
        assert_eq!(config.source.path, PathBuf::from("/defs/media/openEuler.iso"));
        assert_eq!(config.rootfs, PathBuf::from("/defs/build/rootfs"));
        assert_eq!(config.scratch, PathBuf::from("/var/tmp/imager"));
        assert_eq!(config.disk, None);
        assert_eq!(config.install, InstallMethod::Script("/defs/install.sh".into()));
        assert_eq!(
            config.env,
            vec![
                ("HOME".to_string(), "/root".to_string()),
                ("LANG".to_string(), "C".to_string())
            ]
        );
    }

    #[test]
    fn test_parse_disk_and_cdrom() {
        let text = r#"
[source]
kind = "RAW"
path = "/images/disk.raw.xz"

[target]
rootfs = "rootfs"

[disk]
image = "disk.img"
filesystem = "btrfs"

[install.cdrom]
packages = ["basesystem", "yum"]
"#;
        let config = parse(text, Path::new("/defs/vm.toml")).unwrap();
        assert_eq!(config.source.kind, SourceKind::Raw);
        assert_eq!(config.scratch, PathBuf::from("/defs/cache"));
        assert_eq!(
            config.disk,
            Some(DiskConfig {
                image: "/defs/disk.img".into(),
                size: 0,
                filesystem: RootFilesystem::Btrfs,
            })
        );
        assert!(matches!(config.install, InstallMethod::Cdrom { ref packages, .. } if packages.len() == 2));
        assert!(config.strategy().is_ok());
    }

    #[test]
    fn test_rejects_unknown_fields() {
        let text = ISO_DEFINITION.replace("[target]", "[target]\ncompress = true");
        let err = parse(&text, Path::new("/defs/x.toml")).unwrap_err();
        assert!(format!("{:#}", err).contains("/defs/x.toml"));
    }

    #[test]
    fn test_rejects_unknown_source_kind() {
        let text = ISO_DEFINITION.replace("kind = \"iso\"", "kind = \"qcow2\"");
        let err = parse(&text, Path::new("/defs/x.toml")).unwrap_err();
        assert!(err.to_string().contains("unsupported source kind 'qcow2'"));
    }

    #[test]
    fn test_install_method_must_be_unique() {
        let both = ISO_DEFINITION.replace(
            "script = \"install.sh\"",
            "script = \"install.sh\"\ncdrom = { packages = [\"yum\"] }",
        );
        assert!(parse(&both, Path::new("/defs/x.toml")).is_err());

        let neither = ISO_DEFINITION.replace("script = \"install.sh\"\n", "");
        assert!(parse(&neither, Path::new("/defs/x.toml")).is_err());
    }

    #[test]
    fn test_rejects_scratch_inside_rootfs() {
        let text = ISO_DEFINITION.replace("/var/tmp/imager", "build/rootfs/tmp");
        assert!(parse(&text, Path::new("/defs/x.toml")).is_err());
    }

    #[test]
    fn test_load_reads_file_and_script_strategy() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.toml");
        fs::write(&path, ISO_DEFINITION).unwrap();
        fs::write(temp.path().join("install.sh"), "mkdir -p /rootfs\n").unwrap();

        let config = load(&path).unwrap();
        assert_eq!(config.rootfs, temp.path().join("build/rootfs"));
        assert!(config.strategy().is_ok());

        let err = load(&temp.path().join("missing.toml")).unwrap_err();
        assert!(err.to_string().contains("reading build definition"));
    }
}
