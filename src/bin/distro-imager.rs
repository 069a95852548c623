use std::path::Path;

use anyhow::{bail, Context, Result};
use distro_imager::block::{partition_path, BlockDevices};
use distro_imager::disk::layout::{EFI_PARTITION, ROOT_PARTITION};
use distro_imager::process::HostRunner;
use distro_imager::sandbox::ChrootSandbox;
use distro_imager::unpack::raw::{decompress, partition_offset};
use distro_imager::{build, config, preflight};
use tracing_subscriber::EnvFilter;

fn usage() -> &'static str {
    "Usage:\n  distro-imager build <definition.toml>\n  distro-imager preflight <definition.toml>\n  distro-imager detach <loop-device>\n  distro-imager raw-offset <image.raw[.xz]>"
}

fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, definition] if cmd == "build" => build_image(Path::new(definition)),
        [cmd, definition] if cmd == "preflight" => check(Path::new(definition)),
        [cmd, device] if cmd == "detach" => detach(Path::new(device)),
        [cmd, image] if cmd == "raw-offset" => raw_offset(Path::new(image)),
        _ => bail!(usage()),
    }
}

fn build_image(definition: &Path) -> Result<()> {
    let config = config::load(definition)?;
    preflight::check_build(&config)
        .with_context(|| format!("preflight for '{}'", definition.display()))?;

    println!("=== Building {} ===", definition.display());
    let runner = HostRunner;
    let sandbox = ChrootSandbox::new(&runner);
    let report = build::run(&config, &runner, &sandbox)?;

    println!("  rootfs: {}", report.rootfs.display());
    if let Some(disk) = &report.disk {
        println!("  image:  {}", disk.image.display());
        println!("  root PARTUUID: {}", disk.root_partuuid);
        println!("  EFI PARTUUID:  {}", disk.efi_partuuid);
    }
    if !report.warnings.is_empty() {
        println!("  {} cleanup step(s) failed; leftovers:", report.warnings.len());
        for warning in &report.warnings {
            println!("    {}", warning);
        }
    }
    println!("=== Build complete ===");
    Ok(())
}

fn check(definition: &Path) -> Result<()> {
    let config = config::load(definition)?;
    let tools = preflight::tools_for(&config);
    preflight::check_required_tools(&tools)?;
    println!("All {} required host tools found.", tools.len());
    Ok(())
}

fn detach(device: &Path) -> Result<()> {
    let runner = HostRunner;
    let devices = BlockDevices::new(&runner);
    devices.detach_loop(device)?;
    for index in [EFI_PARTITION, ROOT_PARTITION] {
        devices.remove_partition_node(&partition_path(device, index))?;
    }
    println!("Detached {}", device.display());
    Ok(())
}

fn raw_offset(image: &Path) -> Result<()> {
    let runner = HostRunner;
    let raw = decompress(&runner, image)?;
    let offset = partition_offset(&runner, &raw)?;
    println!("{}", offset);
    Ok(())
}
