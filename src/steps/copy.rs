use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, info};

use crate::{
    config::{Configuration, ConfigurationPackage, PackageConfig},
    error::PlacerError,
    overwrite::OverwritePolicy,
    paths,
    steps::{
        extract::{ArchiveExtractor, FreeSpace},
        mount::{with_mounted_partition, MountOptions, Mounter, SignalGuard},
        service, unit,
    },
    ui::{self, Prompt},
};

/// Mounts every configured partition in ascending order and places all
/// packages on it. The first failure stops the run.
///
/// Overwrite approvals given interactively are recorded in `config`.
pub async fn copy_packages_to_partitions(
    config: &mut Configuration,
    mounter: Arc<dyn Mounter>,
    signals: &SignalGuard,
    prompt: &dyn Prompt,
    space: &dyn FreeSpace,
    options: &MountOptions,
) -> Result<(), PlacerError> {
    let image = config
        .target
        .clone()
        .ok_or_else(|| PlacerError::Config("target image path is missing".into()))?;
    let partitions: Vec<u32> = config.partition_numbers.iter().copied().collect();
    let interactive = config.interactive;

    for partition in partitions {
        info!(partition, image = %image.display(), "copying packages to partition");
        ui::print_info(&format!("Partition {}", partition));

        let packages = &mut config.packages;
        let configuration_packages = &mut config.configuration_packages;
        with_mounted_partition(mounter.clone(), signals, &image, partition, options, |mount| {
            let ctx = PartitionContext {
                mount,
                interactive,
                prompt,
                space,
            };
            for pkg in packages.iter_mut() {
                ctx.install_package(pkg)?;
            }
            for pkg in configuration_packages.iter_mut() {
                ctx.install_configuration_package(pkg)?;
            }
            Ok(())
        })
        .await?;

        ui::print_success(&format!("Partition {} done.", partition));
    }
    Ok(())
}

// ── Per-partition work ────────────────────────────────────────────────────────

struct PartitionContext<'a> {
    mount: &'a Path,
    interactive: bool,
    prompt: &'a dyn Prompt,
    space: &'a dyn FreeSpace,
}

impl PartitionContext<'_> {
    fn install_package(&self, pkg: &mut PackageConfig) -> Result<(), PlacerError> {
        let target_dir = self.package_dir(pkg)?;

        ui::print_info(&format!(
            "Copying {} to {}",
            pkg.package_path.display(),
            paths::image_path(self.mount, &target_dir)
        ));

        let mut policy = OverwritePolicy::new(self.interactive, self.prompt, &mut pkg.overwrite_files);
        let service_file = ArchiveExtractor::new(self.mount, self.space).extract(
            &pkg.package_path,
            &target_dir,
            &mut policy,
        )?;

        if !pkg.enable_services {
            if let Some(found) = &service_file {
                debug!(service = %found.display(), "services disabled for package, leaving unit in place");
            }
            return Ok(());
        }

        let unit_path = service_file.ok_or_else(|| PlacerError::NoServiceFile(pkg.package_path.clone()))?;
        unit::rewrite(&unit_path, self.mount, &target_dir)?;
        let record = service::activate(&unit_path, self.mount, &pkg.service_name_suffix, &mut policy)?;
        service::check_requirements(self.mount, &record)?;

        ui::print_success(&format!("Service {} enabled.", record.name));
        Ok(())
    }

    /// `<target-directory>/<archive stem>` for standard packages, the
    /// partition root otherwise.
    fn package_dir(&self, pkg: &PackageConfig) -> Result<PathBuf, PlacerError> {
        if !pkg.is_standard_package {
            return Ok(self.mount.to_path_buf());
        }

        let stem = pkg
            .package_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let outside = || PlacerError::TargetOutsideMount(pkg.target_directory.clone());
        let dir = paths::join_within(self.mount, &format!("{}/{}", pkg.target_directory, stem))
            .map_err(|_| outside())?;
        if stem.is_empty() || dir == self.mount {
            return Err(outside());
        }
        Ok(dir)
    }

    /// Configuration packages land directly on the partition root.
    fn install_configuration_package(&self, pkg: &mut ConfigurationPackage) -> Result<(), PlacerError> {
        ui::print_info(&format!("Copying configuration package {}", pkg.package_path.display()));

        let mut policy = OverwritePolicy::new(self.interactive, self.prompt, &mut pkg.overwrite_files);
        let service_file =
            ArchiveExtractor::new(self.mount, self.space).extract(&pkg.package_path, self.mount, &mut policy)?;
        if let Some(found) = service_file {
            debug!(service = %found.display(), "configuration package carries a unit, not enabling it");
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
