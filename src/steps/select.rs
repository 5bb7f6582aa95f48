use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

use console::style;
use dialoguer::MultiSelect;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    config::{Configuration, ConfigurationPackage, PackageConfig},
    error::PlacerError,
    image, paths,
    ui::{self, Prompt},
};

const DEFAULT_CONFIG_FILE: &str = "package-to-image-placer.json";

/// Interactive session: pick packages and partitions, then optionally save
/// the result as a configuration file. Returns where it was saved.
pub fn run(config: &mut Configuration, prompt: &dyn Prompt) -> Result<Option<PathBuf>, PlacerError> {
    let candidates = find_packages(&config.package_dir);
    if candidates.is_empty() {
        return Err(PlacerError::Config(format!(
            "no .zip packages found in {}",
            config.package_dir.display()
        )));
    }

    let chosen = pick_packages(&config.package_dir, &candidates)?;
    for path in chosen {
        if prompt.confirm(&format!(
            "Is {} a configuration package (extracted onto the partition root)?",
            path.display()
        ))? {
            config.configuration_packages.push(ConfigurationPackage {
                package_path: path,
                overwrite_files: BTreeSet::new(),
            });
        } else {
            config.packages.push(configure_package(path, prompt)?);
        }
    }

    let image = config
        .inspected_image()
        .ok_or_else(|| PlacerError::Config("no image to read partitions from".into()))?
        .to_path_buf();
    config.partition_numbers = pick_partitions(&image)?;
    config.normalize()?;

    if !prompt.confirm("Do you want to save the configuration?")? {
        return Ok(None);
    }
    let path = PathBuf::from(prompt.input("Configuration file", DEFAULT_CONFIG_FILE)?);
    config.save(&path)?;
    ui::print_success(&format!("Configuration saved to {}.", path.display()));
    Ok(Some(path))
}

// ── Packages ──────────────────────────────────────────────────────────────────

/// All `.zip` files below `dir`, sorted by path.
pub fn find_packages(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| match e {
            Ok(e) => Some(e),
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry while looking for packages");
                None
            }
        })
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip")))
        .map(|e| e.into_path())
        .collect()
}

fn pick_packages(root: &Path, candidates: &[PathBuf]) -> Result<Vec<PathBuf>, PlacerError> {
    let labels: Vec<String> = candidates
        .iter()
        .map(|p| p.strip_prefix(root).unwrap_or(p).display().to_string())
        .collect();

    let picked = MultiSelect::new()
        .with_prompt(format!(
            "Select packages {}",
            style("(space to toggle, enter to confirm)").dim()
        ))
        .items(&labels)
        .interact()?;

    if picked.is_empty() {
        return Err(PlacerError::Config("no packages selected".into()));
    }

    let picked: Vec<PathBuf> = picked.into_iter().map(|i| candidates[i].clone()).collect();
    ui::print_info(&format!("{} package(s) selected.", picked.len()));
    Ok(picked)
}

/// Asks how a standard package should be placed and whether its service
/// should be enabled.
pub fn configure_package(path: PathBuf, prompt: &dyn Prompt) -> Result<PackageConfig, PlacerError> {
    let name = path.display().to_string();

    let target_directory = prompt.input(&format!("Target directory in the image for {}", name), "/")?;
    let target_directory = paths::normalize_image_path(&target_directory)
        .ok_or_else(|| PlacerError::TargetOutsideMount(target_directory.clone()))?;

    let enable_services = prompt.confirm(&format!("Enable the service shipped in {}?", name))?;
    let service_name_suffix = if enable_services {
        prompt.input("Service name suffix (empty for none)", "")?.trim().to_string()
    } else {
        String::new()
    };

    info!(package = %name, target = %target_directory, enable_services, "package configured");
    Ok(PackageConfig {
        package_path: path,
        enable_services,
        service_name_suffix,
        target_directory,
        overwrite_files: BTreeSet::new(),
        is_standard_package: true,
    })
}

// ── Partitions ────────────────────────────────────────────────────────────────

fn pick_partitions(image_path: &Path) -> Result<BTreeSet<u32>, PlacerError> {
    let partitions = image::list_partitions(image_path)?;
    if partitions.is_empty() {
        return Err(PlacerError::Config(format!(
            "image {} has no partitions",
            image_path.display()
        )));
    }

    let labels: Vec<String> = partitions.iter().map(|p| p.display()).collect();
    let picked = MultiSelect::new()
        .with_prompt("Select target partitions")
        .items(&labels)
        .interact()?;

    let numbers: BTreeSet<u32> = picked.into_iter().map(|i| partitions[i].number).collect();
    if numbers.is_empty() {
        return Err(PlacerError::Config("no partitions selected".into()));
    }
    Ok(numbers)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::testutil::ScriptedPrompt;

    #[test]
    fn test_find_packages_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("b.zip"), "").unwrap();
        fs::write(dir.path().join("a.ZIP"), "").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::write(dir.path().join("nested/c.zip"), "").unwrap();

        let found: Vec<String> = find_packages(dir.path())
            .iter()
            .map(|p| p.strip_prefix(dir.path()).unwrap().display().to_string())
            .collect();
        assert_eq!(found, vec!["a.ZIP", "b.zip", "nested/c.zip"]);
    }

    #[test]
    fn test_configure_package_without_services() {
        let prompt = ScriptedPrompt::answers(&[false]);
        let pkg = configure_package(PathBuf::from("/pkgs/app.zip"), &prompt).unwrap();

        assert_eq!(pkg.target_directory, "/");
        assert!(!pkg.enable_services);
        assert!(pkg.service_name_suffix.is_empty());
        assert!(pkg.is_standard_package);
        assert_eq!(prompt.asked(), 1);
    }

    #[test]
    fn test_configure_package_with_services() {
        let prompt = ScriptedPrompt::answers(&[true]);
        let pkg = configure_package(PathBuf::from("/pkgs/app.zip"), &prompt).unwrap();
        assert!(pkg.enable_services);
    }
}
