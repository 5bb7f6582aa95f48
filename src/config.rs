use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{error::PlacerError, paths};

// ── Command line ──────────────────────────────────────────────────────────────

/// Copies zip packages into partitions of a GPT disk image.
///
/// Interactive:      package-to-image-placer --target <img> [--source <img> | --no-clone]
/// Non-interactive:  package-to-image-placer --config <file> [override options]
#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Args {
    /// Path to configuration file (non-interactive mode)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Target image path (created unless --no-clone is given)
    #[arg(long)]
    pub target: Option<PathBuf>,

    /// Source image to clone
    #[arg(long)]
    pub source: Option<PathBuf>,

    /// Work on the target image in place. Failures may leave it damaged
    #[arg(long)]
    pub no_clone: bool,

    /// Directory the package picker starts in (interactive mode)
    #[arg(long, default_value = "./")]
    pub package_dir: PathBuf,

    /// Directory for package_to_image_placer.log
    #[arg(long)]
    pub log_path: Option<PathBuf>,
}

// ── Data model ────────────────────────────────────────────────────────────────

/// A package extracted into `<target-directory>/<archive stem>/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PackageConfig {
    pub package_path: PathBuf,
    pub enable_services: bool,
    pub service_name_suffix: String,
    /// Image-absolute directory the package subdirectory is created in.
    pub target_directory: String,
    /// Image-absolute paths that may be replaced if they already exist.
    pub overwrite_files: BTreeSet<String>,
    #[serde(skip)]
    pub is_standard_package: bool,
}

/// A package unpacked straight onto the partition root, no services.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ConfigurationPackage {
    pub package_path: PathBuf,
    pub overwrite_files: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    pub source: Option<PathBuf>,
    pub target: Option<PathBuf>,
    pub no_clone: bool,
    pub packages: Vec<PackageConfig>,
    pub configuration_packages: Vec<ConfigurationPackage>,
    pub partition_numbers: BTreeSet<u32>,
    pub log_path: Option<PathBuf>,

    #[serde(skip)]
    pub interactive: bool,
    #[serde(skip)]
    pub package_dir: PathBuf,
    #[serde(skip)]
    pub config_file: Option<PathBuf>,
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl Configuration {
    /// Builds the run configuration: file values first (if `--config`), then
    /// command-line overrides.
    pub fn from_args(args: Args) -> Result<Self, PlacerError> {
        let mut config = match &args.config {
            Some(path) => {
                let mut c = Self::load(path)?;
                c.interactive = false;
                c
            }
            None => Configuration {
                interactive: true,
                ..Default::default()
            },
        };

        if args.source.is_some() {
            config.source = args.source;
        }
        if args.target.is_some() {
            config.target = args.target;
        }
        if args.no_clone {
            config.no_clone = true;
        }
        if args.log_path.is_some() {
            config.log_path = args.log_path;
        }
        config.package_dir = args.package_dir;
        config.config_file = args.config;

        config.normalize()?;
        Ok(config)
    }

    /// Reads a JSON configuration file; relative paths inside it are resolved
    /// against the file's directory.
    pub fn load(path: &Path) -> Result<Self, PlacerError> {
        let text = fs::read_to_string(path).map_err(PlacerError::file("read config file", path))?;
        let mut config: Configuration = serde_json::from_str(&text)?;

        let base = path.parent().unwrap_or(Path::new(""));
        let resolve = |p: &mut PathBuf| {
            if !p.as_os_str().is_empty() && p.is_relative() {
                *p = base.join(&*p);
            }
        };
        for p in [&mut config.source, &mut config.target, &mut config.log_path]
            .into_iter()
            .flatten()
        {
            resolve(p);
        }
        for pkg in &mut config.packages {
            resolve(&mut pkg.package_path);
        }
        for pkg in &mut config.configuration_packages {
            resolve(&mut pkg.package_path);
        }

        config.config_file = Some(path.to_path_buf());
        Ok(config)
    }

    /// Canonicalises image paths and drops duplicate packages.
    pub fn normalize(&mut self) -> Result<(), PlacerError> {
        for p in [&mut self.source, &mut self.target, &mut self.log_path] {
            if p.as_ref().is_some_and(|v| v.as_os_str().is_empty()) {
                *p = None;
            }
        }

        for pkg in &mut self.packages {
            pkg.is_standard_package = true;
            pkg.target_directory = normalize_dir(&pkg.target_directory)?;
            pkg.overwrite_files = normalize_set(&pkg.overwrite_files)?;
        }
        for pkg in &mut self.configuration_packages {
            pkg.overwrite_files = normalize_set(&pkg.overwrite_files)?;
        }

        let mut seen = BTreeSet::new();
        self.packages.retain(|p| seen.insert(p.package_path.clone()));
        let mut seen = BTreeSet::new();
        self.configuration_packages
            .retain(|p| seen.insert(p.package_path.clone()));
        Ok(())
    }

    // ── Validation ────────────────────────────────────────────────────────────

    /// Rejects missing or contradictory settings before anything is touched.
    pub fn validate(&self) -> Result<(), PlacerError> {
        let err = |m: &str| Err(PlacerError::Config(m.to_string()));

        let Some(target) = &self.target else {
            return err("target image path is missing, start with -h to see arguments");
        };
        if self.source.as_ref() == Some(target) {
            return err("source and target image paths are the same");
        }
        match (&self.source, self.no_clone) {
            (Some(_), true) => return err("source image and no-clone are mutually exclusive"),
            (None, false) => {
                return err("either 'source' or 'no-clone' must be defined, start with -h to see arguments")
            }
            (Some(source), false) if !source.exists() => {
                return Err(PlacerError::Config(format!(
                    "source image path: {} does not exist",
                    source.display()
                )))
            }
            _ => {}
        }
        if self.no_clone && !target.exists() {
            return Err(PlacerError::Config(format!(
                "target image path: {} does not exist",
                target.display()
            )));
        }

        if !self.interactive {
            if self.packages.is_empty() && self.configuration_packages.is_empty() {
                return err("no packages defined in configuration");
            }
            let all_paths = self
                .packages
                .iter()
                .map(|p| &p.package_path)
                .chain(self.configuration_packages.iter().map(|p| &p.package_path));
            for path in all_paths {
                if !path.is_file() {
                    return Err(PlacerError::Config(format!(
                        "package {} does not exist",
                        path.display()
                    )));
                }
            }
            if self.partition_numbers.is_empty() {
                return err("no partition numbers defined in configuration");
            }
        }
        if self.partition_numbers.contains(&0) {
            return err("partition numbers start at 1");
        }

        if let Some(log) = &self.log_path {
            if !log.is_dir() {
                return Err(PlacerError::Config(format!(
                    "log path {} does not exist",
                    log.display()
                )));
            }
        }
        Ok(())
    }

    /// The image that partitions are read from before any copy happens.
    pub fn inspected_image(&self) -> Option<&Path> {
        if self.no_clone {
            self.target.as_deref()
        } else {
            self.source.as_deref()
        }
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    /// Writes the configuration as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), PlacerError> {
        info!(path = %path.display(), "saving configuration");
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json + "\n").map_err(PlacerError::file("write config file", path))
    }
}

fn normalize_dir(dir: &str) -> Result<String, PlacerError> {
    paths::normalize_image_path(dir).ok_or_else(|| PlacerError::TargetOutsideMount(dir.to_string()))
}

fn normalize_set(set: &BTreeSet<String>) -> Result<BTreeSet<String>, PlacerError> {
    set.iter()
        .map(|p| {
            paths::normalize_image_path(p).ok_or_else(|| {
                PlacerError::Config(format!("overwrite path {} leaves the image", p))
            })
        })
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
