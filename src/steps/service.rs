use std::{
    fs::{self, OpenOptions, Permissions},
    io::{self, Write},
    os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::{
    error::PlacerError,
    overwrite::OverwritePolicy,
    paths,
    steps::unit::{split_preserving_quotes, UnitFile},
};

const SYSTEMD_DIR: &str = "etc/systemd/system";
const WANTS_DIR: &str = "multi-user.target.wants";
const UNIT_MODE: u32 = 0o644;

/// An installed and enabled unit inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub name: String,
    pub unit_path: PathBuf,
    pub link_path: PathBuf,
    /// Bytes of the unit this activation replaced, if one was installed.
    replaced_unit: Option<Vec<u8>>,
    link_created: bool,
}

/// `app.service` + `blue` → `app-blue.service`.
pub fn final_name(unit_file: &Path, suffix: &str) -> String {
    let base = unit_file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if suffix.is_empty() {
        return base;
    }
    let stem = base.strip_suffix(".service").unwrap_or(&base);
    format!("{}-{}.service", stem, suffix)
}

// ── Activation ────────────────────────────────────────────────────────────────

/// Installs the (already rewritten) unit under `/etc/systemd/system` of the
/// image and links it from `multi-user.target.wants`.
pub fn activate(
    unit_file: &Path,
    mount_root: &Path,
    suffix: &str,
    policy: &mut OverwritePolicy,
) -> Result<ServiceRecord, PlacerError> {
    let name = final_name(unit_file, suffix);
    let systemd_dir = mount_root.join(SYSTEMD_DIR);
    let wants_dir = systemd_dir.join(WANTS_DIR);
    let unit_path = systemd_dir.join(&name);
    let link_path = wants_dir.join(&name);

    let content = fs::read(unit_file).map_err(PlacerError::file("read service file", unit_file))?;

    // An identical unit that is already installed is not an overwrite.
    let replaced_unit = fs::read(&unit_path).ok();
    let unchanged = replaced_unit.as_ref().is_some_and(|existing| *existing == content);
    let link_exists = fs::symlink_metadata(&link_path).is_ok();
    if (unit_path.exists() && !unchanged) || (link_exists && !unit_path.exists()) {
        policy.check(&paths::image_path(mount_root, &unit_path))?;
    }

    fs::create_dir_all(&wants_dir).map_err(PlacerError::file("create directory", &wants_dir))?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(UNIT_MODE)
        .open(&unit_path)
        .map_err(PlacerError::file("create service file", &unit_path))?;
    file.write_all(&content)
        .map_err(PlacerError::file("copy service file to", &unit_path))?;
    file.sync_all()
        .map_err(PlacerError::file("flush service file", &unit_path))?;
    // `mode` only applies on creation.
    fs::set_permissions(&unit_path, Permissions::from_mode(UNIT_MODE))
        .map_err(PlacerError::file("set permissions on", &unit_path))?;

    let link_created = match symlink(Path::new("..").join(&name), &link_path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(link = %link_path.display(), "enabling symlink already present");
            false
        }
        Err(e) => return Err(PlacerError::file("create symlink", &link_path)(e)),
    };

    info!(service = %name, "activated service");
    Ok(ServiceRecord {
        name,
        unit_path,
        link_path,
        replaced_unit,
        link_created,
    })
}

/// Verifies every `Requires=` dependency of an activated unit. On failure the
/// image goes back to its state before activation: a replaced unit gets its
/// old bytes back, a new unit and a new link are removed.
pub fn check_requirements(mount_root: &Path, record: &ServiceRecord) -> Result<(), PlacerError> {
    info!(service = %record.name, "checking required units are enabled");
    let result = unmet_requirement(mount_root, record);
    if result.is_err() {
        roll_back(record);
    }
    result
}

fn roll_back(record: &ServiceRecord) {
    if record.link_created {
        if let Err(e) = fs::remove_file(&record.link_path) {
            warn!(path = %record.link_path.display(), error = %e, "rollback could not remove link");
        }
    }

    let restored = match &record.replaced_unit {
        Some(previous) => fs::write(&record.unit_path, previous),
        None => fs::remove_file(&record.unit_path),
    };
    match restored {
        Ok(()) => info!(service = %record.name, restored = record.replaced_unit.is_some(), "rolled back activation"),
        Err(e) => warn!(path = %record.unit_path.display(), error = %e, "rollback could not restore unit"),
    }
}

fn unmet_requirement(mount_root: &Path, record: &ServiceRecord) -> Result<(), PlacerError> {
    let unit = UnitFile::read(&record.unit_path)?;
    let Some(requires) = unit.value("Requires") else {
        return Ok(());
    };

    for dep in split_preserving_quotes(requires) {
        let dep = dep.trim_matches('"');
        let (kind, enabled) = if dep.ends_with(".target") {
            ("target", is_target_enabled(mount_root, dep))
        } else {
            let base = Path::new(dep)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| dep.to_string());
            ("service", is_service_enabled(mount_root, &base)?)
        };

        if !enabled {
            return Err(PlacerError::DependencyNotEnabled {
                unit: record.name.clone(),
                kind,
                name: dep.to_string(),
            });
        }
    }
    Ok(())
}

// ── Enablement queries ────────────────────────────────────────────────────────

/// A target counts as enabled when `<target>.wants` or `<target>.requires`
/// exists in the image's systemd directory.
pub fn is_target_enabled(mount_root: &Path, target: &str) -> bool {
    let dir = mount_root.join(SYSTEMD_DIR);
    ["wants", "requires"]
        .iter()
        .any(|kind| dir.join(format!("{}.{}", target, kind)).exists())
}

/// True iff some `*.wants/` or `*.requires/` directory holds a symlink named
/// `service`.
pub fn is_service_enabled(mount_root: &Path, service: &str) -> Result<bool, PlacerError> {
    let dir = mount_root.join(SYSTEMD_DIR);
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(PlacerError::file("read directory", &dir)(e)),
    };

    for entry in entries {
        let entry = entry.map_err(PlacerError::file("read directory", &dir))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.ends_with(".wants") || name.ends_with(".requires")) {
            continue;
        }
        let candidate = entry.path().join(service);
        if fs::symlink_metadata(&candidate).is_ok_and(|m| m.file_type().is_symlink()) {
            return Ok(true);
        }
    }
    Ok(false)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
