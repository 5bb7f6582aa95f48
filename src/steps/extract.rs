use std::{
    fs::{self, File, OpenOptions, Permissions},
    io::{self, Read},
    os::unix::fs::{symlink, OpenOptionsExt, PermissionsExt},
    path::{Path, PathBuf},
};

use nix::sys::statvfs::statvfs;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::{error::PlacerError, overwrite::OverwritePolicy, paths, ui};

const MODE_TYPE_MASK: u32 = 0o170000;
const MODE_SYMLINK: u32 = 0o120000;
const DEFAULT_FILE_MODE: u32 = 0o644;

// ── Free space ────────────────────────────────────────────────────────────────

pub trait FreeSpace {
    /// Bytes available on the filesystem that holds `path`.
    fn free_bytes(&self, path: &Path) -> Result<u64, PlacerError>;
}

/// Asks the kernel via `statvfs(3)`.
pub struct StatvfsProbe;

impl FreeSpace for StatvfsProbe {
    fn free_bytes(&self, path: &Path) -> Result<u64, PlacerError> {
        let stat = statvfs(path)?;
        Ok(stat.blocks_free() as u64 * stat.block_size() as u64)
    }
}

// ── Extraction ────────────────────────────────────────────────────────────────

/// Unpacks zip packages into a mounted partition.
pub struct ArchiveExtractor<'a> {
    mount_root: &'a Path,
    space: &'a dyn FreeSpace,
}

impl<'a> ArchiveExtractor<'a> {
    pub fn new(mount_root: &'a Path, space: &'a dyn FreeSpace) -> Self {
        Self { mount_root, space }
    }

    /// Extracts `archive` below `target_dir` and returns the service unit it
    /// carried, if any.
    ///
    /// Entries are rejected when their stored name, or a symlink created by an
    /// earlier entry, would place them outside `target_dir`.
    pub fn extract(
        &self,
        archive: &Path,
        target_dir: &Path,
        policy: &mut OverwritePolicy,
    ) -> Result<Option<PathBuf>, PlacerError> {
        let file = File::open(archive).map_err(PlacerError::file("open package", archive))?;
        let mut zip = ZipArchive::new(file)?;

        let total = uncompressed_size(&mut zip)?;
        let free = self.space.free_bytes(self.mount_root)?;
        if free < total {
            return Err(PlacerError::InsufficientSpace {
                free_mb: free / 1024 / 1024,
                needed_mb: total / 1024 / 1024,
            });
        }

        info!(package = %archive.display(), target = %target_dir.display(), bytes = total, "extracting package");
        fs::create_dir_all(target_dir).map_err(PlacerError::file("create directory", target_dir))?;
        let real_root = fs::canonicalize(target_dir).map_err(PlacerError::file("resolve", target_dir))?;

        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let pb = ui::byte_progress(total, format!("Extracting {}", name));

        let mut service = None;
        for i in 0..zip.len() {
            let mut entry = zip.by_index(i)?;
            let entry_name = entry.name().to_string();
            let dest = paths::join_within(target_dir, &entry_name)?;
            let mode = entry.unix_mode();

            if entry.is_dir() {
                ensure_existing_inside(&real_root, &dest, &entry_name)?;
                fs::create_dir_all(&dest).map_err(PlacerError::file("create directory", &dest))?;
                ensure_inside(&real_root, &dest, &entry_name)?;
                if let Some(mode) = mode {
                    set_mode(&dest, mode)?;
                }
                continue;
            }

            if let Some(parent) = dest.parent() {
                ensure_existing_inside(&real_root, parent, &entry_name)?;
                fs::create_dir_all(parent).map_err(PlacerError::file("create directory", parent))?;
                ensure_inside(&real_root, parent, &entry_name)?;
            }

            let symlink_entry = mode.is_some_and(|m| m & MODE_TYPE_MASK == MODE_SYMLINK);
            if !symlink_entry && entry_name.ends_with(".service") {
                if service.is_some() {
                    return Err(PlacerError::MultipleServiceFiles(archive.to_path_buf()));
                }
                service = Some(dest.clone());
            }

            let existing = fs::symlink_metadata(&dest).ok();
            if let Some(meta) = &existing {
                policy.check(&paths::image_path(self.mount_root, &dest))?;
                // Never write through a link or into a directory left at the destination.
                if meta.file_type().is_symlink() || symlink_entry {
                    fs::remove_file(&dest).map_err(PlacerError::file("remove", &dest))?;
                }
            }

            if symlink_entry {
                let mut link_target = String::new();
                entry
                    .read_to_string(&mut link_target)
                    .map_err(PlacerError::file("read symlink entry", &dest))?;
                symlink(&link_target, &dest).map_err(PlacerError::file("create symlink", &dest))?;
                debug!(link = %dest.display(), target = link_target, "created symlink");
                continue;
            }

            let file_mode = mode.map(|m| m & 0o7777).unwrap_or(DEFAULT_FILE_MODE);
            let mut out = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .mode(file_mode)
                .open(&dest)
                .map_err(PlacerError::file("create", &dest))?;
            let written = io::copy(&mut entry, &mut out).map_err(PlacerError::file("write", &dest))?;
            set_mode(&dest, file_mode)?;
            pb.inc(written);
        }

        pb.finish_and_clear();
        Ok(service)
    }
}

fn uncompressed_size(zip: &mut ZipArchive<File>) -> Result<u64, PlacerError> {
    let mut total = 0u64;
    for i in 0..zip.len() {
        total += zip.by_index_raw(i)?.size();
    }
    Ok(total)
}

fn set_mode(path: &Path, mode: u32) -> Result<(), PlacerError> {
    fs::set_permissions(path, Permissions::from_mode(mode & 0o7777))
        .map_err(PlacerError::file("set permissions on", path))
}

/// Catches entries routed outside the target through a symlinked directory.
fn ensure_inside(real_root: &Path, dir: &Path, entry_name: &str) -> Result<(), PlacerError> {
    let real = fs::canonicalize(dir).map_err(PlacerError::file("resolve", dir))?;
    if real.starts_with(real_root) {
        Ok(())
    } else {
        Err(PlacerError::PathEscape {
            path: PathBuf::from(entry_name),
            root: real_root.to_path_buf(),
        })
    }
}

/// Resolves the deepest part of `path` that already exists, so a symlinked
/// ancestor is caught before anything is created through it.
fn ensure_existing_inside(real_root: &Path, path: &Path, entry_name: &str) -> Result<(), PlacerError> {
    match path.ancestors().find(|a| fs::symlink_metadata(a).is_ok()) {
        Some(existing) => ensure_inside(real_root, existing, entry_name),
        None => Ok(()),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
