use std::path::{Component, Path, PathBuf};

use crate::error::PlacerError;

// ── Lexical normalisation ─────────────────────────────────────────────────────

/// Collapses `.` and `..` without touching the filesystem, so it works for
/// destinations that do not exist yet.
///
/// Returns `None` when a `..` would climb above the first component of the
/// path (above `/` for absolute paths, above the start for relative ones).
pub fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out: Vec<Component> = Vec::new();

    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                _ => return None,
            },
            other => out.push(other),
        }
    }

    Some(out.iter().collect())
}

/// True iff `path` is `root` itself or lives somewhere below it.
pub fn is_within_root(root: &Path, path: &Path) -> bool {
    match (normalize(root), normalize(path)) {
        (Some(root), Some(path)) => path.starts_with(root),
        _ => false,
    }
}

/// Joins an untrusted relative `name` (zip entry, configured directory) onto
/// `root` and rejects any result that leaves `root`.
///
/// Leading slashes in `name` are dropped first: an absolute entry name is
/// still interpreted relative to `root`, never relative to the host. A name
/// whose `..` segments climb above `root` at any point is rejected, even if
/// later segments would lead back inside.
pub fn join_within(root: &Path, name: &str) -> Result<PathBuf, PlacerError> {
    let escape = || PlacerError::PathEscape {
        path: PathBuf::from(name),
        root: root.to_path_buf(),
    };

    let rel = normalize(Path::new(name.trim_start_matches('/'))).ok_or_else(escape)?;
    let joined = root.join(rel);
    if !is_within_root(root, &joined) {
        return Err(escape());
    }
    Ok(joined)
}

// ── Image-absolute paths ──────────────────────────────────────────────────────

/// Converts a host path below `mount_root` into its path inside the image,
/// e.g. `/tmp/mount-dir-x/opt/app` → `/opt/app`.
pub fn image_path(mount_root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(mount_root).unwrap_or(path);
    let rel = rel.to_string_lossy();
    format!("/{}", rel.trim_start_matches('/'))
}

/// Canonical spelling used for overwrite lists and target directories:
/// leading `/`, no trailing `/`, no `.` or `..` segments.
pub fn normalize_image_path(path: &str) -> Option<String> {
    let rooted = PathBuf::from("/").join(path.trim_start_matches('/'));
    let normalized = normalize(&rooted)?;
    Some(normalized.to_string_lossy().into_owned())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
