use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{error::PlacerError, paths};

const REQUIRED_FIELDS: [&str; 6] = [
    "ExecStart",
    "Type",
    "User",
    "RestartSec",
    "WorkingDirectory",
    "WantedBy",
];

// ── Data types ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOption {
    pub section: String,
    pub name: String,
    pub value: String,
}

/// A unit file as an ordered map keyed by option name.
///
/// A repeated name keeps the position of its first occurrence and the value
/// of its last one. Unit options that legitimately repeat (`Environment=`,
/// several `ExecStartPre=`) collapse to the last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFile {
    options: Vec<UnitOption>,
}

impl UnitFile {
    // ── Parsing ───────────────────────────────────────────────────────────────

    pub fn parse(text: &str) -> Result<Self, String> {
        let mut unit = UnitFile::default();
        let mut section: Option<String> = None;
        let mut pending = String::new();

        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();

            if pending.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with(';')) {
                continue;
            }

            // `\` at end of line joins the next one with a single space.
            if let Some(head) = line.strip_suffix('\\') {
                pending.push_str(head.trim_end());
                pending.push(' ');
                continue;
            }
            pending.push_str(line);
            let logical = std::mem::take(&mut pending);
            let logical = logical.trim();

            if let Some(name) = logical.strip_prefix('[') {
                let name = name
                    .strip_suffix(']')
                    .ok_or_else(|| format!("unterminated section header on line {}", idx + 1))?;
                section = Some(name.trim().to_string());
                continue;
            }

            let (name, value) = logical
                .split_once('=')
                .ok_or_else(|| format!("expected 'Key=Value' on line {}", idx + 1))?;
            let section = section
                .clone()
                .ok_or_else(|| format!("option outside of any section on line {}", idx + 1))?;

            unit.set(UnitOption {
                section,
                name: name.trim().to_string(),
                value: value.trim().to_string(),
            });
        }

        if !pending.is_empty() {
            return Err("file ends inside a continued line".to_string());
        }
        Ok(unit)
    }

    pub fn read(path: &Path) -> Result<Self, PlacerError> {
        let text = fs::read_to_string(path).map_err(PlacerError::file("read service file", path))?;
        Self::parse(&text).map_err(|reason| PlacerError::InvalidUnit {
            path: path.to_path_buf(),
            reason,
        })
    }

    // ── Access ────────────────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<&UnitOption> {
        self.options.iter().find(|o| o.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.get(name).map(|o| o.value.as_str())
    }

    /// Inserts or replaces the option with the same name.
    pub fn set(&mut self, option: UnitOption) {
        match self.options.iter_mut().find(|o| o.name == option.name) {
            Some(existing) => *existing = option,
            None => self.options.push(option),
        }
    }

    // ── Serialisation ─────────────────────────────────────────────────────────

    /// Sections appear in first-seen order with their options in map order,
    /// separated by a blank line.
    pub fn serialize(&self) -> String {
        let mut sections: Vec<&str> = Vec::new();
        for opt in &self.options {
            if !sections.contains(&opt.section.as_str()) {
                sections.push(&opt.section);
            }
        }

        let mut out = String::new();
        for (i, section) in sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", section));
            for opt in self.options.iter().filter(|o| o.section == *section) {
                out.push_str(&format!("{}={}\n", opt.name, opt.value));
            }
        }
        out
    }

    /// Truncates `path`, writes the unit and flushes it to disk.
    pub fn write(&self, path: &Path) -> Result<(), PlacerError> {
        let mut file = File::create(path).map_err(PlacerError::file("open service file for writing", path))?;
        file.write_all(self.serialize().as_bytes())
            .map_err(PlacerError::file("write service file", path))?;
        file.sync_all()
            .map_err(PlacerError::file("flush service file", path))
    }
}

// ── Command-line tokens ───────────────────────────────────────────────────────

/// Splits on whitespace but keeps a double-quoted run as one token, quotes
/// included: `a "b c" d` → `a`, `"b c"`, `d`.
pub fn split_preserving_quotes(input: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut rest = input;

    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let quoted_end = rest
            .strip_prefix('"')
            .and_then(|tail| tail.find('"'))
            .map(|close| close + 2);
        let end = quoted_end.unwrap_or_else(|| rest.find(char::is_whitespace).unwrap_or(rest.len()));

        tokens.push(&rest[..end]);
        rest = &rest[end..];
    }

    tokens
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Checks the required fields and the only supported `Type`/`WantedBy` values.
pub fn validate(unit: &UnitFile, path: &Path) -> Result<(), PlacerError> {
    let missing: Vec<String> = REQUIRED_FIELDS
        .iter()
        .filter(|f| unit.get(f).is_none())
        .map(|f| f.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(PlacerError::MissingUnitFields {
            path: path.to_path_buf(),
            fields: missing,
        });
    }

    for (key, expected) in [("Type", "simple"), ("WantedBy", "multi-user.target")] {
        if unit.value(key) != Some(expected) {
            return Err(PlacerError::UnsupportedUnitValue {
                path: path.to_path_buf(),
                key,
                expected,
            });
        }
    }
    Ok(())
}

// ── Path rewriting ────────────────────────────────────────────────────────────

/// Validates the unit at `unit_path` and relocates its `WorkingDirectory` and
/// `ExecStart` from the development layout to where the package now lives
/// inside the image, then writes it back in place.
///
/// `mount_root` is the host directory the partition is mounted on;
/// `package_root` bounds the executable search.
pub fn rewrite(unit_path: &Path, mount_root: &Path, package_root: &Path) -> Result<UnitFile, PlacerError> {
    info!(unit = %unit_path.display(), "updating paths in service file");
    let mut unit = UnitFile::read(unit_path)?;
    validate(&unit, unit_path)?;

    let invalid = |reason: &str| PlacerError::InvalidUnit {
        path: unit_path.to_path_buf(),
        reason: reason.to_string(),
    };
    let exec_opt = unit.get("ExecStart").cloned().ok_or_else(|| invalid("no ExecStart"))?;
    let wd_opt = unit
        .get("WorkingDirectory")
        .cloned()
        .ok_or_else(|| invalid("no WorkingDirectory"))?;
    let old_wd = wd_opt.value.as_str();

    let tokens = split_preserving_quotes(&exec_opt.value);
    let first = tokens.first().ok_or_else(|| invalid("ExecStart is empty"))?;

    let configured_exe = first.trim_matches(|c: char| c == '\'' || c == '"');
    let exe_suffix = configured_exe.strip_prefix(old_wd).unwrap_or(configured_exe);
    let exe_rel = exe_suffix.trim_start_matches('/');

    let unit_dir = unit_path.parent().unwrap_or(package_root);
    let found = find_executable_dir(unit_dir, exe_rel, package_root)?;

    let new_wd = paths::image_path(mount_root, &found);
    let new_exe = Path::new(&new_wd).join(exe_rel);

    let mut command = vec![new_exe.to_string_lossy().into_owned()];
    command.extend(tokens[1..].iter().map(|t| {
        if old_wd.is_empty() {
            t.to_string()
        } else {
            t.replace(old_wd, &new_wd)
        }
    }));
    let command = command.join(" ");

    info!(from = %exec_opt.value, to = %command, "updated ExecStart");
    unit.set(UnitOption {
        value: command,
        ..exec_opt
    });
    unit.set(UnitOption {
        value: new_wd,
        ..wd_opt
    });

    unit.write(unit_path)?;
    Ok(unit)
}

/// Walks up from `start` towards `package_root`; at every level searches the
/// whole subtree (root first, entries sorted by name) for a directory that
/// contains `exe_rel`. Returns that directory.
fn find_executable_dir(start: &Path, exe_rel: &str, package_root: &Path) -> Result<PathBuf, PlacerError> {
    let not_found = || PlacerError::ExecutableNotFound {
        executable: exe_rel.to_string(),
        package_root: package_root.to_path_buf(),
    };
    if exe_rel.is_empty() {
        return Err(not_found());
    }

    let mut current = Some(start);
    while let Some(dir) = current {
        if !paths::is_within_root(package_root, dir) {
            break;
        }

        let hit = WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| match e {
                Ok(e) => Some(e),
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry during executable search");
                    None
                }
            })
            .filter(|e| e.file_type().is_dir())
            .find(|e| e.path().join(exe_rel).exists());

        if let Some(entry) = hit {
            return Ok(entry.into_path());
        }
        current = dir.parent();
    }

    Err(not_found())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    const VALID: &str = "\
[Unit]
Description=Example app
# a comment
After=network.target

[Service]
Type=simple
User=root
RestartSec=5
WorkingDirectory=/opt/pkg
ExecStart=/opt/pkg/bin/app --flag

[Install]
WantedBy=multi-user.target
";

    fn as_map(unit: &UnitFile) -> BTreeMap<(String, String), String> {
        unit.options
            .iter()
            .map(|o| ((o.section.clone(), o.name.clone()), o.value.clone()))
            .collect()
    }

    #[test]
    fn test_parse_serialize_roundtrip() {
        let unit = UnitFile::parse(VALID).unwrap();
        let again = UnitFile::parse(&unit.serialize()).unwrap();
        assert_eq!(as_map(&unit), as_map(&again));
        assert_eq!(unit.value("After"), Some("network.target"));
        assert_eq!(unit.get("WantedBy").unwrap().section, "Install");
    }

    #[test]
    fn test_last_occurrence_wins() {
        let unit = UnitFile::parse("[Service]\nUser=a\nType=simple\nUser=b\n").unwrap();
        assert_eq!(unit.value("User"), Some("b"));
        assert_eq!(unit.options[0].name, "User");
        assert_eq!(unit.options.len(), 2);
    }

    #[test]
    fn test_line_continuation() {
        let unit = UnitFile::parse("[Service]\nExecStart=/bin/app \\\n    --one \\\n    --two\n").unwrap();
        assert_eq!(unit.value("ExecStart"), Some("/bin/app --one --two"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(UnitFile::parse("User=root\n").is_err());
        assert!(UnitFile::parse("[Service]\njunk\n").is_err());
        assert!(UnitFile::parse("[Service\nUser=root\n").is_err());
    }

    #[test]
    fn test_split_preserving_quotes() {
        assert_eq!(
            split_preserving_quotes(r#"/bin/app "a b"  c --x="y""#),
            vec!["/bin/app", r#""a b""#, "c", r#"--x="y""#]
        );
        assert_eq!(split_preserving_quotes(r#""unterminated x"#), vec![r#""unterminated"#, "x"]);
        assert!(split_preserving_quotes("   ").is_empty());
    }

    #[test]
    fn test_missing_fields_are_all_listed() {
        let unit = UnitFile::parse("[Service]\nType=simple\nUser=root\n").unwrap();
        match validate(&unit, Path::new("x.service")).unwrap_err() {
            PlacerError::MissingUnitFields { fields, .. } => {
                assert_eq!(fields, vec!["ExecStart", "RestartSec", "WorkingDirectory", "WantedBy"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_type_notify_is_rejected() {
        let unit = UnitFile::parse(&VALID.replace("Type=simple", "Type=notify")).unwrap();
        assert!(matches!(
            validate(&unit, Path::new("x.service")),
            Err(PlacerError::UnsupportedUnitValue { key: "Type", .. })
        ));
    }

    #[test]
    fn test_wanted_by_other_target_is_rejected() {
        let unit = UnitFile::parse(&VALID.replace("multi-user.target", "graphical.target")).unwrap();
        assert!(matches!(
            validate(&unit, Path::new("x.service")),
            Err(PlacerError::UnsupportedUnitValue { key: "WantedBy", .. })
        ));
    }

    fn install_exe(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"#!/bin/sh\n").unwrap();
    }

    #[test]
    fn test_rewrite_relocates_exec_and_working_dir() {
        let mount = tempfile::tempdir().unwrap();
        let package = mount.path().join("srv/app2");
        install_exe(&package.join("bin/app"));
        let unit_path = package.join("app.service");
        fs::write(&unit_path, VALID).unwrap();

        rewrite(&unit_path, mount.path(), &package).unwrap();

        let unit = UnitFile::read(&unit_path).unwrap();
        assert_eq!(unit.value("WorkingDirectory"), Some("/srv/app2"));
        assert_eq!(unit.value("ExecStart"), Some("/srv/app2/bin/app --flag"));
        assert_eq!(unit.value("Description"), Some("Example app"));
    }

    #[test]
    fn test_rewrite_searches_sibling_subtrees_and_replaces_arguments() {
        let mount = tempfile::tempdir().unwrap();
        let package = mount.path().join("opt/apps/demo");
        install_exe(&package.join("release/bin/app"));
        let unit_path = package.join("systemd/demo.service");
        fs::create_dir_all(unit_path.parent().unwrap()).unwrap();
        fs::write(
            &unit_path,
            VALID.replace(
                "ExecStart=/opt/pkg/bin/app --flag",
                r#"ExecStart="/opt/pkg/bin/app" --config /opt/pkg/etc/app.toml"#,
            ),
        )
        .unwrap();

        rewrite(&unit_path, mount.path(), &package).unwrap();

        let unit = UnitFile::read(&unit_path).unwrap();
        assert_eq!(unit.value("WorkingDirectory"), Some("/opt/apps/demo/release"));
        assert_eq!(
            unit.value("ExecStart"),
            Some("/opt/apps/demo/release/bin/app --config /opt/apps/demo/release/etc/app.toml")
        );
    }

    #[test]
    fn test_rewrite_fails_when_executable_is_missing() {
        let mount = tempfile::tempdir().unwrap();
        let package = mount.path().join("pkg");
        fs::create_dir_all(&package).unwrap();
        // present outside the package root: must not be found
        install_exe(&mount.path().join("bin/app"));
        let unit_path = package.join("app.service");
        fs::write(&unit_path, VALID).unwrap();

        assert!(matches!(
            rewrite(&unit_path, mount.path(), &package),
            Err(PlacerError::ExecutableNotFound { .. })
        ));
    }
}
