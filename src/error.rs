use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlacerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to {action} {}: {source}", .path.display())]
    FileIo {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{program}' failed with exit code {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Command '{0}' not found. Is it installed?")]
    CommandNotFound(String),

    #[error("These dependencies are not installed: {}", .0.join(", "))]
    MissingDependencies(Vec<String>),

    #[error("Operation cancelled by user")]
    Cancelled,

    #[error("Prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Filesystem query failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("Image {} does not carry a GPT partition table. Only GPT is supported", .0.display())]
    NotGpt(PathBuf),

    #[error(
        "Not enough space to copy package. Free space on partition: {free_mb}MB, package size: {needed_mb}MB"
    )]
    InsufficientSpace { free_mb: u64, needed_mb: u64 },

    #[error("Path {} escapes {}", .path.display(), .root.display())]
    PathEscape { path: PathBuf, root: PathBuf },

    #[error("Target directory is not within the mounted partition: {0}")]
    TargetOutsideMount(String),

    #[error("Multiple service files found in {}", .0.display())]
    MultipleServiceFiles(PathBuf),

    #[error("Services are enabled for {} but it contains no service file", .0.display())]
    NoServiceFile(PathBuf),

    #[error("File {path} already exists and {reason}")]
    OverwriteRefused { path: String, reason: &'static str },

    #[error("Invalid service file {}: {reason}", .path.display())]
    InvalidUnit { path: PathBuf, reason: String },

    #[error("Invalid service file {}: missing required fields: {}", .path.display(), .fields.join(", "))]
    MissingUnitFields { path: PathBuf, fields: Vec<String> },

    #[error("Invalid service file {}: only services with '{key}={expected}' are supported", .path.display())]
    UnsupportedUnitValue {
        path: PathBuf,
        key: &'static str,
        expected: &'static str,
    },

    #[error("Unable to find executable {executable} within package directory {}", .package_root.display())]
    ExecutableNotFound {
        executable: String,
        package_root: PathBuf,
    },

    #[error("Required {kind} {name} of {unit} is not enabled")]
    DependencyNotEnabled {
        unit: String,
        kind: &'static str,
        name: String,
    },

    #[error("Failed to mount partition {partition} after {attempts} attempts: {message}")]
    MountFailed {
        partition: u32,
        attempts: u32,
        message: String,
    },

    #[error("Mount command timed out")]
    MountTimedOut,
}

impl PlacerError {
    /// Wraps an I/O error with the action and path it happened on.
    pub fn file(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| PlacerError::FileIo {
            action,
            path,
            source,
        }
    }
}
