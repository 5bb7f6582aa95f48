use std::{io, process::Stdio};

use tracing::{debug, warn};

use crate::error::PlacerError;

// ── Internal helpers ──────────────────────────────────────────────────────────

fn not_found_or_io(program: &str, err: io::Error) -> PlacerError {
    if err.kind() == io::ErrorKind::NotFound {
        PlacerError::CommandNotFound(program.to_string())
    } else {
        PlacerError::Io(err)
    }
}

fn failed(program: &str, code: Option<i32>, stderr: &[u8]) -> PlacerError {
    PlacerError::CommandFailed {
        program: program.to_string(),
        code: code.unwrap_or(-1),
        stderr: String::from_utf8_lossy(stderr).trim().to_string(),
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Runs a command, discarding its output.
/// Use for cleanup operations where partial failure is acceptable (e.g. unmount).
/// Failures are logged, never returned.
pub async fn run_best_effort(program: &str, args: &[String]) {
    debug!(program, ?args, "running best-effort command");
    match tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
    {
        Ok(output) if !output.status.success() => warn!(
            program,
            code = output.status.code().unwrap_or(-1),
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "best-effort command failed"
        ),
        Ok(_) => {}
        Err(e) => warn!(program, error = %e, "best-effort command could not start"),
    }
}

/// Runs a command to completion and returns its stdout. Async so that a
/// long-running, non-forking process can be raced against other work.
pub async fn run_async(program: &str, args: &[String]) -> Result<String, PlacerError> {
    debug!(program, ?args, "running async command");
    let output = tokio::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| not_found_or_io(program, e))?;

    if !output.status.success() {
        return Err(failed(program, output.status.code(), &output.stderr));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Checks that every program resolves in `PATH`; reports all missing ones at once.
pub fn require_programs(programs: &[&str]) -> Result<(), PlacerError> {
    let missing: Vec<String> = programs
        .iter()
        .filter(|p| which::which(p).is_err())
        .map(|p| p.to_string())
        .collect();

    if !missing.is_empty() {
        return Err(PlacerError::MissingDependencies(missing));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|a| a.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_async_returns_stdout() {
        let out = run_async("echo", &args(&["hello"])).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_async_missing_program() {
        let err = run_async("definitely-not-a-real-program-xyz", &[]).await.unwrap_err();
        assert!(matches!(err, PlacerError::CommandNotFound(_)));
    }

    #[tokio::test]
    async fn test_run_async_reports_stderr_and_code() {
        let err = run_async("sh", &args(&["-c", "echo boom >&2; exit 3"])).await.unwrap_err();
        match err {
            PlacerError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_run_best_effort_swallows_failures() {
        run_best_effort("sh", &args(&["-c", "exit 1"])).await;
        run_best_effort("definitely-not-a-real-program-xyz", &[]).await;
    }

    #[test]
    fn test_require_programs_lists_all_missing() {
        let err = require_programs(&["sh", "missing-one-xyz", "missing-two-xyz"]).unwrap_err();
        match err {
            PlacerError::MissingDependencies(m) => {
                assert_eq!(m, vec!["missing-one-xyz", "missing-two-xyz"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
