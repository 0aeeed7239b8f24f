//! Pre-update check runner.
//!
//! Executes an externally supplied validator as a gate before
//! cycling a container. The path is validated before execution;
//! the run is bounded by the configured deadline; all output is
//! captured for the operation record.

use std::time::Duration;

use thiserror::Error;

/// Characters never allowed in a check script path.
const FORBIDDEN: &[char] = &[';', '&', '|', '`', '$', '\n'];

#[derive(Debug, Error)]
pub enum PrecheckError {
  #[error("invalid pre-update check path: {0}")]
  Invalid(String),
  #[error("pre-update check exited {code}")]
  Failed {
    code: i32,
    stdout: String,
    stderr: String,
  },
  #[error("pre-update check timed out")]
  Timeout,
  #[error("pre-update check failed to spawn: {0}")]
  Spawn(String),
}

#[derive(Debug, Clone, Default)]
pub struct PrecheckOutput {
  pub stdout: String,
  pub stderr: String,
}

/// Reject before execution: path must be non-empty, absolute, and
/// free of shell metacharacters. The script is executed directly,
/// never through a shell.
pub fn validate_path(path: &str) -> Result<(), PrecheckError> {
  if path.trim().is_empty() {
    return Err(PrecheckError::Invalid(String::from(
      "path is empty",
    )));
  }
  if !path.starts_with('/') {
    return Err(PrecheckError::Invalid(format!(
      "path must be absolute: {path}"
    )));
  }
  if let Some(bad) = path.chars().find(|c| FORBIDDEN.contains(c)) {
    return Err(PrecheckError::Invalid(format!(
      "path contains forbidden character {bad:?}"
    )));
  }
  Ok(())
}

/// Run the check. Exit 0 passes; anything else fails with the
/// captured output preserved.
pub async fn run_precheck(
  path: &str,
  container_name: &str,
  timeout: Duration,
) -> Result<PrecheckOutput, PrecheckError> {
  validate_path(path)?;
  let child = tokio::process::Command::new(path)
    .arg(container_name)
    .output();
  let output = tokio::time::timeout(timeout, child)
    .await
    .map_err(|_| PrecheckError::Timeout)?
    .map_err(|e| PrecheckError::Spawn(e.to_string()))?;
  let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
  let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
  if output.status.success() {
    Ok(PrecheckOutput { stdout, stderr })
  } else {
    Err(PrecheckError::Failed {
      code: output.status.code().unwrap_or(-1),
      stdout,
      stderr,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rejects_invalid_paths() {
    assert!(validate_path("").is_err());
    assert!(validate_path("   ").is_err());
    assert!(validate_path("relative/check.sh").is_err());
    assert!(validate_path("/opt/check.sh; rm -rf /").is_err());
    assert!(validate_path("/opt/check$(x).sh").is_err());
    assert!(validate_path("/opt/a|b").is_err());
    assert!(validate_path("/opt/`cmd`").is_err());
    assert!(validate_path("/opt/checks/web.sh").is_ok());
  }

  #[tokio::test]
  async fn passes_on_exit_zero() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("ok.sh");
    write_script(&script, "#!/bin/sh\necho ready\nexit 0\n");
    let output = run_precheck(
      script.to_str().unwrap(),
      "web",
      Duration::from_secs(5),
    )
    .await
    .unwrap();
    assert!(output.stdout.contains("ready"));
  }

  #[tokio::test]
  async fn fails_with_captured_output() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("fail.sh");
    write_script(
      &script,
      "#!/bin/sh\necho not ready >&2\nexit 3\n",
    );
    let err = run_precheck(
      script.to_str().unwrap(),
      "web",
      Duration::from_secs(5),
    )
    .await
    .unwrap_err();
    match err {
      PrecheckError::Failed { code, stderr, .. } => {
        assert_eq!(code, 3);
        assert!(stderr.contains("not ready"));
      }
      other => panic!("unexpected error: {other:?}"),
    }
  }

  #[tokio::test]
  async fn times_out() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("slow.sh");
    write_script(&script, "#!/bin/sh\nsleep 5\n");
    let err = run_precheck(
      script.to_str().unwrap(),
      "web",
      Duration::from_millis(100),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, PrecheckError::Timeout));
  }

  fn write_script(path: &std::path::Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, contents).unwrap();
    std::fs::set_permissions(
      path,
      std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();
  }
}
