//! `PatchApplier` backed by `git apply`, run inside a scratch directory
//! holding only the one file being patched.

use std::process::Command;

use tempfile::TempDir;

use crate::external::{ExternalError, PatchApplier};

#[derive(Debug, Default)]
pub struct GitApplyPatcher;

impl GitApplyPatcher {
    pub fn new() -> Self {
        Self
    }
}

impl PatchApplier for GitApplyPatcher {
    fn apply(
        &self,
        original: &[u8],
        unified_diff: &[u8],
        path: &str,
    ) -> Result<Vec<u8>, ExternalError> {
        let scratch = TempDir::new()
            .map_err(|e| ExternalError::Transient(format!("failed to create scratch dir: {e}")))?;

        let init = Command::new("git")
            .args(["init", "-q"])
            .current_dir(scratch.path())
            .output()
            .map_err(|e| ExternalError::Transient(format!("failed to spawn git init: {e}")))?;
        if !init.status.success() {
            return Err(ExternalError::Transient(
                "git init in scratch dir failed".to_string(),
            ));
        }

        let target = scratch.path().join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ExternalError::Transient(format!("failed to create {path}: {e}")))?;
        }
        std::fs::write(&target, original)
            .map_err(|e| ExternalError::Transient(format!("failed to write {path}: {e}")))?;

        let diff_path = scratch.path().join(".patch.diff");
        std::fs::write(&diff_path, unified_diff)
            .map_err(|e| ExternalError::Transient(format!("failed to write patch: {e}")))?;

        let apply = Command::new("git")
            .args([
                "apply",
                "--whitespace=nowarn",
                "-p1",
                diff_path.to_string_lossy().as_ref(),
            ])
            .current_dir(scratch.path())
            .output()
            .map_err(|e| ExternalError::Transient(format!("failed to spawn git apply: {e}")))?;

        if !apply.status.success() {
            let stderr = String::from_utf8_lossy(&apply.stderr).into_owned();
            return Err(ExternalError::PatchRejected(stderr));
        }

        std::fs::read(&target)
            .map_err(|e| ExternalError::Transient(format!("failed to read patched {path}: {e}")))
    }
}
