//! Content-addressed storage backed by the local filesystem: `upload`
//! hashes the selected tree into a digest and copies it into
//! `store_root/<digest>/`, the layout a local `Executor` reads back from
//! when it materializes a task's inputs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::external::{Cas, ExternalError};

pub struct LocalFsCas {
    store_root: PathBuf,
}

impl LocalFsCas {
    pub fn new(store_root: PathBuf) -> Self {
        Self { store_root }
    }
}

#[async_trait]
impl Cas for LocalFsCas {
    async fn upload(
        &self,
        root: &Path,
        paths: &[String],
        excludes: &[String],
    ) -> Result<String, ExternalError> {
        let mut files = Vec::new();
        collect_files(root, root, paths, excludes, &mut files)?;
        files.sort();

        let mut hasher = Sha256::new();
        let mut contents = Vec::with_capacity(files.len());
        for rel in &files {
            let bytes = std::fs::read(root.join(rel))
                .map_err(|e| ExternalError::Transient(format!("failed to read {rel}: {e}")))?;
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(&bytes);
            hasher.update(b"\0");
            contents.push((rel.clone(), bytes));
        }
        let digest = hex::encode(hasher.finalize());

        let dest = self.store_root.join(&digest);
        if !dest.exists() {
            for (rel, bytes) in &contents {
                let out_path = dest.join(rel);
                if let Some(parent) = out_path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        ExternalError::Transient(format!("failed to create {}: {e}", parent.display()))
                    })?;
                }
                std::fs::write(&out_path, bytes)
                    .map_err(|e| ExternalError::Transient(format!("failed to write {rel}: {e}")))?;
            }
        }

        Ok(digest)
    }
}

/// Recursively collects every regular file under `root` that matches at
/// least one entry of `paths` (empty `paths` means "everything") and no
/// entry of `excludes`, as paths relative to `root`.
fn collect_files(
    root: &Path,
    dir: &Path,
    paths: &[String],
    excludes: &[String],
    out: &mut Vec<String>,
) -> Result<(), ExternalError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ExternalError::Transient(format!("failed to read {}: {e}", dir.display())))?;
    for entry in entries {
        let entry =
            entry.map_err(|e| ExternalError::Transient(format!("failed to read dir entry: {e}")))?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .map_err(|e| ExternalError::Transient(format!("failed to stat {}: {e}", path.display())))?;

        if file_type.is_dir() {
            collect_files(root, &path, paths, excludes, out)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .expect("path is always under root during recursion")
            .to_string_lossy()
            .replace('\\', "/");

        if excludes.iter().any(|pat| matches_selector(pat, &rel)) {
            continue;
        }
        if paths.is_empty() || paths.iter().any(|pat| matches_selector(pat, &rel)) {
            out.push(rel);
        }
    }
    Ok(())
}

/// A selector matches a relative path if it names the path exactly, or
/// names a directory the path falls under.
fn matches_selector(selector: &str, rel_path: &str) -> bool {
    let selector = selector.trim_end_matches('/');
    rel_path == selector || rel_path.starts_with(&format!("{selector}/"))
}
