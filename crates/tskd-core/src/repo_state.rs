//! `RepoState`: a point in version-control space at which the pipeline is
//! evaluated, plus its canonical content-addressed digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A code-review patch layered on top of a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Patch {
    pub issue: String,
    pub patchset: String,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_repo: Option<String>,
}

/// `{repo, revision, patch?}`. Equality is structural.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoState {
    pub repo: String,
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<Patch>,
}

impl RepoState {
    pub fn new(repo: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            revision: revision.into(),
            patch: None,
        }
    }

    pub fn with_patch(mut self, patch: Patch) -> Self {
        self.patch = Some(patch);
        self
    }

    /// A `RepoState` is a try job iff it carries a patch with a non-empty
    /// issue.
    pub fn is_try_job(&self) -> bool {
        self.patch.as_ref().is_some_and(|p| !p.issue.is_empty())
    }

    /// Canonical content-addressed digest: a SHA-256 hex digest over a
    /// deterministic serialization of the fields.
    ///
    /// Two structurally-equal `RepoState`s always produce the same digest.
    /// The computation lives here, not inside the Cacher, so other
    /// components (telemetry, log correlation) can reuse it without
    /// depending on `tskd-core`'s cache internals.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"repo=");
        hasher.update(self.repo.as_bytes());
        hasher.update(b"\x00revision=");
        hasher.update(self.revision.as_bytes());
        match &self.patch {
            Some(patch) => {
                hasher.update(b"\x00issue=");
                hasher.update(patch.issue.as_bytes());
                hasher.update(b"\x00patchset=");
                hasher.update(patch.patchset.as_bytes());
                hasher.update(b"\x00server=");
                hasher.update(patch.server.as_bytes());
                hasher.update(b"\x00patch_repo=");
                hasher.update(patch.patch_repo.as_deref().unwrap_or("").as_bytes());
            }
            None => {
                hasher.update(b"\x00nopatch");
            }
        }
        hex::encode(hasher.finalize())
    }
}
