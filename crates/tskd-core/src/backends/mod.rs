//! Concrete collaborator implementations for the traits in
//! [`crate::external`]: a git-backed source of truth (read-file,
//! worktree sync, code-review patch fetch), a `git apply`-based patch
//! applier, a filesystem CAS, and a local-subprocess executor.
//!
//! None of these talk to a real Gerrit/Buildbucket-shaped service --
//! they operate entirely against git refs and the local filesystem, the
//! same way `gator-core`'s `isolation`/`harness` adapters wrap `git` and
//! a local subprocess rather than a hosted API. A deployment that needs
//! a different code-review host or a remote execution fleet swaps these
//! out behind the same trait boundary; the scheduler never depends on
//! the concrete type.

mod fs_cas;
mod git_source;
mod patch_apply;
mod process_executor;

pub use fs_cas::LocalFsCas;
pub use git_source::{GitRepoBackend, GitRepoBackendConfig};
pub use patch_apply::GitApplyPatcher;
pub use process_executor::LocalProcessExecutor;
