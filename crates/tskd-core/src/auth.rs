//! Authorization model (§6): operations are *read* or *write*; write
//! operations require `Editor`, reads require only `Viewer`.
//! Authorization failures are a distinct, named error that the RPC
//! boundary maps to a permission-denied response and never leaks data
//! about the underlying resource.

use thiserror::Error;

/// The caller's role, extracted from a request header/token by the RPC
/// transport (§6.1) and passed down to the core operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Viewer,
    Editor,
}

/// Minimum role an operation requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    Read,
    Write,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("permission denied: caller role {caller:?} does not satisfy {required:?}")]
pub struct AuthError {
    pub caller: Role,
    pub required: Requirement,
}

/// Check `caller` against `required`, returning a distinct
/// permission-denied error on failure. Called before any query touches
/// the database (§6.1) so a permission failure never reaches the store.
pub fn authorize(caller: Role, required: Requirement) -> Result<(), AuthError> {
    let satisfied = match required {
        Requirement::Read => true, // any authenticated role may read.
        Requirement::Write => caller == Role::Editor,
    };
    if satisfied {
        Ok(())
    } else {
        Err(AuthError { caller, required })
    }
}
