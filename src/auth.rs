//! Authentication engine.
//!
//! Verifies a password against a named system identity, and answers the
//! cheaper question of whether an identity has a usable credential at all
//! (the capability probe). The hash comparison itself is delegated to
//! `pwhash` and treated as opaque; everything here is lookup, probe
//! semantics and identity resolution.

use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::{Uid, User};
use tracing::debug;

/// A system identity a password may be verified against.
///
/// Resolved once at startup and immutable afterwards. The name doubles as
/// the credential reference into the shadow store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Account name.
    pub name: String,
}

/// Outcome of a verification attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// The password matches the identity's credential.
    Success,
    /// A real, wrong password.
    Mismatch,
    /// The credential could not be evaluated at all: missing, locked or
    /// empty entry, or an unreadable store. Distinct from a wrong password.
    Error,
}

/// Errors from identity resolution.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The terminal device whose owner defines the occupant is missing.
    #[error("{path}: {source}")]
    Stat {
        /// The terminal device path.
        path: String,
        /// The underlying errno.
        #[source]
        source: nix::Error,
    },

    /// The user database could not be consulted.
    #[error("user database lookup failed: {0}")]
    Lookup(#[source] nix::Error),

    /// The owning uid has no passwd entry.
    #[error("uid {0} has no passwd entry")]
    UnknownUid(u32),
}

/// Verifies passwords against identities.
///
/// An empty password is a pure **capability probe**: it never yields
/// [`VerifyOutcome::Success`], only distinguishes [`VerifyOutcome::Error`]
/// (no usable credential, the identity can never unlock the session) from
/// viability.
pub trait CredentialVerifier {
    /// Verify `password` against `who`'s credential.
    fn verify(&self, who: &Identity, password: &[u8]) -> VerifyOutcome;

    /// Whether `who` has a usable credential. Grants eligibility, never
    /// access.
    fn probe(&self, who: &Identity) -> bool {
        self.verify(who, b"") != VerifyOutcome::Error
    }
}

/// Verifier backed by a shadow-format credential store.
#[derive(Debug, Clone)]
pub struct ShadowVerifier {
    path: PathBuf,
}

impl ShadowVerifier {
    /// Verifier reading from the given shadow-format file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Hash field for `name`, or `None` when the account has no entry.
    fn lookup(&self, name: &str) -> io::Result<Option<String>> {
        let data = std::fs::read_to_string(&self.path)?;
        for line in data.lines() {
            let mut fields = line.splitn(3, ':');
            if fields.next() == Some(name) {
                return Ok(fields.next().map(ToOwned::to_owned));
            }
        }
        Ok(None)
    }
}

impl CredentialVerifier for ShadowVerifier {
    fn verify(&self, who: &Identity, password: &[u8]) -> VerifyOutcome {
        let hash = match self.lookup(&who.name) {
            Err(e) => {
                debug!(identity = %who.name, error = %e, "credential store unreadable");
                return VerifyOutcome::Error;
            }
            Ok(None) => return VerifyOutcome::Error,
            Ok(Some(hash)) => hash,
        };
        // Locked ("!", "*") and empty hash fields are unusable credentials,
        // not mismatches. An empty hash in particular must never let an
        // empty password through.
        if hash.is_empty() || hash.starts_with('!') || hash.starts_with('*') {
            return VerifyOutcome::Error;
        }
        if password.is_empty() {
            return VerifyOutcome::Mismatch;
        }
        let Ok(password) = std::str::from_utf8(password) else {
            return VerifyOutcome::Mismatch;
        };
        if pwhash::unix::verify(password, &hash) {
            VerifyOutcome::Success
        } else {
            VerifyOutcome::Mismatch
        }
    }
}

/// Resolve the console occupant: the owner of the active terminal's device
/// node.
///
/// # Errors
///
/// Returns an error when the device cannot be inspected or its owner has
/// no passwd entry.
pub fn occupant_of_vt(tty_base: &str, nr: u16) -> Result<Identity, AuthError> {
    let path = format!("{tty_base}{nr}");
    let stat = nix::sys::stat::stat(Path::new(&path)).map_err(|e| AuthError::Stat {
        path: path.clone(),
        source: e,
    })?;
    let uid = Uid::from_raw(stat.st_uid);
    let user = User::from_uid(uid)
        .map_err(AuthError::Lookup)?
        .ok_or(AuthError::UnknownUid(stat.st_uid))?;
    Ok(Identity { name: user.name })
}

/// Resolve the superuser identity, if the system has one.
///
/// # Errors
///
/// Returns an error when the user database cannot be consulted.
pub fn superuser() -> Result<Option<Identity>, AuthError> {
    let user = User::from_name("root").map_err(AuthError::Lookup)?;
    Ok(user.map(|u| Identity { name: u.name }))
}
