//! SSH key pair generation.

use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;

use crate::errors::DevboxError;
use crate::task::Task;

/// Creates a private/public key pair on the local machine.
pub(crate) trait KeyGenerator {
    /// Write `private` and `private.pub`.
    fn generate(&mut self, private: &Utf8Path, comment: &str) -> Result<()>;
}

/// Key generation via `ssh-keygen`.
#[derive(Debug, Default)]
pub(crate) struct SshKeygen;

impl KeyGenerator for SshKeygen {
    fn generate(&mut self, private: &Utf8Path, comment: &str) -> Result<()> {
        if let Some(parent) = private.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("Creating {parent}"))?;
        }
        Task::new(format!("Generating SSH key {private}"), "ssh-keygen")
            .args(["-q", "-t", "rsa", "-b", "4096", "-N", "", "-C", comment, "-f"])
            .args([private.as_str()])
            .run()
    }
}

/// Generate a key pair at the given paths, refusing to clobber existing files,
/// then check that the public half parses as an OpenSSH key.
#[context("Generating key pair {private}")]
pub(crate) fn generate_key_pair(
    keygen: &mut dyn KeyGenerator,
    private: &Utf8Path,
    public: &Utf8Path,
    comment: &str,
) -> Result<()> {
    for p in [private, public] {
        if p.try_exists().with_context(|| format!("Checking {p}"))? {
            return Err(DevboxError::PathCollision(p.to_string()).into());
        }
    }
    keygen.generate(private, comment)?;
    validate_public_key(public)?;
    Ok(())
}

/// Both halves exist and the public key is well-formed.
pub(crate) fn key_pair_present(private: &Utf8Path, public: &Utf8Path) -> Result<bool> {
    if !(private.try_exists()? && public.try_exists()?) {
        return Ok(false);
    }
    validate_public_key(public)?;
    Ok(true)
}

#[context("Validating public key {public}")]
pub(crate) fn validate_public_key(public: &Utf8Path) -> Result<openssh_keys::PublicKey> {
    let buf = std::fs::read_to_string(public)?;
    let key = openssh_keys::PublicKey::parse(buf.trim())?;
    tracing::debug!("Public key {public}: {} {}", key.keytype(), key.fingerprint());
    Ok(key)
}
