use anyhow::{Context, Result};
use camino::Utf8PathBuf;

/// The invoking user's home directory, from `$HOME`.
pub(crate) fn home_dir() -> Result<Utf8PathBuf> {
    let home = std::env::var("HOME").context("$HOME is not set")?;
    anyhow::ensure!(!home.is_empty(), "$HOME is empty");
    Ok(Utf8PathBuf::from(home))
}
