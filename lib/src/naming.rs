//! Names and local paths derived for one provisioning run.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{ensure, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// The prefix used when none is given on the command line.
pub(crate) const DEFAULT_PREFIX: &str = "space-sdk-demo";
/// Longest accepted prefix; keeps every derived name within cloud name limits.
pub(crate) const MAX_PREFIX_LEN: usize = 16;

/// Last suffix handed out by this process, in milliseconds since the epoch.
static LAST_SUFFIX_MS: AtomicU64 = AtomicU64::new(0);

/// Return a time-based value that is strictly greater than any previous one
/// handed out by this process.
fn next_suffix_millis(now_ms: u64) -> u64 {
    let mut prev = LAST_SUFFIX_MS.load(Ordering::SeqCst);
    loop {
        let next = now_ms.max(prev + 1);
        match LAST_SUFFIX_MS.compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => return next,
            Err(p) => prev = p,
        }
    }
}

/// Lowercase base36, which is valid in every resource name we generate.
fn base36(mut v: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if v == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while v > 0 {
        out.push(DIGITS[(v % 36) as usize]);
        v /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

pub(crate) fn validate_prefix(prefix: &str) -> Result<()> {
    ensure!(
        !prefix.is_empty() && prefix.len() <= MAX_PREFIX_LEN,
        "Prefix {prefix:?} must be between 1 and {MAX_PREFIX_LEN} characters"
    );
    ensure!(
        prefix.starts_with(|c: char| c.is_ascii_lowercase()),
        "Prefix {prefix:?} must start with a lowercase letter"
    );
    ensure!(
        prefix
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
        "Prefix {prefix:?} may only contain lowercase letters, digits and '-'"
    );
    Ok(())
}

/// Every name and path a run needs, computed once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct NamingContext {
    pub(crate) prefix: String,
    pub(crate) region: String,
    pub(crate) suffix: String,
    pub(crate) resource_group: String,
    pub(crate) public_ip: String,
    pub(crate) vm: String,
    pub(crate) key_name: String,
    pub(crate) private_key: Utf8PathBuf,
    pub(crate) public_key: Utf8PathBuf,
    pub(crate) host_file: Utf8PathBuf,
    pub(crate) log_file: Utf8PathBuf,
}

impl NamingContext {
    /// Generate names using the current time as the suffix source.
    pub(crate) fn generate(prefix: &str, region: &str, home: &Utf8Path) -> Result<Self> {
        let now_ms = u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or_default();
        Self::with_suffix(prefix, region, home, &base36(next_suffix_millis(now_ms)))
    }

    pub(crate) fn with_suffix(
        prefix: &str,
        region: &str,
        home: &Utf8Path,
        suffix: &str,
    ) -> Result<Self> {
        validate_prefix(prefix)?;
        ensure!(!region.is_empty(), "Region must not be empty");
        let key_name = format!("{prefix}-key-{suffix}");
        let ssh_dir = home.join(".ssh");
        Ok(Self {
            prefix: prefix.to_string(),
            region: region.to_string(),
            suffix: suffix.to_string(),
            resource_group: format!("{prefix}-rg-{suffix}"),
            public_ip: format!("{prefix}-ip-{suffix}"),
            vm: format!("{prefix}-vm-{suffix}"),
            private_key: ssh_dir.join(&key_name),
            public_key: ssh_dir.join(format!("{key_name}.pub")),
            host_file: ssh_dir.join(format!("{prefix}_hosts")),
            log_file: home.join(format!("{prefix}-{suffix}.log")),
            key_name,
        })
    }
}
