//! # Configuration for `devbox`
//!
//! This module handles the TOML configuration files. Fragments are read from
//! conventional locations and merged field by field; anything not set falls
//! back to built-in defaults.

use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Names a single config file, bypassing the conventional search path.
pub(crate) const CONFIG_ENV: &str = "DEVBOX_CONFIG";
const SYSTEM_CONFIG: &str = "/etc/devbox/config.toml";
const USER_CONFIG: &str = ".config/devbox/config.toml";

/// What to do with already-created cloud resources when provisioning fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum OnFailure {
    /// Keep everything and tell the operator how to clean up.
    #[default]
    Leave,
    /// Delete what this run created, best effort.
    Rollback,
}

/// The toplevel config file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub(crate) struct ConfigToplevel {
    pub(crate) provision: Option<ProvisionSection>,
    pub(crate) secrets: Option<SecretsSection>,
    pub(crate) retry: Option<RetrySection>,
    pub(crate) bootstrap: Option<BootstrapSection>,
}

/// The serialized [provision] section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct ProvisionSection {
    pub(crate) region: Option<String>,
    pub(crate) image: Option<String>,
    pub(crate) size: Option<String>,
    pub(crate) os_disk_size_gb: Option<u32>,
    pub(crate) admin_user: Option<String>,
    pub(crate) ssh_port: Option<u16>,
    pub(crate) nsg_priority: Option<u32>,
    pub(crate) repos: Option<Vec<String>>,
    pub(crate) remote_repo_dir: Option<String>,
    pub(crate) on_failure: Option<OnFailure>,
    pub(crate) bootstrap: Option<bool>,
}

/// The serialized [secrets] section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct SecretsSection {
    pub(crate) username_env: Option<String>,
    pub(crate) token_env: Option<String>,
}

/// The serialized [retry] section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct RetrySection {
    pub(crate) max_attempts: Option<u32>,
    pub(crate) base_delay_ms: Option<u64>,
    pub(crate) max_delay_ms: Option<u64>,
}

/// The serialized [bootstrap] section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct BootstrapSection {
    pub(crate) state_file: Option<Utf8PathBuf>,
    pub(crate) k3s_version: Option<String>,
    pub(crate) dapr_version: Option<String>,
    pub(crate) docker_version: Option<String>,
    pub(crate) oras_version: Option<String>,
}

fn mergeopt<T>(s: &mut Option<T>, o: Option<T>) {
    if let Some(o) = o {
        *s = Some(o);
    }
}

/// Merge `other` into `s`, field by field, using `f` for the section contents.
fn merge_section<T: Default>(s: &mut Option<T>, other: Option<T>, f: impl FnOnce(&mut T, T)) {
    if let Some(other) = other {
        f(s.get_or_insert_with(Default::default), other);
    }
}

impl ConfigToplevel {
    /// Apply any values in other, overriding any existing values in `self`.
    pub(crate) fn merge(&mut self, other: Self) {
        merge_section(&mut self.provision, other.provision, |s, o| {
            mergeopt(&mut s.region, o.region);
            mergeopt(&mut s.image, o.image);
            mergeopt(&mut s.size, o.size);
            mergeopt(&mut s.os_disk_size_gb, o.os_disk_size_gb);
            mergeopt(&mut s.admin_user, o.admin_user);
            mergeopt(&mut s.ssh_port, o.ssh_port);
            mergeopt(&mut s.nsg_priority, o.nsg_priority);
            // A later fragment replaces the repository list wholesale
            mergeopt(&mut s.repos, o.repos);
            mergeopt(&mut s.remote_repo_dir, o.remote_repo_dir);
            mergeopt(&mut s.on_failure, o.on_failure);
            mergeopt(&mut s.bootstrap, o.bootstrap);
        });
        merge_section(&mut self.secrets, other.secrets, |s, o| {
            mergeopt(&mut s.username_env, o.username_env);
            mergeopt(&mut s.token_env, o.token_env);
        });
        merge_section(&mut self.retry, other.retry, |s, o| {
            mergeopt(&mut s.max_attempts, o.max_attempts);
            mergeopt(&mut s.base_delay_ms, o.base_delay_ms);
            mergeopt(&mut s.max_delay_ms, o.max_delay_ms);
        });
        merge_section(&mut self.bootstrap, other.bootstrap, |s, o| {
            mergeopt(&mut s.state_file, o.state_file);
            mergeopt(&mut s.k3s_version, o.k3s_version);
            mergeopt(&mut s.dapr_version, o.dapr_version);
            mergeopt(&mut s.docker_version, o.docker_version);
            mergeopt(&mut s.oras_version, o.oras_version);
        });
    }
}

/// Fully resolved provisioning settings.
#[derive(Debug, Clone)]
pub(crate) struct ProvisionConfig {
    pub(crate) region: String,
    pub(crate) image: String,
    pub(crate) size: String,
    pub(crate) os_disk_size_gb: u32,
    pub(crate) admin_user: String,
    pub(crate) ssh_port: u16,
    pub(crate) nsg_priority: u32,
    pub(crate) repos: Vec<String>,
    pub(crate) remote_repo_dir: String,
    pub(crate) on_failure: OnFailure,
    pub(crate) bootstrap: bool,
}

/// Fully resolved secret source names.
#[derive(Debug, Clone)]
pub(crate) struct SecretsConfig {
    pub(crate) username_env: String,
    pub(crate) token_env: String,
}

/// Fully resolved bootstrap settings.
#[derive(Debug, Clone)]
pub(crate) struct BootstrapConfig {
    pub(crate) state_file: Utf8PathBuf,
    pub(crate) k3s_version: String,
    pub(crate) dapr_version: String,
    pub(crate) docker_version: String,
    pub(crate) oras_version: String,
}

/// Everything read from configuration, with defaults applied.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) provision: ProvisionConfig,
    pub(crate) secrets: SecretsConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) bootstrap: BootstrapConfig,
}

const DEFAULT_IMAGE: &str = "Canonical:0001-com-ubuntu-server-jammy:22_04-lts-gen2:latest";

const DEFAULT_REPOS: &[&str] = &[
    "https://github.com/microsoft/azure-orbital-space-sdk-setup",
    "https://github.com/microsoft/azure-orbital-space-sdk-core",
    "https://github.com/microsoft/azure-orbital-space-sdk-coresvc-registry",
    "https://github.com/microsoft/azure-orbital-space-sdk-hostsvc-link",
];

impl From<ConfigToplevel> for Config {
    fn from(c: ConfigToplevel) -> Self {
        let p = c.provision.unwrap_or_default();
        let s = c.secrets.unwrap_or_default();
        let r = c.retry.unwrap_or_default();
        let b = c.bootstrap.unwrap_or_default();
        Config {
            provision: ProvisionConfig {
                region: p.region.unwrap_or_else(|| "eastus".into()),
                image: p.image.unwrap_or_else(|| DEFAULT_IMAGE.into()),
                size: p.size.unwrap_or_else(|| "Standard_D4s_v3".into()),
                os_disk_size_gb: p.os_disk_size_gb.unwrap_or(128),
                admin_user: p.admin_user.unwrap_or_else(|| "azureuser".into()),
                ssh_port: p.ssh_port.unwrap_or(2222),
                nsg_priority: p.nsg_priority.unwrap_or(900),
                repos: p
                    .repos
                    .unwrap_or_else(|| DEFAULT_REPOS.iter().map(|&r| r.to_owned()).collect()),
                remote_repo_dir: p.remote_repo_dir.unwrap_or_else(|| "repos".into()),
                on_failure: p.on_failure.unwrap_or_default(),
                bootstrap: p.bootstrap.unwrap_or(false),
            },
            secrets: SecretsConfig {
                username_env: s.username_env.unwrap_or_else(|| "GITHUB_USERNAME".into()),
                token_env: s.token_env.unwrap_or_else(|| "GITHUB_TOKEN".into()),
            },
            retry: RetryPolicy {
                max_attempts: r.max_attempts.unwrap_or(3).max(1),
                base_delay: Duration::from_millis(r.base_delay_ms.unwrap_or(2_000)),
                max_delay: Duration::from_millis(r.max_delay_ms.unwrap_or(30_000)),
            },
            bootstrap: BootstrapConfig {
                state_file: b
                    .state_file
                    .unwrap_or_else(|| "/var/lib/devbox/bootstrap.json".into()),
                k3s_version: b.k3s_version.unwrap_or_else(|| "v1.29.4+k3s1".into()),
                dapr_version: b.dapr_version.unwrap_or_else(|| "1.13.2".into()),
                docker_version: b.docker_version.unwrap_or_else(|| "25.0.5".into()),
                oras_version: b.oras_version.unwrap_or_else(|| "1.1.0".into()),
            },
        }
    }
}

fn parse_fragment(path: &Utf8Path, buf: &str) -> Result<ConfigToplevel> {
    let mut unused = std::collections::HashSet::new();
    let de = toml::Deserializer::new(buf);
    let c: ConfigToplevel = serde_ignored::deserialize(de, |path| {
        unused.insert(path.to_string());
    })
    .with_context(|| format!("Parsing {path}"))?;
    for key in unused {
        tracing::warn!("{path}: Unknown key {key}");
    }
    Ok(c)
}

/// Load the configuration.
///
/// If `explicit` (or `$DEVBOX_CONFIG`) names a file, only that file is read and it must
/// exist. Otherwise the system and per-user files are merged in that order, and
/// missing files are skipped.
#[context("Loading configuration")]
pub(crate) fn load_config(explicit: Option<&Utf8Path>, home: &Utf8Path) -> Result<Config> {
    let from_env = std::env::var(CONFIG_ENV).ok().map(Utf8PathBuf::from);
    let explicit = explicit.map(ToOwned::to_owned).or(from_env);
    let mut config = ConfigToplevel::default();
    if let Some(path) = explicit {
        let buf = std::fs::read_to_string(&path).with_context(|| format!("Reading {path}"))?;
        config = parse_fragment(&path, &buf)?;
    } else {
        for path in [Utf8PathBuf::from(SYSTEM_CONFIG), home.join(USER_CONFIG)] {
            let buf = match std::fs::read_to_string(&path) {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).with_context(|| format!("Reading {path}")),
            };
            tracing::debug!("Merging config fragment {path}");
            config.merge(parse_fragment(&path, &buf)?);
        }
    }
    Ok(config.into())
}
