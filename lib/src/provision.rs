//! # Provisioning a development VM
//!
//! A run creates, in order: an SSH key pair, a resource group, a static public
//! IP, the VM itself, an inbound rule and sshd configuration for the custom
//! SSH port, a local host entry, the forwarded credentials and the repository
//! checkouts. Optionally it then bootstraps the VM by running this same
//! program on it.
//!
//! Everything the run creates and every step outcome is recorded in a state
//! file under `~/.local/state/devbox`, which is what `--resume`, `status`
//! and `cleanup` work from.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::cli::{CleanupOpts, ProvisionOpts};
use crate::cloud::{AzCli, CloudApi, VmSpec};
use crate::config::{load_config, Config, OnFailure, ProvisionConfig};
use crate::errors::DevboxError;
use crate::hostentry::{self, HostEntry};
use crate::keys::{self, KeyGenerator, SshKeygen};
use crate::naming::NamingContext;
use crate::preflight::Requirements;
use crate::remote::{self, RemoteShell, SshClient, SshTarget};
use crate::retry::RetryPolicy;
use crate::secrets::{RemoteSecret, REMOTE_CREDENTIALS};
use crate::state;
use crate::step::{Plan, Step, StepContext, StepJournal};

const STATE_DIR: &str = ".local/state/devbox";
/// Name of this program's copy in the remote user's home.
const REMOTE_BINARY: &str = "devbox";
const TOOLS: &[&str] = &["az", "git", "ssh-keygen", "ssh", "scp"];

pub(crate) fn state_path(home: &Utf8Path, vm: &str) -> Utf8PathBuf {
    home.join(STATE_DIR).join(format!("{vm}.json"))
}

/// Something a run created and would need to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub(crate) enum CreatedResource {
    KeyPair {
        private: Utf8PathBuf,
        public: Utf8PathBuf,
    },
    ResourceGroup {
        name: String,
    },
    /// Lives in the resource group.
    PublicIp {
        name: String,
    },
    /// Lives in the resource group.
    Vm {
        name: String,
    },
    HostEntry {
        file: Utf8PathBuf,
        alias: String,
    },
}

impl fmt::Display for CreatedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CreatedResource::KeyPair { private, .. } => write!(f, "key pair {private}"),
            CreatedResource::ResourceGroup { name } => write!(f, "resource group {name}"),
            CreatedResource::PublicIp { name } => write!(f, "public IP {name}"),
            CreatedResource::Vm { name } => write!(f, "VM {name}"),
            CreatedResource::HostEntry { file, alias } => write!(f, "host entry {alias} in {file}"),
        }
    }
}

/// Everything persisted about one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct RunState {
    pub(crate) naming: NamingContext,
    pub(crate) admin_user: String,
    pub(crate) ssh_port: u16,
    #[serde(default)]
    pub(crate) ip_address: Option<String>,
    #[serde(default)]
    pub(crate) created: Vec<CreatedResource>,
    #[serde(default)]
    pub(crate) journal: StepJournal,
}

impl RunState {
    pub(crate) fn new(naming: NamingContext, config: &ProvisionConfig) -> Self {
        Self {
            naming,
            admin_user: config.admin_user.clone(),
            ssh_port: config.ssh_port,
            ip_address: None,
            created: Vec::new(),
            journal: StepJournal::default(),
        }
    }

    fn track(&mut self, r: CreatedResource) {
        if !self.created.contains(&r) {
            self.created.push(r);
        }
    }

    fn owns_key_pair(&self) -> bool {
        self.created
            .iter()
            .any(|r| matches!(r, CreatedResource::KeyPair { .. }))
    }

    fn target(&self) -> SshTarget {
        SshTarget {
            host_file: self.naming.host_file.clone(),
            alias: self.naming.vm.clone(),
        }
    }
}

/// The context provisioning steps run against.
pub(crate) struct ProvisionCtx<'a> {
    pub(crate) config: &'a ProvisionConfig,
    pub(crate) secret: &'a RemoteSecret,
    pub(crate) state: RunState,
    pub(crate) state_path: Utf8PathBuf,
    pub(crate) cloud: &'a mut dyn CloudApi,
    pub(crate) remote: &'a mut dyn RemoteShell,
    pub(crate) keygen: &'a mut dyn KeyGenerator,
    /// Copied to the VM and run by the bootstrap step.
    pub(crate) bootstrap_binary: Option<PathBuf>,
}

impl StepContext for ProvisionCtx<'_> {
    fn journal(&self) -> &StepJournal {
        &self.state.journal
    }

    fn journal_mut(&mut self) -> &mut StepJournal {
        &mut self.state.journal
    }

    fn persist(&mut self) -> Result<()> {
        state::write_atomic(&self.state_path, &self.state)
    }
}

/// Key files at this run's unique paths come from an earlier attempt that
/// stopped before recording them; adopt them.
fn key_pair_ready(cx: &mut ProvisionCtx<'_>) -> Result<bool> {
    let n = &cx.state.naming;
    if !keys::key_pair_present(&n.private_key, &n.public_key)? {
        return Ok(false);
    }
    if !cx.state.owns_key_pair() {
        tracing::info!("Adopting existing key pair {}", n.private_key);
    }
    let r = CreatedResource::KeyPair {
        private: n.private_key.clone(),
        public: n.public_key.clone(),
    };
    cx.state.track(r);
    Ok(true)
}

fn create_key_pair(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let n = &cx.state.naming;
    keys::generate_key_pair(cx.keygen, &n.private_key, &n.public_key, &n.vm)?;
    let r = CreatedResource::KeyPair {
        private: n.private_key.clone(),
        public: n.public_key.clone(),
    };
    cx.state.track(r);
    Ok(())
}

/// A group carrying this run's unique name can only be ours, e.g. from a run
/// that stopped before recording it; adopt it.
fn resource_group_ready(cx: &mut ProvisionCtx<'_>) -> Result<bool> {
    let name = cx.state.naming.resource_group.clone();
    let exists = cx.cloud.group_exists(&name)?;
    if exists {
        cx.state.track(CreatedResource::ResourceGroup { name });
    }
    Ok(exists)
}

fn create_resource_group(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let n = &cx.state.naming;
    cx.cloud.create_group(&n.resource_group, &n.region)?;
    let name = n.resource_group.clone();
    cx.state.track(CreatedResource::ResourceGroup { name });
    Ok(())
}

fn public_ip_ready(cx: &mut ProvisionCtx<'_>) -> Result<bool> {
    let n = &cx.state.naming;
    cx.cloud.public_ip_exists(&n.resource_group, &n.public_ip)
}

fn create_public_ip(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let n = &cx.state.naming;
    cx.cloud
        .create_public_ip(&n.resource_group, &n.public_ip, &n.region)?;
    let name = n.public_ip.clone();
    cx.state.track(CreatedResource::PublicIp { name });
    Ok(())
}

fn vm_ready(cx: &mut ProvisionCtx<'_>) -> Result<bool> {
    let n = &cx.state.naming;
    cx.cloud.vm_exists(&n.resource_group, &n.vm)
}

fn create_vm(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let n = &cx.state.naming;
    let c = cx.config;
    let spec = VmSpec {
        group: &n.resource_group,
        name: &n.vm,
        region: &n.region,
        image: &c.image,
        size: &c.size,
        os_disk_size_gb: c.os_disk_size_gb,
        admin_user: &cx.state.admin_user,
        public_key: &n.public_key,
        public_ip: &n.public_ip,
    };
    cx.cloud.create_vm(&spec)?;
    let name = n.vm.clone();
    cx.state.track(CreatedResource::Vm { name });
    Ok(())
}

fn open_ssh_port(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let n = &cx.state.naming;
    cx.cloud.open_port(
        &n.resource_group,
        &n.vm,
        cx.state.ssh_port,
        cx.config.nsg_priority,
    )
}

fn move_sshd_port(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let n = &cx.state.naming;
    let script = remote::sshd_port_script(cx.state.ssh_port);
    cx.cloud.run_script(&n.resource_group, &n.vm, &script)?;
    Ok(())
}

fn write_host_entry(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let n = &cx.state.naming;
    let ip = cx.cloud.vm_public_ip(&n.resource_group, &n.vm)?;
    let ip = ip.trim();
    if ip.is_empty() {
        return Err(DevboxError::EmptyResult(format!("public IP query for {}", n.vm)).into());
    }
    let entry = HostEntry {
        alias: n.vm.clone(),
        hostname: ip.to_string(),
        user: cx.state.admin_user.clone(),
        port: cx.state.ssh_port,
        identity_file: n.private_key.to_string(),
    };
    hostentry::upsert(&n.host_file, &entry)?;
    let r = CreatedResource::HostEntry {
        file: n.host_file.clone(),
        alias: n.vm.clone(),
    };
    cx.state.ip_address = Some(entry.hostname);
    cx.state.track(r);
    Ok(())
}

fn install_credentials(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let secret = cx.secret;
    let target = cx.state.target();
    let classify =
        |e| DevboxError::from_command("installing credentials", e, &|s| secret.redact(s));
    let file = secret.write_transient_file()?;
    cx.remote
        .exec(&target, &remote::credentials_dir_script(REMOTE_CREDENTIALS)?)
        .map_err(classify)?;
    cx.remote
        .upload(&target, file.path(), REMOTE_CREDENTIALS)
        .map_err(classify)?;
    cx.remote
        .exec(&target, &remote::activate_credentials_script(REMOTE_CREDENTIALS))
        .map_err(classify)?;
    tracing::info!("Credentials installed in ~/{REMOTE_CREDENTIALS}");
    Ok(())
}

fn clone_repos(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let secret = cx.secret;
    let script = remote::clone_repos_script(
        &cx.config.repos,
        &cx.config.remote_repo_dir,
        REMOTE_CREDENTIALS,
        secret.username_env(),
        secret.token_env(),
    )?;
    let target = cx.state.target();
    cx.remote
        .exec(&target, &script)
        .map_err(|e| DevboxError::from_command("cloning repositories", e, &|s| secret.redact(s)))?;
    tracing::info!(
        "Cloned {} repositories into ~/{}",
        cx.config.repos.len(),
        cx.config.remote_repo_dir
    );
    Ok(())
}

fn bootstrap_remote(cx: &mut ProvisionCtx<'_>) -> Result<()> {
    let binary = cx
        .bootstrap_binary
        .clone()
        .context("No local binary to copy for bootstrapping")?;
    let target = cx.state.target();
    cx.remote.upload(&target, &binary, REMOTE_BINARY)?;
    cx.remote
        .exec(&target, &remote::remote_bootstrap_script(REMOTE_BINARY))?;
    Ok(())
}

/// The provisioning steps, in order.
pub(crate) fn provision_plan<'a, 'c>(bootstrap: bool) -> Result<Plan<'a, ProvisionCtx<'c>>> {
    let mut steps = vec![
        Step::new("ssh-key", create_key_pair).satisfied_if(key_pair_ready),
        Step::new("resource-group", create_resource_group)
            .satisfied_if(resource_group_ready)
            .retry(),
        Step::new("public-ip", create_public_ip)
            .after(["resource-group"])
            .satisfied_if(public_ip_ready)
            .retry(),
        Step::new("vm", create_vm)
            .after(["ssh-key", "public-ip"])
            .satisfied_if(vm_ready)
            .retry(),
        Step::new("open-ssh-port", open_ssh_port)
            .after(["vm"])
            .retry(),
        Step::new("sshd-port", move_sshd_port)
            .after(["vm"])
            .retry(),
        Step::new("host-entry", write_host_entry)
            .after(["open-ssh-port", "sshd-port"])
            .retry(),
        Step::new("credentials", install_credentials)
            .after(["host-entry"])
            .retry(),
        Step::new("clone-repos", clone_repos)
            .after(["credentials"])
            .retry(),
    ];
    if bootstrap {
        steps.push(Step::new("bootstrap", bootstrap_remote).after(["host-entry"]));
    }
    Plan::new(steps)
}

fn report_leftovers(state: &RunState) {
    let vm = &state.naming.vm;
    if state.created.is_empty() {
        return;
    }
    tracing::warn!("Leaving created resources in place:");
    for r in &state.created {
        tracing::warn!("  {r}");
    }
    tracing::warn!(
        "Resume with `devbox provision --resume {vm}`, or remove them with `devbox cleanup {vm}`"
    );
}

/// Run the provisioning plan, applying the failure policy if a step fails.
pub(crate) fn provision(
    cx: &mut ProvisionCtx<'_>,
    bootstrap: bool,
    retry: &RetryPolicy,
    on_failure: OnFailure,
) -> Result<()> {
    let plan = provision_plan(bootstrap)?;
    cx.persist()?;
    match plan.run(cx, retry) {
        Ok(()) => {
            let n = &cx.state.naming;
            tracing::info!("{} is ready: ssh -F {} {}", n.vm, n.host_file, n.vm);
            Ok(())
        }
        Err(e) => {
            match on_failure {
                OnFailure::Leave => report_leftovers(&cx.state),
                OnFailure::Rollback => {
                    tracing::warn!("Rolling back");
                    if let Err(re) = cleanup(cx.cloud, &mut cx.state, &cx.state_path, retry) {
                        tracing::error!("Rollback incomplete: {re:#}");
                    }
                }
            }
            Err(e)
        }
    }
}

fn remove_resource(
    cloud: &mut dyn CloudApi,
    r: &CreatedResource,
    retry: &RetryPolicy,
) -> Result<()> {
    match r {
        CreatedResource::KeyPair { private, public } => {
            for p in [private, public] {
                match std::fs::remove_file(p) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e).with_context(|| format!("Removing {p}")),
                }
            }
            Ok(())
        }
        CreatedResource::ResourceGroup { name } => {
            let (r, _) = retry.run("deleting resource group", || {
                if cloud.group_exists(name)? {
                    cloud.delete_group(name)?;
                }
                Ok(())
            });
            r
        }
        // Deleted along with the resource group
        CreatedResource::PublicIp { .. } | CreatedResource::Vm { .. } => Ok(()),
        CreatedResource::HostEntry { file, alias } => hostentry::remove(file, alias).map(|_| ()),
    }
}

/// Remove everything recorded in `state`, newest first. Whatever could not be
/// removed stays recorded so cleanup can be retried; once nothing is left the
/// state file itself is deleted.
pub(crate) fn cleanup(
    cloud: &mut dyn CloudApi,
    state: &mut RunState,
    state_path: &Utf8Path,
    retry: &RetryPolicy,
) -> Result<()> {
    let mut remaining = Vec::new();
    for r in std::mem::take(&mut state.created).into_iter().rev() {
        match remove_resource(cloud, &r, retry) {
            Ok(()) => tracing::info!("Removed {r}"),
            Err(e) => {
                tracing::warn!("Failed to remove {r}: {e:#}");
                remaining.push(r);
            }
        }
    }
    remaining.reverse();
    state.created = remaining;
    if state.created.is_empty() {
        match std::fs::remove_file(state_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("Removing {state_path}")),
        }
        return Ok(());
    }
    state::write_atomic(state_path, state)?;
    anyhow::bail!(
        "{} resource(s) could not be removed; rerun `devbox cleanup {}`",
        state.created.len(),
        state.naming.vm
    )
}

pub(crate) fn requirements(config: &Config) -> Requirements {
    Requirements {
        env: vec![
            config.secrets.username_env.clone(),
            config.secrets.token_env.clone(),
        ],
        tools: TOOLS.iter().map(|&t| t.to_owned()).collect(),
    }
}

/// Reload the saved state of `vm` and continue its log file.
fn resume_run(home: &Utf8Path, vm: &str) -> Result<RunState> {
    let path = state_path(home, vm);
    let state: RunState = state::load_optional(&path)?
        .with_context(|| format!("No saved state for {vm} at {path}"))?;
    devbox_utils::attach_log_file(state.naming.log_file.as_std_path(), true)?;
    tracing::info!("Resuming {vm}");
    Ok(state)
}

/// Entrypoint for `devbox provision`.
pub(crate) fn run_provision(opts: &ProvisionOpts) -> Result<()> {
    let home = crate::utils::home_dir()?;
    let resumed = opts
        .resume
        .as_deref()
        .map(|vm| resume_run(&home, vm))
        .transpose()?;
    let mut config = load_config(opts.config.as_deref(), &home)?;
    if let Some(region) = &opts.region {
        config.provision.region = region.clone();
    }
    if let Some(on_failure) = opts.on_failure {
        config.provision.on_failure = on_failure;
    }
    if opts.bootstrap {
        config.provision.bootstrap = true;
    }

    let state = match resumed {
        Some(state) => state,
        None => {
            let naming = NamingContext::generate(&opts.prefix, &config.provision.region, &home)?;
            devbox_utils::attach_log_file(naming.log_file.as_std_path(), false)?;
            RunState::new(naming, &config.provision)
        }
    };
    let naming = &state.naming;
    tracing::info!(
        "Provisioning {} in {} (log: {})",
        naming.vm,
        naming.region,
        naming.log_file
    );
    requirements(&config).check()?;

    let secret = RemoteSecret::from_env(&config.secrets)?;
    let bootstrap_binary = if config.provision.bootstrap {
        Some(std::env::current_exe().context("Locating current executable")?)
    } else {
        None
    };
    let mut cloud = AzCli::default();
    let mut remote = SshClient;
    let mut keygen = SshKeygen;
    let mut cx = ProvisionCtx {
        config: &config.provision,
        secret: &secret,
        state_path: state_path(&home, &state.naming.vm),
        state,
        cloud: &mut cloud,
        remote: &mut remote,
        keygen: &mut keygen,
        bootstrap_binary,
    };
    provision(
        &mut cx,
        config.provision.bootstrap,
        &config.retry,
        config.provision.on_failure,
    )
}

/// Entrypoint for `devbox cleanup`.
pub(crate) fn run_cleanup(opts: &CleanupOpts) -> Result<()> {
    let home = crate::utils::home_dir()?;
    let config = load_config(opts.config.as_deref(), &home)?;
    Requirements {
        env: Vec::new(),
        tools: vec!["az".into()],
    }
    .check()?;
    let path = state_path(&home, &opts.vm);
    let mut state: RunState = state::load_optional(&path)?
        .with_context(|| format!("No saved state for {} at {path}", opts.vm))?;
    cleanup(&mut AzCli::default(), &mut state, &path, &config.retry)?;
    tracing::info!("Removed everything created for {}", opts.vm);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigToplevel, SecretsConfig};
    use crate::errors::FailureKind;
    use crate::step::StepStatus;
    use crate::testutils::{FakeKeygen, InjectedFailure, MockCloud, MockRemote};
    use std::time::Duration;

    const TOKEN: &str = "ghp_t0k3n";

    struct Fixture {
        _td: tempfile::TempDir,
        home: Utf8PathBuf,
        config: Config,
        secret: RemoteSecret,
        cloud: MockCloud,
        remote: MockRemote,
        keygen: FakeKeygen,
    }

    impl Fixture {
        fn new(ip: &str) -> Self {
            let td = tempfile::tempdir().unwrap();
            let home = Utf8Path::from_path(td.path()).unwrap().to_owned();
            let mut config = Config::from(ConfigToplevel::default());
            config.retry = RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            };
            let secrets = SecretsConfig {
                username_env: "GITHUB_USERNAME".into(),
                token_env: "GITHUB_TOKEN".into(),
            };
            Self {
                _td: td,
                home,
                config,
                secret: RemoteSecret::new(&secrets, "octo".into(), TOKEN.into()),
                cloud: MockCloud::with_ip(ip),
                remote: MockRemote::default(),
                keygen: FakeKeygen::default(),
            }
        }

        fn state(&self) -> RunState {
            let naming =
                NamingContext::with_suffix("demo1", "eastus", &self.home, "t1").unwrap();
            RunState::new(naming, &self.config.provision)
        }

        fn run(&mut self, state: RunState, on_failure: OnFailure) -> Result<RunState> {
            let path = state_path(&self.home, &state.naming.vm);
            let mut cx = ProvisionCtx {
                config: &self.config.provision,
                secret: &self.secret,
                state,
                state_path: path,
                cloud: &mut self.cloud,
                remote: &mut self.remote,
                keygen: &mut self.keygen,
                bootstrap_binary: None,
            };
            let r = provision(&mut cx, false, &self.config.retry, on_failure);
            r.map(|()| cx.state)
        }

        fn saved(&self) -> Option<RunState> {
            state::load_optional(&state_path(&self.home, "demo1-vm-t1")).unwrap()
        }
    }

    #[test]
    fn test_end_to_end() {
        let mut f = Fixture::new("10.0.0.5");
        let st = f.run(f.state(), OnFailure::Leave).unwrap();

        let hosts = std::fs::read_to_string(f.home.join(".ssh/demo1_hosts")).unwrap();
        assert!(hosts.contains("Host demo1-vm-t1\n"));
        assert!(hosts.contains("  Hostname 10.0.0.5\n"));
        assert!(hosts.contains("  Port 2222\n"));
        assert!(hosts.contains(&format!(
            "  IdentityFile {}/.ssh/demo1-key-t1\n",
            f.home
        )));
        assert_eq!(st.ip_address.as_deref(), Some("10.0.0.5"));

        assert_eq!(f.keygen.calls, 1);
        assert_eq!(f.cloud.count("create_group"), 1);
        assert_eq!(f.cloud.count("create_vm"), 1);
        assert!(f.cloud.scripts[0].contains("Port 2222"));

        // The secret travels only in the uploaded file
        assert_eq!(f.remote.uploads.len(), 1);
        assert_eq!(f.remote.uploads[0].0, REMOTE_CREDENTIALS);
        assert!(f.remote.uploads[0].1.contains(TOKEN));
        assert!(f.remote.scripts.iter().all(|s| !s.contains(TOKEN)));
        assert!(f.remote.scripts.iter().any(|s| s.contains("azure-orbital-space-sdk-core")));

        let saved = f.saved().unwrap();
        assert_eq!(saved, st);
        let names: Vec<&str> = saved.journal.steps.iter().map(|r| r.name.as_str()).collect();
        similar_asserts::assert_eq!(
            names,
            vec![
                "ssh-key",
                "resource-group",
                "public-ip",
                "vm",
                "open-ssh-port",
                "sshd-port",
                "host-entry",
                "credentials",
                "clone-repos"
            ]
        );
        assert!(saved.journal.steps.iter().all(|r| r.status == StepStatus::Succeeded));
    }

    #[test]
    fn test_failure_stops_later_steps() {
        let mut f = Fixture::new("10.0.0.5");
        f.cloud
            .failures
            .push(InjectedFailure::new("create_vm", FailureKind::Permanent, 1));
        let e = f.run(f.state(), OnFailure::Leave).unwrap_err();
        assert_eq!(e.to_string(), "Step vm failed");
        assert_eq!(f.cloud.calls.last().unwrap(), "create_vm");
        assert_eq!(f.cloud.count("create_vm"), 1);
        assert!(!f.home.join(".ssh/demo1_hosts").exists());
        assert!(f.remote.scripts.is_empty());

        let saved = f.saved().unwrap();
        assert!(matches!(saved.journal.status("vm"), StepStatus::Failed { .. }));
        assert_eq!(saved.journal.status("open-ssh-port"), StepStatus::Pending);
        // Left in place for inspection or resume
        assert_eq!(saved.created.len(), 3);
        assert!(f.cloud.groups.contains("demo1-rg-t1"));
        assert!(f.home.join(".ssh/demo1-key-t1").exists());
    }

    #[test]
    fn test_rollback() {
        let mut f = Fixture::new("10.0.0.5");
        f.cloud
            .failures
            .push(InjectedFailure::new("run_script", FailureKind::Permanent, 1));
        f.run(f.state(), OnFailure::Rollback).unwrap_err();
        assert_eq!(f.cloud.count("delete_group"), 1);
        assert!(f.cloud.groups.is_empty());
        assert!(!f.home.join(".ssh/demo1-key-t1").exists());
        assert!(!f.home.join(".ssh/demo1-key-t1.pub").exists());
        assert!(f.saved().is_none());
    }

    #[test]
    fn test_empty_ip() {
        let mut f = Fixture::new("");
        let e = f.run(f.state(), OnFailure::Leave).unwrap_err();
        let root = e.root_cause().downcast_ref::<DevboxError>();
        assert!(matches!(root, Some(DevboxError::EmptyResult(_))));
        // Not retried
        assert_eq!(f.cloud.count("vm_public_ip"), 1);
        assert!(!f.home.join(".ssh/demo1_hosts").exists());
        assert!(f.remote.uploads.is_empty());
    }

    #[test]
    fn test_transient_retried() {
        let mut f = Fixture::new("10.0.0.5");
        f.cloud
            .failures
            .push(InjectedFailure::new("create_public_ip", FailureKind::Transient, 2));
        let st = f.run(f.state(), OnFailure::Leave).unwrap();
        let rec = st.journal.steps.iter().find(|r| r.name == "public-ip").unwrap();
        assert_eq!(rec.attempts, 3);
        assert_eq!(f.cloud.count("create_public_ip"), 3);
    }

    #[test]
    fn test_resume() {
        let mut f = Fixture::new("10.0.0.5");
        f.remote
            .failures
            .push(InjectedFailure::new("exec", FailureKind::Permanent, 1));
        f.run(f.state(), OnFailure::Leave).unwrap_err();
        let saved = f.saved().unwrap();
        assert!(matches!(saved.journal.status("credentials"), StepStatus::Failed { .. }));

        let st = f.run(saved, OnFailure::Leave).unwrap();
        assert!(st.journal.steps.iter().all(|r| r.status.is_done()));
        assert_eq!(f.keygen.calls, 1);
        assert_eq!(f.cloud.count("create_group"), 1);
        assert_eq!(f.cloud.count("create_vm"), 1);
        let hosts = std::fs::read_to_string(f.home.join(".ssh/demo1_hosts")).unwrap();
        assert_eq!(hosts.matches("Host ").count(), 1);
    }

    #[test]
    fn test_resume_keeps_log() {
        let f = Fixture::new("10.0.0.5");
        let st = f.state();
        state::write_atomic(&state_path(&f.home, &st.naming.vm), &st).unwrap();
        std::fs::write(&st.naming.log_file, "ERROR Step vm failed\n").unwrap();
        let resumed = resume_run(&f.home, &st.naming.vm).unwrap();
        assert_eq!(resumed.naming, st.naming);
        assert_eq!(
            std::fs::read_to_string(&st.naming.log_file).unwrap(),
            "ERROR Step vm failed\n"
        );
        assert!(resume_run(&f.home, "demo1-vm-missing").is_err());
    }

    #[test]
    fn test_resume_adopts_unrecorded_keys() {
        let mut f = Fixture::new("10.0.0.5");
        let st = f.state();
        // Interrupted after ssh-keygen, before the journal was saved
        keys::generate_key_pair(
            &mut f.keygen,
            &st.naming.private_key,
            &st.naming.public_key,
            &st.naming.vm,
        )
        .unwrap();
        assert!(f.saved().is_none());

        let st = f.run(st, OnFailure::Leave).unwrap();
        assert_eq!(f.keygen.calls, 1);
        assert_eq!(st.journal.status("ssh-key"), StepStatus::Skipped);
        assert!(st.created.contains(&CreatedResource::KeyPair {
            private: f.home.join(".ssh/demo1-key-t1"),
            public: f.home.join(".ssh/demo1-key-t1.pub"),
        }));
        assert_eq!(f.cloud.count("create_vm"), 1);
    }

    #[test]
    fn test_cleanup_partial_failure() {
        let mut f = Fixture::new("10.0.0.5");
        let st = f.run(f.state(), OnFailure::Leave).unwrap();
        let mut st = st;
        let path = state_path(&f.home, &st.naming.vm);
        f.cloud
            .failures
            .push(InjectedFailure::new("delete_group", FailureKind::Permanent, 1));
        assert!(cleanup(&mut f.cloud, &mut st, &path, &f.config.retry).is_err());
        assert_eq!(
            st.created,
            vec![CreatedResource::ResourceGroup {
                name: "demo1-rg-t1".into()
            }]
        );
        assert!(!f.home.join(".ssh/demo1-key-t1").exists());
        let hosts = std::fs::read_to_string(f.home.join(".ssh/demo1_hosts")).unwrap();
        assert!(!hosts.contains("demo1-vm-t1"));
        cleanup(&mut f.cloud, &mut st, &path, &f.config.retry).unwrap();
        assert!(st.created.is_empty());
        assert!(!path.exists());
    }
}
