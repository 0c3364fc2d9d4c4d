//! # Installing the development toolchain on the machine itself
//!
//! Each tool is an [`InstallStep`]: a probe that decides whether the wanted
//! version is already there, optional downloads, the commands that install
//! it, and a post-install check reusing the same probe. Steps run in order
//! through the generic step runner, and progress is journaled to a state
//! file so an interrupted bootstrap picks up where it stopped.

use std::process::Command;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indoc::formatdoc;
use serde::{Deserialize, Serialize};

use crate::cli::BootstrapOpts;
use crate::config::{load_config, BootstrapConfig};
use crate::errors::DevboxError;
use crate::preflight::Requirements;
use crate::retry::RetryPolicy;
use crate::state;
use crate::step::{Plan, Step, StepContext, StepJournal};
use crate::task::Task;

/// The machine being set up.
pub(crate) trait Host {
    /// Run a bash script with root privileges and return its stdout.
    fn run(&mut self, script: &str) -> Result<String>;
    /// Download `url` to `dest`, as the invoking user.
    fn fetch(&mut self, url: &str, dest: &Utf8Path) -> Result<()>;
}

/// The local machine; commands go through `sudo` unless we already are root.
#[derive(Debug)]
pub(crate) struct LocalHost {
    sudo: bool,
}

impl LocalHost {
    pub(crate) fn new() -> Self {
        Self {
            sudo: !rustix::process::getuid().is_root(),
        }
    }
}

impl Host for LocalHost {
    fn run(&mut self, script: &str) -> Result<String> {
        let cmd = if self.sudo {
            let mut c = Command::new("sudo");
            c.args(["-n", "bash", "-s"]);
            c
        } else {
            let mut c = Command::new("bash");
            c.arg("-s");
            c
        };
        let summary = script.lines().next().unwrap_or_default();
        tracing::debug!("+ {script}");
        Task::new_cmd(summary, cmd)
            .quiet()
            .read_with_input(format!("set -euo pipefail\n{script}\n").as_bytes())
    }

    fn fetch(&mut self, url: &str, dest: &Utf8Path) -> Result<()> {
        Task::new(format!("Downloading {url}"), "curl")
            .args(["-fsSL", "--connect-timeout", "20", "-o", dest.as_str(), url])
            .run()
            .map_err(|e| {
                DevboxError::from_command(format!("downloading {url}"), e, &|s| s.to_string())
            })
    }
}

/// A command whose success, and optionally output, shows a tool is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Probe {
    pub(crate) command: String,
    /// Substring the output must contain, typically the pinned version.
    pub(crate) expect: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Download {
    pub(crate) url: String,
    /// Name of the file in the work directory.
    pub(crate) file: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InstallStep {
    pub(crate) name: &'static str,
    pub(crate) depends_on: Vec<&'static str>,
    pub(crate) probe: Probe,
    /// Run first, to remove a previous version.
    pub(crate) remove: Vec<String>,
    pub(crate) downloads: Vec<Download>,
    pub(crate) install: Vec<String>,
    /// Post-install configuration.
    pub(crate) configure: Vec<String>,
}

impl InstallStep {
    fn new(name: &'static str, probe: &str, expect: Option<&str>) -> Self {
        Self {
            name,
            depends_on: Vec::new(),
            probe: Probe {
                command: probe.to_string(),
                expect: expect.map(ToOwned::to_owned),
            },
            remove: Vec::new(),
            downloads: Vec::new(),
            install: Vec::new(),
            configure: Vec::new(),
        }
    }

    fn after(mut self, deps: &[&'static str]) -> Self {
        self.depends_on.extend_from_slice(deps);
        self
    }

    fn remove(mut self, script: impl Into<String>) -> Self {
        self.remove.push(script.into());
        self
    }

    fn download(mut self, url: impl Into<String>, file: &str) -> Self {
        self.downloads.push(Download {
            url: url.into(),
            file: file.to_string(),
        });
        self
    }

    fn install(mut self, script: impl Into<String>) -> Self {
        self.install.push(script.into());
        self
    }

    fn configure(mut self, script: impl Into<String>) -> Self {
        self.configure.push(script.into());
        self
    }
}

fn oras_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "arm64",
        "arm" => "armv7",
        _ => "amd64",
    }
}

const KUBECONFIG: &str = "/etc/rancher/k3s/k3s.yaml";

/// The toolchain, in installation order. Downloads land in `work`.
pub(crate) fn install_steps(cfg: &BootstrapConfig, work: &Utf8Path) -> Vec<InstallStep> {
    let k3s = &cfg.k3s_version;
    let dapr = &cfg.dapr_version;
    let docker = &cfg.docker_version;
    let oras = &cfg.oras_version;
    let arch = oras_arch();
    vec![
        InstallStep::new("azure-cli", "az version --output tsv --query '\"azure-cli\"'", None)
            .download("https://aka.ms/InstallAzureCLIDeb", "install-azure-cli.sh")
            .install(format!("bash {work}/install-azure-cli.sh")),
        InstallStep::new("container-runtime", "docker --version", None)
            .remove("apt-get remove -y docker.io docker-doc docker-compose podman-docker containerd runc || true")
            .download("https://get.docker.com", "get-docker.sh")
            .install(format!("sh {work}/get-docker.sh"))
            .configure("systemctl enable --now docker")
            .configure("chmod 666 /var/run/docker.sock"),
        InstallStep::new("k3s", "k3s --version", Some(k3s.as_str()))
            .remove("if [ -x /usr/local/bin/k3s-uninstall.sh ]; then /usr/local/bin/k3s-uninstall.sh; fi")
            .download("https://get.k3s.io", "install-k3s.sh")
            .install(format!(
                "INSTALL_K3S_VERSION={k3s} sh {work}/install-k3s.sh --write-kubeconfig-mode 644"
            ))
            .configure(format!(
                "printf 'export KUBECONFIG={KUBECONFIG}\\n' > /etc/profile.d/devbox-k3s.sh"
            )),
        InstallStep::new("helm", "helm version --short", None)
            .download(
                "https://raw.githubusercontent.com/helm/helm/main/scripts/get-helm-3",
                "get-helm.sh",
            )
            .install(format!("bash {work}/get-helm.sh")),
        InstallStep::new(
            "dapr",
            &format!("KUBECONFIG={KUBECONFIG} helm list --namespace dapr-system --filter '^dapr$' --output yaml"),
            Some(format!("dapr-{dapr}").as_str()),
        )
        .after(&["k3s", "helm"])
        .install(formatdoc! {"
            export KUBECONFIG={KUBECONFIG}
            helm repo add dapr https://dapr.github.io/helm-charts/ --force-update
            helm repo update
            helm upgrade --install dapr dapr/dapr --version {dapr} --namespace dapr-system --create-namespace --wait
        "}),
        InstallStep::new(
            "docker-engine",
            "docker version --format '{{.Server.Version}}'",
            Some(docker.as_str()),
        )
        .after(&["container-runtime"])
        .install(formatdoc! {r#"
            apt-get update
            v=$(apt-cache madison docker-ce | awk -v want=':{docker}-' 'index($3, want) && !v {{ v = $3 }} END {{ print v }}')
            test -n "$v"
            DEBIAN_FRONTEND=noninteractive apt-get install -y --allow-downgrades "docker-ce=$v" "docker-ce-cli=$v" containerd.io
        "#})
        .configure("apt-mark hold docker-ce docker-ce-cli")
        .configure("systemctl restart docker"),
        InstallStep::new("compose-plugin", "docker compose version", None)
            .after(&["docker-engine"])
            .install("DEBIAN_FRONTEND=noninteractive apt-get install -y docker-compose-plugin"),
        InstallStep::new("jq", "jq --version", None)
            .install("apt-get update && DEBIAN_FRONTEND=noninteractive apt-get install -y jq"),
        InstallStep::new("oras", "oras version", Some(oras.as_str()))
            .download(
                format!("https://github.com/oras-project/oras/releases/download/v{oras}/oras_{oras}_linux_{arch}.tar.gz"),
                "oras.tar.gz",
            )
            .install(format!("tar -xzf {work}/oras.tar.gz -C /usr/local/bin oras"))
            .configure("chmod 755 /usr/local/bin/oras"),
    ]
}

/// Saved bootstrap progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct BootstrapState {
    pub(crate) journal: StepJournal,
}

pub(crate) struct BootstrapCtx<'a> {
    host: &'a mut dyn Host,
    state: BootstrapState,
    state_path: Utf8PathBuf,
    work_dir: Utf8PathBuf,
    retry: RetryPolicy,
}

impl StepContext for BootstrapCtx<'_> {
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

/// Run the probe; `Ok(output)` if it succeeded and matched.
fn check_probe(host: &mut dyn Host, probe: &Probe) -> std::result::Result<String, String> {
    let out = host.run(&probe.command).map_err(|e| format!("{e:#}"))?;
    match &probe.expect {
        Some(want) if !out.contains(want.as_str()) => {
            Err(format!("expected {want}, found {:?}", out.trim()))
        }
        _ => Ok(out),
    }
}

fn already_installed(cx: &mut BootstrapCtx<'_>, step: &InstallStep) -> Result<bool> {
    match check_probe(cx.host, &step.probe) {
        Ok(_) => Ok(true),
        Err(detail) => {
            tracing::debug!("{}: not installed: {detail}", step.name);
            Ok(false)
        }
    }
}

fn install(cx: &mut BootstrapCtx<'_>, step: &InstallStep) -> Result<()> {
    for d in &step.downloads {
        let dest = cx.work_dir.join(&d.file);
        let what = format!("downloading {}", d.url);
        let (r, _) = cx.retry.run(&what, || cx.host.fetch(&d.url, &dest));
        r?;
    }
    for script in step.remove.iter().chain(&step.install).chain(&step.configure) {
        cx.host.run(script)?;
    }
    check_probe(cx.host, &step.probe).map_err(|detail| DevboxError::Postcondition {
        step: step.name.to_string(),
        detail,
    })?;
    Ok(())
}

/// Turn install steps into a runnable plan.
pub(crate) fn plan<'a, 'h>(steps: &'a [InstallStep]) -> Result<Plan<'a, BootstrapCtx<'h>>> {
    Plan::new(
        steps
            .iter()
            .map(|s| {
                Step::new(s.name, move |cx: &mut BootstrapCtx<'h>| install(cx, s))
                    .satisfied_if(move |cx: &mut BootstrapCtx<'h>| already_installed(cx, s))
                    .after(&s.depends_on)
            })
            .collect(),
    )
}

fn requirements(sudo: bool) -> Requirements {
    let mut tools: Vec<String> = ["bash", "curl", "tar", "apt-get"]
        .into_iter()
        .map(ToOwned::to_owned)
        .collect();
    if sudo {
        tools.push("sudo".into());
    }
    Requirements {
        env: Vec::new(),
        tools,
    }
}

/// Check the prerequisites for bootstrapping this machine.
pub(crate) fn check() -> Result<()> {
    requirements(LocalHost::new().sudo).check()
}

fn run_plan<'h>(
    plan: &Plan<'_, BootstrapCtx<'h>>,
    host: &'h mut dyn Host,
    state_path: &Utf8Path,
    work_dir: &Utf8Path,
    retry: &RetryPolicy,
    fresh: bool,
) -> Result<()> {
    let state = if fresh {
        BootstrapState::default()
    } else {
        state::load_optional(state_path)?.unwrap_or_default()
    };
    let mut cx = BootstrapCtx {
        host,
        state,
        state_path: state_path.to_owned(),
        work_dir: work_dir.to_owned(),
        retry: retry.clone(),
    };
    plan.run(&mut cx, retry).context("Running bootstrap")
}

/// Entrypoint for `devbox bootstrap`.
pub(crate) fn run_bootstrap(opts: &BootstrapOpts) -> Result<()> {
    let home = crate::utils::home_dir()?;
    let config = load_config(opts.config.as_deref(), &home)?;
    let work = tempfile::tempdir().context("creating work directory")?;
    let work_dir = Utf8Path::from_path(work.path()).context("non-UTF-8 temporary directory")?;
    let mut host = LocalHost::new();
    let steps = install_steps(&config.bootstrap, work_dir);
    let plan = plan(&steps)?;
    if opts.list {
        for name in plan.names() {
            println!("{name}");
        }
        return Ok(());
    }
    requirements(host.sudo).check()?;
    run_plan(
        &plan,
        &mut host,
        &config.bootstrap.state_file,
        work_dir,
        &config.retry,
        opts.fresh,
    )?;
    tracing::info!("Bootstrap complete");
    Ok(())
}
