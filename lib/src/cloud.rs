//! # Cloud resource API
//!
//! The provisioner only needs a handful of operations from the cloud; they are
//! expressed as the [`CloudApi`] trait and implemented by shelling out to the
//! Azure CLI.

use std::process::Command;

use anyhow::Result;
use camino::Utf8Path;
use devbox_utils::{CommandFailure, CommandRunExt};
use serde::de::DeserializeOwned;

use crate::errors::{DevboxError, FailureKind};

/// Parameters for creating the virtual machine.
#[derive(Debug, Clone)]
pub(crate) struct VmSpec<'a> {
    pub(crate) group: &'a str,
    pub(crate) name: &'a str,
    pub(crate) region: &'a str,
    pub(crate) image: &'a str,
    pub(crate) size: &'a str,
    pub(crate) os_disk_size_gb: u32,
    pub(crate) admin_user: &'a str,
    pub(crate) public_key: &'a Utf8Path,
    pub(crate) public_ip: &'a str,
}

/// Operations against the infrastructure provider. Every call blocks until the
/// provider reports completion.
pub(crate) trait CloudApi {
    fn group_exists(&mut self, group: &str) -> Result<bool>;
    fn create_group(&mut self, group: &str, region: &str) -> Result<()>;
    fn public_ip_exists(&mut self, group: &str, name: &str) -> Result<bool>;
    fn create_public_ip(&mut self, group: &str, name: &str, region: &str) -> Result<()>;
    fn vm_exists(&mut self, group: &str, vm: &str) -> Result<bool>;
    fn create_vm(&mut self, spec: &VmSpec<'_>) -> Result<()>;
    /// Allow inbound TCP on `port` in the VM's network security group.
    fn open_port(&mut self, group: &str, vm: &str, port: u16, priority: u32) -> Result<()>;
    /// Run a shell script as root on the VM through the provider's agent.
    fn run_script(&mut self, group: &str, vm: &str, script: &str) -> Result<String>;
    /// The VM's public IP address; empty if none is assigned yet.
    fn vm_public_ip(&mut self, group: &str, vm: &str) -> Result<String>;
    fn delete_group(&mut self, group: &str) -> Result<()>;
}

/// Printed by scripts run through [`CloudApi::run_script`] once they complete,
/// since the agent reports success regardless of the script's exit code.
const SCRIPT_OK_MARKER: &str = "__devbox_script_ok__";

/// [`CloudApi`] implemented with the `az` command line tool.
#[derive(Debug)]
pub(crate) struct AzCli {
    program: String,
}

impl Default for AzCli {
    fn default() -> Self {
        Self {
            program: "az".into(),
        }
    }
}

impl AzCli {
    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).arg("--only-show-errors");
        cmd
    }

    fn az(&self, operation: &str, args: &[&str]) -> Result<()> {
        self.command(args)
            .run_get_string()
            .map(|_| ())
            .map_err(|e| DevboxError::from_command(operation, e, &|s| s.to_string()))
    }

    fn az_json<T: DeserializeOwned>(&self, operation: &str, args: &[&str]) -> Result<T> {
        self.command(args)
            .args(["--output", "json"])
            .run_and_parse_json()
            .map_err(|e| {
                if e.chain().any(|c| c.is::<CommandFailure>()) {
                    DevboxError::from_command(operation, e, &|s| s.to_string())
                } else {
                    e.context(format!("Unexpected output from az while {operation}"))
                }
            })
    }

    /// Whether a resource called `name` appears in a listing.
    fn listed(&self, operation: &str, args: &[&str], name: &str) -> Result<bool> {
        let mut args = args.to_vec();
        args.extend(["--query", "[].name"]);
        let names: Vec<String> = self.az_json(operation, &args)?;
        Ok(names.iter().any(|n| n == name))
    }
}

/// Wrap a script so that success is detectable from the agent's output.
fn wrap_script(script: &str) -> String {
    format!("set -euo pipefail\n{script}\necho {SCRIPT_OK_MARKER}\n")
}

/// Interpret the message returned by `az vm run-command invoke`.
fn check_script_output(message: &str) -> Result<String> {
    let (stdout, stderr) = match message.split_once("[stderr]") {
        Some((o, e)) => (o, e.trim()),
        None => (message, ""),
    };
    let stdout = stdout
        .split_once("[stdout]")
        .map(|(_, o)| o)
        .unwrap_or(stdout);
    if !stdout.contains(SCRIPT_OK_MARKER) {
        let detail = stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("script did not complete");
        return Err(DevboxError::ExternalCall {
            operation: "remote script".into(),
            kind: FailureKind::Permanent,
            message: detail.trim().to_string(),
        }
        .into());
    }
    Ok(stdout.replace(SCRIPT_OK_MARKER, "").trim().to_string())
}

impl CloudApi for AzCli {
    fn group_exists(&mut self, group: &str) -> Result<bool> {
        self.az_json("checking resource group", &["group", "exists", "--name", group])
    }

    fn create_group(&mut self, group: &str, region: &str) -> Result<()> {
        tracing::info!("Creating resource group {group} in {region}");
        self.az(
            "creating resource group",
            &["group", "create", "--name", group, "--location", region, "--output", "none"],
        )
    }

    fn public_ip_exists(&mut self, group: &str, name: &str) -> Result<bool> {
        self.listed(
            "checking public IP",
            &["network", "public-ip", "list", "--resource-group", group],
            name,
        )
    }

    fn create_public_ip(&mut self, group: &str, name: &str, region: &str) -> Result<()> {
        tracing::info!("Creating static public IP {name}");
        self.az(
            "creating public IP",
            &[
                "network",
                "public-ip",
                "create",
                "--resource-group",
                group,
                "--name",
                name,
                "--location",
                region,
                "--allocation-method",
                "Static",
                "--sku",
                "Standard",
                "--output",
                "none",
            ],
        )
    }

    fn vm_exists(&mut self, group: &str, vm: &str) -> Result<bool> {
        self.listed("checking VM", &["vm", "list", "--resource-group", group], vm)
    }

    fn create_vm(&mut self, spec: &VmSpec<'_>) -> Result<()> {
        tracing::info!("Creating VM {} ({}, {})", spec.name, spec.size, spec.image);
        let disk = spec.os_disk_size_gb.to_string();
        self.az(
            "creating VM",
            &[
                "vm",
                "create",
                "--resource-group",
                spec.group,
                "--name",
                spec.name,
                "--location",
                spec.region,
                "--image",
                spec.image,
                "--size",
                spec.size,
                "--os-disk-size-gb",
                &disk,
                "--admin-username",
                spec.admin_user,
                "--authentication-type",
                "ssh",
                "--ssh-key-values",
                spec.public_key.as_str(),
                "--public-ip-address",
                spec.public_ip,
                "--output",
                "none",
            ],
        )
    }

    fn open_port(&mut self, group: &str, vm: &str, port: u16, priority: u32) -> Result<()> {
        tracing::info!("Opening TCP port {port} on {vm}");
        let port = port.to_string();
        let priority = priority.to_string();
        self.az(
            "opening port",
            &[
                "vm",
                "open-port",
                "--resource-group",
                group,
                "--name",
                vm,
                "--port",
                &port,
                "--priority",
                &priority,
                "--output",
                "none",
            ],
        )
    }

    fn run_script(&mut self, group: &str, vm: &str, script: &str) -> Result<String> {
        let script = wrap_script(script);
        let message: Option<String> = self.az_json(
            "running remote command",
            &[
                "vm",
                "run-command",
                "invoke",
                "--resource-group",
                group,
                "--name",
                vm,
                "--command-id",
                "RunShellScript",
                "--scripts",
                &script,
                "--query",
                "value[0].message",
            ],
        )?;
        check_script_output(message.as_deref().unwrap_or_default())
    }

    fn vm_public_ip(&mut self, group: &str, vm: &str) -> Result<String> {
        let ip: Option<String> = self.az_json(
            "querying public IP",
            &[
                "vm",
                "show",
                "--show-details",
                "--resource-group",
                group,
                "--name",
                vm,
                "--query",
                "publicIps",
            ],
        )?;
        Ok(ip.unwrap_or_default().trim().to_string())
    }

    fn delete_group(&mut self, group: &str) -> Result<()> {
        tracing::info!("Deleting resource group {group}");
        self.az(
            "deleting resource group",
            &["group", "delete", "--name", group, "--yes", "--output", "none"],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_script() {
        let s = wrap_script("echo hi");
        assert!(s.starts_with("set -euo pipefail\n"));
        assert!(s.ends_with(&format!("echo {SCRIPT_OK_MARKER}\n")));
    }

    #[test]
    fn test_check_script_output() {
        let ok = format!(
            "Enable succeeded: \n[stdout]\nrestarted\n{SCRIPT_OK_MARKER}\n\n[stderr]\nwarning\n"
        );
        assert_eq!(check_script_output(&ok).unwrap(), "restarted");

        let failed = "Enable succeeded: \n[stdout]\n\n[stderr]\nsed: can't read /etc/ssh/sshd_config: No such file\n";
        let e = check_script_output(failed).unwrap_err();
        assert!(e.to_string().contains("can't read /etc/ssh/sshd_config"));
        assert!(!crate::errors::is_retriable(&e));
    }

    /// An `AzCli` whose `az` prints `output` and exits with `code`.
    fn fake_az(dir: &Utf8Path, output: &str, code: i32) -> AzCli {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("az");
        let script = format!("#!/bin/sh\ncat <<'EOF'\n{output}\nEOF\nexit {code}\n");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        AzCli {
            program: path.into_string(),
        }
    }

    fn tmpdir() -> (tempfile::TempDir, camino::Utf8PathBuf) {
        let td = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(td.path()).unwrap().to_owned();
        (td, dir)
    }

    #[test]
    fn test_listed_names() {
        let (_td, dir) = tmpdir();
        let mut az = fake_az(&dir, r#"["other-vm", "demo1-vm-t1"]"#, 0);
        assert!(az.vm_exists("demo1-rg-t1", "demo1-vm-t1").unwrap());
        assert!(!az.vm_exists("demo1-rg-t1", "demo1-vm-t2").unwrap());
        let mut az = fake_az(&dir, "[]", 0);
        assert!(!az.public_ip_exists("demo1-rg-t1", "demo1-ip-t1").unwrap());
    }

    #[test]
    fn test_unexpected_output_is_an_error() {
        let (_td, dir) = tmpdir();
        let mut az = fake_az(&dir, "Please run 'az login' to setup account.", 0);
        let e = az.vm_exists("demo1-rg-t1", "demo1-vm-t1").unwrap_err();
        assert!(format!("{e:#}").contains("Unexpected output from az while checking VM"));
        let mut az = fake_az(&dir, "maybe", 0);
        assert!(az.group_exists("demo1-rg-t1").is_err());
    }

    #[test]
    fn test_public_ip_and_failures() {
        let (_td, dir) = tmpdir();
        let mut az = fake_az(&dir, r#""10.0.0.5""#, 0);
        assert_eq!(az.vm_public_ip("g", "vm").unwrap(), "10.0.0.5");
        let mut az = fake_az(&dir, "null", 0);
        assert_eq!(az.vm_public_ip("g", "vm").unwrap(), "");
        let mut az = fake_az(&dir, "", 3);
        let e = az.vm_public_ip("g", "vm").unwrap_err();
        assert!(e.chain().any(|c| matches!(
            c.downcast_ref::<DevboxError>(),
            Some(DevboxError::ExternalCall { .. })
        )));
    }
}
