//! Running commands on the provisioned machine over SSH.
//!
//! Connections go through the generated host file, so the alias, port, user
//! and identity all come from the entry written by [`crate::hostentry`].
//! Scripts are fed to a remote `bash -s` on stdin; they never carry secrets.

use std::path::Path;

use anyhow::{ensure, Result};
use camino::{Utf8Path, Utf8PathBuf};
use devbox_utils::ShellQuoted;
use indoc::formatdoc;

use crate::task::Task;

/// How to reach a provisioned host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SshTarget {
    pub(crate) host_file: Utf8PathBuf,
    pub(crate) alias: String,
}

pub(crate) trait RemoteShell {
    /// Copy a local file to `remote`, relative to the login user's home.
    fn upload(&mut self, target: &SshTarget, local: &Path, remote: &str) -> Result<()>;
    /// Run `script` with `bash` on the remote host, returning its stdout.
    fn exec(&mut self, target: &SshTarget, script: &str) -> Result<String>;
}

const SSH_OPTIONS: &[&str] = &[
    "-o",
    "BatchMode=yes",
    "-o",
    "StrictHostKeyChecking=accept-new",
    "-o",
    "ConnectTimeout=20",
];

/// [`RemoteShell`] implemented with the OpenSSH client tools.
#[derive(Debug, Default)]
pub(crate) struct SshClient;

impl RemoteShell for SshClient {
    fn upload(&mut self, target: &SshTarget, local: &Path, remote: &str) -> Result<()> {
        let dest = format!("{}:{remote}", target.alias);
        Task::new(format!("Copying to {dest}"), "scp")
            .quiet()
            .args(["-q", "-F", target.host_file.as_str()])
            .args(SSH_OPTIONS)
            .args([local.as_os_str()])
            .args([dest])
            .run()
    }

    fn exec(&mut self, target: &SshTarget, script: &str) -> Result<String> {
        let out = Task::new(format!("Running script on {}", target.alias), "ssh")
            .quiet()
            .args(["-F", target.host_file.as_str()])
            .args(SSH_OPTIONS)
            .args([target.alias.as_str(), "bash", "-s"])
            .read_with_input(format!("set -euo pipefail\n{script}").as_bytes())?;
        tracing::debug!("{}: {}", target.alias, out.trim_end());
        Ok(out)
    }
}

/// Move sshd to `port` and restart it. Runs as root.
pub(crate) fn sshd_port_script(port: u16) -> String {
    formatdoc! {r#"
        sed -i -E 's/^#?Port[[:space:]]+[0-9]+$/Port {port}/' /etc/ssh/sshd_config
        grep -qx 'Port {port}' /etc/ssh/sshd_config || echo 'Port {port}' >> /etc/ssh/sshd_config
        systemctl daemon-reload
        if systemctl is-enabled --quiet ssh.socket 2>/dev/null; then
            systemctl restart ssh.socket
        fi
        systemctl restart ssh || systemctl restart sshd
    "#}
}

/// Prepare the directory the credentials file is uploaded into.
pub(crate) fn credentials_dir_script(credentials: &str) -> Result<String> {
    let dir = Utf8Path::new(credentials)
        .parent()
        .filter(|p| !p.as_str().is_empty());
    let Some(dir) = dir else {
        anyhow::bail!("Credentials path {credentials} has no parent directory");
    };
    let dir = ShellQuoted::new(dir.as_str());
    Ok(formatdoc! {r#"
        cd
        mkdir -p {dir}
        chmod 700 {dir}
    "#})
}

/// Lock down the uploaded credentials file and source it from the login profile,
/// without adding the line twice.
pub(crate) fn activate_credentials_script(credentials: &str) -> String {
    let line = format!(r#"[ -f "$HOME/{credentials}" ] && . "$HOME/{credentials}""#);
    let line = ShellQuoted::new(&line);
    let file = ShellQuoted::new(credentials);
    formatdoc! {r#"
        cd
        chmod 600 {file}
        touch .profile
        grep -qxF {line} .profile || printf '%s\n' {line} >> .profile
    "#}
}

/// The checkout directory name for a repository URL.
fn repo_dir_name(url: &str) -> Option<&str> {
    let name = url.trim_end_matches('/').rsplit('/').next()?;
    let name = name.strip_suffix(".git").unwrap_or(name);
    (!name.is_empty() && name != "." && name != "..").then_some(name)
}

/// Clone each repository into `dest_dir` unless a checkout already exists.
///
/// Credentials are supplied by a git credential helper reading the named
/// environment variables from the sourced credentials file, so they never
/// appear in a URL or on a command line.
pub(crate) fn clone_repos_script(
    repos: &[String],
    dest_dir: &str,
    credentials: &str,
    username_env: &str,
    token_env: &str,
) -> Result<String> {
    let helper = format!(
        r#"!f() {{ test "$1" = get || return 0; printf 'username=%s\npassword=%s\n' "${username_env}" "${token_env}"; }}; f"#
    );
    let helper = ShellQuoted::new(&helper);
    let mut script = formatdoc! {r#"
        cd
        . {creds}
        mkdir -p {dest}
        cd {dest}
        clone() {{
            if [ -d "$2/.git" ]; then
                echo "$2 already cloned"
                return 0
            fi
            rm -rf "$2.partial"
            git -c credential.helper= -c credential.helper={helper} clone --quiet "$1" "$2.partial"
            mv "$2.partial" "$2"
        }}
    "#,
        creds = ShellQuoted::new(credentials),
        dest = ShellQuoted::new(dest_dir),
    };
    for url in repos {
        ensure!(
            url.starts_with("https://"),
            "Repository {url} must be an https:// URL"
        );
        let Some(name) = repo_dir_name(url) else {
            anyhow::bail!("Cannot derive a directory name from {url}");
        };
        script.push_str(&format!(
            "clone {} {}\n",
            ShellQuoted::new(url),
            ShellQuoted::new(name)
        ));
    }
    Ok(script)
}

/// Install a copy of this program on the remote host and run its bootstrap command as root.
pub(crate) fn remote_bootstrap_script(binary: &str) -> String {
    let binary = ShellQuoted::new(binary);
    formatdoc! {r#"
        cd
        chmod 755 {binary}
        sudo -n ./{binary} bootstrap
    "#}
}
