use std::{ffi::OsStr, process::Command};

use anyhow::{Context, Result};
use devbox_utils::CommandRunExt;

pub(crate) struct Task {
    description: String,
    quiet: bool,
    cmd: Command,
}

impl Task {
    pub(crate) fn new(description: impl AsRef<str>, exe: impl AsRef<str>) -> Self {
        Self::new_cmd(description, Command::new(exe.as_ref()))
    }

    pub(crate) fn new_cmd(description: impl AsRef<str>, cmd: Command) -> Self {
        let description = description.as_ref().to_string();
        Self {
            description,
            quiet: false,
            cmd,
        }
    }

    pub(crate) fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub(crate) fn args<S: AsRef<OsStr>>(mut self, args: impl IntoIterator<Item = S>) -> Self {
        self.cmd.args(args);
        self
    }

    fn announce(&self) {
        if !self.quiet {
            tracing::info!("{}", self.description);
        }
    }

    /// Run the command, returning an error if the command does not exit successfully.
    pub(crate) fn run(self) -> Result<()> {
        self.announce();
        let description = self.description;
        let mut cmd = self.cmd;
        cmd.run_with_cmd_context()
            .with_context(|| format!("Task {description} failed"))
    }

    /// Like [`run()`], but feed `input` on stdin and return stdout.
    pub(crate) fn read_with_input(self, input: &[u8]) -> Result<String> {
        self.announce();
        let description = self.description;
        let mut cmd = self.cmd;
        cmd.run_with_input(input)
            .with_context(|| format!("Task {description} failed"))
    }
}
