//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::Write;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// A child process that ran to completion but did not exit successfully.
///
/// This is attached as the root cause of errors returned by [`CommandRunExt`]
/// so callers can inspect the exit code and standard error.
#[derive(Debug, Clone)]
pub struct CommandFailure {
    /// The program that was executed (without arguments).
    pub program: String,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Captured standard error, lossily decoded.
    pub stderr: String,
}

impl CommandFailure {
    /// The last non-empty line of standard error, which is usually the most useful one.
    pub fn last_stderr_line(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
    }
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} exited with code {code}", self.program)?,
            None => write!(f, "{} was terminated by a signal", self.program)?,
        }
        let line = self.last_stderr_line();
        if !line.is_empty() {
            write!(f, ": {line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for CommandFailure {}

fn program_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, inheriting stdout. Standard error is captured
    /// and included in the error on failure.
    fn run_with_cmd_context(&mut self) -> Result<()>;

    /// Execute the child process and return its standard output as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Like [`Self::run_get_string`], but feed `input` to the child's standard input.
    fn run_with_input(&mut self, input: &[u8]) -> Result<String>;

    /// Execute the child process, parsing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

fn finish(cmd: &Command, output: std::process::Output) -> Result<String> {
    if !output.status.success() {
        let failure = CommandFailure {
            program: program_name(cmd),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        return Err(anyhow::Error::new(failure));
    }
    String::from_utf8(output.stdout)
        .with_context(|| format!("decoding output of {}", program_name(cmd)))
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run_with_cmd_context(&mut self) -> Result<()> {
        self.log_debug();
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning {}", program_name(self)))?;
        finish(self, output).map(|_| ())
    }

    fn run_get_string(&mut self) -> Result<String> {
        self.log_debug();
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning {}", program_name(self)))?;
        finish(self, output)
    }

    fn run_with_input(&mut self, input: &[u8]) -> Result<String> {
        self.log_debug();
        let mut child = self
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", program_name(self)))?;
        // Dropping the handle closes the pipe so the child sees EOF.
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input).context("writing to child stdin")?;
        }
        let output = child
            .wait_with_output()
            .with_context(|| format!("waiting for {}", program_name(self)))?;
        finish(self, output)
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let buf = self.run_get_string()?;
        serde_json::from_str(&buf)
            .with_context(|| format!("parsing JSON output of {}", program_name(self)))
    }
}
