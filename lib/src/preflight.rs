//! Precondition checks run before anything is touched.

use anyhow::Result;

use crate::errors::{DevboxError, MissingItem};

/// Required environment variables and executables.
#[derive(Debug, Clone, Default)]
pub(crate) struct Requirements {
    pub(crate) env: Vec<String>,
    pub(crate) tools: Vec<String>,
}

impl Requirements {
    /// Check everything, collecting every violation rather than stopping at the first.
    pub(crate) fn missing_with(
        &self,
        getenv: impl Fn(&str) -> Option<String>,
        has_tool: impl Fn(&str) -> bool,
    ) -> Vec<MissingItem> {
        let env = self
            .env
            .iter()
            .filter(|v| getenv(v).map_or(true, |s| s.is_empty()))
            .map(|v| MissingItem::EnvVar(v.clone()));
        let tools = self
            .tools
            .iter()
            .filter(|t| !has_tool(t))
            .map(|t| MissingItem::Tool(t.clone()));
        env.chain(tools).collect()
    }

    pub(crate) fn check_with(
        &self,
        getenv: impl Fn(&str) -> Option<String>,
        has_tool: impl Fn(&str) -> bool,
    ) -> Result<()> {
        let missing = self.missing_with(getenv, has_tool);
        if missing.is_empty() {
            return Ok(());
        }
        for m in &missing {
            tracing::error!("Missing {m}");
        }
        Err(DevboxError::MissingPrerequisites(missing).into())
    }

    /// Check against the real process environment and `$PATH`.
    pub(crate) fn check(&self) -> Result<()> {
        self.check_with(|v| std::env::var(v).ok(), |t| which::which(t).is_ok())
    }
}
