//! Ordered, named steps with declared dependencies, and the runner that
//! executes them while journaling each outcome.

use std::collections::HashSet;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::HumanDuration;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub(crate) enum StepStatus {
    Pending,
    Succeeded,
    /// The step's probe found the desired state already in place.
    Skipped,
    Failed {
        reason: String,
    },
}

impl StepStatus {
    pub(crate) fn is_done(&self) -> bool {
        matches!(self, StepStatus::Succeeded | StepStatus::Skipped)
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Skipped => "skipped",
            StepStatus::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct StepRecord {
    pub(crate) name: String,
    #[serde(flatten)]
    pub(crate) status: StepStatus,
    pub(crate) attempts: u32,
    pub(crate) updated: DateTime<Utc>,
}

/// Per-step outcomes, in the order steps were first recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct StepJournal {
    pub(crate) steps: Vec<StepRecord>,
}

impl StepJournal {
    pub(crate) fn status(&self, name: &str) -> StepStatus {
        self.steps
            .iter()
            .find(|r| r.name == name)
            .map(|r| r.status.clone())
            .unwrap_or(StepStatus::Pending)
    }

    pub(crate) fn is_done(&self, name: &str) -> bool {
        self.status(name).is_done()
    }

    pub(crate) fn record(&mut self, name: &str, status: StepStatus, attempts: u32) {
        let updated = Utc::now();
        match self.steps.iter_mut().find(|r| r.name == name) {
            Some(r) => {
                r.status = status;
                r.attempts = attempts;
                r.updated = updated;
            }
            None => self.steps.push(StepRecord {
                name: name.to_string(),
                status,
                attempts,
                updated,
            }),
        }
    }

    /// The first failed step, if any.
    pub(crate) fn failed(&self) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|r| matches!(r.status, StepStatus::Failed { .. }))
    }
}

/// The state a runner needs from whatever context the steps operate on.
pub(crate) trait StepContext {
    fn journal(&self) -> &StepJournal;
    fn journal_mut(&mut self) -> &mut StepJournal;
    /// Save the journal (and anything else worth keeping) after a step finishes.
    fn persist(&mut self) -> Result<()>;
}

type ActionFn<'a, C> = Box<dyn Fn(&mut C) -> Result<()> + 'a>;
type ProbeFn<'a, C> = Box<dyn Fn(&mut C) -> Result<bool> + 'a>;

pub(crate) struct Step<'a, C> {
    pub(crate) name: String,
    pub(crate) depends_on: Vec<String>,
    satisfied: Option<ProbeFn<'a, C>>,
    action: ActionFn<'a, C>,
    retry: bool,
}

impl<'a, C> Step<'a, C> {
    pub(crate) fn new(
        name: impl Into<String>,
        action: impl Fn(&mut C) -> Result<()> + 'a,
    ) -> Self {
        Self {
            name: name.into(),
            depends_on: Vec::new(),
            satisfied: None,
            action: Box::new(action),
            retry: false,
        }
    }

    /// Declare steps that must have completed before this one.
    pub(crate) fn after<S: AsRef<str>>(mut self, deps: impl IntoIterator<Item = S>) -> Self {
        self.depends_on
            .extend(deps.into_iter().map(|d| d.as_ref().to_string()));
        self
    }

    /// A check-before-act probe; if it returns true the action is not run.
    pub(crate) fn satisfied_if(mut self, probe: impl Fn(&mut C) -> Result<bool> + 'a) -> Self {
        self.satisfied = Some(Box::new(probe));
        self
    }

    /// Retry the action on transient failures.
    pub(crate) fn retry(mut self) -> Self {
        self.retry = true;
        self
    }
}

/// A validated, ordered list of steps.
pub(crate) struct Plan<'a, C> {
    steps: Vec<Step<'a, C>>,
}

impl<'a, C: StepContext> Plan<'a, C> {
    /// Validate that names are unique and every dependency refers to an earlier step.
    pub(crate) fn new(steps: Vec<Step<'a, C>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for step in &steps {
            for dep in &step.depends_on {
                ensure!(
                    seen.contains(dep.as_str()),
                    "Step {} depends on {dep}, which is not an earlier step",
                    step.name
                );
            }
            ensure!(
                seen.insert(step.name.as_str()),
                "Duplicate step name {}",
                step.name
            );
        }
        Ok(Self { steps })
    }

    pub(crate) fn names(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.name.as_str())
    }

    /// Execute every step in order, stopping at the first failure.
    ///
    /// Steps already recorded as done in the journal are not run again, which
    /// makes re-running an interrupted plan a resume.
    pub(crate) fn run(&self, cx: &mut C, retry: &RetryPolicy) -> Result<()> {
        let total = self.steps.len();
        for (i, step) in self.steps.iter().enumerate() {
            let name = step.name.as_str();
            if cx.journal().is_done(name) {
                tracing::info!("[{}/{total}] {name}: already complete", i + 1);
                continue;
            }
            if let Some(dep) = step.depends_on.iter().find(|d| !cx.journal().is_done(d)) {
                bail!("Step {name} cannot run: dependency {dep} has not completed");
            }
            tracing::info!("[{}/{total}] {name}", i + 1);
            let start = Instant::now();

            let satisfied = match &step.satisfied {
                Some(probe) => probe(cx),
                None => Ok(false),
            };
            let (r, attempts) = match satisfied {
                Ok(true) => {
                    tracing::info!("{name}: already in place, skipping");
                    cx.journal_mut().record(name, StepStatus::Skipped, 0);
                    cx.persist()?;
                    continue;
                }
                Ok(false) => {
                    let policy = if step.retry {
                        retry
                    } else {
                        &RetryPolicy::NONE
                    };
                    policy.run(name, || (step.action)(cx))
                }
                Err(e) => (Err(e.context("probing current state")), 0),
            };

            match r {
                Ok(()) => {
                    cx.journal_mut()
                        .record(name, StepStatus::Succeeded, attempts);
                    cx.persist()?;
                    tracing::info!("{name}: done in {}", HumanDuration(start.elapsed()));
                }
                Err(e) => {
                    let reason = format!("{e:#}");
                    tracing::error!("{name}: {reason}");
                    cx.journal_mut()
                        .record(name, StepStatus::Failed { reason }, attempts);
                    if let Err(pe) = cx.persist() {
                        tracing::warn!("Failed to save state after {name} failed: {pe:#}");
                    }
                    return Err(e).with_context(|| format!("Step {name} failed"));
                }
            }
        }
        Ok(())
    }
}
