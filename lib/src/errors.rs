//! Classified failures.
//!
//! Most code propagates [`anyhow::Error`]; the variants here are attached at the
//! point where a failure is understood well enough to decide whether it is
//! worth retrying, and are recovered by the step runner via `downcast_ref`.

use std::fmt;

use devbox_utils::CommandFailure;
use thiserror::Error;

/// One missing precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MissingItem {
    /// An environment variable that is unset or empty.
    EnvVar(String),
    /// An executable not found in `$PATH`.
    Tool(String),
}

impl fmt::Display for MissingItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingItem::EnvVar(v) => write!(f, "environment variable {v}"),
            MissingItem::Tool(t) => write!(f, "tool {t}"),
        }
    }
}

/// Whether an external failure is likely to go away by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FailureKind {
    Transient,
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        })
    }
}

#[derive(Debug, Error)]
pub(crate) enum DevboxError {
    #[error("missing prerequisites: {}", join_missing(.0))]
    MissingPrerequisites(Vec<MissingItem>),
    #[error("{operation} failed ({kind}): {message}")]
    ExternalCall {
        operation: String,
        kind: FailureKind,
        message: String,
    },
    #[error("{0} returned an empty result")]
    EmptyResult(String),
    #[error("{step}: post-install check failed: {detail}")]
    Postcondition { step: String, detail: String },
    #[error("refusing to overwrite existing {0}")]
    PathCollision(String),
}

fn join_missing(items: &[MissingItem]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl DevboxError {
    pub(crate) fn is_retriable(&self) -> bool {
        matches!(
            self,
            DevboxError::ExternalCall {
                kind: FailureKind::Transient,
                ..
            }
        )
    }

    /// Convert the failure of an external command into a classified error.
    ///
    /// Errors that did not come from a child exiting non-zero (e.g. the
    /// executable could not be spawned) are passed through untouched.
    pub(crate) fn from_command(
        operation: impl Into<String>,
        e: anyhow::Error,
        redact: &dyn Fn(&str) -> String,
    ) -> anyhow::Error {
        let Some(failure) = e.chain().find_map(|c| c.downcast_ref::<CommandFailure>()) else {
            return e;
        };
        let kind = classify(failure);
        let message = redact(&failure.to_string());
        anyhow::Error::new(DevboxError::ExternalCall {
            operation: operation.into(),
            kind,
            message,
        })
    }
}

/// True if anything in the error chain is a retriable [`DevboxError`].
pub(crate) fn is_retriable(e: &anyhow::Error) -> bool {
    e.chain()
        .filter_map(|c| c.downcast_ref::<DevboxError>())
        .any(DevboxError::is_retriable)
}

/// curl exit codes for resolver, connect, timeout, TLS and transfer failures.
const CURL_NETWORK_EXIT_CODES: &[i32] = &[5, 6, 7, 18, 28, 35, 52, 55, 56];

/// Substrings of cloud CLI / ssh / git errors that indicate a transient condition.
const TRANSIENT_MARKERS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "temporary failure in name resolution",
    "could not resolve host",
    "no route to host",
    "network is unreachable",
    "toomanyrequests",
    "too many requests",
    "429",
    "serviceunavailable",
    "service unavailable",
    "internalservererror",
    "bad gateway",
    "gatewaytimeout",
    "retryableerror",
    "operation was interrupted",
];

pub(crate) fn classify(failure: &CommandFailure) -> FailureKind {
    if failure.program == "curl"
        && failure
            .code
            .is_some_and(|c| CURL_NETWORK_EXIT_CODES.contains(&c))
    {
        return FailureKind::Transient;
    }
    let stderr = failure.stderr.to_ascii_lowercase();
    if TRANSIENT_MARKERS.iter().any(|m| stderr.contains(m)) {
        FailureKind::Transient
    } else {
        FailureKind::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(program: &str, code: i32, stderr: &str) -> CommandFailure {
        CommandFailure {
            program: program.into(),
            code: Some(code),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn test_classify() {
        let transient = [
            failure("az", 1, "ERROR: (TooManyRequests) Rate limit exceeded"),
            failure("az", 1, "ERROR: HTTPSConnectionPool: Read timed out."),
            failure("ssh", 255, "ssh: connect to host 10.0.0.5 port 2222: Connection refused"),
            failure("curl", 6, ""),
            failure("curl", 28, "curl: (28) Operation timed out"),
        ];
        for f in &transient {
            assert_eq!(classify(f), FailureKind::Transient, "{f}");
        }
        let permanent = [
            failure("az", 1, "ERROR: (InvalidTemplateDeployment) image not found"),
            failure("az", 1, "ERROR: (QuotaExceeded) Operation could not be completed"),
            failure("curl", 22, "curl: (22) The requested URL returned error: 404"),
            failure("git", 128, "fatal: Authentication failed"),
        ];
        for f in &permanent {
            assert_eq!(classify(f), FailureKind::Permanent, "{f}");
        }
    }

    #[test]
    fn test_from_command_redacts() {
        let e = anyhow::Error::new(failure("git", 128, "fatal: bad token s3cr3t timed out"));
        let e = DevboxError::from_command("cloning", e, &|s| s.replace("s3cr3t", "***"));
        assert!(is_retriable(&e));
        let msg = format!("{e:#}");
        assert!(msg.contains("***"));
        assert!(!msg.contains("s3cr3t"));
    }

    #[test]
    fn test_missing_display() {
        let e = DevboxError::MissingPrerequisites(vec![
            MissingItem::EnvVar("GITHUB_TOKEN".into()),
            MissingItem::Tool("az".into()),
        ]);
        assert_eq!(
            e.to_string(),
            "missing prerequisites: environment variable GITHUB_TOKEN, tool az"
        );
        assert!(!e.is_retriable());
    }
}
