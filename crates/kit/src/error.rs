//! Failure kinds of a bootstrap run.
//!
//! Every kind terminates the run immediately and leaves the completion
//! marker unset. Internally these travel as the root cause of a
//! [`color_eyre::Report`]; `main` downcasts to pick the process exit code.

use std::time::Duration;

/// A typed protocol failure.
#[derive(Debug, thiserror::Error)]
pub(crate) enum BootstrapError {
    #[error("console prompt {prompt:?} not seen within {}s", elapsed.as_secs())]
    BootTimeout { prompt: String, elapsed: Duration },

    #[error("no result marker received within {}s", elapsed.as_secs())]
    TransferTimeout { elapsed: Duration },

    #[error("{}", render_remote_failure(detail, progress))]
    RemoteScriptFailure {
        detail: String,
        progress: Vec<String>,
    },

    #[error("console channel error: {0}")]
    Channel(String),

    #[error("precondition failed: {0}")]
    Precondition(String),
}

fn render_remote_failure(detail: &str, progress: &[String]) -> String {
    let mut s = if detail.is_empty() {
        "remote configuration failed (malformed result marker)".to_owned()
    } else {
        format!("remote configuration failed: {detail}")
    };
    if !progress.is_empty() {
        s.push_str("\nunit progress:");
        for line in progress {
            s.push_str("\n  ");
            s.push_str(line);
        }
    }
    s
}

impl BootstrapError {
    /// Process exit code for this failure kind.
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            BootstrapError::Precondition(_) => 2,
            BootstrapError::Channel(_) => 3,
            BootstrapError::BootTimeout { .. } => 4,
            BootstrapError::TransferTimeout { .. } => 5,
            BootstrapError::RemoteScriptFailure { .. } => 6,
        }
    }

    pub(crate) fn channel(e: impl std::fmt::Display) -> Self {
        BootstrapError::Channel(e.to_string())
    }

    pub(crate) fn precondition(e: impl std::fmt::Display) -> Self {
        BootstrapError::Precondition(e.to_string())
    }
}

/// Exit code for an arbitrary report: the typed kind if one is in the chain, else 1.
pub(crate) fn exit_code_for(report: &color_eyre::Report) -> i32 {
    report
        .chain()
        .find_map(|e| e.downcast_ref::<BootstrapError>())
        .map(BootstrapError::exit_code)
        .unwrap_or(1)
}
