//! Provider-facing value types.
//!
//! An invocation never raises for actor failures: everything an actor can
//! do wrong (non-zero exit, timeout, garbage output) is captured in
//! [`InvocationResult`]. Classification into failure classes is a
//! separate, provider-specific step.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;

/// Token counts reported by a provider's final result event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Streamed activity from a running invocation.
///
/// Consumers use these both for liveness (the activity-reset timeout is
/// driven by raw chunks) and for the per-invocation activity log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityEvent {
    /// A raw stdout chunk (may be mid-line).
    Stdout(String),
    /// A raw stderr chunk.
    Stderr(String),
    /// Assistant text extracted from the streaming protocol.
    AssistantText(String),
    /// The actor invoked a tool.
    ToolUse { name: String },
    /// The final result event with lifecycle metadata.
    Result {
        session_id: Option<String>,
        usage: Option<TokenUsage>,
    },
}

/// Options for one actor invocation.
pub struct InvokeOptions<'a> {
    pub model: &'a str,
    /// Activity-reset timeout: the child is killed when no output byte
    /// arrives within this window.
    pub timeout: Duration,
    pub cwd: &'a Path,
    /// Operator-supplied invocation template; `None` uses the provider's
    /// built-in argv path.
    pub invocation_template: Option<&'a str>,
    /// Pre-materialized prompt file; `None` lets the provider write one.
    pub prompt_file: Option<&'a Path>,
    /// Resume a previous provider session.
    pub resume_session_id: Option<&'a str>,
    /// Channel receiving streamed activity. Events are also sent after
    /// the output caps are reached.
    pub activity: Option<UnboundedSender<ActivityEvent>>,
}

impl<'a> InvokeOptions<'a> {
    pub fn new(model: &'a str, cwd: &'a Path, timeout: Duration) -> Self {
        Self {
            model,
            timeout,
            cwd,
            invocation_template: None,
            prompt_file: None,
            resume_session_id: None,
            activity: None,
        }
    }

    /// Forward activity events to `sender`.
    pub fn with_activity(mut self, sender: UnboundedSender<ActivityEvent>) -> Self {
        self.activity = Some(sender);
        self
    }
}

/// Outcome of one invocation. Never an error: failures are data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvocationResult {
    pub success: bool,
    pub exit_code: Option<i64>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub timed_out: bool,
    pub session_id: Option<String>,
    pub token_usage: Option<TokenUsage>,
}

impl InvocationResult {
    /// A synthetic failure result for errors that happen before the child
    /// even starts (missing binary, bad template).
    pub fn spawn_failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stderr: message.into(),
            ..Default::default()
        }
    }
}

/// A classified provider failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureClass {
    CreditExhaustion {
        message: String,
    },
    RateLimit {
        message: String,
        retry_after_ms: Option<u64>,
    },
    AuthError {
        message: String,
    },
    ModelNotFound {
        message: String,
    },
    Other {
        message: String,
    },
}

impl FailureClass {
    pub fn message(&self) -> &str {
        match self {
            Self::CreditExhaustion { message }
            | Self::RateLimit { message, .. }
            | Self::AuthError { message }
            | Self::ModelNotFound { message }
            | Self::Other { message } => message,
        }
    }
}
