//! Error types for the device runner
//!
//! Transient faults (a failed connect, a failed send, a misbehaving method
//! handler) are absorbed where their retry or recovery policy lives. Only the
//! conditions below ever reach the caller of [`crate::runner::DeviceRunner::run`].

use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use thiserror::Error;

/// Main error type for runner operations
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("[{device_id}] Could not reconnect within the retry limit ({attempts} attempts, backoff reached {max_delay:?})")]
    RetryBudgetExhausted {
        device_id: String,
        attempts: u32,
        max_delay: Duration,
    },

    #[error("[{device_id}] {task} task failed: {message}")]
    TaskFailed {
        device_id: String,
        task: &'static str,
        message: String,
    },
}

impl RunnerError {
    /// Create a task failure error
    pub fn task_failed<S: Into<String>>(device_id: &str, task: &'static str, message: S) -> Self {
        Self::TaskFailed {
            device_id: device_id.to_string(),
            task,
            message: message.into(),
        }
    }

    /// Whether this error means the retry budget ran out
    pub fn is_retry_budget_exhausted(&self) -> bool {
        matches!(self, RunnerError::RetryBudgetExhausted { .. })
    }
}

/// Rejected enqueue; the payload is handed back to the caller
#[derive(Debug, Error, PartialEq)]
pub enum EnqueueError<T> {
    #[error("outbound queue is full")]
    Full(T),
    #[error("runner is stopping")]
    Stopped(T),
}

impl<T> EnqueueError<T> {
    /// Take back the rejected payload
    pub fn into_inner(self) -> T {
        match self {
            EnqueueError::Full(item) | EnqueueError::Stopped(item) => item,
        }
    }
}

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|signature|sig)[=:]\s*[^\s;&]+")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

static SENSITIVE_PATH_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+")
        .unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Sanitize error text before it leaves the device (method responses)
pub fn sanitize_error_message(message: &str) -> String {
    let sanitized = SECRET_PATTERN.replace_all(message, "${1}=***");
    let mut sanitized = SENSITIVE_PATH_PATTERN
        .replace_all(&sanitized, "/***REDACTED***/")
        .to_string();

    // Truncate very long messages - ensure total length is <= 500
    if sanitized.len() > MAX_ERROR_MESSAGE_LEN {
        let truncate_suffix = "...[truncated]";
        let mut cut = MAX_ERROR_MESSAGE_LEN - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
        sanitized.push_str(truncate_suffix);
    }

    sanitized
}

/// Result type for runner operations
pub type RunnerResult<T> = Result<T, RunnerError>;
