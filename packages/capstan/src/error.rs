//! Structured error types for job settlement.
//!
//! `JobError` is the only error type that reaches submitters. How a job run
//! settles is decided entirely by which variant the handler returns:
//!
//! - [`JobError::Retryable`] - re-queue the job (until the retry budget runs out)
//! - [`JobError::Permanent`] - settle FAILED, no retry
//! - [`JobError::Abort`] - settle FAILED, counted as aborted
//! - [`JobError::Disabled`] - settle DISABLED
//! - [`JobError::Generic`] - treated as permanent
//!
//! Everything else in the engine (storage plumbing, limiter state) moves
//! errors as `anyhow::Error` internally; those are logged and swallowed and
//! never cross into a submitter's result.
//!
//! # Wire form
//!
//! A terminal error is persisted on the job row as `{error, error_code}`.
//! The code is a stable string tag ([`ErrorCode`]) so that a client in
//! another process can rehydrate the original variant from the row alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable wire tags for persisted job errors.
///
/// These strings are part of the storage contract: they are written to the
/// `error_code` column and parsed back by observing clients, possibly in a
/// different process. Do not rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "JobError")]
    Generic,
    #[serde(rename = "PermanentJobError")]
    Permanent,
    #[serde(rename = "RetryableJobError")]
    Retryable,
    #[serde(rename = "AbortSignalJobError")]
    AbortSignal,
    #[serde(rename = "JobDisabledError")]
    Disabled,
    #[serde(rename = "JobNotFoundError")]
    NotFound,
}

impl ErrorCode {
    /// The persisted tag for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Generic => "JobError",
            ErrorCode::Permanent => "PermanentJobError",
            ErrorCode::Retryable => "RetryableJobError",
            ErrorCode::AbortSignal => "AbortSignalJobError",
            ErrorCode::Disabled => "JobDisabledError",
            ErrorCode::NotFound => "JobNotFoundError",
        }
    }

    /// Parse a persisted tag back into a code.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "JobError" => Some(ErrorCode::Generic),
            "PermanentJobError" => Some(ErrorCode::Permanent),
            "RetryableJobError" => Some(ErrorCode::Retryable),
            "AbortSignalJobError" => Some(ErrorCode::AbortSignal),
            "JobDisabledError" => Some(ErrorCode::Disabled),
            "JobNotFoundError" => Some(ErrorCode::NotFound),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error raised by (or on behalf of) a job run.
///
/// Handlers return these from `execute` to control settlement. Clients
/// receive them back from `wait_for`, rehydrated from the persisted row
/// when the failure happened in another process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JobError {
    /// Unclassified failure. Settled the same way as [`JobError::Permanent`].
    #[error("{0}")]
    Generic(String),

    /// The job can never succeed; do not retry.
    #[error("{0}")]
    Permanent(String),

    /// Transient failure; re-queue if the retry budget allows.
    ///
    /// `retry_at` is an optional earliest-retry hint (e.g. a Retry-After
    /// header). It is folded into the row's `run_after` at settlement and
    /// not persisted beyond that.
    #[error("{message}")]
    Retryable {
        message: String,
        retry_at: Option<DateTime<Utc>>,
    },

    /// The job was aborted by an external request.
    #[error("job aborted")]
    Abort,

    /// The job disabled itself; settle DISABLED rather than FAILED.
    #[error("{0}")]
    Disabled(String),

    /// No such job in this queue.
    #[error("job not found: {0}")]
    NotFound(Uuid),
}

impl JobError {
    /// Transient failure with no earliest-retry hint.
    pub fn retryable(message: impl Into<String>) -> Self {
        JobError::Retryable {
            message: message.into(),
            retry_at: None,
        }
    }

    /// Transient failure that must not be retried before `retry_at`.
    pub fn retryable_at(message: impl Into<String>, retry_at: DateTime<Utc>) -> Self {
        JobError::Retryable {
            message: message.into(),
            retry_at: Some(retry_at),
        }
    }

    /// Permanent failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        JobError::Permanent(message.into())
    }

    /// The wire tag persisted for this variant.
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::Generic(_) => ErrorCode::Generic,
            JobError::Permanent(_) => ErrorCode::Permanent,
            JobError::Retryable { .. } => ErrorCode::Retryable,
            JobError::Abort => ErrorCode::AbortSignal,
            JobError::Disabled(_) => ErrorCode::Disabled,
            JobError::NotFound(_) => ErrorCode::NotFound,
        }
    }

    /// Whether this error still allows a retry given the attempt budget.
    ///
    /// Attempts are counted at dispatch, so a job with `max_retries = 2`
    /// may run three times; the failure of the third attempt is final.
    pub fn should_retry(&self, run_attempts: u32, max_retries: u32) -> bool {
        matches!(self, JobError::Retryable { .. }) && run_attempts <= max_retries
    }

    /// Rebuild the variant a persisted `{error, error_code}` pair came from.
    ///
    /// Rows written by older adapters may carry a message with no code;
    /// those rehydrate as [`JobError::Generic`].
    pub fn rehydrate(code: Option<ErrorCode>, message: &str) -> Self {
        match code {
            Some(ErrorCode::Permanent) => JobError::Permanent(message.to_string()),
            Some(ErrorCode::Retryable) => JobError::Retryable {
                message: message.to_string(),
                retry_at: None,
            },
            Some(ErrorCode::AbortSignal) => JobError::Abort,
            Some(ErrorCode::Disabled) => JobError::Disabled(message.to_string()),
            Some(ErrorCode::NotFound) => JobError::Generic(message.to_string()),
            Some(ErrorCode::Generic) | None => JobError::Generic(message.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip_through_tags() {
        for code in [
            ErrorCode::Generic,
            ErrorCode::Permanent,
            ErrorCode::Retryable,
            ErrorCode::AbortSignal,
            ErrorCode::Disabled,
            ErrorCode::NotFound,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
        assert_eq!(ErrorCode::parse("SomethingElse"), None);
    }

    #[test]
    fn codes_serialize_as_wire_tags() {
        let json = serde_json::to_string(&ErrorCode::Retryable).unwrap();
        assert_eq!(json, "\"RetryableJobError\"");
        let back: ErrorCode = serde_json::from_str("\"AbortSignalJobError\"").unwrap();
        assert_eq!(back, ErrorCode::AbortSignal);
    }

    #[test]
    fn retryable_respects_attempt_budget() {
        let err = JobError::retryable("flaky");
        // max_retries = 2: attempts 1 and 2 retry, attempt 3 is final
        assert!(err.should_retry(1, 2));
        assert!(err.should_retry(2, 2));
        assert!(!err.should_retry(3, 2));
    }

    #[test]
    fn permanent_never_retries() {
        let err = JobError::permanent("broken input");
        assert!(!err.should_retry(1, 10));
    }

    #[test]
    fn rehydrate_restores_variants() {
        let err = JobError::rehydrate(Some(ErrorCode::AbortSignal), "job aborted");
        assert_eq!(err, JobError::Abort);

        let err = JobError::rehydrate(Some(ErrorCode::Permanent), "nope");
        assert_eq!(err, JobError::Permanent("nope".to_string()));

        let err = JobError::rehydrate(None, "mystery");
        assert_eq!(err, JobError::Generic("mystery".to_string()));
    }

    #[test]
    fn rehydrate_matches_code() {
        for code in [
            ErrorCode::Generic,
            ErrorCode::Permanent,
            ErrorCode::Retryable,
            ErrorCode::AbortSignal,
            ErrorCode::Disabled,
        ] {
            let err = JobError::rehydrate(Some(code), "msg");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn display_uses_message() {
        let err = JobError::retryable_at("rate limited", Utc::now());
        assert_eq!(err.to_string(), "rate limited");
        assert_eq!(JobError::Abort.to_string(), "job aborted");
    }
}
