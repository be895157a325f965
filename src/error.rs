//! Error types for the crawler core.
//!
//! Two taxonomies exist side by side. `CrawlError` is the crate-level error
//! returned by public operations when the caller itself did something wrong
//! (bad configuration, empty IP list, destroying a key that was never built).
//! `TraceError` is the per-URL failure record: workflow conditions with a
//! numeric code, or generic failures captured from behaviors. Trace errors
//! are recorded on the trace and never cross the pipeline boundary as `Err`.

use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

/// No IP address remained after host resolution.
pub const NO_IP_AVAILABLE: i32 = -7;
/// Information required for request scheduling (IP or scheduler) is missing.
pub const MISSING_SCHEDULING_INFO: i32 = -8;

/// Errors surfaced to callers of the public API.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// Invalid builder or crawl configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A contract violation by the caller, reported immediately.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The input string could not be parsed as a URL.
    #[error("invalid url `{url}`: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },

    /// A factory build action failed. The entry was removed from the cache
    /// before this error became observable.
    #[error("{0}")]
    Build(Arc<anyhow::Error>),

    /// The scheduler actor is no longer running.
    #[error("scheduler stopped")]
    SchedulerStopped,
}

/// A failure recorded on a trace.
///
/// Workflow errors carry one of the stable numeric codes above; everything
/// else lands as a generic error. Downstream pipeline stages run only while
/// a trace has no recorded errors.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TraceError {
    #[serde(rename_all = "camelCase")]
    Workflow { code: i32, message: String },
    #[serde(rename_all = "camelCase")]
    Generic { message: String },
}

impl TraceError {
    pub fn workflow(code: i32, message: impl Into<String>) -> Self {
        TraceError::Workflow {
            code,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        TraceError::Generic {
            message: message.into(),
        }
    }

    /// Whether this is a workflow (coded) error.
    pub fn is_workflow(&self) -> bool {
        matches!(self, TraceError::Workflow { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            TraceError::Workflow { message, .. } => message,
            TraceError::Generic { message } => message,
        }
    }
}

impl std::fmt::Display for TraceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TraceError::Workflow { code, message } => write!(f, "workflow error {code}: {message}"),
            TraceError::Generic { message } => write!(f, "{message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_errors_keep_their_code() {
        let err = TraceError::workflow(NO_IP_AVAILABLE, "no ip available");
        assert!(err.is_workflow());
        assert_eq!(
            err,
            TraceError::Workflow {
                code: -7,
                message: "no ip available".into()
            }
        );
    }

    #[test]
    fn generic_errors_render_their_message() {
        let err = TraceError::generic("test");
        assert!(!err.is_workflow());
        assert_eq!(err.to_string(), "test");
        assert_eq!(err.message(), "test");
    }
}
