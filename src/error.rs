//! Custom error types for the workcell.
//!
//! This module defines the primary error type, `WorkcellError`, and the flat
//! `ErrorCode` taxonomy reported back to callers of the dispatch core. Using the
//! `thiserror` crate, each variant carries a human-readable description for
//! operator logs while `WorkcellError::code()` reduces it to the error kind that
//! crosses public boundaries.
//!
//! ## Error Tiers
//!
//! - **`Critical`**: an environment contract was violated (malformed position,
//!   archive returning an impossible answer). Aborts the plan.
//! - **`Bug`**: an internal invariant was violated. Aborts the plan and is never
//!   retried.
//! - Everything else (`NotAvailable`, `NotAllowed`, trigger timeouts, transport
//!   failures) is an ordinary operational outcome.
//!
//! `Estop` always wins: see [`ErrorCode::with_estop`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the workcell error type.
pub type AppResult<T> = std::result::Result<T, WorkcellError>;

/// Error kind reported by every public entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// No error.
    #[default]
    None,
    /// Resource, position, tool or sample absent.
    NotAvailable,
    /// Environment contract violated.
    Critical,
    /// Internal invariant violated.
    Bug,
    /// Forbidden by position policy.
    NotAllowed,
    /// Unit conversion or arithmetic failure on a single axis.
    Numerical,
    /// Misconfigured axis mapping or calibration.
    Setup,
    /// Start trigger never arrived.
    StartTimeout,
    /// Continue trigger never arrived.
    ContinueTimeout,
    /// Done trigger never arrived.
    DoneTimeout,
    /// Remote shell transport failure.
    SshError,
    /// Local process transport failure.
    CmdError,
    /// Operator emergency stop.
    Estop,
    /// Another plan is active.
    InProgress,
    /// Anything else.
    Unspecified,
}

impl ErrorCode {
    /// Whether this kind aborts the whole plan immediately.
    pub fn aborts_plan(self) -> bool {
        matches!(self, ErrorCode::Bug | ErrorCode::Critical)
    }

    /// Replace the code with `Estop` when the emergency stop was observed.
    pub fn with_estop(self, estopped: bool) -> Self {
        if estopped {
            ErrorCode::Estop
        } else {
            self
        }
    }

    /// Returns the snake_case name used in data records and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::None => "none",
            ErrorCode::NotAvailable => "not_available",
            ErrorCode::Critical => "critical",
            ErrorCode::Bug => "bug",
            ErrorCode::NotAllowed => "not_allowed",
            ErrorCode::Numerical => "numerical",
            ErrorCode::Setup => "setup",
            ErrorCode::StartTimeout => "start_timeout",
            ErrorCode::ContinueTimeout => "continue_timeout",
            ErrorCode::DoneTimeout => "done_timeout",
            ErrorCode::SshError => "ssh_error",
            ErrorCode::CmdError => "cmd_error",
            ErrorCode::Estop => "estop",
            ErrorCode::InProgress => "in_progress",
            ErrorCode::Unspecified => "unspecified",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors of the workcell crate. [`WorkcellError::code`] gives the taxonomy kind.
#[derive(Error, Debug)]
pub enum WorkcellError {
    /// A resource, position, tool or sample is absent
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// Malformed position
    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    /// The archive broke its contract
    #[error("Archive contract violated: {0}")]
    Archive(String),

    /// An internal invariant was violated
    #[error("Internal invariant violated: {0}")]
    Bug(String),

    /// Forbidden by position policy or request limits
    #[error("Not allowed: {0}")]
    NotAllowed(String),

    /// Arithmetic or conversion failure on one axis
    #[error("Numerical error on axis '{axis}': {reason}")]
    Numerical {
        /// Logical axis, or `input` for unparsable coordinates
        axis: String,
        /// What went wrong
        reason: String,
    },

    /// Misconfigured axis mapping or calibration
    #[error("Setup error: {0}")]
    Setup(String),

    /// A trigger phase was not acknowledged in time
    #[error("Timed out waiting for {0:?} trigger")]
    TriggerTimeout(crate::pal::trigger::TriggerPhase),

    /// The ssh client failed or the remote program failed
    #[error("SSH transport error: {0}")]
    Ssh(String),

    /// The local vendor program failed
    #[error("Command transport error: {0}")]
    Command(String),

    /// Emergency stop engaged
    #[error("Emergency stop active")]
    Estop,

    /// Another plan holds the active token
    #[error("Another plan is already in progress")]
    InProgress,

    /// Log or record file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding of a data record
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Auxiliary log writing
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The dispatch task ended before answering
    #[error("Dispatch loop is not running")]
    DispatcherGone,
}

impl WorkcellError {
    /// Reduce the error to its taxonomy kind.
    pub fn code(&self) -> ErrorCode {
        use crate::pal::trigger::TriggerPhase;

        match self {
            WorkcellError::NotAvailable(_) => ErrorCode::NotAvailable,
            WorkcellError::InvalidPosition(_) | WorkcellError::Archive(_) => ErrorCode::Critical,
            WorkcellError::Bug(_) => ErrorCode::Bug,
            WorkcellError::NotAllowed(_) => ErrorCode::NotAllowed,
            WorkcellError::Numerical { .. } => ErrorCode::Numerical,
            WorkcellError::Setup(_) => ErrorCode::Setup,
            WorkcellError::TriggerTimeout(TriggerPhase::Start) => ErrorCode::StartTimeout,
            WorkcellError::TriggerTimeout(TriggerPhase::Continue) => ErrorCode::ContinueTimeout,
            WorkcellError::TriggerTimeout(TriggerPhase::Done) => ErrorCode::DoneTimeout,
            WorkcellError::Ssh(_) => ErrorCode::SshError,
            WorkcellError::Command(_) => ErrorCode::CmdError,
            WorkcellError::Estop => ErrorCode::Estop,
            WorkcellError::InProgress => ErrorCode::InProgress,
            WorkcellError::Io(_)
            | WorkcellError::Serialization(_)
            | WorkcellError::Csv(_)
            | WorkcellError::DispatcherGone => ErrorCode::Unspecified,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::trigger::TriggerPhase;

    #[test]
    fn test_error_display() {
        let err = WorkcellError::NotAvailable("tray 1 slot 1 vial 1 is empty".to_string());
        assert_eq!(err.to_string(), "Not available: tray 1 slot 1 vial 1 is empty");
        assert_eq!(err.code(), ErrorCode::NotAvailable);
    }

    #[test]
    fn test_two_tier_taxonomy() {
        assert!(WorkcellError::Bug("two inputs".into()).code().aborts_plan());
        assert!(WorkcellError::InvalidPosition("tray 0".into()).code().aborts_plan());
        assert!(!WorkcellError::NotAllowed("assembly".into()).code().aborts_plan());
    }

    #[test]
    fn test_trigger_timeouts_map_per_phase() {
        assert_eq!(
            WorkcellError::TriggerTimeout(TriggerPhase::Start).code(),
            ErrorCode::StartTimeout
        );
        assert_eq!(
            WorkcellError::TriggerTimeout(TriggerPhase::Done).code(),
            ErrorCode::DoneTimeout
        );
    }

    #[test]
    fn test_estop_overrides() {
        assert_eq!(ErrorCode::DoneTimeout.with_estop(true), ErrorCode::Estop);
        assert_eq!(ErrorCode::None.with_estop(false), ErrorCode::None);
        assert_eq!(
            serde_json::to_string(&ErrorCode::NotAvailable).unwrap(),
            "\"not_available\""
        );
    }
}
