use std::{fmt, time::Duration};

use thiserror::Error;

use crate::{api::ApiError, retry::RetryError};

/// Remote operation attempted by the engine.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum Operation {
    GetGroup,
    AddMember,
    RemoveMember,
}

/// A single add or remove that could not be applied.
#[derive(Debug)]
pub struct MemberFailure {
    pub member: String,
    pub operation: Operation,
    pub error: RetryError,
}

impl fmt::Display for MemberFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.operation, self.member, self.error)
    }
}

fn describe_failures(failures: &[MemberFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

fn describe_member(member: Option<&String>) -> String {
    member.map_or_else(String::new, |member| format!(" (member {member})"))
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Group {0} not found")]
    NotFound(String),
    #[error(
        "Remote call {operation} failed for group {group}{}: {source}",
        describe_member(.member.as_ref())
    )]
    RemoteCallFailed {
        group: String,
        operation: Operation,
        member: Option<String>,
        #[source]
        source: ApiError,
    },
    #[error(
        "Failed to apply {} membership change(s) to group {group}: {}",
        .failures.len(),
        describe_failures(.failures)
    )]
    PartialApplyFailure {
        group: String,
        failures: Vec<MemberFailure>,
    },
    #[error("Listing members of group {group} returned inconsistent pages: {detail}")]
    PaginationInconsistency { group: String, detail: String },
    #[error("Operation {operation} on group {group} did not complete within {elapsed:?}")]
    Timeout {
        group: String,
        operation: Operation,
        elapsed: Duration,
    },
    #[error("Group {0} still exists after teardown")]
    StillExists(String),
    #[error("Invalid group membership declaration: {0}")]
    InvalidDeclaration(String),
}

impl ReconcileError {
    /// Map a retried remote call failure into the engine taxonomy.
    pub(crate) fn from_retry(
        err: RetryError,
        group: &str,
        operation: Operation,
        member: Option<&str>,
    ) -> Self {
        match err {
            RetryError::Api(source) if source.is_group_not_found() => {
                Self::NotFound(group.to_string())
            }
            RetryError::Api(source) => Self::RemoteCallFailed {
                group: group.to_string(),
                operation,
                member: member.map(ToString::to_string),
                source,
            },
            RetryError::TimedOut { elapsed, .. } => Self::Timeout {
                group: group.to_string(),
                operation,
                elapsed,
            },
        }
    }

    /// Members named by a partial apply failure, if this is one.
    #[must_use]
    pub fn failed_members(&self) -> Vec<&str> {
        match self {
            Self::PartialApplyFailure { failures, .. } => {
                failures.iter().map(|f| f.member.as_str()).collect()
            }
            _ => Vec::new(),
        }
    }
}
