//! Group membership reconciliation.
//!
//! A [`GroupMembership`] declares that a remote group should contain exactly a given set of
//! users. The [`Reconciler`] lists the group (following pagination to the end), diffs the
//! listing against the declaration and applies the minimal set of additions and removals,
//! tolerating the remote API's eventual consistency.
pub mod api;
pub mod applier;
pub mod config;
pub mod diff;
pub mod error;
pub mod http;
pub mod model;
pub mod reader;
pub mod reconciler;
pub mod retry;
pub mod verifier;

#[cfg(test)]
pub(crate) mod testprovider;

#[macro_use]
extern crate tracing;

#[macro_use]
extern crate serde;

pub use crate::{
    api::{ApiError, GroupApi, GroupPage},
    config::{EngineConfig, GroupSyncConfig},
    diff::{compute_diff, MembershipDiff},
    error::ReconcileError,
    http::HttpGroupApi,
    model::{GroupMembership, ObservedMembership, ReconcileState, RemoteGroup},
    reconciler::{ReadOutcome, Reconciler},
};

pub static VERSION: &str = env!("CARGO_PKG_VERSION");
