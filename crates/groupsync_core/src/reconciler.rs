use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::instrument;

use crate::{
    api::GroupApi,
    applier::{ApplyReport, MutationApplier},
    config::EngineConfig,
    diff::{compute_diff, MembershipDiff},
    error::ReconcileError,
    model::{GroupMembership, ObservedMembership, ReconcileState},
    reader::MembershipReader,
    verifier::{ExistenceVerifier, GroupExistence},
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of reading a declaration's membership back from the remote side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReadOutcome {
    Present(ObservedMembership),
    /// The group is gone, the host should drop the resource from its state.
    Gone,
}

/// Drives the lifecycle of group membership declarations against one remote API.
///
/// Holds no state between calls: every operation starts from a fresh remote listing,
/// so different declarations can be reconciled concurrently through the same instance.
pub struct Reconciler<C> {
    client: C,
    config: EngineConfig,
}

impl<C> Reconciler<C>
where
    C: GroupApi + Sync,
{
    pub const fn new(client: C, config: EngineConfig) -> Self {
        Self { client, config }
    }

    pub const fn client(&self) -> &C {
        &self.client
    }

    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn reader(&self) -> MembershipReader<'_, C> {
        MembershipReader::new(&self.client, &self.config)
    }

    fn applier(&self) -> MutationApplier<'_, C> {
        MutationApplier::new(&self.client, &self.config)
    }

    fn verifier(&self) -> ExistenceVerifier<'_, C> {
        ExistenceVerifier::new(&self.client, &self.config)
    }

    /// Changes that applying `declaration` would make right now.
    #[instrument(skip_all, fields(membership = %declaration.name, group = %declaration.group))]
    pub async fn plan(
        &self,
        declaration: &GroupMembership,
    ) -> Result<MembershipDiff, ReconcileError> {
        let actual = self.reader().read_group(&declaration.group).await?;
        let diff = compute_diff(&declaration.users, &actual.member_set());
        debug!(
            "Planned {} addition(s) and {} removal(s) for group {}",
            diff.additions.len(),
            diff.removals.len(),
            declaration.group
        );
        Ok(diff)
    }

    #[instrument(skip_all, fields(membership = %declaration.name, group = %declaration.group))]
    pub async fn create(
        &self,
        declaration: &GroupMembership,
    ) -> Result<ObservedMembership, ReconcileError> {
        info!(
            "Creating membership {} of group {} with {} user(s)",
            declaration.name,
            declaration.group,
            declaration.users.len()
        );
        self.converge(declaration).await
    }

    #[instrument(skip_all, fields(membership = %declaration.name, group = %declaration.group))]
    pub async fn update(
        &self,
        declaration: &GroupMembership,
    ) -> Result<ObservedMembership, ReconcileError> {
        info!(
            "Updating membership {} of group {} to {} user(s)",
            declaration.name,
            declaration.group,
            declaration.users.len()
        );
        self.converge(declaration).await
    }

    /// Current remote membership projected into the declaration's shape, for drift detection.
    #[instrument(skip_all, fields(membership = %declaration.name, group = %declaration.group))]
    pub async fn read(&self, declaration: &GroupMembership) -> Result<ReadOutcome, ReconcileError> {
        match self.reader().read_group(&declaration.group).await {
            Ok(remote) => {
                let observed = ObservedMembership::from_remote(&declaration.name, &remote);
                let drift = observed.undeclared_users(declaration);
                if !drift.is_empty() {
                    info!(
                        "Group {} has {} member(s) not listed in membership {}: {drift:?}",
                        declaration.group,
                        drift.len(),
                        declaration.name
                    );
                }
                Ok(ReadOutcome::Present(observed))
            }
            Err(ReconcileError::NotFound(group)) => {
                warn!(
                    "Group {group} of membership {} no longer exists, removing it from state",
                    declaration.name
                );
                Ok(ReadOutcome::Gone)
            }
            Err(err) => Err(err),
        }
    }

    /// Remove every current member of the declared group. The group and the users themselves
    /// are left in place.
    #[instrument(skip_all, fields(membership = %declaration.name, group = %declaration.group))]
    pub async fn delete(&self, declaration: &GroupMembership) -> Result<ApplyReport, ReconcileError> {
        info!(
            "Deleting membership {} of group {}",
            declaration.name, declaration.group
        );
        let actual = match self.reader().read_group(&declaration.group).await {
            Ok(actual) => actual,
            Err(ReconcileError::NotFound(group)) => {
                info!("Group {group} is already gone, nothing to remove");
                return Ok(ApplyReport::default());
            }
            Err(err) => return Err(err),
        };

        let diff = MembershipDiff::teardown(&actual.member_set());
        if diff.is_empty() {
            debug!("Group {} has no members left", declaration.group);
            return Ok(ApplyReport::default());
        }
        let report = match self.applier().apply(&declaration.group, &diff).await {
            Ok(report) => report,
            Err(ReconcileError::NotFound(group)) => {
                info!("Group {group} was removed while tearing down its membership");
                return Ok(ApplyReport::default());
            }
            Err(err) => return Err(err),
        };
        report.into_result(&declaration.group)
    }

    /// Teardown check: only a missing group counts as destroyed.
    #[instrument(skip(self))]
    pub async fn verify_destroyed(&self, group: &str) -> Result<ReconcileState, ReconcileError> {
        match self.verifier().check(group).await? {
            GroupExistence::NotFound => Ok(ReconcileState::Destroyed),
            GroupExistence::Exists => {
                error!("Group {group} still exists after teardown");
                Err(ReconcileError::StillExists(group.to_string()))
            }
        }
    }

    /// Like [`Self::verify_destroyed`], but keeps polling for up to `timeout` to ride out
    /// propagation delay.
    #[instrument(skip(self))]
    pub async fn verify_destroyed_within(
        &self,
        group: &str,
        timeout: Duration,
    ) -> Result<ReconcileState, ReconcileError> {
        match self.verifier().wait_for_absence(group, timeout).await? {
            GroupExistence::NotFound => Ok(ReconcileState::Destroyed),
            GroupExistence::Exists => Err(ReconcileError::StillExists(group.to_string())),
        }
    }

    async fn converge(
        &self,
        declaration: &GroupMembership,
    ) -> Result<ObservedMembership, ReconcileError> {
        let actual = self.reader().read_group(&declaration.group).await?;
        let diff = compute_diff(&declaration.users, &actual.member_set());
        if diff.is_empty() {
            info!(
                "Group {} already matches membership {}",
                declaration.group, declaration.name
            );
            return Ok(ObservedMembership::from_remote(&declaration.name, &actual));
        }

        self.applier()
            .apply(&declaration.group, &diff)
            .await?
            .into_result(&declaration.group)?;

        if self.config.verify_after_apply {
            self.observe_converged(declaration).await
        } else {
            Ok(trusted_observation(declaration))
        }
    }

    /// Re-read the group until it reflects the declaration or the retry deadline passes.
    async fn observe_converged(
        &self,
        declaration: &GroupMembership,
    ) -> Result<ObservedMembership, ReconcileError> {
        let policy = &self.config.retry;
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            let remote = self.reader().read_group(&declaration.group).await?;
            let observed = ObservedMembership::from_remote(&declaration.name, &remote);
            if observed.state(declaration) == Some(ReconcileState::Reconciled) {
                debug!(
                    "Group {} reflects membership {} after {} re-read(s)",
                    declaration.group,
                    declaration.name,
                    attempt + 1
                );
                return Ok(observed);
            }

            let delay = policy.backoff(attempt).max(MIN_POLL_INTERVAL);
            if start.elapsed() + delay > policy.timeout {
                warn!(
                    "Group {} still doesn't reflect membership {} after {:?}, trusting the applied \
                    changes",
                    declaration.group,
                    declaration.name,
                    start.elapsed()
                );
                return Ok(trusted_observation(declaration));
            }
            debug!(
                "Group {} doesn't reflect the applied changes yet, re-reading in {delay:?}",
                declaration.group
            );
            sleep(delay).await;
            attempt += 1;
        }
    }
}

fn trusted_observation(declaration: &GroupMembership) -> ObservedMembership {
    ObservedMembership {
        name: declaration.name.clone(),
        group: declaration.group.clone(),
        users: declaration.users.clone(),
    }
}
