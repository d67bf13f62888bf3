use futures::{stream, StreamExt};

use crate::{
    api::{ApiError, EntityKind, GroupApi},
    config::EngineConfig,
    diff::MembershipDiff,
    error::{MemberFailure, Operation, ReconcileError},
    retry::{retry, RetryError},
};

/// Outcome of applying one diff.
///
/// Successful mutations stay in effect even when others failed, there is no rollback.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Mutations the remote side reported as already done.
    pub already_satisfied: Vec<String>,
    pub failures: Vec<MemberFailure>,
}

impl ApplyReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Fold per-member failures into a single error naming each of them.
    pub fn into_result(self, group: &str) -> Result<Self, ReconcileError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            error!(
                "Failed to apply {} membership change(s) to group {group}, the {} addition(s) and \
                {} removal(s) that succeeded are kept",
                self.failures.len(),
                self.added.len(),
                self.removed.len()
            );
            Err(ReconcileError::PartialApplyFailure {
                group: group.to_string(),
                failures: self.failures,
            })
        }
    }
}

enum Applied {
    Changed,
    AlreadySatisfied,
}

pub struct MutationApplier<'a, C> {
    client: &'a C,
    config: &'a EngineConfig,
}

impl<'a, C> MutationApplier<'a, C>
where
    C: GroupApi + Sync,
{
    pub const fn new(client: &'a C, config: &'a EngineConfig) -> Self {
        Self { client, config }
    }

    /// Issue one call per addition and removal, attempting every member even if some fail.
    ///
    /// Only a missing group aborts the whole diff with [`ReconcileError::NotFound`];
    /// everything else ends up in [`ApplyReport::failures`].
    pub async fn apply(
        &self,
        group: &str,
        diff: &MembershipDiff,
    ) -> Result<ApplyReport, ReconcileError> {
        info!(
            "Applying {} addition(s) and {} removal(s) to group {group}",
            diff.additions.len(),
            diff.removals.len()
        );
        let mutations = diff
            .removals
            .iter()
            .map(|member| (Operation::RemoveMember, member))
            .chain(
                diff.additions
                    .iter()
                    .map(|member| (Operation::AddMember, member)),
            );

        let outcomes: Vec<_> = stream::iter(mutations)
            .map(move |(operation, member)| async move {
                let outcome = self.apply_one(group, operation, member).await;
                (operation, member, outcome)
            })
            .buffer_unordered(self.config.max_concurrent_mutations.max(1))
            .collect()
            .await;

        let mut report = ApplyReport::default();
        let mut group_missing = false;
        for (operation, member, outcome) in outcomes {
            match outcome {
                Ok(Applied::Changed) => match operation {
                    Operation::AddMember => report.added.push(member.clone()),
                    _ => report.removed.push(member.clone()),
                },
                Ok(Applied::AlreadySatisfied) => report.already_satisfied.push(member.clone()),
                Err(RetryError::Api(err)) if err.is_group_not_found() => {
                    error!("Group {group} disappeared while applying {operation} of {member}");
                    group_missing = true;
                }
                Err(err) => {
                    warn!("Failed to {operation} {member} in group {group}: {err}");
                    report.failures.push(MemberFailure {
                        member: member.clone(),
                        operation,
                        error: err,
                    });
                }
            }
        }

        if group_missing {
            return Err(ReconcileError::NotFound(group.to_string()));
        }
        info!(
            "Applied changes to group {group}: {} added, {} removed, {} already satisfied, {} failed",
            report.added.len(),
            report.removed.len(),
            report.already_satisfied.len(),
            report.failures.len()
        );
        Ok(report)
    }

    async fn apply_one(
        &self,
        group: &str,
        operation: Operation,
        member: &str,
    ) -> Result<Applied, RetryError> {
        let description = format!("{operation} {member} in group {group}");
        let result = retry(&self.config.retry, &description, move || async move {
            match operation {
                Operation::AddMember => self.client.add_member(group, member).await,
                _ => self.client.remove_member(group, member).await,
            }
        })
        .await;

        match result {
            Ok(()) => {
                debug!("{description} done");
                Ok(Applied::Changed)
            }
            // The listing we diffed against may lag behind the remote state.
            Err(RetryError::Api(ApiError::EntityAlreadyExists(_)))
                if operation == Operation::AddMember =>
            {
                debug!("{member} is already a member of group {group}");
                Ok(Applied::AlreadySatisfied)
            }
            Err(RetryError::Api(ApiError::NoSuchEntity {
                entity: EntityKind::Member,
                ..
            })) if operation == Operation::RemoveMember => {
                debug!("{member} is already absent from group {group}");
                Ok(Applied::AlreadySatisfied)
            }
            Err(err) => Err(err),
        }
    }
}
