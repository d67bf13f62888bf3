use std::time::Duration;

use tokio::time::{sleep, Instant};

use crate::{
    api::GroupApi,
    config::EngineConfig,
    error::{Operation, ReconcileError},
    retry::retry,
};

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum GroupExistence {
    Exists,
    NotFound,
}

pub struct ExistenceVerifier<'a, C> {
    client: &'a C,
    config: &'a EngineConfig,
}

impl<'a, C> ExistenceVerifier<'a, C>
where
    C: GroupApi + Sync,
{
    pub const fn new(client: &'a C, config: &'a EngineConfig) -> Self {
        Self { client, config }
    }

    /// Whether `group` exists remotely. A missing group is a regular answer, not an error.
    pub async fn check(&self, group: &str) -> Result<GroupExistence, ReconcileError> {
        debug!("Checking if group {group} exists");
        let description = format!("Looking up group {group}");
        match retry(&self.config.retry, &description, || {
            self.client.get_group(group, None)
        })
        .await
        {
            Ok(_) => {
                debug!("Group {group} exists");
                Ok(GroupExistence::Exists)
            }
            Err(err) => match ReconcileError::from_retry(err, group, Operation::GetGroup, None) {
                ReconcileError::NotFound(_) => {
                    debug!("Group {group} doesn't exist");
                    Ok(GroupExistence::NotFound)
                }
                err => Err(err),
            },
        }
    }

    /// Poll until `group` is reported missing, allowing for propagation delay after a delete.
    ///
    /// Returns [`GroupExistence::Exists`] if the group is still there when `timeout` runs out.
    /// Failed lookups are returned as errors, they never count as either answer.
    pub async fn wait_for_absence(
        &self,
        group: &str,
        timeout: Duration,
    ) -> Result<GroupExistence, ReconcileError> {
        let start = Instant::now();
        let mut attempt = 0;
        loop {
            if self.check(group).await? == GroupExistence::NotFound {
                return Ok(GroupExistence::NotFound);
            }

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                error!("Group {group} still exists {elapsed:?} after teardown");
                return Ok(GroupExistence::Exists);
            }
            let delay = self
                .config
                .retry
                .backoff(attempt)
                .max(MIN_POLL_INTERVAL)
                .min(timeout.saturating_sub(elapsed));
            debug!("Group {group} still exists, checking again in {delay:?}");
            sleep(delay).await;
            attempt += 1;
        }
    }
}
