use std::path::PathBuf;

use clap::{Parser, Subcommand};
use humantime::Duration;
use reqwest::Url;
use secrecy::SecretString;

use crate::retry::RetryPolicy;

const DEFAULT_MAX_PAGES: usize = 1000;
const DEFAULT_MAX_CONCURRENT_MUTATIONS: usize = 4;

/// Tuning of the reconciliation engine.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Hard cap on pages fetched for one listing.
    pub max_pages: usize,
    /// Pause between consecutive page requests.
    pub pagination_delay: std::time::Duration,
    /// Number of add/remove calls in flight at once, 1 means sequential.
    pub max_concurrent_mutations: usize,
    /// Re-read the group after applying changes instead of trusting the diff.
    pub verify_after_apply: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_pages: DEFAULT_MAX_PAGES,
            pagination_delay: std::time::Duration::ZERO,
            max_concurrent_mutations: DEFAULT_MAX_CONCURRENT_MUTATIONS,
            verify_after_apply: true,
        }
    }
}

#[derive(Clone, Parser, Debug)]
#[command(version, about = "Reconcile remote group membership against a declaration")]
pub struct GroupSyncConfig {
    #[arg(long, env = "GROUPSYNC_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "GROUPSYNC_API_URL", value_parser = Url::parse, default_value = "http://localhost:8080/")]
    pub api_url: Url,

    #[arg(long, env = "GROUPSYNC_API_TOKEN", default_value = "")]
    pub api_token: SecretString,

    #[arg(long, env = "GROUPSYNC_REQUEST_TIMEOUT", default_value = "10s")]
    pub request_timeout: Duration,

    #[arg(long, env = "GROUPSYNC_RETRY_TIMEOUT", default_value = "30s")]
    pub retry_timeout: Duration,

    #[arg(long, env = "GROUPSYNC_RETRY_INITIAL_BACKOFF", default_value = "100ms")]
    pub retry_initial_backoff: Duration,

    #[arg(long, env = "GROUPSYNC_RETRY_MAX_BACKOFF", default_value = "5s")]
    pub retry_max_backoff: Duration,

    #[arg(long, env = "GROUPSYNC_RETRY_MAX_ATTEMPTS", default_value_t = 5)]
    pub retry_max_attempts: u32,

    #[arg(long, env = "GROUPSYNC_MAX_CONCURRENT_MUTATIONS", default_value_t = DEFAULT_MAX_CONCURRENT_MUTATIONS)]
    pub max_concurrent_mutations: usize,

    // sent as `max_items` with every listing request
    #[arg(long, env = "GROUPSYNC_PAGE_SIZE", default_value_t = 100)]
    pub page_size: usize,

    #[arg(long, env = "GROUPSYNC_MAX_PAGES", default_value_t = DEFAULT_MAX_PAGES)]
    pub max_pages: usize,

    #[arg(long, env = "GROUPSYNC_PAGINATION_DELAY", default_value = "0s")]
    pub pagination_delay: Duration,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    #[command(about = "Create or update the membership described in a declaration file")]
    Apply { declaration: PathBuf },
    #[command(about = "Show the changes applying a declaration file would make")]
    Plan { declaration: PathBuf },
    #[command(about = "Print the membership currently observed for a declaration file")]
    Read { declaration: PathBuf },
    #[command(about = "Remove the membership described in a declaration file")]
    Delete { declaration: PathBuf },
    #[command(about = "Check that a group no longer exists after teardown")]
    VerifyDestroyed {
        group: String,
        /// Keep polling for this long before reporting the group as still present.
        #[arg(long)]
        wait: Option<Duration>,
    },
}

impl GroupSyncConfig {
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_backoff: *self.retry_initial_backoff,
            max_backoff: *self.retry_max_backoff,
            max_attempts: self.retry_max_attempts.max(1),
            timeout: *self.retry_timeout,
            ..RetryPolicy::default()
        }
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            retry: self.retry_policy(),
            max_pages: self.max_pages,
            pagination_delay: *self.pagination_delay,
            max_concurrent_mutations: self.max_concurrent_mutations.max(1),
            verify_after_apply: true,
        }
    }
}
