use thiserror::Error;

/// Kind of remote entity named by a `NoSuchEntity` error.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EntityKind {
    Group,
    Member,
}

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ApiError {
    #[error("NoSuchEntity: {entity} {name} cannot be found")]
    NoSuchEntity { entity: EntityKind, name: String },
    #[error("EntityAlreadyExists: {0}")]
    EntityAlreadyExists(String),
    #[error("The remote API throttled the request: {0}")]
    Throttled(String),
    #[error("Transport error while calling the remote API: {0}")]
    Transport(String),
    #[error("Remote API returned {code}: {message}")]
    Other { code: String, message: String },
}

impl ApiError {
    #[must_use]
    pub fn no_such_group(group: &str) -> Self {
        Self::NoSuchEntity {
            entity: EntityKind::Group,
            name: group.to_string(),
        }
    }

    #[must_use]
    pub fn no_such_member(member: &str) -> Self {
        Self::NoSuchEntity {
            entity: EntityKind::Member,
            name: member.to_string(),
        }
    }

    /// True when the group itself (not one of its members) is absent.
    #[must_use]
    pub fn is_group_not_found(&self) -> bool {
        matches!(
            self,
            Self::NoSuchEntity {
                entity: EntityKind::Group,
                ..
            }
        )
    }

    /// Errors worth retrying with backoff. Everything else is final.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled(_) | Self::Transport(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Other {
                code: "MalformedResponse".into(),
                message: format!(
                    "There was an error while trying to decode the response, it may be malformed: {err}"
                ),
            }
        } else if err.is_timeout() {
            Self::Transport(format!("The request to the remote API timed out: {err}"))
        } else {
            Self::Transport(err.to_string())
        }
    }
}

/// One page of a group listing.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupPage {
    pub group_name: String,
    pub members: Vec<String>,
    pub is_truncated: bool,
    /// Continuation token for the next page, present while `is_truncated` is set.
    pub marker: Option<String>,
}

/// Remote group membership API.
///
/// The client is handed to every engine component explicitly; there is no shared
/// process-wide handle.
#[trait_variant::make(Send)]
pub trait GroupApi {
    /// Fetch one page of the group's members, starting at `marker` if given.
    async fn get_group(&self, group: &str, marker: Option<&str>) -> Result<GroupPage, ApiError>;

    /// Add `member` to `group`.
    async fn add_member(&self, group: &str, member: &str) -> Result<(), ApiError>;

    /// Remove `member` from `group`.
    async fn remove_member(&self, group: &str, member: &str) -> Result<(), ApiError>;
}
