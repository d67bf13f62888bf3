use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};

use crate::error::ReconcileError;

/// Attribute map handed over by the host framework.
pub type Attributes = Map<String, Value>;

/// Read-back attribute carrying the true remote member count.
pub const USERS_COUNT_ATTRIBUTE: &str = "users.#";

/// Desired membership of one group, as declared by the caller.
///
/// `name` identifies the declaration only and has no meaning remotely.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawGroupMembership")]
pub struct GroupMembership {
    pub name: String,
    pub group: String,
    pub users: BTreeSet<String>,
}

#[derive(Deserialize)]
struct RawGroupMembership {
    name: String,
    group: String,
    #[serde(default)]
    users: Vec<String>,
}

impl TryFrom<RawGroupMembership> for GroupMembership {
    type Error = ReconcileError;

    fn try_from(raw: RawGroupMembership) -> Result<Self, Self::Error> {
        Self::new(raw.name, raw.group, raw.users)
    }
}

impl GroupMembership {
    /// Validate and build a declaration. Duplicate users are rejected rather than merged.
    pub fn new<N, G, I, U>(name: N, group: G, users: I) -> Result<Self, ReconcileError>
    where
        N: Into<String>,
        G: Into<String>,
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        let name = name.into();
        let group = group.into();
        if name.trim().is_empty() {
            return Err(ReconcileError::InvalidDeclaration(
                "membership name must not be empty".into(),
            ));
        }
        if group.trim().is_empty() {
            return Err(ReconcileError::InvalidDeclaration(format!(
                "membership {name} doesn't name a group"
            )));
        }

        let mut set = BTreeSet::new();
        for user in users {
            let user = user.into();
            if user.trim().is_empty() {
                return Err(ReconcileError::InvalidDeclaration(format!(
                    "membership {name} contains an empty user name"
                )));
            }
            if !set.insert(user.clone()) {
                return Err(ReconcileError::InvalidDeclaration(format!(
                    "membership {name} lists user {user} more than once"
                )));
            }
        }

        Ok(Self {
            name,
            group,
            users: set,
        })
    }

    /// Build a declaration from the host framework's attributes.
    pub fn from_attributes(attributes: &Attributes) -> Result<Self, ReconcileError> {
        let name = string_attribute(attributes, "name")?;
        let group = string_attribute(attributes, "group")?;
        let users = match attributes.get("users") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(values)) => values
                .iter()
                .map(|value| {
                    value.as_str().map(ToString::to_string).ok_or_else(|| {
                        ReconcileError::InvalidDeclaration(format!(
                            "attribute users of membership {name} must only contain strings, got {value}"
                        ))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(ReconcileError::InvalidDeclaration(format!(
                    "attribute users of membership {name} must be a list, got {other}"
                )))
            }
        };
        Self::new(name, group, users)
    }
}

fn string_attribute(attributes: &Attributes, key: &str) -> Result<String, ReconcileError> {
    match attributes.get(key) {
        Some(Value::String(value)) => Ok(value.clone()),
        Some(other) => Err(ReconcileError::InvalidDeclaration(format!(
            "attribute {key} must be a string, got {other}"
        ))),
        None => Err(ReconcileError::InvalidDeclaration(format!(
            "missing required attribute {key}"
        ))),
    }
}

/// Snapshot of a group as listed remotely, rebuilt on every pass.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteGroup {
    pub name: String,
    pub members: Vec<String>,
}

impl RemoteGroup {
    #[must_use]
    pub fn member_set(&self) -> BTreeSet<String> {
        self.members.iter().cloned().collect()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, strum::Display)]
pub enum ReconcileState {
    Reconciled,
    Destroyed,
}

/// Membership as observed remotely, projected back into the declaration's shape.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ObservedMembership {
    pub name: String,
    pub group: String,
    pub users: BTreeSet<String>,
}

impl ObservedMembership {
    #[must_use]
    pub fn from_remote(name: &str, remote: &RemoteGroup) -> Self {
        Self {
            name: name.to_string(),
            group: remote.name.clone(),
            users: remote.member_set(),
        }
    }

    #[must_use]
    pub fn member_count(&self) -> usize {
        self.users.len()
    }

    /// `Reconciled` if the observed users are exactly the declared ones.
    #[must_use]
    pub fn state(&self, declaration: &GroupMembership) -> Option<ReconcileState> {
        (self.group == declaration.group && self.users == declaration.users)
            .then_some(ReconcileState::Reconciled)
    }

    /// Users observed remotely that the declaration doesn't list, i.e. out-of-band drift.
    #[must_use]
    pub fn undeclared_users<'a>(&'a self, declaration: &GroupMembership) -> HashSet<&'a str> {
        self.users
            .iter()
            .filter(|user| !declaration.users.contains(*user))
            .map(String::as_str)
            .collect()
    }

    /// Attributes written back to the host framework.
    #[must_use]
    pub fn to_attributes(&self) -> Attributes {
        let mut attributes = Attributes::new();
        attributes.insert("name".into(), Value::String(self.name.clone()));
        attributes.insert("group".into(), Value::String(self.group.clone()));
        attributes.insert(
            "users".into(),
            Value::Array(self.users.iter().cloned().map(Value::String).collect()),
        );
        attributes.insert(USERS_COUNT_ATTRIBUTE.into(), Value::from(self.member_count()));
        attributes
    }
}
