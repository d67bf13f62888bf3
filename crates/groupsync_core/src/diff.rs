use std::collections::BTreeSet;

/// Changes needed to turn the actual membership into the desired one.
///
/// Both sets come from set differences, so no member is ever in both.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct MembershipDiff {
    pub additions: BTreeSet<String>,
    pub removals: BTreeSet<String>,
}

impl MembershipDiff {
    /// Diff that removes every current member.
    #[must_use]
    pub fn teardown(actual: &BTreeSet<String>) -> Self {
        compute_diff(&BTreeSet::new(), actual)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.additions.len() + self.removals.len()
    }
}

/// `additions = desired \ actual`, `removals = actual \ desired`.
#[must_use]
pub fn compute_diff(desired: &BTreeSet<String>, actual: &BTreeSet<String>) -> MembershipDiff {
    MembershipDiff {
        additions: desired.difference(actual).cloned().collect(),
        removals: actual.difference(desired).cloned().collect(),
    }
}
