use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use tokio::time::sleep;

use crate::api::{ApiError, GroupApi, GroupPage};

const DEFAULT_PAGE_SIZE: usize = 100;
const STALE_PREFIX: &str = "stale:";

type Groups = BTreeMap<String, Vec<String>>;

/// Way in which the fake breaks its pagination contract.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub(crate) enum PageFault {
    #[default]
    None,
    /// A full last page is still marked truncated and followed by an empty page.
    TruncateFullLastPage,
    /// Every page hands out the marker of the second page.
    MarkerLoop,
    /// Truncated pages carry no marker.
    MissingMarker,
    /// Each page after the first repeats the last member of the previous one.
    RepeatBoundaryMember,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub(crate) struct Calls {
    pub get_group: usize,
    pub add_member: usize,
    pub remove_member: usize,
}

#[derive(Default)]
struct State {
    groups: Groups,
    // what listings see while mutations haven't propagated yet
    stale: Option<Groups>,
    stale_listings: usize,
    throttled_listings: usize,
    throttled_mutations: usize,
    failing_members: HashMap<String, ApiError>,
    vanishing: Option<(String, usize)>,
    calls: Calls,
}

/// In-memory remote group API.
pub(crate) struct FakeGroupApi {
    state: Mutex<State>,
    page_size: usize,
    fault: PageFault,
    listing_lag: usize,
    mutation_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeGroupApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::default(),
            page_size: DEFAULT_PAGE_SIZE,
            fault: PageFault::None,
            listing_lag: 0,
            mutation_delay: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_group<I, S>(self, group: &str, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state()
            .groups
            .insert(group.into(), members.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_fault(mut self, fault: PageFault) -> Self {
        self.fault = fault;
        self
    }

    /// Listings keep showing the state from before the latest mutations `listings` times.
    pub fn with_listing_lag(mut self, listings: usize) -> Self {
        self.listing_lag = listings;
        self
    }

    pub fn with_mutation_delay(mut self, delay: Duration) -> Self {
        self.mutation_delay = delay;
        self
    }

    pub fn throttle_listings(&self, count: usize) {
        self.state().throttled_listings = count;
    }

    pub fn throttle_mutations(&self, count: usize) {
        self.state().throttled_mutations = count;
    }

    /// Every add or remove of `member` fails with `err`.
    pub fn fail_member(&self, member: &str, err: ApiError) {
        self.state().failing_members.insert(member.into(), err);
    }

    /// Delete `group` once it has been listed `listings` more times.
    pub fn remove_group_after(&self, group: &str, listings: usize) {
        self.state().vanishing = Some((group.into(), listings));
    }

    pub fn remove_group(&self, group: &str) {
        self.state().groups.remove(group);
    }

    pub fn members(&self, group: &str) -> Option<Vec<String>> {
        self.state().groups.get(group).cloned()
    }

    pub fn calls(&self) -> Calls {
        self.state().calls.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn encode_marker(stale: bool, offset: usize) -> String {
        if stale {
            format!("{STALE_PREFIX}{offset}")
        } else {
            offset.to_string()
        }
    }

    fn decode_marker(marker: &str) -> Result<(bool, usize), ApiError> {
        let (stale, offset) = match marker.strip_prefix(STALE_PREFIX) {
            Some(offset) => (true, offset),
            None => (false, marker),
        };
        let offset = offset.parse().map_err(|_| ApiError::Other {
            code: "InvalidInput".into(),
            message: format!("invalid marker {marker}"),
        })?;
        Ok((stale, offset))
    }

    fn list(&self, group: &str, marker: Option<&str>) -> Result<GroupPage, ApiError> {
        let mut state = self.state();
        state.calls.get_group += 1;

        if matches!(state.vanishing, Some((_, 0))) {
            if let Some((vanishing, _)) = state.vanishing.take() {
                state.groups.remove(&vanishing);
            }
        } else if let Some((_, remaining)) = state.vanishing.as_mut() {
            *remaining -= 1;
        }

        if state.throttled_listings > 0 {
            state.throttled_listings -= 1;
            return Err(ApiError::Throttled("Rate exceeded".into()));
        }

        let (stale, offset) = match marker {
            Some(marker) => Self::decode_marker(marker)?,
            None if state.stale_listings > 0 => {
                state.stale_listings -= 1;
                (true, 0)
            }
            None => {
                state.stale = None;
                (false, 0)
            }
        };
        let groups = match (stale, state.stale.as_ref()) {
            (true, Some(stale)) => stale,
            _ => &state.groups,
        };
        let members = groups
            .get(group)
            .ok_or_else(|| ApiError::no_such_group(group))?;

        let start = offset.min(members.len());
        let end = (start + self.page_size).min(members.len());
        let mut page_members = members[start..end].to_vec();
        if self.fault == PageFault::RepeatBoundaryMember && start > 0 {
            page_members.insert(0, members[start - 1].clone());
        }

        let is_truncated = end < members.len()
            || (self.fault == PageFault::TruncateFullLastPage
                && end > start
                && end - start == self.page_size);
        let marker = match self.fault {
            _ if !is_truncated => None,
            PageFault::MissingMarker => None,
            PageFault::MarkerLoop => Some(Self::encode_marker(stale, self.page_size)),
            _ => Some(Self::encode_marker(stale, end)),
        };

        Ok(GroupPage {
            group_name: group.into(),
            members: page_members,
            is_truncated,
            marker,
        })
    }

    async fn mutate(&self, group: &str, member: &str, add: bool) -> Result<(), ApiError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if !self.mutation_delay.is_zero() {
            sleep(self.mutation_delay).await;
        }
        let result = self.apply_mutation(group, member, add);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn apply_mutation(&self, group: &str, member: &str, add: bool) -> Result<(), ApiError> {
        let mut state = self.state();
        if add {
            state.calls.add_member += 1;
        } else {
            state.calls.remove_member += 1;
        }

        if state.throttled_mutations > 0 {
            state.throttled_mutations -= 1;
            return Err(ApiError::Throttled("Rate exceeded".into()));
        }
        if let Some(err) = state.failing_members.get(member) {
            return Err(err.clone());
        }

        let snapshot = (self.listing_lag > 0 && state.stale.is_none()).then(|| state.groups.clone());
        let members = state
            .groups
            .get_mut(group)
            .ok_or_else(|| ApiError::no_such_group(group))?;
        let position = members.iter().position(|m| m == member);
        match (add, position) {
            (true, Some(_)) => {
                return Err(ApiError::EntityAlreadyExists(format!(
                    "User {member} is already a member of group {group}"
                )))
            }
            (true, None) => members.push(member.into()),
            (false, Some(position)) => {
                members.remove(position);
            }
            (false, None) => return Err(ApiError::no_such_member(member)),
        }

        if self.listing_lag > 0 {
            if let Some(snapshot) = snapshot {
                state.stale = Some(snapshot);
            }
            state.stale_listings = self.listing_lag;
        }
        Ok(())
    }
}

impl GroupApi for FakeGroupApi {
    async fn get_group(&self, group: &str, marker: Option<&str>) -> Result<GroupPage, ApiError> {
        self.list(group, marker)
    }

    async fn add_member(&self, group: &str, member: &str) -> Result<(), ApiError> {
        self.mutate(group, member, true).await
    }

    async fn remove_member(&self, group: &str, member: &str) -> Result<(), ApiError> {
        self.mutate(group, member, false).await
    }
}
