//! Remote membership listing.
//!
//! A group listing is a cursor kept by the remote API: each `get_group` response may
//! be truncated and carry a marker to continue from. The pages are modelled as a lazy,
//! finite stream that can only be walked once; [`MembershipReader::read_group`] drains
//! it completely before returning, so callers never see a partial listing.
//!
//! The only completion signal is a response with `is_truncated == false`. The number
//! of members on a page says nothing about whether more pages follow: a page can be
//! exactly full and still be followed by another one, or be marked truncated and be
//! followed by an empty final page.
//!
//! Listings that can't be trusted are reported as
//! [`ReconcileError::PaginationInconsistency`] instead of being patched up:
//! - a truncated page without a marker,
//! - a marker that was already used during the same listing (cursor loop),
//! - a member reported on more than one page,
//! - more pages than the configured cap.
use std::{collections::HashSet, pin::pin};

use futures::{stream, Stream, TryStreamExt};
use tokio::time::sleep;

use crate::{
    api::{GroupApi, GroupPage},
    config::EngineConfig,
    error::{Operation, ReconcileError},
    model::RemoteGroup,
    retry::retry,
};

pub struct MembershipReader<'a, C> {
    client: &'a C,
    config: &'a EngineConfig,
}

// Listing progress carried between page requests.
struct Cursor {
    marker: Option<String>,
    used_markers: HashSet<String>,
    pages: usize,
    finished: bool,
}

impl<'a, C> MembershipReader<'a, C>
where
    C: GroupApi + Sync,
{
    pub const fn new(client: &'a C, config: &'a EngineConfig) -> Self {
        Self { client, config }
    }

    /// Pages of the group listing, fetched one by one as the stream is polled.
    fn pages<'s>(
        &'s self,
        group: &'s str,
    ) -> impl Stream<Item = Result<GroupPage, ReconcileError>> + 's {
        let cursor = Cursor {
            marker: None,
            used_markers: HashSet::new(),
            pages: 0,
            finished: false,
        };

        stream::try_unfold(cursor, move |mut cursor| async move {
            if cursor.finished {
                return Ok(None);
            }
            if cursor.pages >= self.config.max_pages {
                return Err(ReconcileError::PaginationInconsistency {
                    group: group.to_string(),
                    detail: format!(
                        "listing didn't finish within {} pages",
                        self.config.max_pages
                    ),
                });
            }
            if cursor.pages > 0 && !self.config.pagination_delay.is_zero() {
                sleep(self.config.pagination_delay).await;
            }

            let marker = cursor.marker.take();
            debug!(
                "Fetching page {} of group {group} members, marker: {marker:?}",
                cursor.pages + 1
            );
            let description = format!("Listing members of group {group}");
            let page = retry(&self.config.retry, &description, || {
                self.client.get_group(group, marker.as_deref())
            })
            .await
            .map_err(|err| ReconcileError::from_retry(err, group, Operation::GetGroup, None))?;
            cursor.pages += 1;

            if page.is_truncated {
                let Some(next) = page.marker.clone() else {
                    return Err(ReconcileError::PaginationInconsistency {
                        group: group.to_string(),
                        detail: format!(
                            "page {} is marked as truncated but carries no marker",
                            cursor.pages
                        ),
                    });
                };
                if !cursor.used_markers.insert(next.clone()) {
                    return Err(ReconcileError::PaginationInconsistency {
                        group: group.to_string(),
                        detail: format!("marker {next} was returned more than once"),
                    });
                }
                debug!(
                    "Page {} of group {group} holds {} members and is truncated, continuing from marker {next}",
                    cursor.pages,
                    page.members.len()
                );
                cursor.marker = Some(next);
            } else {
                debug!(
                    "Page {} of group {group} holds {} members and is the last one",
                    cursor.pages,
                    page.members.len()
                );
                cursor.finished = true;
            }

            Ok(Some((page, cursor)))
        })
    }

    /// Complete current membership of `group`.
    pub async fn read_group(&self, group: &str) -> Result<RemoteGroup, ReconcileError> {
        let mut pages = pin!(self.pages(group));
        let mut members = Vec::new();
        let mut seen = HashSet::new();
        let mut page_count = 0;

        while let Some(page) = pages.try_next().await? {
            page_count += 1;
            if page.group_name != group {
                warn!(
                    "Listing of group {group} returned a page for group {}, using the requested name",
                    page.group_name
                );
            }
            for member in page.members {
                if !seen.insert(member.clone()) {
                    return Err(ReconcileError::PaginationInconsistency {
                        group: group.to_string(),
                        detail: format!("member {member} was listed more than once"),
                    });
                }
                members.push(member);
            }
        }

        debug!(
            "Group {group} has {} members across {page_count} page(s)",
            members.len()
        );
        Ok(RemoteGroup {
            name: group.to_string(),
            members,
        })
    }
}
