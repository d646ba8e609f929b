use std::collections::BTreeSet;

use crate::model::{UNKNOWN_USER, UserMap};
use crate::settings::RateLimits;
use crate::slack::{SlackClient, UserRecord};

/// Stop paging `users.list` after this many pages; the per-id fallback covers the rest.
const MAX_USER_LIST_PAGES: usize = 20;

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Display name precedence: `real_name`, `profile.display_name`,
/// `profile.real_name`, `name`, then [`UNKNOWN_USER`].
pub fn display_name(user: &UserRecord) -> String {
    let profile = user.profile.as_ref();
    non_empty(user.real_name.as_deref())
        .or_else(|| non_empty(profile.and_then(|p| p.display_name.as_deref())))
        .or_else(|| non_empty(profile.and_then(|p| p.real_name.as_deref())))
        .or_else(|| non_empty(user.name.as_deref()))
        .unwrap_or(UNKNOWN_USER)
        .to_string()
}

/// Resolves user ids to display names.
pub struct IdentityResolver<'a> {
    client: &'a SlackClient,
    limits: &'a RateLimits,
}

impl<'a> IdentityResolver<'a> {
    pub fn new(client: &'a SlackClient, limits: &'a RateLimits) -> Self {
        Self { client, limits }
    }

    /// Resolve every id in `ids`. Never fails: unresolvable ids map to [`UNKNOWN_USER`].
    pub async fn resolve(&self, ids: &BTreeSet<String>) -> UserMap {
        let mut users = UserMap::new();
        if ids.is_empty() {
            return users;
        }

        self.bulk_lookup(ids, &mut users).await;

        let missing: Vec<&String> = ids.iter().filter(|id| !users.contains_key(*id)).collect();
        if !missing.is_empty() {
            tracing::debug!(
                resolved = users.len(),
                missing = missing.len(),
                "falling back to per-user lookups"
            );
            self.individual_lookups(&missing, &mut users).await;
        }

        users
    }

    async fn bulk_lookup(&self, ids: &BTreeSet<String>, users: &mut UserMap) {
        let mut cursor: Option<String> = None;

        for page_number in 0..MAX_USER_LIST_PAGES {
            if page_number > 0 {
                tokio::time::sleep(self.limits.page_delay()).await;
            }

            let page = match self.client.users_list(cursor.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(error = %e, "bulk user lookup failed");
                    return;
                }
            };

            for member in &page.members {
                if ids.contains(&member.id) {
                    users.insert(member.id.clone(), display_name(member));
                }
            }

            if users.len() == ids.len() {
                return;
            }

            match page.next_cursor() {
                Some(next) => cursor = Some(next.to_string()),
                None => return,
            }
        }
    }

    async fn individual_lookups(&self, missing: &[&String], users: &mut UserMap) {
        let batch_size = self.limits.user_batch_size.max(1);

        for (batch_index, batch) in missing.chunks(batch_size).enumerate() {
            if batch_index > 0 {
                tokio::time::sleep(self.limits.user_batch_delay()).await;
            }

            for (item_index, id) in batch.iter().enumerate() {
                if item_index > 0 {
                    tokio::time::sleep(self.limits.user_lookup_delay()).await;
                }

                let name = match self.client.users_info(id).await {
                    Ok(user) => display_name(&user),
                    Err(e) => {
                        tracing::warn!(user = %id, error = %e, "user lookup failed");
                        UNKNOWN_USER.to_string()
                    }
                };
                users.insert((*id).clone(), name);
            }
        }
    }
}
