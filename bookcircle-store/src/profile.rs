//! Live profile card for the signed-in user.
//!
//! Unlike the windowed stores this holds one record plus follow counters,
//! kept fresh from two change feeds: the profile row itself and the
//! follows table on either side of the user.

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use uuid::Uuid;

use bookcircle_client::{ChangeFeed, ChangeFilter, DataService};
use bookcircle_shared::{
    ActorSummary, ClientError, ClientResult, FollowStats, Profile, ProfilePatch, Table,
};

use crate::binding::{Binding, BindingSlot};

/// Point-in-time view of the bound user's profile and follow counters.
#[derive(Debug, Clone)]
pub struct ProfileSnapshot {
    pub profile: Option<Profile>,
    pub stats: FollowStats,
    pub loading: bool,
}

impl ProfileSnapshot {
    fn initial() -> Self {
        Self { profile: None, stats: FollowStats::default(), loading: true }
    }
}

pub struct ProfileStore<S: DataService> {
    service: Arc<S>,
    cell: Arc<watch::Sender<ProfileSnapshot>>,
    binding: BindingSlot,
}

impl<S: DataService> ProfileStore<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            cell: Arc::new(watch::channel(ProfileSnapshot::initial()).0),
            binding: BindingSlot::new(),
        }
    }

    pub async fn bind(&self, user_id: Uuid) -> ClientResult<()> {
        self.binding.teardown();
        self.cell.send_replace(ProfileSnapshot::initial());

        let profile_feed = match self
            .service
            .subscribe(ChangeFilter::new(Table::Profiles, user_id))
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                self.finish_loading();
                return Err(e);
            }
        };
        let follow_feed = match self
            .service
            .subscribe(ChangeFilter::new(Table::Follows, user_id))
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                self.finish_loading();
                return Err(e);
            }
        };

        match self.service.get_profile(user_id).await {
            Ok(profile) => self.merge_profile(profile),
            Err(e) => tracing::warn!(user = %user_id, error = %e, "initial profile load failed"),
        }
        match self.service.follow_stats(user_id).await {
            Ok(stats) => self.cell.send_modify(|s| s.stats = stats),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "initial follow stats load failed")
            }
        }
        self.finish_loading();

        let pump = tokio::spawn(profile_pump(
            profile_feed,
            follow_feed,
            Arc::downgrade(&self.cell),
            self.service.clone(),
            user_id,
        ));
        self.binding.install(Binding { user_id, pump: Some(pump) });
        Ok(())
    }

    pub fn unbind(&self) {
        self.binding.teardown();
        self.cell.send_replace(ProfileSnapshot {
            profile: None,
            stats: FollowStats::default(),
            loading: false,
        });
    }

    pub fn snapshot(&self) -> ProfileSnapshot {
        self.cell.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<ProfileSnapshot> {
        self.cell.subscribe()
    }

    /// Refetch profile and counters now instead of waiting for an event.
    pub async fn refresh(&self) -> ClientResult<()> {
        let user_id = self.require_bound()?;
        let profile = self.service.get_profile(user_id).await?;
        let stats = self.service.follow_stats(user_id).await?;
        self.merge_profile(profile);
        self.cell.send_modify(|s| {
            s.stats = stats;
            s.loading = false;
        });
        Ok(())
    }

    pub async fn update(&self, patch: ProfilePatch) -> ClientResult<Profile> {
        let user_id = self.require_bound()?;
        let updated = self.service.update_profile(user_id, patch).await?;
        self.merge_profile(updated.clone());
        Ok(updated)
    }

    /// Follow another reader as the bound user.
    pub async fn follow(&self, target: Uuid) -> ClientResult<()> {
        let user_id = self.require_bound()?;
        self.service.follow(user_id, target).await?;
        self.refetch_stats(user_id).await;
        Ok(())
    }

    pub async fn unfollow(&self, target: Uuid) -> ClientResult<()> {
        let user_id = self.require_bound()?;
        self.service.unfollow(user_id, target).await?;
        self.refetch_stats(user_id).await;
        Ok(())
    }

    /// Readers following the bound user, sorted by username.
    pub async fn followers(&self) -> ClientResult<Vec<ActorSummary>> {
        let user_id = self.require_bound()?;
        self.service.followers(user_id).await
    }

    /// Readers the bound user follows, sorted by username.
    pub async fn following(&self) -> ClientResult<Vec<ActorSummary>> {
        let user_id = self.require_bound()?;
        self.service.following(user_id).await
    }

    /// The write itself succeeded, so a failed counter refetch is only
    /// logged; the follows feed will repair the numbers.
    async fn refetch_stats(&self, user_id: Uuid) {
        match self.service.follow_stats(user_id).await {
            Ok(stats) => self.cell.send_modify(|s| s.stats = stats),
            Err(e) => tracing::warn!(user = %user_id, error = %e, "follow stats refresh failed"),
        }
    }

    fn merge_profile(&self, incoming: Profile) {
        merge_profile_into(&self.cell, incoming);
    }

    fn finish_loading(&self) {
        self.cell.send_if_modified(|s| {
            let was_loading = s.loading;
            s.loading = false;
            was_loading
        });
    }

    fn require_bound(&self) -> ClientResult<Uuid> {
        self.binding
            .user()
            .ok_or_else(|| ClientError::bad_request("profile store is not bound"))
    }
}

/// Keep whichever copy carries the higher version, so an optimistic
/// patch is never reverted by a refetch that raced it.
fn merge_profile_into(cell: &watch::Sender<ProfileSnapshot>, incoming: Profile) {
    cell.send_if_modified(|s| match &s.profile {
        Some(current) if current.version > incoming.version => false,
        _ => {
            s.profile = Some(incoming);
            true
        }
    });
}

async fn profile_pump<S: DataService>(
    mut profile_feed: ChangeFeed,
    mut follow_feed: ChangeFeed,
    cell: Weak<watch::Sender<ProfileSnapshot>>,
    service: Arc<S>,
    user_id: Uuid,
) {
    loop {
        tokio::select! {
            event = profile_feed.next() => {
                let Some(event) = event else { break };
                tracing::debug!(event = %event.id, table = %event.table, "profile change");
                match service.get_profile(user_id).await {
                    Ok(profile) => {
                        let Some(cell) = cell.upgrade() else { break };
                        merge_profile_into(&cell, profile);
                    }
                    Err(e) => tracing::warn!(user = %user_id, error = %e, "profile refresh failed"),
                }
            }
            event = follow_feed.next() => {
                let Some(event) = event else { break };
                tracing::debug!(event = %event.id, table = %event.table, "follow change");
                match service.follow_stats(user_id).await {
                    Ok(stats) => {
                        let Some(cell) = cell.upgrade() else { break };
                        cell.send_modify(|s| s.stats = stats);
                    }
                    Err(e) => tracing::warn!(user = %user_id, error = %e, "follow stats refresh failed"),
                }
            }
        }
    }
}
