//! Live club directory for the bound user: membership state and member
//! counts stay current through change events.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use bookcircle_client::{ChangeFilter, DataService};
use bookcircle_shared::{ActorSummary, ClientError, ClientResult, Club, Table};

use crate::binding::{pump_loop, Binding, BindingSlot};
use crate::live::{LiveWindow, Snapshot};

/// Clubs are a directory, not a stream; the window just caps pathological
/// list sizes.
const CLUB_WINDOW: usize = 100;

pub struct ClubsStore<S: DataService> {
    service: Arc<S>,
    window: LiveWindow<Club>,
    binding: BindingSlot,
}

impl<S: DataService> ClubsStore<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            window: LiveWindow::new(CLUB_WINDOW),
            binding: BindingSlot::new(),
        }
    }

    pub async fn bind(&self, user_id: Uuid) -> ClientResult<()> {
        self.binding.teardown();
        self.window.reset();

        let feed = match self
            .service
            .subscribe(ChangeFilter::new(Table::Clubs, user_id))
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                self.window.finish_loading();
                return Err(e);
            }
        };

        match self.service.list_clubs(user_id).await {
            Ok(rows) => self.window.reconcile(rows),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "initial club load failed");
                self.window.finish_loading();
            }
        }

        let service = self.service.clone();
        let pump = tokio::spawn(pump_loop(feed, self.window.downgrade(), move |_limit| {
            let service = service.clone();
            async move { service.list_clubs(user_id).await }
        }));
        self.binding.install(Binding { user_id, pump: Some(pump) });
        Ok(())
    }

    pub fn unbind(&self) {
        self.binding.teardown();
        self.window.clear();
    }

    pub fn snapshot(&self) -> Snapshot<Club> {
        self.window.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<Club>> {
        self.window.watch()
    }

    pub async fn join(&self, club_id: Uuid) -> ClientResult<Club> {
        let user_id = self.require_bound()?;
        let updated = self.service.join_club(user_id, club_id).await?;
        self.window.merge_record(updated.clone());
        Ok(updated)
    }

    pub async fn leave(&self, club_id: Uuid) -> ClientResult<Club> {
        let user_id = self.require_bound()?;
        let updated = self.service.leave_club(user_id, club_id).await?;
        self.window.merge_record(updated.clone());
        Ok(updated)
    }

    /// Roster of a club, sorted by username. Available without a bound
    /// user; the listing is the same for every viewer.
    pub async fn members(&self, club_id: Uuid) -> ClientResult<Vec<ActorSummary>> {
        self.service.club_members(club_id).await
    }

    fn require_bound(&self) -> ClientResult<Uuid> {
        self.binding
            .user()
            .ok_or_else(|| ClientError::bad_request("clubs store is not bound"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookcircle_client::MemoryDataService;
    use bookcircle_shared::ErrorCode;

    #[tokio::test]
    async fn join_updates_membership_in_snapshot() {
        let service = MemoryDataService::new();
        let club = service.seed_club("Night Readers").await;
        let user = Uuid::new_v4();

        let store = ClubsStore::new(Arc::new(service.clone()));
        store.bind(user).await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert!(!snapshot.items[0].joined);

        let joined = store.join(club.id).await.unwrap();
        assert!(joined.joined);
        assert_eq!(joined.member_count, 1);
        assert!(store.snapshot().items[0].joined);

        let left = store.leave(club.id).await.unwrap();
        assert!(!left.joined);
        assert!(!store.snapshot().items[0].joined);
    }

    #[tokio::test]
    async fn roster_reflects_joins() {
        let service = MemoryDataService::new();
        let club = service.seed_club("Night Readers").await;
        let amina = service.seed_profile("amina").await;

        let store = ClubsStore::new(Arc::new(service.clone()));
        store.bind(amina.id).await.unwrap();
        assert!(store.members(club.id).await.unwrap().is_empty());

        store.join(club.id).await.unwrap();
        let roster = store.members(club.id).await.unwrap();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].username, "amina");

        let err = store.members(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ClubNotFound));
    }

    #[tokio::test]
    async fn double_join_surfaces_conflict() {
        let service = MemoryDataService::new();
        let club = service.seed_club("Slow Readers").await;
        let user = Uuid::new_v4();

        let store = ClubsStore::new(Arc::new(service.clone()));
        store.bind(user).await.unwrap();

        store.join(club.id).await.unwrap();
        let err = store.join(club.id).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::AlreadyMember));
    }
}
