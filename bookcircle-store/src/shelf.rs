//! Live reading-shelf store for the bound user.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use bookcircle_client::{ChangeFilter, DataService};
use bookcircle_shared::{ClientError, ClientResult, ShelfEntry, ShelfUpsert, Table};

use crate::binding::{pump_loop, Binding, BindingSlot};
use crate::live::{LiveWindow, Snapshot};

const SHELF_WINDOW: usize = 200;

pub struct ShelfStore<S: DataService> {
    service: Arc<S>,
    window: LiveWindow<ShelfEntry>,
    binding: BindingSlot,
}

impl<S: DataService> ShelfStore<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self {
            service,
            window: LiveWindow::new(SHELF_WINDOW),
            binding: BindingSlot::new(),
        }
    }

    pub async fn bind(&self, user_id: Uuid) -> ClientResult<()> {
        self.binding.teardown();
        self.window.reset();

        let feed = match self
            .service
            .subscribe(ChangeFilter::new(Table::ShelfEntries, user_id))
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                self.window.finish_loading();
                return Err(e);
            }
        };

        match self.service.list_shelf(user_id).await {
            Ok(rows) => self.window.reconcile(rows),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "initial shelf load failed");
                self.window.finish_loading();
            }
        }

        let service = self.service.clone();
        let pump = tokio::spawn(pump_loop(feed, self.window.downgrade(), move |_limit| {
            let service = service.clone();
            async move { service.list_shelf(user_id).await }
        }));
        self.binding.install(Binding { user_id, pump: Some(pump) });
        Ok(())
    }

    pub fn unbind(&self) {
        self.binding.teardown();
        self.window.clear();
    }

    pub fn snapshot(&self) -> Snapshot<ShelfEntry> {
        self.window.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<ShelfEntry>> {
        self.window.watch()
    }

    /// Add a book or move it between statuses. One entry per book; the
    /// server decides whether this was an insert or an update.
    pub async fn upsert(&self, entry: ShelfUpsert) -> ClientResult<ShelfEntry> {
        let user_id = self.require_bound()?;
        let updated = self.service.upsert_shelf_entry(user_id, entry).await?;
        if !self.window.merge_record(updated.clone()) {
            self.window.prepend(updated.clone());
        }
        Ok(updated)
    }

    pub async fn remove(&self, id: Uuid) -> ClientResult<()> {
        let user_id = self.require_bound()?;
        self.service.remove_shelf_entry(user_id, id).await?;
        self.window.remove(id);
        Ok(())
    }

    fn require_bound(&self) -> ClientResult<Uuid> {
        self.binding
            .user()
            .ok_or_else(|| ClientError::bad_request("shelf store is not bound"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookcircle_client::MemoryDataService;
    use bookcircle_shared::{BookRef, ErrorCode, ReadingStatus};

    fn want(title: &str) -> ShelfUpsert {
        ShelfUpsert {
            book: BookRef { title: title.into(), author: "N. K. Jemisin".into() },
            status: ReadingStatus::WantToRead,
            rating: None,
        }
    }

    #[tokio::test]
    async fn upsert_inserts_then_updates_in_place() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let store = ShelfStore::new(Arc::new(service.clone()));
        store.bind(user).await.unwrap();

        let added = store.upsert(want("The Fifth Season")).await.unwrap();
        assert_eq!(store.snapshot().items.len(), 1);

        let finished = store
            .upsert(ShelfUpsert {
                book: added.book.clone(),
                status: ReadingStatus::Finished,
                rating: Some(5),
            })
            .await
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(finished.id, added.id);
        assert_eq!(snapshot.items[0].status, ReadingStatus::Finished);
        assert_eq!(snapshot.items[0].rating, Some(5));
    }

    #[tokio::test]
    async fn invalid_rating_never_reaches_the_wire() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let store = ShelfStore::new(Arc::new(service.clone()));
        store.bind(user).await.unwrap();

        let mut entry = want("Gideon the Ninth");
        entry.rating = Some(9);
        let err = store.upsert(entry).await.unwrap_err();
        assert!(matches!(err, ClientError::Validation(_)));
        assert!(store.snapshot().items.is_empty());
    }

    #[tokio::test]
    async fn remove_drops_from_window() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let store = ShelfStore::new(Arc::new(service.clone()));
        store.bind(user).await.unwrap();

        let added = store.upsert(want("Annihilation")).await.unwrap();
        store.remove(added.id).await.unwrap();
        assert!(store.snapshot().items.is_empty());

        let err = store.remove(added.id).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ShelfEntryNotFound));
    }
}
