//! Live notification store.
//!
//! Binds to one user, keeps the newest notifications resident, and
//! reconciles on every server change event. Reads never block on the
//! network once the window is loaded; mutations go through the backend
//! and fold the response into the window by version.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use bookcircle_client::{ChangeFilter, DataService};
use bookcircle_shared::{BulkReadReceipt, ClientError, ClientResult, Notification, Table};

use crate::binding::{pump_loop, Binding, BindingSlot};
use crate::gate::{Announcement, AnnouncementGate};
use crate::live::{LiveWindow, Snapshot, DEFAULT_WINDOW};

pub struct NotificationStore<S: DataService> {
    service: Arc<S>,
    window: LiveWindow<Notification>,
    gate: AnnouncementGate,
    binding: BindingSlot,
}

impl<S: DataService> NotificationStore<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self::with_limit(service, DEFAULT_WINDOW)
    }

    pub fn with_limit(service: Arc<S>, limit: usize) -> Self {
        Self {
            service,
            window: LiveWindow::new(limit),
            gate: AnnouncementGate::new(),
            binding: BindingSlot::new(),
        }
    }

    /// Bind the store to a user: probe capabilities, open the change
    /// subscription, load the initial window, and start the refresh
    /// pump. Rebinding tears the previous binding down first.
    ///
    /// A failed initial load is logged and leaves an empty settled
    /// window; the next change event heals it.
    pub async fn bind(&self, user_id: Uuid) -> ClientResult<()> {
        self.binding.teardown();
        self.window.reset();

        let caps = match self.service.capabilities().await {
            Ok(caps) => caps,
            Err(e) => {
                self.window.finish_loading();
                return Err(e);
            }
        };
        if !caps.notifications {
            tracing::info!(user = %user_id, "notifications not provisioned, serving empty window");
            self.window.mark_unprovisioned();
            self.binding.install(Binding { user_id, pump: None });
            return Ok(());
        }

        // Subscribe before the first fetch so no change can land
        // between the snapshot and the feed.
        let filter = ChangeFilter::new(Table::Notifications, user_id);
        let feed = match self.service.subscribe(filter).await {
            Ok(feed) => feed,
            Err(e) => {
                self.window.finish_loading();
                return Err(e);
            }
        };

        match self
            .service
            .list_notifications(user_id, self.window.limit() as u32)
            .await
        {
            Ok(rows) => self.window.reconcile(rows),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "initial notification load failed");
                self.window.finish_loading();
            }
        }

        let service = self.service.clone();
        let pump = tokio::spawn(pump_loop(feed, self.window.downgrade(), move |limit| {
            let service = service.clone();
            async move { service.list_notifications(user_id, limit).await }
        }));
        self.binding.install(Binding { user_id, pump: Some(pump) });
        Ok(())
    }

    /// Stop refreshing and publish an empty settled snapshot.
    pub fn unbind(&self) {
        self.binding.teardown();
        self.window.clear();
    }

    pub fn is_bound(&self) -> bool {
        self.binding.user().is_some()
    }

    pub fn snapshot(&self) -> Snapshot<Notification> {
        self.window.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<Notification>> {
        self.window.watch()
    }

    /// Unread count in the resident window.
    pub fn unread(&self) -> usize {
        self.window
            .snapshot()
            .items
            .iter()
            .filter(|n| !n.read)
            .count()
    }

    /// One-shot startup announcement, granted at most once per store
    /// lifetime and only while something is unread.
    pub fn announcement(&self) -> Option<Announcement> {
        self.gate.offer(self.unread())
    }

    /// Refetch the window now. Unlike pump refreshes, errors surface to
    /// the caller.
    pub async fn refresh(&self) -> ClientResult<()> {
        let user_id = self.require_ready()?;
        let rows = self
            .service
            .list_notifications(user_id, self.window.limit() as u32)
            .await?;
        self.window.reconcile(rows);
        Ok(())
    }

    /// Mark one notification read and fold the server's updated record
    /// into the window. The response version outranks any refetch that
    /// was already in flight.
    pub async fn mark_read(&self, id: Uuid) -> ClientResult<Notification> {
        let user_id = self.require_ready()?;
        let updated = self.service.mark_notification_read(user_id, id).await?;
        self.window.merge_record(updated.clone());
        Ok(updated)
    }

    /// Mark everything read. The single version watermark from the
    /// server is stamped on every resident row it covers, so rows that
    /// arrived after the bulk update keep their unread state.
    pub async fn mark_all_read(&self) -> ClientResult<BulkReadReceipt> {
        let user_id = self.require_ready()?;
        let receipt = self.service.mark_all_notifications_read(user_id).await?;
        self.window.apply_each(|n| {
            if !n.read && n.version < receipt.version {
                n.read = true;
                n.version = receipt.version;
                true
            } else {
                false
            }
        });
        Ok(receipt)
    }

    fn require_ready(&self) -> ClientResult<Uuid> {
        let user_id = self
            .binding
            .user()
            .ok_or_else(|| ClientError::bad_request("notification store is not bound"))?;
        if !self.window.snapshot().provisioned {
            return Err(ClientError::not_provisioned("notifications are not provisioned"));
        }
        Ok(user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookcircle_client::MemoryDataService;
    use bookcircle_shared::{ErrorCode, NotificationKind};
    use std::time::Duration;

    async fn wait_until(
        rx: &mut watch::Receiver<Snapshot<Notification>>,
        predicate: impl Fn(&Snapshot<Notification>) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                {
                    let snapshot = rx.borrow_and_update();
                    if predicate(&snapshot) {
                        return;
                    }
                }
                rx.changed().await.expect("window closed while waiting");
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn store_over(service: &MemoryDataService) -> NotificationStore<MemoryDataService> {
        NotificationStore::new(Arc::new(service.clone()))
    }

    #[tokio::test]
    async fn bind_loads_newest_window() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        for i in 0..25 {
            let actor = MemoryDataService::make_actor(&format!("reader{i}"));
            service.push_notification(user, actor, NotificationKind::Follow).await;
        }

        let store = store_over(&service);
        store.bind(user).await.unwrap();

        let snapshot = store.snapshot();
        assert!(!snapshot.loading);
        assert!(snapshot.provisioned);
        assert_eq!(snapshot.items.len(), 20);
        assert_eq!(store.unread(), 20);
        for pair in snapshot.items.windows(2) {
            assert!(pair[0].version > pair[1].version);
        }
    }

    #[tokio::test]
    async fn change_event_refreshes_window() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let store = store_over(&service);
        store.bind(user).await.unwrap();
        assert_eq!(store.unread(), 0);

        let mut rx = store.watch();
        let actor = MemoryDataService::make_actor("mara");
        let pushed = service.push_notification(user, actor, NotificationKind::Like).await;

        wait_until(&mut rx, |s| s.items.iter().any(|n| n.id == pushed.id)).await;
        assert_eq!(store.unread(), 1);
    }

    #[tokio::test]
    async fn mark_read_folds_response_into_window() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let actor = MemoryDataService::make_actor("ana");
        let pushed = service.push_notification(user, actor, NotificationKind::Comment).await;

        let store = store_over(&service);
        store.bind(user).await.unwrap();
        assert_eq!(store.unread(), 1);

        let updated = store.mark_read(pushed.id).await.unwrap();
        assert!(updated.read);
        assert!(updated.version > pushed.version);

        let snapshot = store.snapshot();
        assert!(snapshot.items[0].read);
        assert_eq!(store.unread(), 0);

        // A full refetch converges to the same state.
        store.refresh().await.unwrap();
        assert!(store.snapshot().items[0].read);
    }

    #[tokio::test]
    async fn mark_read_unknown_id_is_an_error() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let store = store_over(&service);
        store.bind(user).await.unwrap();

        let err = store.mark_read(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotificationNotFound));
    }

    #[tokio::test]
    async fn mark_all_read_stamps_watermark() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        for name in ["a", "b", "c"] {
            let actor = MemoryDataService::make_actor(name);
            service.push_notification(user, actor, NotificationKind::Follow).await;
        }

        let store = store_over(&service);
        store.bind(user).await.unwrap();
        assert_eq!(store.unread(), 3);

        let receipt = store.mark_all_read().await.unwrap();
        assert_eq!(receipt.updated, 3);

        let snapshot = store.snapshot();
        assert!(snapshot.items.iter().all(|n| n.read && n.version == receipt.version));
        assert_eq!(store.unread(), 0);

        store.refresh().await.unwrap();
        assert_eq!(store.unread(), 0);
    }

    #[tokio::test]
    async fn unread_drains_one_then_all() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let actor = MemoryDataService::make_actor("peer");
        for _ in 0..2 {
            let seen = service.push_notification(user, actor.clone(), NotificationKind::Like).await;
            service.mark_notification_read(user, seen.id).await.unwrap();
        }
        let mut unread = Vec::new();
        for _ in 0..3 {
            unread.push(service.push_notification(user, actor.clone(), NotificationKind::Follow).await);
        }

        let store = store_over(&service);
        store.bind(user).await.unwrap();
        assert_eq!(store.snapshot().items.len(), 5);
        assert_eq!(store.unread(), 3);

        let marked = store.mark_read(unread[0].id).await.unwrap();
        assert!(marked.read);
        assert_eq!(store.unread(), 2);

        let receipt = store.mark_all_read().await.unwrap();
        assert_eq!(receipt.updated, 2);
        assert_eq!(store.unread(), 0);

        let snapshot = store.snapshot();
        assert!(snapshot.items.iter().all(|n| n.read));
        // Rows read before the bulk update keep their own versions.
        let at_watermark = snapshot.items.iter().filter(|n| n.version == receipt.version).count();
        assert_eq!(at_watermark, 2);
    }

    #[tokio::test]
    async fn notifications_arriving_after_bulk_read_stay_unread() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let actor = MemoryDataService::make_actor("ana");
        service.push_notification(user, actor.clone(), NotificationKind::Follow).await;

        let store = store_over(&service);
        store.bind(user).await.unwrap();
        store.mark_all_read().await.unwrap();
        assert_eq!(store.unread(), 0);

        let mut rx = store.watch();
        let late = service.push_notification(user, actor, NotificationKind::Mention).await;
        wait_until(&mut rx, |s| s.items.iter().any(|n| n.id == late.id)).await;

        assert_eq!(store.unread(), 1);
    }

    #[tokio::test]
    async fn unprovisioned_backend_serves_empty_settled_window() {
        let service = MemoryDataService::without_notifications();
        let user = Uuid::new_v4();
        let store = store_over(&service);
        store.bind(user).await.unwrap();

        let snapshot = store.snapshot();
        assert!(!snapshot.loading);
        assert!(!snapshot.provisioned);
        assert!(snapshot.items.is_empty());

        let err = store.mark_read(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_provisioned());
        assert!(store.announcement().is_none());
    }

    #[tokio::test]
    async fn announcement_granted_once() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let actor = MemoryDataService::make_actor("bo");
        service.push_notification(user, actor.clone(), NotificationKind::Follow).await;
        service.push_notification(user, actor, NotificationKind::Like).await;

        let store = store_over(&service);
        store.bind(user).await.unwrap();

        let granted = store.announcement().unwrap();
        assert_eq!(granted.unread, 2);
        assert!(store.announcement().is_none());
    }

    #[tokio::test]
    async fn announcement_waits_for_unread() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let store = store_over(&service);
        store.bind(user).await.unwrap();

        // Nothing unread yet; the grant must not be consumed.
        assert!(store.announcement().is_none());

        let mut rx = store.watch();
        let actor = MemoryDataService::make_actor("late");
        service.push_notification(user, actor, NotificationKind::Follow).await;
        wait_until(&mut rx, |s| !s.items.is_empty()).await;

        assert!(store.announcement().is_some());
    }

    #[tokio::test]
    async fn unbind_clears_and_stops_refreshing() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let store = store_over(&service);
        store.bind(user).await.unwrap();
        store.unbind();
        assert!(!store.is_bound());

        let actor = MemoryDataService::make_actor("x");
        service.push_notification(user, actor, NotificationKind::Follow).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let snapshot = store.snapshot();
        assert!(snapshot.items.is_empty());
        assert!(!snapshot.loading);
    }

    #[tokio::test]
    async fn rebind_switches_user() {
        let service = MemoryDataService::new();
        let ana = Uuid::new_v4();
        let bo = Uuid::new_v4();
        let actor = MemoryDataService::make_actor("peer");
        service.push_notification(ana, actor.clone(), NotificationKind::Follow).await;
        let bos = service.push_notification(bo, actor, NotificationKind::Like).await;

        let store = store_over(&service);
        store.bind(ana).await.unwrap();
        assert_eq!(store.snapshot().items.len(), 1);

        store.bind(bo).await.unwrap();
        let snapshot = store.snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].id, bos.id);
    }

    #[tokio::test]
    async fn drop_during_inflight_refresh_is_quiet() {
        let service = MemoryDataService::with_latency(Duration::from_millis(40));
        let user = Uuid::new_v4();
        let store = store_over(&service);
        store.bind(user).await.unwrap();
        let mut rx = store.watch();

        // Kick off an event-driven refresh, then drop the store while
        // the fetch is still sleeping inside the service.
        let actor = MemoryDataService::make_actor("x");
        service.push_notification(user, actor, NotificationKind::Follow).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(store);

        tokio::time::sleep(Duration::from_millis(80)).await;
        // The watch channel closed without delivering a late update.
        assert!(rx.changed().await.is_err());
    }

    #[tokio::test]
    async fn mutations_require_binding() {
        let service = MemoryDataService::new();
        let store = store_over(&service);
        let err = store.mark_read(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::BadRequest));
    }
}
