//! Bounded live window over a user-scoped record list.
//!
//! A window holds the newest records for one user, published to watchers
//! through a [`watch`] channel. The server is the source of truth for
//! membership and order; local copies win only when they carry a higher
//! version, so an optimistic patch is never reverted by a refetch that
//! was already in flight when the patch landed.

use std::sync::{Arc, Weak};

use tokio::sync::watch;
use uuid::Uuid;

use bookcircle_shared::{Club, Notification, Post, ShelfEntry};

/// Window size stores keep resident per user unless overridden.
pub const DEFAULT_WINDOW: usize = 20;

/// Records a [`LiveWindow`] can hold: identity plus a server-assigned
/// version that increases on every write.
pub trait LiveRecord: Clone + Send + Sync + 'static {
    fn record_id(&self) -> Uuid;
    fn record_version(&self) -> i64;
}

impl LiveRecord for Notification {
    fn record_id(&self) -> Uuid {
        self.id
    }
    fn record_version(&self) -> i64 {
        self.version
    }
}

impl LiveRecord for Post {
    fn record_id(&self) -> Uuid {
        self.id
    }
    fn record_version(&self) -> i64 {
        self.version
    }
}

impl LiveRecord for Club {
    fn record_id(&self) -> Uuid {
        self.id
    }
    fn record_version(&self) -> i64 {
        self.version
    }
}

impl LiveRecord for ShelfEntry {
    fn record_id(&self) -> Uuid {
        self.id
    }
    fn record_version(&self) -> i64 {
        self.version
    }
}

/// What watchers observe: the window contents plus load state.
#[derive(Debug, Clone)]
pub struct Snapshot<T> {
    /// Newest first, at most the window limit.
    pub items: Vec<T>,
    /// True until the first reconcile (or a terminal outcome) lands.
    pub loading: bool,
    /// False when the backend reports the feature unprovisioned.
    pub provisioned: bool,
}

impl<T> Snapshot<T> {
    fn initial() -> Self {
        Self { items: Vec::new(), loading: true, provisioned: true }
    }
}

/// Merge a fresh fetch into the window. Fetched order and membership
/// win; per record the higher version wins.
fn merge_window<T: LiveRecord>(local: &[T], fetched: Vec<T>, limit: usize) -> Vec<T> {
    let mut merged: Vec<T> = fetched
        .into_iter()
        .map(|incoming| {
            let stale = local
                .iter()
                .find(|l| l.record_id() == incoming.record_id())
                .filter(|l| l.record_version() > incoming.record_version());
            match stale {
                Some(local_copy) => local_copy.clone(),
                None => incoming,
            }
        })
        .collect();
    merged.truncate(limit);
    merged
}

struct WindowInner<T> {
    tx: watch::Sender<Snapshot<T>>,
    limit: usize,
}

/// Shared handle to one live window. Clones observe and mutate the same
/// state.
pub struct LiveWindow<T> {
    inner: Arc<WindowInner<T>>,
}

impl<T> Clone for LiveWindow<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

/// Weak handle held by background tasks so a window can be torn down
/// while refreshes are still in flight.
pub struct WeakWindow<T> {
    inner: Weak<WindowInner<T>>,
}

impl<T> WeakWindow<T> {
    pub fn upgrade(&self) -> Option<LiveWindow<T>> {
        self.inner.upgrade().map(|inner| LiveWindow { inner })
    }
}

impl<T: LiveRecord> LiveWindow<T> {
    pub fn new(limit: usize) -> Self {
        let (tx, _) = watch::channel(Snapshot::initial());
        Self { inner: Arc::new(WindowInner { tx, limit }) }
    }

    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    pub fn downgrade(&self) -> WeakWindow<T> {
        WeakWindow { inner: Arc::downgrade(&self.inner) }
    }

    pub fn snapshot(&self) -> Snapshot<T> {
        self.inner.tx.borrow().clone()
    }

    /// Watch for snapshot changes. The receiver sees the current value
    /// immediately via [`watch::Receiver::borrow`].
    pub fn watch(&self) -> watch::Receiver<Snapshot<T>> {
        self.inner.tx.subscribe()
    }

    /// Back to the pristine loading state, for rebinding.
    pub fn reset(&self) {
        self.inner.tx.send_replace(Snapshot::initial());
    }

    /// Empty, settled, provisioned. Published on unbind.
    pub fn clear(&self) {
        self.inner.tx.send_replace(Snapshot {
            items: Vec::new(),
            loading: false,
            provisioned: true,
        });
    }

    /// Terminal state for a backend without this feature.
    pub fn mark_unprovisioned(&self) {
        self.inner.tx.send_replace(Snapshot {
            items: Vec::new(),
            loading: false,
            provisioned: false,
        });
    }

    /// Settle the loading flag without touching items, for load paths
    /// that failed.
    pub fn finish_loading(&self) {
        self.inner.tx.send_if_modified(|snapshot| {
            let was_loading = snapshot.loading;
            snapshot.loading = false;
            was_loading
        });
    }

    /// Apply a fresh fetch. The same routine serves the initial load
    /// and every change-event refresh.
    pub fn reconcile(&self, fetched: Vec<T>) {
        let limit = self.inner.limit;
        self.inner.tx.send_modify(|snapshot| {
            let merged = merge_window(&snapshot.items, fetched, limit);
            snapshot.items = merged;
            snapshot.loading = false;
            snapshot.provisioned = true;
        });
    }

    /// Replace the window copy of one record if the incoming version is
    /// newer. Returns false when the record is not resident; absent
    /// records are left to the next reconcile.
    pub fn merge_record(&self, record: T) -> bool {
        let mut merged = false;
        self.inner.tx.send_if_modified(|snapshot| {
            let Some(resident) = snapshot
                .items
                .iter_mut()
                .find(|item| item.record_id() == record.record_id())
            else {
                return false;
            };
            merged = true;
            if record.record_version() > resident.record_version() {
                *resident = record.clone();
                true
            } else {
                false
            }
        });
        merged
    }

    /// Insert a record at the newest end, evicting past the limit.
    pub fn prepend(&self, record: T) {
        let limit = self.inner.limit;
        self.inner.tx.send_modify(|snapshot| {
            snapshot.items.retain(|item| item.record_id() != record.record_id());
            snapshot.items.insert(0, record.clone());
            snapshot.items.truncate(limit);
        });
    }

    pub fn remove(&self, id: Uuid) {
        self.inner.tx.send_if_modified(|snapshot| {
            let before = snapshot.items.len();
            snapshot.items.retain(|item| item.record_id() != id);
            snapshot.items.len() != before
        });
    }

    /// Patch every resident record. The closure returns whether it
    /// changed the record; watchers are notified only if any did.
    pub fn apply_each(&self, mut patch: impl FnMut(&mut T) -> bool) {
        self.inner.tx.send_if_modified(|snapshot| {
            let mut changed = false;
            for item in &mut snapshot.items {
                changed |= patch(item);
            }
            changed
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookcircle_shared::{ActorSummary, NotificationKind};
    use chrono::Utc;

    fn notification(version: i64) -> Notification {
        Notification {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            actor: ActorSummary {
                id: Uuid::new_v4(),
                username: "casey".into(),
                display_name: "Casey".into(),
                avatar_url: None,
            },
            kind: NotificationKind::Follow,
            body: None,
            data: None,
            read: false,
            version,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn reconcile_clears_loading_and_truncates() {
        let window: LiveWindow<Notification> = LiveWindow::new(3);
        assert!(window.snapshot().loading);

        window.reconcile((0..5).map(|v| notification(v)).collect());
        let snapshot = window.snapshot();
        assert!(!snapshot.loading);
        assert_eq!(snapshot.items.len(), 3);
    }

    #[test]
    fn local_higher_version_survives_stale_refetch() {
        let window: LiveWindow<Notification> = LiveWindow::new(20);
        let mut record = notification(1);
        window.reconcile(vec![record.clone()]);

        // Local optimistic patch lands with a newer version.
        record.read = true;
        record.version = 5;
        assert!(window.merge_record(record.clone()));

        // A refetch that started before the patch reports the old row.
        let mut stale = record.clone();
        stale.read = false;
        stale.version = 1;
        window.reconcile(vec![stale]);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert!(snapshot.items[0].read);
        assert_eq!(snapshot.items[0].version, 5);
    }

    #[test]
    fn reconcile_controls_membership() {
        let window: LiveWindow<Notification> = LiveWindow::new(20);
        let old = notification(1);
        window.reconcile(vec![old.clone()]);

        let replacement = notification(2);
        window.reconcile(vec![replacement.clone()]);

        let snapshot = window.snapshot();
        assert_eq!(snapshot.items.len(), 1);
        assert_eq!(snapshot.items[0].id, replacement.id);
    }

    #[test]
    fn merge_record_ignores_absent_and_older() {
        let window: LiveWindow<Notification> = LiveWindow::new(20);
        let resident = notification(5);
        window.reconcile(vec![resident.clone()]);

        // Absent record is not inserted.
        assert!(!window.merge_record(notification(9)));
        assert_eq!(window.snapshot().items.len(), 1);

        // Older copy of the resident does not replace it.
        let mut older = resident.clone();
        older.version = 2;
        older.read = true;
        assert!(window.merge_record(older));
        assert!(!window.snapshot().items[0].read);
    }

    #[test]
    fn prepend_evicts_past_limit() {
        let window: LiveWindow<Notification> = LiveWindow::new(2);
        let a = notification(1);
        let b = notification(2);
        let c = notification(3);
        window.reconcile(vec![b.clone(), a.clone()]);

        window.prepend(c.clone());
        let ids: Vec<Uuid> = window.snapshot().items.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![c.id, b.id]);
    }

    #[tokio::test]
    async fn watchers_observe_changes() {
        let window: LiveWindow<Notification> = LiveWindow::new(20);
        let mut rx = window.watch();
        assert!(rx.borrow().loading);

        window.reconcile(vec![notification(1)]);
        rx.changed().await.unwrap();
        let snapshot = rx.borrow_and_update().clone();
        assert!(!snapshot.loading);
        assert_eq!(snapshot.items.len(), 1);
    }

    #[test]
    fn weak_handle_dies_with_window() {
        let window: LiveWindow<Notification> = LiveWindow::new(20);
        let weak = window.downgrade();
        assert!(weak.upgrade().is_some());
        drop(window);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn apply_each_notifies_only_on_change() {
        let window: LiveWindow<Notification> = LiveWindow::new(20);
        window.reconcile(vec![notification(1)]);
        let mut rx = window.watch();
        rx.borrow_and_update();

        // No-op patch leaves watchers unnotified.
        window.apply_each(|_| false);
        assert!(!rx.has_changed().unwrap());

        window.apply_each(|n| {
            n.read = true;
            true
        });
        assert!(rx.has_changed().unwrap());
    }
}
