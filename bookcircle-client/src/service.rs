use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use bookcircle_shared::{
    ActorSummary, BulkReadReceipt, ChangeEvent, Club, ClientResult, FollowStats, NewPost,
    Notification, Post, Profile, ProfilePatch, ShelfEntry, ShelfUpsert, Table,
};

/// Buffered events per subscription before backpressure kicks in.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// What the backend reports itself able to serve, from `GET /v1/capabilities`.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ServiceCapabilities {
    /// Notification tables and triggers are provisioned.
    pub notifications: bool,
    /// The realtime change feed is available.
    pub realtime: bool,
}

impl ServiceCapabilities {
    /// Posture taken when the capabilities endpoint itself is missing:
    /// assume everything is provisioned and let real calls surface errors.
    pub fn assume_all() -> Self {
        Self { notifications: true, realtime: true }
    }
}

/// Selects which change events a subscription receives. Feeds are always
/// scoped to one table and one user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangeFilter {
    pub table: Table,
    pub user_id: Uuid,
}

impl ChangeFilter {
    pub fn new(table: Table, user_id: Uuid) -> Self {
        Self { table, user_id }
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        event.table == self.table && event.user_id == self.user_id
    }
}

/// Consumer handle for one change subscription.
///
/// Events arrive from a background task over a bounded channel. Dropping
/// the handle unsubscribes; so does [`ChangeFeed::close`], which is safe
/// to call more than once.
pub struct ChangeFeed {
    id: Uuid,
    events: mpsc::Receiver<ChangeEvent>,
    unsubscribe_tx: mpsc::Sender<Uuid>,
    closed: bool,
}

impl ChangeFeed {
    pub fn new(id: Uuid, events: mpsc::Receiver<ChangeEvent>, unsubscribe_tx: mpsc::Sender<Uuid>) -> Self {
        Self { id, events, unsubscribe_tx, closed: false }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Next event, or `None` once the feed has been closed from either
    /// side.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        if self.closed {
            return None;
        }
        match self.events.recv().await {
            Some(event) => Some(event),
            None => {
                self.closed = true;
                None
            }
        }
    }

    /// Unsubscribe and stop receiving. Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.close();
        let _ = self.unsubscribe_tx.send(self.id).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for ChangeFeed {
    fn drop(&mut self) {
        if !self.closed {
            // Fire-and-forget; the producer reaps the entry even if the
            // channel is momentarily full.
            let _ = self.unsubscribe_tx.try_send(self.id);
        }
    }
}

/// Everything the app needs from the backend: reads, mutations, and the
/// change feed. Implemented over HTTP+WebSocket in production and fully
/// in memory for tests.
#[async_trait]
pub trait DataService: Send + Sync + 'static {
    /// Explicit provisioning probe. Implementations may cache the answer.
    async fn capabilities(&self) -> ClientResult<ServiceCapabilities>;

    // Notifications
    async fn list_notifications(&self, user_id: Uuid, limit: u32) -> ClientResult<Vec<Notification>>;
    /// Flip one notification to read. Returns the updated record with its
    /// new server version.
    async fn mark_notification_read(&self, user_id: Uuid, id: Uuid) -> ClientResult<Notification>;
    /// Mark every unread notification read in one statement. All touched
    /// rows receive the same version watermark.
    async fn mark_all_notifications_read(&self, user_id: Uuid) -> ClientResult<BulkReadReceipt>;

    // Feed
    async fn list_feed(&self, user_id: Uuid, limit: u32) -> ClientResult<Vec<Post>>;
    async fn create_post(&self, user_id: Uuid, post: NewPost) -> ClientResult<Post>;
    async fn like_post(&self, user_id: Uuid, post_id: Uuid) -> ClientResult<Post>;
    async fn unlike_post(&self, user_id: Uuid, post_id: Uuid) -> ClientResult<Post>;

    // Profiles and follows
    async fn get_profile(&self, id: Uuid) -> ClientResult<Profile>;
    async fn update_profile(&self, id: Uuid, patch: ProfilePatch) -> ClientResult<Profile>;
    async fn follow_stats(&self, id: Uuid) -> ClientResult<FollowStats>;
    async fn followers(&self, id: Uuid) -> ClientResult<Vec<ActorSummary>>;
    async fn following(&self, id: Uuid) -> ClientResult<Vec<ActorSummary>>;
    async fn follow(&self, follower: Uuid, followee: Uuid) -> ClientResult<()>;
    async fn unfollow(&self, follower: Uuid, followee: Uuid) -> ClientResult<()>;

    // Clubs
    async fn list_clubs(&self, user_id: Uuid) -> ClientResult<Vec<Club>>;
    async fn join_club(&self, user_id: Uuid, club_id: Uuid) -> ClientResult<Club>;
    async fn leave_club(&self, user_id: Uuid, club_id: Uuid) -> ClientResult<Club>;
    async fn club_members(&self, club_id: Uuid) -> ClientResult<Vec<ActorSummary>>;

    // Shelf
    async fn list_shelf(&self, user_id: Uuid) -> ClientResult<Vec<ShelfEntry>>;
    async fn upsert_shelf_entry(&self, user_id: Uuid, entry: ShelfUpsert) -> ClientResult<ShelfEntry>;
    async fn remove_shelf_entry(&self, user_id: Uuid, id: Uuid) -> ClientResult<()>;

    /// Open a change subscription for one table and user.
    async fn subscribe(&self, filter: ChangeFilter) -> ClientResult<ChangeFeed>;
}
