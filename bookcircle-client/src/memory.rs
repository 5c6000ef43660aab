//! In-memory [`DataService`] with the same observable semantics as the
//! real backend: server-assigned versions, trigger-created notifications,
//! and a broadcast change feed. Store tests run entirely against this.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;
use validator::Validate;

use bookcircle_shared::{
    ActorSummary, BookRef, BulkReadReceipt, ChangeAction, ChangeEvent, ClientError, ClientResult,
    Club, ErrorCode, FollowStats, NewPost, Notification, NotificationKind, Post, Profile,
    ProfilePatch, ShelfEntry, ShelfUpsert, Table,
};

use crate::service::{
    ChangeFeed, ChangeFilter, DataService, ServiceCapabilities, EVENT_CHANNEL_CAPACITY,
};

const BUS_CAPACITY: usize = 256;

struct PostRow {
    id: Uuid,
    author_id: Uuid,
    club_id: Option<Uuid>,
    body: String,
    version: i64,
    created_at: DateTime<Utc>,
}

struct ClubRow {
    id: Uuid,
    name: String,
    description: Option<String>,
    current_book: Option<BookRef>,
    version: i64,
    created_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    notifications: HashMap<Uuid, Notification>,
    posts: HashMap<Uuid, PostRow>,
    /// (post, liker)
    likes: HashSet<(Uuid, Uuid)>,
    profiles: HashMap<Uuid, Profile>,
    /// (follower, followee)
    follows: HashSet<(Uuid, Uuid)>,
    clubs: HashMap<Uuid, ClubRow>,
    /// (user, club)
    memberships: HashSet<(Uuid, Uuid)>,
    shelves: HashMap<Uuid, ShelfEntry>,
}

struct State {
    version: AtomicI64,
    latency: Option<Duration>,
    caps: ServiceCapabilities,
    bus: broadcast::Sender<ChangeEvent>,
    tables: RwLock<Tables>,
}

#[derive(Clone)]
pub struct MemoryDataService {
    state: Arc<State>,
}

impl Default for MemoryDataService {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDataService {
    pub fn new() -> Self {
        Self::build(None, ServiceCapabilities::assume_all())
    }

    /// Every operation sleeps this long before touching state. Used to
    /// surface races around in-flight requests.
    pub fn with_latency(latency: Duration) -> Self {
        Self::build(Some(latency), ServiceCapabilities::assume_all())
    }

    /// Backend without notification tables provisioned.
    pub fn without_notifications() -> Self {
        Self::build(None, ServiceCapabilities { notifications: false, realtime: true })
    }

    fn build(latency: Option<Duration>, caps: ServiceCapabilities) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            state: Arc::new(State {
                version: AtomicI64::new(0),
                latency,
                caps,
                bus,
                tables: RwLock::new(Tables::default()),
            }),
        }
    }

    /// Current value of the version counter.
    pub fn version(&self) -> i64 {
        self.state.version.load(Ordering::SeqCst)
    }

    fn next_version(&self) -> i64 {
        self.state.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.state.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn emit(&self, event: ChangeEvent) {
        // Send fails only when nobody is subscribed.
        let _ = self.state.bus.send(event);
    }

    fn require_notifications(&self) -> ClientResult<()> {
        if self.state.caps.notifications {
            Ok(())
        } else {
            Err(ClientError::not_provisioned("notification tables are not provisioned"))
        }
    }

    // ── Seeding helpers for tests ──

    pub fn make_actor(username: &str) -> ActorSummary {
        ActorSummary {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: username.to_string(),
            avatar_url: None,
        }
    }

    pub async fn seed_profile(&self, username: &str) -> Profile {
        let profile = Profile {
            id: Uuid::new_v4(),
            username: username.to_string(),
            display_name: username.to_string(),
            bio: None,
            avatar_url: None,
            favorite_genres: Vec::new(),
            version: self.next_version(),
            created_at: Utc::now(),
        };
        let mut tables = self.state.tables.write().await;
        tables.profiles.insert(profile.id, profile.clone());
        profile
    }

    pub async fn seed_club(&self, name: &str) -> Club {
        let row = ClubRow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: None,
            current_book: None,
            version: self.next_version(),
            created_at: Utc::now(),
        };
        let club = Club {
            id: row.id,
            name: row.name.clone(),
            description: None,
            current_book: None,
            member_count: 0,
            joined: false,
            version: row.version,
            created_at: row.created_at,
        };
        let mut tables = self.state.tables.write().await;
        tables.clubs.insert(row.id, row);
        club
    }

    /// Insert a notification directly, as a server-side trigger would,
    /// and emit its insert event.
    pub async fn push_notification(
        &self,
        user_id: Uuid,
        actor: ActorSummary,
        kind: NotificationKind,
    ) -> Notification {
        let version = self.next_version();
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id,
            actor,
            kind,
            body: None,
            data: None,
            read: false,
            version,
            created_at: Utc::now(),
        };
        {
            let mut tables = self.state.tables.write().await;
            tables.notifications.insert(notification.id, notification.clone());
        }
        self.emit(
            ChangeEvent::new(Table::Notifications, user_id, ChangeAction::Insert, Some(notification.id))
                .with_version(version),
        );
        notification
    }

    fn actor_for(tables: &Tables, id: Uuid) -> ActorSummary {
        tables
            .profiles
            .get(&id)
            .map(|p| ActorSummary {
                id: p.id,
                username: p.username.clone(),
                display_name: p.display_name.clone(),
                avatar_url: p.avatar_url.clone(),
            })
            .unwrap_or_else(|| ActorSummary {
                id,
                username: format!("user-{}", &id.simple().to_string()[..8]),
                display_name: "Reader".to_string(),
                avatar_url: None,
            })
    }

    fn assemble_post(tables: &Tables, row: &PostRow, viewer: Uuid) -> Post {
        Post {
            id: row.id,
            author: Self::actor_for(tables, row.author_id),
            club_id: row.club_id,
            body: row.body.clone(),
            like_count: tables.likes.iter().filter(|(post, _)| *post == row.id).count() as i64,
            liked_by_me: tables.likes.contains(&(row.id, viewer)),
            version: row.version,
            created_at: row.created_at,
        }
    }

    fn assemble_club(tables: &Tables, row: &ClubRow, viewer: Uuid) -> Club {
        Club {
            id: row.id,
            name: row.name.clone(),
            description: row.description.clone(),
            current_book: row.current_book.clone(),
            member_count: tables.memberships.iter().filter(|(_, club)| *club == row.id).count()
                as i64,
            joined: tables.memberships.contains(&(viewer, row.id)),
            version: row.version,
            created_at: row.created_at,
        }
    }

    fn trigger_notification(
        &self,
        tables: &mut Tables,
        recipient: Uuid,
        actor_id: Uuid,
        kind: NotificationKind,
    ) {
        let version = self.next_version();
        let notification = Notification {
            id: Uuid::new_v4(),
            user_id: recipient,
            actor: Self::actor_for(tables, actor_id),
            kind,
            body: None,
            data: None,
            read: false,
            version,
            created_at: Utc::now(),
        };
        let id = notification.id;
        tables.notifications.insert(id, notification);
        self.emit(
            ChangeEvent::new(Table::Notifications, recipient, ChangeAction::Insert, Some(id))
                .with_version(version),
        );
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn capabilities(&self) -> ClientResult<ServiceCapabilities> {
        self.simulate_latency().await;
        Ok(self.state.caps)
    }

    async fn list_notifications(&self, user_id: Uuid, limit: u32) -> ClientResult<Vec<Notification>> {
        self.simulate_latency().await;
        self.require_notifications()?;
        let tables = self.state.tables.read().await;
        let mut rows: Vec<Notification> = tables
            .notifications
            .values()
            .filter(|n| n.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.version.cmp(&a.version)));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn mark_notification_read(&self, user_id: Uuid, id: Uuid) -> ClientResult<Notification> {
        self.simulate_latency().await;
        self.require_notifications()?;
        let updated = {
            let mut tables = self.state.tables.write().await;
            let row = tables
                .notifications
                .get_mut(&id)
                .filter(|n| n.user_id == user_id)
                .ok_or_else(|| {
                    ClientError::new(ErrorCode::NotificationNotFound, "notification not found")
                })?;
            if !row.read {
                row.read = true;
                row.version = self.next_version();
            }
            row.clone()
        };
        self.emit(
            ChangeEvent::new(Table::Notifications, user_id, ChangeAction::Update, Some(id))
                .with_version(updated.version),
        );
        Ok(updated)
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> ClientResult<BulkReadReceipt> {
        self.simulate_latency().await;
        self.require_notifications()?;
        let receipt = {
            let mut tables = self.state.tables.write().await;
            let unread: Vec<Uuid> = tables
                .notifications
                .values()
                .filter(|n| n.user_id == user_id && !n.read)
                .map(|n| n.id)
                .collect();
            if unread.is_empty() {
                return Ok(BulkReadReceipt { updated: 0, version: self.version() });
            }
            // One statement, one watermark stamped on every touched row.
            let version = self.next_version();
            for id in &unread {
                if let Some(row) = tables.notifications.get_mut(id) {
                    row.read = true;
                    row.version = version;
                }
            }
            BulkReadReceipt { updated: unread.len() as u64, version }
        };
        self.emit(
            ChangeEvent::new(Table::Notifications, user_id, ChangeAction::Update, None)
                .with_version(receipt.version),
        );
        Ok(receipt)
    }

    async fn list_feed(&self, user_id: Uuid, limit: u32) -> ClientResult<Vec<Post>> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        let mut rows: Vec<Post> = tables
            .posts
            .values()
            .map(|row| Self::assemble_post(&tables, row, user_id))
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.version.cmp(&a.version)));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn create_post(&self, user_id: Uuid, post: NewPost) -> ClientResult<Post> {
        self.simulate_latency().await;
        post.validate()?;
        let (assembled, followers) = {
            let mut tables = self.state.tables.write().await;
            let row = PostRow {
                id: Uuid::new_v4(),
                author_id: user_id,
                club_id: post.club_id,
                body: post.body,
                version: self.next_version(),
                created_at: Utc::now(),
            };
            let id = row.id;
            tables.posts.insert(id, row);
            let followers: Vec<Uuid> = tables
                .follows
                .iter()
                .filter(|(_, followee)| *followee == user_id)
                .map(|(follower, _)| *follower)
                .collect();
            let row = &tables.posts[&id];
            (Self::assemble_post(&tables, row, user_id), followers)
        };
        self.emit(
            ChangeEvent::new(Table::Posts, user_id, ChangeAction::Insert, Some(assembled.id))
                .with_version(assembled.version),
        );
        for follower in followers {
            self.emit(
                ChangeEvent::new(Table::Posts, follower, ChangeAction::Insert, Some(assembled.id))
                    .with_version(assembled.version),
            );
        }
        Ok(assembled)
    }

    async fn like_post(&self, user_id: Uuid, post_id: Uuid) -> ClientResult<Post> {
        self.simulate_latency().await;
        let (assembled, author_id) = {
            let mut tables = self.state.tables.write().await;
            if !tables.posts.contains_key(&post_id) {
                return Err(ClientError::new(ErrorCode::PostNotFound, "post not found"));
            }
            let newly_liked = tables.likes.insert((post_id, user_id));
            let version = self.next_version();
            let row = tables.posts.get_mut(&post_id).ok_or_else(|| {
                ClientError::new(ErrorCode::PostNotFound, "post not found")
            })?;
            row.version = version;
            let author_id = row.author_id;
            if newly_liked && author_id != user_id {
                self.trigger_notification(&mut tables, author_id, user_id, NotificationKind::Like);
            }
            let row = &tables.posts[&post_id];
            (Self::assemble_post(&tables, row, user_id), author_id)
        };
        self.emit(
            ChangeEvent::new(Table::Posts, user_id, ChangeAction::Update, Some(post_id))
                .with_version(assembled.version),
        );
        if author_id != user_id {
            self.emit(
                ChangeEvent::new(Table::Posts, author_id, ChangeAction::Update, Some(post_id))
                    .with_version(assembled.version),
            );
        }
        Ok(assembled)
    }

    async fn unlike_post(&self, user_id: Uuid, post_id: Uuid) -> ClientResult<Post> {
        self.simulate_latency().await;
        let (assembled, author_id) = {
            let mut tables = self.state.tables.write().await;
            if !tables.likes.remove(&(post_id, user_id)) {
                return Err(ClientError::new(ErrorCode::LikeNotFound, "like not found"));
            }
            let version = self.next_version();
            let row = tables.posts.get_mut(&post_id).ok_or_else(|| {
                ClientError::new(ErrorCode::PostNotFound, "post not found")
            })?;
            row.version = version;
            let author_id = row.author_id;
            let row = &tables.posts[&post_id];
            (Self::assemble_post(&tables, row, user_id), author_id)
        };
        self.emit(
            ChangeEvent::new(Table::Posts, user_id, ChangeAction::Update, Some(post_id))
                .with_version(assembled.version),
        );
        if author_id != user_id {
            self.emit(
                ChangeEvent::new(Table::Posts, author_id, ChangeAction::Update, Some(post_id))
                    .with_version(assembled.version),
            );
        }
        Ok(assembled)
    }

    async fn get_profile(&self, id: Uuid) -> ClientResult<Profile> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        tables
            .profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| ClientError::new(ErrorCode::ProfileNotFound, "profile not found"))
    }

    async fn update_profile(&self, id: Uuid, patch: ProfilePatch) -> ClientResult<Profile> {
        self.simulate_latency().await;
        patch.validate()?;
        let updated = {
            let mut tables = self.state.tables.write().await;
            if let Some(name) = &patch.display_name {
                let taken = tables
                    .profiles
                    .values()
                    .any(|p| p.id != id && p.display_name == *name);
                if taken {
                    return Err(ClientError::new(
                        ErrorCode::DisplayNameTaken,
                        "display name already taken",
                    ));
                }
            }
            let version = self.next_version();
            let profile = tables
                .profiles
                .get_mut(&id)
                .ok_or_else(|| ClientError::new(ErrorCode::ProfileNotFound, "profile not found"))?;
            if let Some(name) = patch.display_name {
                profile.display_name = name;
            }
            if let Some(bio) = patch.bio {
                profile.bio = Some(bio);
            }
            if let Some(url) = patch.avatar_url {
                profile.avatar_url = Some(url);
            }
            if let Some(genres) = patch.favorite_genres {
                profile.favorite_genres = genres;
            }
            profile.version = version;
            profile.clone()
        };
        self.emit(
            ChangeEvent::new(Table::Profiles, id, ChangeAction::Update, Some(id))
                .with_version(updated.version),
        );
        Ok(updated)
    }

    async fn follow_stats(&self, id: Uuid) -> ClientResult<FollowStats> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        Ok(FollowStats {
            followers: tables.follows.iter().filter(|(_, followee)| *followee == id).count() as u64,
            following: tables.follows.iter().filter(|(follower, _)| *follower == id).count() as u64,
        })
    }

    async fn followers(&self, id: Uuid) -> ClientResult<Vec<ActorSummary>> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        let mut actors: Vec<ActorSummary> = tables
            .follows
            .iter()
            .filter(|(_, followee)| *followee == id)
            .map(|(follower, _)| Self::actor_for(&tables, *follower))
            .collect();
        actors.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(actors)
    }

    async fn following(&self, id: Uuid) -> ClientResult<Vec<ActorSummary>> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        let mut actors: Vec<ActorSummary> = tables
            .follows
            .iter()
            .filter(|(follower, _)| *follower == id)
            .map(|(_, followee)| Self::actor_for(&tables, *followee))
            .collect();
        actors.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(actors)
    }

    async fn follow(&self, follower: Uuid, followee: Uuid) -> ClientResult<()> {
        self.simulate_latency().await;
        if follower == followee {
            return Err(ClientError::new(ErrorCode::CannotFollowSelf, "cannot follow yourself"));
        }
        {
            let mut tables = self.state.tables.write().await;
            if !tables.follows.insert((follower, followee)) {
                return Err(ClientError::new(ErrorCode::FollowAlreadyExists, "already following"));
            }
            self.trigger_notification(&mut tables, followee, follower, NotificationKind::Follow);
        }
        self.emit(ChangeEvent::new(Table::Follows, follower, ChangeAction::Insert, None));
        self.emit(ChangeEvent::new(Table::Follows, followee, ChangeAction::Insert, None));
        Ok(())
    }

    async fn unfollow(&self, follower: Uuid, followee: Uuid) -> ClientResult<()> {
        self.simulate_latency().await;
        {
            let mut tables = self.state.tables.write().await;
            if !tables.follows.remove(&(follower, followee)) {
                return Err(ClientError::new(ErrorCode::FollowNotFound, "not following"));
            }
        }
        self.emit(ChangeEvent::new(Table::Follows, follower, ChangeAction::Delete, None));
        self.emit(ChangeEvent::new(Table::Follows, followee, ChangeAction::Delete, None));
        Ok(())
    }

    async fn list_clubs(&self, user_id: Uuid) -> ClientResult<Vec<Club>> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        let mut rows: Vec<Club> = tables
            .clubs
            .values()
            .map(|row| Self::assemble_club(&tables, row, user_id))
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }

    async fn join_club(&self, user_id: Uuid, club_id: Uuid) -> ClientResult<Club> {
        self.simulate_latency().await;
        let assembled = {
            let mut tables = self.state.tables.write().await;
            if !tables.clubs.contains_key(&club_id) {
                return Err(ClientError::new(ErrorCode::ClubNotFound, "club not found"));
            }
            if !tables.memberships.insert((user_id, club_id)) {
                return Err(ClientError::new(ErrorCode::AlreadyMember, "already a member"));
            }
            let version = self.next_version();
            let row = tables.clubs.get_mut(&club_id).ok_or_else(|| {
                ClientError::new(ErrorCode::ClubNotFound, "club not found")
            })?;
            row.version = version;
            let row = &tables.clubs[&club_id];
            Self::assemble_club(&tables, row, user_id)
        };
        self.emit(
            ChangeEvent::new(Table::Clubs, user_id, ChangeAction::Update, Some(club_id))
                .with_version(assembled.version),
        );
        Ok(assembled)
    }

    async fn leave_club(&self, user_id: Uuid, club_id: Uuid) -> ClientResult<Club> {
        self.simulate_latency().await;
        let assembled = {
            let mut tables = self.state.tables.write().await;
            if !tables.memberships.remove(&(user_id, club_id)) {
                return Err(ClientError::new(ErrorCode::NotMember, "not a member"));
            }
            let version = self.next_version();
            let row = tables.clubs.get_mut(&club_id).ok_or_else(|| {
                ClientError::new(ErrorCode::ClubNotFound, "club not found")
            })?;
            row.version = version;
            let row = &tables.clubs[&club_id];
            Self::assemble_club(&tables, row, user_id)
        };
        self.emit(
            ChangeEvent::new(Table::Clubs, user_id, ChangeAction::Update, Some(club_id))
                .with_version(assembled.version),
        );
        Ok(assembled)
    }

    async fn club_members(&self, club_id: Uuid) -> ClientResult<Vec<ActorSummary>> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        if !tables.clubs.contains_key(&club_id) {
            return Err(ClientError::new(ErrorCode::ClubNotFound, "club not found"));
        }
        let mut actors: Vec<ActorSummary> = tables
            .memberships
            .iter()
            .filter(|(_, club)| *club == club_id)
            .map(|(member, _)| Self::actor_for(&tables, *member))
            .collect();
        actors.sort_by(|a, b| a.username.cmp(&b.username));
        Ok(actors)
    }

    async fn list_shelf(&self, user_id: Uuid) -> ClientResult<Vec<ShelfEntry>> {
        self.simulate_latency().await;
        let tables = self.state.tables.read().await;
        let mut rows: Vec<ShelfEntry> = tables
            .shelves
            .values()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.version.cmp(&a.version)));
        Ok(rows)
    }

    async fn upsert_shelf_entry(&self, user_id: Uuid, entry: ShelfUpsert) -> ClientResult<ShelfEntry> {
        self.simulate_latency().await;
        entry.validate()?;
        let (updated, action) = {
            let mut tables = self.state.tables.write().await;
            let version = self.next_version();
            let existing = tables
                .shelves
                .values()
                .find(|row| row.user_id == user_id && row.book == entry.book)
                .map(|row| row.id);
            match existing {
                Some(id) => {
                    let row = tables.shelves.get_mut(&id).ok_or_else(|| {
                        ClientError::new(ErrorCode::ShelfEntryNotFound, "shelf entry not found")
                    })?;
                    row.status = entry.status;
                    row.rating = entry.rating;
                    row.version = version;
                    (row.clone(), ChangeAction::Update)
                }
                None => {
                    let row = ShelfEntry {
                        id: Uuid::new_v4(),
                        user_id,
                        book: entry.book,
                        status: entry.status,
                        rating: entry.rating,
                        version,
                        created_at: Utc::now(),
                    };
                    tables.shelves.insert(row.id, row.clone());
                    (row, ChangeAction::Insert)
                }
            }
        };
        self.emit(
            ChangeEvent::new(Table::ShelfEntries, user_id, action, Some(updated.id))
                .with_version(updated.version),
        );
        Ok(updated)
    }

    async fn remove_shelf_entry(&self, user_id: Uuid, id: Uuid) -> ClientResult<()> {
        self.simulate_latency().await;
        {
            let mut tables = self.state.tables.write().await;
            let owned = tables
                .shelves
                .get(&id)
                .is_some_and(|entry| entry.user_id == user_id);
            if !owned {
                return Err(ClientError::new(
                    ErrorCode::ShelfEntryNotFound,
                    "shelf entry not found",
                ));
            }
            tables.shelves.remove(&id);
        }
        self.emit(ChangeEvent::new(Table::ShelfEntries, user_id, ChangeAction::Delete, Some(id)));
        Ok(())
    }

    async fn subscribe(&self, filter: ChangeFilter) -> ClientResult<ChangeFeed> {
        self.simulate_latency().await;
        if !self.state.caps.realtime {
            return Err(ClientError::not_provisioned("realtime feed is not provisioned"));
        }
        let id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (unsub_tx, mut unsub_rx) = mpsc::channel(8);
        let mut bus_rx = self.state.bus.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = unsub_rx.recv() => break,
                    event = bus_rx.recv() => match event {
                        Ok(event) if filter.matches(&event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "change feed lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        Ok(ChangeFeed::new(id, event_rx, unsub_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notifications_list_newest_first_with_limit() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        for i in 0..25 {
            let actor = MemoryDataService::make_actor(&format!("reader{i}"));
            service.push_notification(user, actor, NotificationKind::Follow).await;
        }

        let rows = service.list_notifications(user, 20).await.unwrap();
        assert_eq!(rows.len(), 20);
        for pair in rows.windows(2) {
            assert!(pair[0].version > pair[1].version);
        }
    }

    #[tokio::test]
    async fn mark_read_is_idempotent_and_bumps_version_once() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let actor = MemoryDataService::make_actor("ana");
        let pushed = service.push_notification(user, actor, NotificationKind::Like).await;

        let first = service.mark_notification_read(user, pushed.id).await.unwrap();
        assert!(first.read);
        assert!(first.version > pushed.version);

        let second = service.mark_notification_read(user, pushed.id).await.unwrap();
        assert_eq!(second.version, first.version);
    }

    #[tokio::test]
    async fn mark_read_rejects_foreign_notifications() {
        let service = MemoryDataService::new();
        let owner = Uuid::new_v4();
        let actor = MemoryDataService::make_actor("bo");
        let pushed = service.push_notification(owner, actor, NotificationKind::Mention).await;

        let err = service
            .mark_notification_read(Uuid::new_v4(), pushed.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::NotificationNotFound));
    }

    #[tokio::test]
    async fn mark_all_stamps_one_watermark() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        for name in ["a", "b", "c"] {
            let actor = MemoryDataService::make_actor(name);
            service.push_notification(user, actor, NotificationKind::Comment).await;
        }

        let receipt = service.mark_all_notifications_read(user).await.unwrap();
        assert_eq!(receipt.updated, 3);

        let rows = service.list_notifications(user, 20).await.unwrap();
        assert!(rows.iter().all(|n| n.read && n.version == receipt.version));

        // Nothing left unread, so the next call touches zero rows.
        let again = service.mark_all_notifications_read(user).await.unwrap();
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    async fn follow_creates_notification_for_followee() {
        let service = MemoryDataService::new();
        let alice = service.seed_profile("alice").await;
        let bo = service.seed_profile("bo").await;

        service.follow(alice.id, bo.id).await.unwrap();

        let rows = service.list_notifications(bo.id, 20).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, NotificationKind::Follow);
        assert_eq!(rows[0].actor.username, "alice");

        let stats = service.follow_stats(bo.id).await.unwrap();
        assert_eq!(stats.followers, 1);
    }

    #[tokio::test]
    async fn duplicate_follow_and_self_follow_rejected() {
        let service = MemoryDataService::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert_eq!(
            service.follow(a, a).await.unwrap_err().code(),
            Some(ErrorCode::CannotFollowSelf)
        );
        service.follow(a, b).await.unwrap();
        assert_eq!(
            service.follow(a, b).await.unwrap_err().code(),
            Some(ErrorCode::FollowAlreadyExists)
        );
    }

    #[tokio::test]
    async fn listings_name_both_sides_of_a_follow() {
        let service = MemoryDataService::new();
        let amina = service.seed_profile("amina").await;
        let bea = service.seed_profile("bea").await;
        let chris = service.seed_profile("chris").await;

        service.follow(bea.id, amina.id).await.unwrap();
        service.follow(chris.id, amina.id).await.unwrap();
        service.follow(amina.id, bea.id).await.unwrap();

        let followers = service.followers(amina.id).await.unwrap();
        assert_eq!(
            followers.iter().map(|a| a.username.as_str()).collect::<Vec<_>>(),
            ["bea", "chris"]
        );

        let following = service.following(amina.id).await.unwrap();
        assert_eq!(following.len(), 1);
        assert_eq!(following[0].username, "bea");
    }

    #[tokio::test]
    async fn club_roster_lists_members_by_username() {
        let service = MemoryDataService::new();
        let club = service.seed_club("Night Readers").await;
        let zoe = service.seed_profile("zoe").await;
        let ada = service.seed_profile("ada").await;
        service.join_club(zoe.id, club.id).await.unwrap();
        service.join_club(ada.id, club.id).await.unwrap();

        let members = service.club_members(club.id).await.unwrap();
        assert_eq!(
            members.iter().map(|a| a.username.as_str()).collect::<Vec<_>>(),
            ["ada", "zoe"]
        );

        let err = service.club_members(Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::ClubNotFound));
    }

    #[tokio::test]
    async fn like_notifies_author_but_not_self_likes() {
        let service = MemoryDataService::new();
        let author = service.seed_profile("author").await;
        let fan = service.seed_profile("fan").await;

        let post = service
            .create_post(author.id, NewPost { body: "finished it at 2am".into(), club_id: None })
            .await
            .unwrap();

        // Self-like stays silent.
        service.like_post(author.id, post.id).await.unwrap();
        assert!(service.list_notifications(author.id, 20).await.unwrap().is_empty());

        let liked = service.like_post(fan.id, post.id).await.unwrap();
        assert!(liked.liked_by_me);
        assert_eq!(liked.like_count, 2);

        let rows = service.list_notifications(author.id, 20).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, NotificationKind::Like);
    }

    #[tokio::test]
    async fn subscription_receives_matching_events_only() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        let mut feed = service
            .subscribe(ChangeFilter::new(Table::Notifications, user))
            .await
            .unwrap();

        let actor = MemoryDataService::make_actor("x");
        service.push_notification(other, actor.clone(), NotificationKind::Follow).await;
        let mine = service.push_notification(user, actor, NotificationKind::Follow).await;

        let event = feed.next().await.unwrap();
        assert_eq!(event.record_id, Some(mine.id));
        assert_eq!(event.user_id, user);
    }

    #[tokio::test]
    async fn unprovisioned_notifications_error_with_code() {
        let service = MemoryDataService::without_notifications();
        let err = service.list_notifications(Uuid::new_v4(), 20).await.unwrap_err();
        assert!(err.is_not_provisioned());
    }

    #[tokio::test]
    async fn shelf_upsert_replaces_same_book() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let book = BookRef { title: "Piranesi".into(), author: "Susanna Clarke".into() };

        let first = service
            .upsert_shelf_entry(
                user,
                ShelfUpsert { book: book.clone(), status: bookcircle_shared::ReadingStatus::Reading, rating: None },
            )
            .await
            .unwrap();
        let second = service
            .upsert_shelf_entry(
                user,
                ShelfUpsert { book, status: bookcircle_shared::ReadingStatus::Finished, rating: Some(5) },
            )
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.version > first.version);
        assert_eq!(service.list_shelf(user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn club_membership_round_trip() {
        let service = MemoryDataService::new();
        let user = Uuid::new_v4();
        let club = service.seed_club("Slow Readers").await;

        let joined = service.join_club(user, club.id).await.unwrap();
        assert!(joined.joined);
        assert_eq!(joined.member_count, 1);

        assert_eq!(
            service.join_club(user, club.id).await.unwrap_err().code(),
            Some(ErrorCode::AlreadyMember)
        );

        let left = service.leave_club(user, club.id).await.unwrap();
        assert!(!left.joined);
        assert_eq!(left.member_count, 0);
    }
}
