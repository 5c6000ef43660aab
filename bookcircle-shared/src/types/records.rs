use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Denormalized author/actor projection carried on records so list views
/// never need a second lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorSummary {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Follow,
    Like,
    Comment,
    ClubInvite,
    ClubPost,
    Mention,
}

impl NotificationKind {
    /// Stable string used in payloads and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Follow => "follow",
            Self::Like => "like",
            Self::Comment => "comment",
            Self::ClubInvite => "club_invite",
            Self::ClubPost => "club_post",
            Self::Mention => "mention",
        }
    }
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A notification row. Created by server-side triggers only; the client
/// observes it and flips `read`, nothing else.
///
/// `version` is a server-assigned sequence that increases on every write
/// to the row. Merges keep the copy with the higher version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub actor: ActorSummary,
    pub kind: NotificationKind,
    pub body: Option<String>,
    pub data: Option<serde_json::Value>,
    pub read: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn is_unread(&self) -> bool {
        !self.read
    }
}

/// Response of the bulk mark-all-read update: how many rows were touched
/// and the single version watermark stamped on every one of them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BulkReadReceipt {
    pub updated: u64,
    pub version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub author: ActorSummary,
    pub club_id: Option<Uuid>,
    pub body: String,
    pub like_count: i64,
    pub liked_by_me: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub favorite_genres: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BookRef {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    #[validate(length(min = 1, max = 200))]
    pub author: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    WantToRead,
    Reading,
    Finished,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WantToRead => "want_to_read",
            Self::Reading => "reading",
            Self::Finished => "finished",
        }
    }
}

/// One reading-list row: a book, where the user is with it, and an
/// optional star rating once finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShelfEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub book: BookRef,
    pub status: ReadingStatus,
    pub rating: Option<u8>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Club {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub current_book: Option<BookRef>,
    pub member_count: i64,
    /// Whether the viewer belongs to the club.
    pub joined: bool,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FollowStats {
    pub followers: u64,
    pub following: u64,
}

// ── Mutation payloads ──

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewPost {
    #[validate(length(min = 1, max = 2000))]
    pub body: String,
    pub club_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct ProfilePatch {
    #[validate(length(min = 2, max = 60))]
    pub display_name: Option<String>,
    #[validate(length(max = 500))]
    pub bio: Option<String>,
    #[validate(url)]
    pub avatar_url: Option<String>,
    pub favorite_genres: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ShelfUpsert {
    #[validate]
    pub book: BookRef,
    pub status: ReadingStatus,
    #[validate(range(min = 1, max = 5))]
    pub rating: Option<u8>,
}
