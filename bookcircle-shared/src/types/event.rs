use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Server tables the realtime feed can report changes for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Notifications,
    Posts,
    Profiles,
    Follows,
    Clubs,
    ShelfEntries,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notifications => "notifications",
            Self::Posts => "posts",
            Self::Profiles => "profiles",
            Self::Follows => "follows",
            Self::Clubs => "clubs",
            Self::ShelfEntries => "shelf_entries",
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One change notice pushed by the server. Deliberately thin: it says
/// *that* a row changed, not what it now contains. Consumers refetch
/// through the data service and merge by version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// v7 so ids sort by emission time.
    pub id: Uuid,
    pub table: Table,
    /// Owner of the affected row; feeds are always user-scoped.
    pub user_id: Uuid,
    pub action: ChangeAction,
    /// Absent for bulk operations that touch many rows at once.
    pub record_id: Option<Uuid>,
    /// Version the row was stamped with, when the server knows it.
    pub version: Option<i64>,
    pub occurred_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: Table, user_id: Uuid, action: ChangeAction, record_id: Option<Uuid>) -> Self {
        Self {
            id: Uuid::now_v7(),
            table,
            user_id,
            action,
            record_id,
            version: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Routing topic, `bookcircle.{table}.{user}`.
    pub fn topic(&self) -> String {
        format!("bookcircle.{}.{}", self.table, self.user_id)
    }
}
