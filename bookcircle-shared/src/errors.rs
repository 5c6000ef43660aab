use serde::{Deserialize, Serialize};

/// Wire error codes following the pattern E{area}{sequence}
///
/// Ranges:
/// - E0xxx: Shared/transport errors
/// - E2xxx: Profile and follow errors
/// - E3xxx: Club errors
/// - E4xxx: Feed errors
/// - E5xxx: Notification errors
/// - E6xxx: Shelf errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    RateLimited,
    ServiceUnavailable,
    BadRequest,
    FeatureNotProvisioned,

    // Profile / follows (E2xxx)
    ProfileNotFound,
    DisplayNameTaken,
    InvalidDisplayName,
    FollowAlreadyExists,
    FollowNotFound,
    CannotFollowSelf,

    // Clubs (E3xxx)
    ClubNotFound,
    AlreadyMember,
    NotMember,

    // Feed (E4xxx)
    PostNotFound,
    LikeNotFound,

    // Notifications (E5xxx)
    NotificationNotFound,

    // Shelf (E6xxx)
    ShelfEntryNotFound,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            // Shared
            Self::InternalError => "E0001",
            Self::ValidationError => "E0002",
            Self::NotFound => "E0003",
            Self::Unauthorized => "E0004",
            Self::Forbidden => "E0005",
            Self::RateLimited => "E0006",
            Self::ServiceUnavailable => "E0007",
            Self::BadRequest => "E0008",
            Self::FeatureNotProvisioned => "E0009",

            // Profile / follows
            Self::ProfileNotFound => "E2001",
            Self::DisplayNameTaken => "E2002",
            Self::InvalidDisplayName => "E2003",
            Self::FollowAlreadyExists => "E2004",
            Self::FollowNotFound => "E2005",
            Self::CannotFollowSelf => "E2006",

            // Clubs
            Self::ClubNotFound => "E3001",
            Self::AlreadyMember => "E3002",
            Self::NotMember => "E3003",

            // Feed
            Self::PostNotFound => "E4001",
            Self::LikeNotFound => "E4002",

            // Notifications
            Self::NotificationNotFound => "E5001",

            // Shelf
            Self::ShelfEntryNotFound => "E6001",
        }
    }

    /// Reverse lookup for codes arriving over the wire. Unknown codes map
    /// to `None` and are carried through as internal errors by the caller.
    pub fn from_code(code: &str) -> Option<Self> {
        let all = [
            Self::InternalError,
            Self::ValidationError,
            Self::NotFound,
            Self::Unauthorized,
            Self::Forbidden,
            Self::RateLimited,
            Self::ServiceUnavailable,
            Self::BadRequest,
            Self::FeatureNotProvisioned,
            Self::ProfileNotFound,
            Self::DisplayNameTaken,
            Self::InvalidDisplayName,
            Self::FollowAlreadyExists,
            Self::FollowNotFound,
            Self::CannotFollowSelf,
            Self::ClubNotFound,
            Self::AlreadyMember,
            Self::NotMember,
            Self::PostNotFound,
            Self::LikeNotFound,
            Self::NotificationNotFound,
            Self::ShelfEntryNotFound,
        ];
        all.into_iter().find(|c| c.code() == code)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound
                | Self::ProfileNotFound
                | Self::FollowNotFound
                | Self::ClubNotFound
                | Self::PostNotFound
                | Self::LikeNotFound
                | Self::NotificationNotFound
                | Self::ShelfEntryNotFound
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn not_provisioned(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FeatureNotProvisioned, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Known { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_provisioned(&self) -> bool {
        matches!(
            self,
            Self::Known {
                code: ErrorCode::FeatureNotProvisioned,
                ..
            }
        )
    }

    /// True when the request died before any server answer arrived,
    /// such as a refused dial or a timeout. Server-reported errors are
    /// not unreachability.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

impl From<validator::ValidationErrors> for ClientError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
