//! Feature stores: live, watchable views over [`bookcircle_client`]
//! data, reconciled against realtime change events.

mod binding;

pub mod clubs;
pub mod feed;
pub mod gate;
pub mod live;
pub mod notifications;
pub mod profile;
pub mod shelf;

pub use clubs::ClubsStore;
pub use feed::FeedStore;
pub use gate::{Announcement, AnnouncementGate, ANNOUNCE_DISPLAY_DELAY};
pub use live::{LiveRecord, LiveWindow, Snapshot, WeakWindow, DEFAULT_WINDOW};
pub use notifications::NotificationStore;
pub use profile::{ProfileSnapshot, ProfileStore};
pub use shelf::ShelfStore;
