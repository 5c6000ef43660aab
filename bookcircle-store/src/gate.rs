//! One-shot unread announcement gate.
//!
//! The app surfaces "you have N unread notifications" at most once per
//! process, no matter how often snapshots refresh or how many views ask.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long the UI waits after startup before surfacing the
/// announcement. Carried on the grant; the gate itself never sleeps.
pub const ANNOUNCE_DISPLAY_DELAY: Duration = Duration::from_secs(3);

/// A granted announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub unread: usize,
    pub display_delay: Duration,
}

/// Gate over the announcement. Starts unshown; the first offer with a
/// positive unread count flips it shown for the rest of the process.
#[derive(Debug, Default)]
pub struct AnnouncementGate {
    shown: AtomicBool,
}

impl AnnouncementGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for the announcement. Grants exactly once, and only while
    /// there is something unread. Zero unread never consumes the grant.
    pub fn offer(&self, unread: usize) -> Option<Announcement> {
        if unread == 0 {
            return None;
        }
        if self.shown.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(Announcement { unread, display_delay: ANNOUNCE_DISPLAY_DELAY })
    }

    pub fn is_shown(&self) -> bool {
        self.shown.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn grants_once_with_positive_unread() {
        let gate = AnnouncementGate::new();
        assert!(!gate.is_shown());

        let granted = gate.offer(4).unwrap();
        assert_eq!(granted.unread, 4);
        assert_eq!(granted.display_delay, ANNOUNCE_DISPLAY_DELAY);

        assert!(gate.offer(4).is_none());
        assert!(gate.is_shown());
    }

    #[test]
    fn zero_unread_does_not_consume_the_grant() {
        let gate = AnnouncementGate::new();
        assert!(gate.offer(0).is_none());
        assert!(!gate.is_shown());

        // The grant is still available once something arrives.
        assert!(gate.offer(1).is_some());
    }

    #[tokio::test]
    async fn concurrent_offers_grant_exactly_once() {
        let gate = Arc::new(AnnouncementGate::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let gate = gate.clone();
            handles.push(tokio::spawn(async move { gate.offer(3).is_some() }));
        }

        let mut grants = 0;
        for handle in handles {
            if handle.await.unwrap() {
                grants += 1;
            }
        }
        assert_eq!(grants, 1);
    }
}
