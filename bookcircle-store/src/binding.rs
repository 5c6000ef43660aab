//! Store plumbing shared by the live stores: the binding slot that owns
//! the refresh pump, and the pump loop itself.

use std::future::Future;
use std::sync::Mutex;

use tokio::task::JoinHandle;
use uuid::Uuid;

use bookcircle_client::ChangeFeed;
use bookcircle_shared::ClientResult;

use crate::live::{LiveRecord, WeakWindow};

pub(crate) struct Binding {
    pub user_id: Uuid,
    /// None for bindings that run no pump, e.g. unprovisioned features.
    pub pump: Option<JoinHandle<()>>,
}

/// Holder for the current binding. Installing a replacement or tearing
/// down aborts the previous pump; dropping the slot does the same.
pub(crate) struct BindingSlot {
    inner: Mutex<Option<Binding>>,
}

impl BindingSlot {
    pub fn new() -> Self {
        Self { inner: Mutex::new(None) }
    }

    pub fn user(&self) -> Option<Uuid> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|b| b.user_id)
    }

    pub fn install(&self, binding: Binding) {
        let old = self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(binding);
        abort(old);
    }

    pub fn teardown(&self) {
        let old = self.inner.lock().unwrap_or_else(|e| e.into_inner()).take();
        abort(old);
    }
}

fn abort(binding: Option<Binding>) {
    if let Some(binding) = binding {
        if let Some(pump) = binding.pump {
            pump.abort();
        }
    }
}

impl Drop for BindingSlot {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Consume change events and refetch through `fetch`. Holds only a weak
/// window handle across the fetch, so a teardown mid-fetch turns the
/// late completion into a no-op. Refresh errors are logged, never fatal;
/// the next event retries.
pub(crate) async fn pump_loop<T, F, Fut>(mut feed: ChangeFeed, window: WeakWindow<T>, fetch: F)
where
    T: LiveRecord,
    F: Fn(u32) -> Fut + Send + 'static,
    Fut: Future<Output = ClientResult<Vec<T>>> + Send,
{
    while let Some(event) = feed.next().await {
        tracing::debug!(
            event = %event.id,
            table = %event.table,
            action = event.action.as_str(),
            "change event",
        );
        let Some(limit) = window.upgrade().map(|w| w.limit()) else {
            break;
        };
        match fetch(limit as u32).await {
            Ok(rows) => {
                let Some(window) = window.upgrade() else { break };
                window.reconcile(rows);
            }
            Err(e) => {
                tracing::warn!(error = %e, "refresh after change event failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_aborts_replaced_pump() {
        let slot = BindingSlot::new();
        let pump = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        let handle_probe = pump.abort_handle();
        slot.install(Binding { user_id: Uuid::new_v4(), pump: Some(pump) });

        let replacement = Uuid::new_v4();
        slot.install(Binding { user_id: replacement, pump: None });

        tokio::task::yield_now().await;
        assert!(handle_probe.is_finished());
        assert_eq!(slot.user(), Some(replacement));

        slot.teardown();
        assert_eq!(slot.user(), None);
    }
}
