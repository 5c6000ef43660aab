//! Live feed store: the newest posts visible to the bound user, with
//! optimistic like state protected by version merges.

use std::sync::Arc;

use tokio::sync::watch;
use uuid::Uuid;

use bookcircle_client::{ChangeFilter, DataService};
use bookcircle_shared::{ClientError, ClientResult, NewPost, Post, Table};

use crate::binding::{pump_loop, Binding, BindingSlot};
use crate::live::{LiveWindow, Snapshot, DEFAULT_WINDOW};

pub struct FeedStore<S: DataService> {
    service: Arc<S>,
    window: LiveWindow<Post>,
    binding: BindingSlot,
}

impl<S: DataService> FeedStore<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self::with_limit(service, DEFAULT_WINDOW)
    }

    pub fn with_limit(service: Arc<S>, limit: usize) -> Self {
        Self {
            service,
            window: LiveWindow::new(limit),
            binding: BindingSlot::new(),
        }
    }

    pub async fn bind(&self, user_id: Uuid) -> ClientResult<()> {
        self.binding.teardown();
        self.window.reset();

        let feed = match self
            .service
            .subscribe(ChangeFilter::new(Table::Posts, user_id))
            .await
        {
            Ok(feed) => feed,
            Err(e) => {
                self.window.finish_loading();
                return Err(e);
            }
        };

        match self.service.list_feed(user_id, self.window.limit() as u32).await {
            Ok(rows) => self.window.reconcile(rows),
            Err(e) => {
                tracing::warn!(user = %user_id, error = %e, "initial feed load failed");
                self.window.finish_loading();
            }
        }

        let service = self.service.clone();
        let pump = tokio::spawn(pump_loop(feed, self.window.downgrade(), move |limit| {
            let service = service.clone();
            async move { service.list_feed(user_id, limit).await }
        }));
        self.binding.install(Binding { user_id, pump: Some(pump) });
        Ok(())
    }

    pub fn unbind(&self) {
        self.binding.teardown();
        self.window.clear();
    }

    pub fn snapshot(&self) -> Snapshot<Post> {
        self.window.snapshot()
    }

    pub fn watch(&self) -> watch::Receiver<Snapshot<Post>> {
        self.window.watch()
    }

    pub async fn refresh(&self) -> ClientResult<()> {
        let user_id = self.require_bound()?;
        let rows = self
            .service
            .list_feed(user_id, self.window.limit() as u32)
            .await?;
        self.window.reconcile(rows);
        Ok(())
    }

    /// Publish a post. The created record lands at the top of the
    /// window immediately; the change event then converges everyone.
    pub async fn publish(&self, post: NewPost) -> ClientResult<Post> {
        let user_id = self.require_bound()?;
        let created = self.service.create_post(user_id, post).await?;
        self.window.prepend(created.clone());
        Ok(created)
    }

    /// Like a post and fold the server's updated copy into the window.
    /// The response version keeps a concurrent refetch from reverting
    /// the liked state.
    pub async fn like(&self, post_id: Uuid) -> ClientResult<Post> {
        let user_id = self.require_bound()?;
        let updated = self.service.like_post(user_id, post_id).await?;
        self.window.merge_record(updated.clone());
        Ok(updated)
    }

    pub async fn unlike(&self, post_id: Uuid) -> ClientResult<Post> {
        let user_id = self.require_bound()?;
        let updated = self.service.unlike_post(user_id, post_id).await?;
        self.window.merge_record(updated.clone());
        Ok(updated)
    }

    fn require_bound(&self) -> ClientResult<Uuid> {
        self.binding
            .user()
            .ok_or_else(|| ClientError::bad_request("feed store is not bound"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookcircle_client::MemoryDataService;
    use std::time::Duration;

    async fn wait_until(
        rx: &mut watch::Receiver<Snapshot<Post>>,
        predicate: impl Fn(&Snapshot<Post>) -> bool,
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

    #[tokio::test]
    async fn publish_prepends_and_event_converges() {
        let service = MemoryDataService::new();
        let author = service.seed_profile("author").await;

        let store = FeedStore::new(Arc::new(service.clone()));
        store.bind(author.id).await.unwrap();

        let created = store
            .publish(NewPost { body: "Starting chapter one tonight".into(), club_id: None })
            .await
            .unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.items[0].id, created.id);
        assert_eq!(snapshot.items[0].author.username, "author");
    }

    #[tokio::test]
    async fn followers_see_new_posts_via_events() {
        let service = MemoryDataService::new();
        let author = service.seed_profile("author").await;
        let fan = service.seed_profile("fan").await;
        service.follow(fan.id, author.id).await.unwrap();

        let store = FeedStore::new(Arc::new(service.clone()));
        store.bind(fan.id).await.unwrap();
        let mut rx = store.watch();

        let created = service
            .create_post(author.id, NewPost { body: "New book day".into(), club_id: None })
            .await
            .unwrap();

        wait_until(&mut rx, |s| s.items.iter().any(|p| p.id == created.id)).await;
    }

    #[tokio::test]
    async fn like_state_survives_concurrent_refetch() {
        let service = MemoryDataService::new();
        let author = service.seed_profile("author").await;
        let fan = service.seed_profile("fan").await;
        let post = service
            .create_post(author.id, NewPost { body: "thoughts?".into(), club_id: None })
            .await
            .unwrap();

        let store = FeedStore::new(Arc::new(service.clone()));
        store.bind(fan.id).await.unwrap();

        let liked = store.like(post.id).await.unwrap();
        assert!(liked.liked_by_me);
        assert!(liked.version > post.version);

        let resident = store
            .snapshot()
            .items
            .iter()
            .find(|p| p.id == post.id)
            .cloned()
            .unwrap();
        assert!(resident.liked_by_me);
        assert_eq!(resident.like_count, 1);

        // A refetch reflects the same state once the server has it.
        store.refresh().await.unwrap();
        assert!(store.snapshot().items.iter().any(|p| p.id == post.id && p.liked_by_me));
    }

    #[tokio::test]
    async fn unlike_folds_back() {
        let service = MemoryDataService::new();
        let author = service.seed_profile("author").await;
        let post = service
            .create_post(author.id, NewPost { body: "self five".into(), club_id: None })
            .await
            .unwrap();

        let store = FeedStore::new(Arc::new(service.clone()));
        store.bind(author.id).await.unwrap();

        store.like(post.id).await.unwrap();
        let unliked = store.unlike(post.id).await.unwrap();
        assert!(!unliked.liked_by_me);
        assert_eq!(unliked.like_count, 0);
    }

    #[tokio::test]
    async fn publish_requires_binding() {
        let service = MemoryDataService::new();
        let store = FeedStore::new(Arc::new(service));
        let err = store
            .publish(NewPost { body: "orphan".into(), club_id: None })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(bookcircle_shared::ErrorCode::BadRequest));
    }
}
