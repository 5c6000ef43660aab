//! HTTP implementation of [`DataService`] over the BookCircle REST API,
//! with the change feed served by [`RealtimeClient`].

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use uuid::Uuid;
use validator::Validate;

use bookcircle_shared::{
    ActorSummary, BulkReadReceipt, ClientError, ClientResult, Club, Envelope, ErrorCode,
    FollowStats, NewPost, Notification, Post, Profile, ProfilePatch, ShelfEntry, ShelfUpsert,
};

use crate::auth::Auth;
use crate::config::ClientConfig;
use crate::realtime::RealtimeClient;
use crate::service::{ChangeFeed, ChangeFilter, DataService, ServiceCapabilities};

/// How long a capabilities probe stays valid.
const CAPABILITIES_TTL: Duration = Duration::from_secs(60);

struct CapsCacheEntry {
    caps: ServiceCapabilities,
    fetched_at: Instant,
}

/// [`DataService`] backed by the REST API. Cheap to share behind an
/// `Arc`; all methods take `&self`.
pub struct HttpDataService {
    http: reqwest::Client,
    base: String,
    auth: Auth,
    config: ClientConfig,
    caps_cache: RwLock<Option<CapsCacheEntry>>,
    /// Realtime connection, dialed on first subscribe.
    realtime: OnceCell<RealtimeClient>,
}

pub struct HttpDataServiceBuilder {
    config: ClientConfig,
}

impl HttpDataServiceBuilder {
    pub fn new() -> Self {
        Self { config: ClientConfig::default() }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self { config: ClientConfig::load()? })
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.config.access_token = Some(token.into());
        self
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> ClientResult<HttpDataService> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .user_agent(concat!("bookcircle-client/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let base = self.config.base_url.trim_end_matches('/').to_string();
        let auth = Auth::from(self.config.access_token.clone());
        Ok(HttpDataService {
            http,
            base,
            auth,
            config: self.config,
            caps_cache: RwLock::new(None),
            realtime: OnceCell::new(),
        })
    }
}

impl Default for HttpDataServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn status_error(status: reqwest::StatusCode) -> ClientError {
    let code = match status.as_u16() {
        400 => ErrorCode::BadRequest,
        401 => ErrorCode::Unauthorized,
        403 => ErrorCode::Forbidden,
        404 => ErrorCode::NotFound,
        429 => ErrorCode::RateLimited,
        500..=599 => ErrorCode::ServiceUnavailable,
        _ => ErrorCode::InternalError,
    };
    ClientError::new(code, format!("http status {status}"))
}

impl HttpDataService {
    pub fn builder() -> HttpDataServiceBuilder {
        HttpDataServiceBuilder::new()
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn execute<T: DeserializeOwned>(&self, builder: reqwest::RequestBuilder) -> ClientResult<T> {
        let response = self.auth.apply(builder).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if !status.is_success() => Err(status_error(status)),
            Err(e) => Err(ClientError::Decode(e)),
        }
    }

    async fn execute_empty(&self, builder: reqwest::RequestBuilder) -> ClientResult<()> {
        let response = self.auth.apply(builder).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        match serde_json::from_slice::<Envelope<serde_json::Value>>(&bytes) {
            Ok(envelope) => envelope.into_unit_result(),
            // 204-style responses carry no body at all.
            Err(_) if status.is_success() => Ok(()),
            Err(_) => Err(status_error(status)),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.execute(self.http.get(self.url(path))).await
    }

    async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        self.execute(self.http.post(self.url(path)).json(body)).await
    }

    async fn post_empty_body<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        self.execute(self.http.post(self.url(path))).await
    }

    async fn fetch_capabilities(&self) -> ClientResult<ServiceCapabilities> {
        match self.get::<ServiceCapabilities>("/v1/capabilities").await {
            Ok(caps) => Ok(caps),
            // Older deployments predate the endpoint. Assume the full
            // surface and let real calls report what is missing.
            Err(e) if e.code().is_some_and(|c| c.is_not_found()) => {
                tracing::warn!("capabilities endpoint missing, assuming fully provisioned");
                Ok(ServiceCapabilities::assume_all())
            }
            // No answer at all degrades the same way; server-reported
            // failures still propagate.
            Err(e) if e.is_unreachable() => {
                tracing::warn!(error = %e, "capabilities endpoint unreachable, assuming fully provisioned");
                Ok(ServiceCapabilities::assume_all())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl DataService for HttpDataService {
    async fn capabilities(&self) -> ClientResult<ServiceCapabilities> {
        {
            let cache = self.caps_cache.read().await;
            if let Some(entry) = cache.as_ref() {
                if entry.fetched_at.elapsed() < CAPABILITIES_TTL {
                    return Ok(entry.caps);
                }
            }
        }

        let caps = self.fetch_capabilities().await?;
        let mut cache = self.caps_cache.write().await;
        *cache = Some(CapsCacheEntry { caps, fetched_at: Instant::now() });
        Ok(caps)
    }

    async fn list_notifications(&self, user_id: Uuid, limit: u32) -> ClientResult<Vec<Notification>> {
        self.get(&format!("/v1/users/{user_id}/notifications?limit={limit}"))
            .await
    }

    async fn mark_notification_read(&self, user_id: Uuid, id: Uuid) -> ClientResult<Notification> {
        self.post_empty_body(&format!("/v1/users/{user_id}/notifications/{id}/read"))
            .await
    }

    async fn mark_all_notifications_read(&self, user_id: Uuid) -> ClientResult<BulkReadReceipt> {
        self.post_empty_body(&format!("/v1/users/{user_id}/notifications/read-all"))
            .await
    }

    async fn list_feed(&self, user_id: Uuid, limit: u32) -> ClientResult<Vec<Post>> {
        self.get(&format!("/v1/users/{user_id}/feed?limit={limit}")).await
    }

    async fn create_post(&self, user_id: Uuid, post: NewPost) -> ClientResult<Post> {
        post.validate()?;
        self.post(&format!("/v1/users/{user_id}/posts"), &post).await
    }

    async fn like_post(&self, user_id: Uuid, post_id: Uuid) -> ClientResult<Post> {
        self.post_empty_body(&format!("/v1/users/{user_id}/posts/{post_id}/like"))
            .await
    }

    async fn unlike_post(&self, user_id: Uuid, post_id: Uuid) -> ClientResult<Post> {
        self.execute(
            self.http
                .delete(self.url(&format!("/v1/users/{user_id}/posts/{post_id}/like"))),
        )
        .await
    }

    async fn get_profile(&self, id: Uuid) -> ClientResult<Profile> {
        self.get(&format!("/v1/profiles/{id}")).await
    }

    async fn update_profile(&self, id: Uuid, patch: ProfilePatch) -> ClientResult<Profile> {
        patch.validate()?;
        self.execute(
            self.http
                .patch(self.url(&format!("/v1/profiles/{id}")))
                .json(&patch),
        )
        .await
    }

    async fn follow_stats(&self, id: Uuid) -> ClientResult<FollowStats> {
        self.get(&format!("/v1/profiles/{id}/follow-stats")).await
    }

    async fn followers(&self, id: Uuid) -> ClientResult<Vec<ActorSummary>> {
        self.get(&format!("/v1/profiles/{id}/followers")).await
    }

    async fn following(&self, id: Uuid) -> ClientResult<Vec<ActorSummary>> {
        self.get(&format!("/v1/profiles/{id}/following")).await
    }

    async fn follow(&self, follower: Uuid, followee: Uuid) -> ClientResult<()> {
        if follower == followee {
            return Err(ClientError::new(
                ErrorCode::CannotFollowSelf,
                "cannot follow yourself",
            ));
        }
        self.execute_empty(
            self.http
                .put(self.url(&format!("/v1/profiles/{follower}/following/{followee}"))),
        )
        .await
    }

    async fn unfollow(&self, follower: Uuid, followee: Uuid) -> ClientResult<()> {
        self.execute_empty(
            self.http
                .delete(self.url(&format!("/v1/profiles/{follower}/following/{followee}"))),
        )
        .await
    }

    async fn list_clubs(&self, user_id: Uuid) -> ClientResult<Vec<Club>> {
        self.get(&format!("/v1/users/{user_id}/clubs")).await
    }

    async fn join_club(&self, user_id: Uuid, club_id: Uuid) -> ClientResult<Club> {
        self.execute(
            self.http
                .put(self.url(&format!("/v1/users/{user_id}/clubs/{club_id}"))),
        )
        .await
    }

    async fn leave_club(&self, user_id: Uuid, club_id: Uuid) -> ClientResult<Club> {
        self.execute(
            self.http
                .delete(self.url(&format!("/v1/users/{user_id}/clubs/{club_id}"))),
        )
        .await
    }

    async fn club_members(&self, club_id: Uuid) -> ClientResult<Vec<ActorSummary>> {
        self.get(&format!("/v1/clubs/{club_id}/members")).await
    }

    async fn list_shelf(&self, user_id: Uuid) -> ClientResult<Vec<ShelfEntry>> {
        self.get(&format!("/v1/users/{user_id}/shelf")).await
    }

    async fn upsert_shelf_entry(&self, user_id: Uuid, entry: ShelfUpsert) -> ClientResult<ShelfEntry> {
        entry.validate()?;
        self.execute(
            self.http
                .put(self.url(&format!("/v1/users/{user_id}/shelf")))
                .json(&entry),
        )
        .await
    }

    async fn remove_shelf_entry(&self, user_id: Uuid, id: Uuid) -> ClientResult<()> {
        self.execute_empty(
            self.http
                .delete(self.url(&format!("/v1/users/{user_id}/shelf/{id}"))),
        )
        .await
    }

    async fn subscribe(&self, filter: ChangeFilter) -> ClientResult<ChangeFeed> {
        let realtime = self
            .realtime
            .get_or_init(|| async { RealtimeClient::start(self.config.clone(), self.auth.clone()) })
            .await;
        realtime.subscribe(filter).await
    }
}
