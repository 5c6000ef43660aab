use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ClientConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// WebSocket endpoint for the change feed. Derived from `base_url`
    /// when unset.
    #[serde(default)]
    pub realtime_url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed reconnects tolerated before the feed is
    /// declared dead. 0 means retry forever.
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
}

fn default_base_url() -> String { "http://localhost:4000".into() }
fn default_request_timeout_secs() -> u64 { 30 }
fn default_reconnect_initial_delay_ms() -> u64 { 500 }
fn default_reconnect_max_delay_ms() -> u64 { 30_000 }
fn default_reconnect_max_attempts() -> u32 { 10 }

impl ClientConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("BOOKCIRCLE").separator("__"))
            .build()?;
        Ok(config.try_deserialize().unwrap_or_else(|_| Self::default()))
    }

    /// The realtime endpoint, falling back to `base_url` with the scheme
    /// swapped to WebSocket and `/v1/changes` appended.
    pub fn realtime_endpoint(&self) -> String {
        if let Some(url) = &self.realtime_url {
            return url.clone();
        }
        let ws_base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{}/v1/changes", ws_base.trim_end_matches('/'))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            realtime_url: None,
            access_token: None,
            request_timeout_secs: default_request_timeout_secs(),
            reconnect_initial_delay_ms: default_reconnect_initial_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
        }
    }
}
