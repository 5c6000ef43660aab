//! Shared WebSocket connection for the change feed.
//!
//! One connection serves every subscription. A background task owns the
//! stream and handles:
//!
//! - routing events to subscriptions by table and user
//! - automatic reconnection with exponential backoff and jitter
//! - re-subscribing all active filters after a reconnect
//! - dropping events already delivered before a reconnect
//! - keepalive pings

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use bookcircle_shared::{ChangeEvent, ClientError, ClientResult};

use crate::auth::Auth;
use crate::config::ClientConfig;
use crate::service::{ChangeFeed, ChangeFilter, EVENT_CHANNEL_CAPACITY};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
/// Event ids remembered for duplicate suppression across reconnects.
const SEEN_EVENTS_WINDOW: usize = 1024;

// ── Wire frames ──

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ClientFrame<'a> {
    Subscribe { id: Uuid, table: &'a str, user_id: Uuid },
    Unsubscribe { id: Uuid },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum ServerFrame {
    Change { event: ChangeEvent },
    Subscribed { id: Uuid },
    Error { message: String },
}

// ── Commands from the public handle to the connection task ──

enum ConnCmd {
    Subscribe {
        id: Uuid,
        filter: ChangeFilter,
        event_tx: mpsc::Sender<ChangeEvent>,
        result_tx: oneshot::Sender<ClientResult<()>>,
    },
    Unsubscribe {
        id: Uuid,
    },
    Shutdown,
}

struct SubEntry {
    filter: ChangeFilter,
    event_tx: mpsc::Sender<ChangeEvent>,
}

/// Bounded window of already-delivered event ids. The server may replay
/// recent events after a reconnect; replays inside the window are
/// dropped.
struct SeenEvents {
    order: VecDeque<Uuid>,
    ids: HashSet<Uuid>,
    capacity: usize,
}

impl SeenEvents {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            ids: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record an id. Returns `false` when it was already in the window.
    fn insert(&mut self, id: Uuid) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }
}

/// Exponential backoff before jitter: `initial * 2^attempt`, capped.
fn backoff_delay(attempt: u32, initial_ms: u64, max_ms: u64) -> u64 {
    std::cmp::min(initial_ms.saturating_mul(2u64.saturating_pow(attempt)), max_ms)
}

fn with_jitter(delay_ms: u64) -> u64 {
    delay_ms + rand::thread_rng().gen_range(0..=delay_ms / 4)
}

// ── Public handle ──

/// Handle to the shared change-feed connection. Dropping it shuts the
/// connection down along with every feed it serves.
pub struct RealtimeClient {
    cmd_tx: mpsc::Sender<ConnCmd>,
    unsub_tx: mpsc::Sender<Uuid>,
    connected: Arc<AtomicBool>,
    _task: JoinHandle<()>,
    _unsub_bridge: JoinHandle<()>,
}

impl RealtimeClient {
    /// Spawn the connection task. The first dial happens in the
    /// background; subscriptions placed while offline are flushed once
    /// the connection is up.
    pub fn start(config: ClientConfig, auth: Auth) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel::<ConnCmd>(256);
        let connected = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(connection_task(cmd_rx, config, auth, connected.clone()));

        // Bridge so feed handles can unsubscribe without holding the
        // command sender type.
        let (unsub_tx, mut unsub_rx) = mpsc::channel::<Uuid>(256);
        let cmd_tx_bridge = cmd_tx.clone();
        let unsub_bridge = tokio::spawn(async move {
            while let Some(id) = unsub_rx.recv().await {
                let _ = cmd_tx_bridge.send(ConnCmd::Unsubscribe { id }).await;
            }
        });

        Self {
            cmd_tx,
            unsub_tx,
            connected,
            _task: task,
            _unsub_bridge: unsub_bridge,
        }
    }

    pub async fn subscribe(&self, filter: ChangeFilter) -> ClientResult<ChangeFeed> {
        let id = Uuid::new_v4();
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (result_tx, result_rx) = oneshot::channel();

        self.cmd_tx
            .send(ConnCmd::Subscribe { id, filter, event_tx, result_tx })
            .await
            .map_err(|_| ClientError::WebSocket("connection task is not running".into()))?;
        result_rx
            .await
            .map_err(|_| ClientError::WebSocket("connection task died before confirming".into()))??;

        Ok(ChangeFeed::new(id, event_rx, self.unsub_tx.clone()))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ConnCmd::Shutdown).await;
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        let _ = self.cmd_tx.try_send(ConnCmd::Shutdown);
    }
}

// ── Background connection task ──

async fn establish_ws(endpoint: &str, auth: &Auth) -> ClientResult<WsStream> {
    let mut request = endpoint
        .into_client_request()
        .map_err(|e| ClientError::WebSocket(format!("bad realtime url: {e}")))?;
    if let Some(value) = auth.header_value() {
        let header = HeaderValue::from_str(&value)
            .map_err(|e| ClientError::WebSocket(format!("bad auth header: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, header);
    }

    match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
        Ok(Ok((stream, _response))) => Ok(stream),
        Ok(Err(e)) => Err(ClientError::WebSocket(format!("connect failed: {e}"))),
        Err(_) => Err(ClientError::Timeout(format!(
            "connect timed out after {CONNECT_TIMEOUT:?}"
        ))),
    }
}

async fn send_frame(ws: &mut WsStream, frame: &ClientFrame<'_>) -> ClientResult<()> {
    let payload = serde_json::to_string(frame)?;
    ws.send(Message::Text(payload))
        .await
        .map_err(|e| ClientError::WebSocket(format!("send failed: {e}")))
}

async fn send_subscribe(ws: &mut WsStream, id: Uuid, filter: &ChangeFilter) -> ClientResult<()> {
    send_frame(
        ws,
        &ClientFrame::Subscribe {
            id,
            table: filter.table.as_str(),
            user_id: filter.user_id,
        },
    )
    .await
}

async fn resubscribe_all(ws: &mut WsStream, subs: &HashMap<Uuid, SubEntry>) {
    tracing::info!(count = subs.len(), "re-subscribing after reconnect");
    for (id, entry) in subs {
        if let Err(e) = send_subscribe(ws, *id, &entry.filter).await {
            tracing::warn!(subscription = %id, error = %e, "re-subscribe failed");
        }
    }
}

/// Deliver one event to every matching subscription, dropping replays.
async fn route_change(event: ChangeEvent, subs: &HashMap<Uuid, SubEntry>, seen: &mut SeenEvents) {
    if !seen.insert(event.id) {
        tracing::debug!(event = %event.id, "dropping replayed event");
        return;
    }
    for (id, entry) in subs {
        if entry.filter.matches(&event) {
            if entry.event_tx.send(event.clone()).await.is_err() {
                tracing::debug!(subscription = %id, "receiver dropped");
            }
        }
    }
}

async fn connection_task(
    mut cmd_rx: mpsc::Receiver<ConnCmd>,
    config: ClientConfig,
    auth: Auth,
    connected: Arc<AtomicBool>,
) {
    let endpoint = config.realtime_endpoint();
    let mut subs: HashMap<Uuid, SubEntry> = HashMap::new();
    let mut seen = SeenEvents::new(SEEN_EVENTS_WINDOW);
    let mut ws_stream: Option<WsStream> = None;
    let mut attempts: u32 = 0;
    let mut shutdown_requested = false;

    loop {
        if shutdown_requested {
            if let Some(mut ws) = ws_stream.take() {
                for id in subs.keys() {
                    let _ = send_frame(&mut ws, &ClientFrame::Unsubscribe { id: *id }).await;
                }
                let _ = ws.close(None).await;
            }
            connected.store(false, Ordering::SeqCst);
            return;
        }

        if let Some(ws) = ws_stream.as_mut() {
            let keepalive = tokio::time::sleep(KEEPALIVE_INTERVAL);
            tokio::pin!(keepalive);

            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => match cmd {
                    Some(ConnCmd::Subscribe { id, filter, event_tx, result_tx }) => {
                        subs.insert(id, SubEntry { filter, event_tx });
                        // Delivery is registration plus a best-effort wire
                        // send; a failed send is repaired by the next
                        // reconnect's resubscribe pass.
                        if let Err(e) = send_subscribe(ws, id, &filter).await {
                            tracing::warn!(subscription = %id, error = %e, "subscribe send failed");
                            connected.store(false, Ordering::SeqCst);
                            ws_stream = None;
                        }
                        let _ = result_tx.send(Ok(()));
                    }
                    Some(ConnCmd::Unsubscribe { id }) => {
                        if subs.remove(&id).is_some() {
                            let _ = send_frame(ws, &ClientFrame::Unsubscribe { id }).await;
                        }
                    }
                    Some(ConnCmd::Shutdown) | None => {
                        shutdown_requested = true;
                    }
                },

                _ = &mut keepalive => {
                    if let Err(e) = ws.send(Message::Ping(Vec::new())).await {
                        tracing::warn!(error = %e, "keepalive ping failed");
                        connected.store(false, Ordering::SeqCst);
                        ws_stream = None;
                    }
                }

                frame = ws.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(ServerFrame::Change { event }) => {
                                route_change(event, &subs, &mut seen).await;
                            }
                            Ok(ServerFrame::Subscribed { id }) => {
                                tracing::debug!(subscription = %id, "subscription confirmed");
                            }
                            Ok(ServerFrame::Error { message }) => {
                                tracing::warn!(message = %message, "server reported error");
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "unparseable frame");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        tracing::info!("server closed connection");
                        connected.store(false, Ordering::SeqCst);
                        ws_stream = None;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket error");
                        connected.store(false, Ordering::SeqCst);
                        ws_stream = None;
                    }
                    None => {
                        tracing::info!("websocket stream ended");
                        connected.store(false, Ordering::SeqCst);
                        ws_stream = None;
                    }
                },
            }
        } else {
            // Offline. Give up once the attempt budget is spent, closing
            // every feed so consumers observe the end of the stream.
            let attempt = attempts;
            attempts = attempts.saturating_add(1);
            let max = config.reconnect_max_attempts;
            if max != 0 && attempt >= max {
                tracing::warn!(attempts = max, "reconnect attempts exhausted");
                subs.clear();
                loop {
                    match cmd_rx.recv().await {
                        Some(ConnCmd::Subscribe { result_tx, .. }) => {
                            let _ = result_tx.send(Err(ClientError::WebSocket(
                                "reconnect attempts exhausted".into(),
                            )));
                        }
                        Some(ConnCmd::Unsubscribe { .. }) => {}
                        Some(ConnCmd::Shutdown) | None => return,
                    }
                }
            }

            if attempt > 0 {
                let delay = with_jitter(backoff_delay(
                    attempt - 1,
                    config.reconnect_initial_delay_ms,
                    config.reconnect_max_delay_ms,
                ));
                tracing::info!(delay_ms = delay, attempt = attempt, "reconnecting after delay");

                let sleep = tokio::time::sleep(Duration::from_millis(delay));
                tokio::pin!(sleep);
                loop {
                    tokio::select! {
                        biased;
                        cmd = cmd_rx.recv() => match cmd {
                            Some(ConnCmd::Subscribe { id, filter, event_tx, result_tx }) => {
                                subs.insert(id, SubEntry { filter, event_tx });
                                let _ = result_tx.send(Ok(()));
                            }
                            Some(ConnCmd::Unsubscribe { id }) => {
                                subs.remove(&id);
                            }
                            Some(ConnCmd::Shutdown) | None => {
                                shutdown_requested = true;
                                break;
                            }
                        },
                        _ = &mut sleep => break,
                    }
                }
                if shutdown_requested {
                    continue;
                }
            }

            match establish_ws(&endpoint, &auth).await {
                Ok(mut ws) => {
                    tracing::info!(endpoint = %endpoint, "realtime connected");
                    attempts = 0;
                    connected.store(true, Ordering::SeqCst);
                    resubscribe_all(&mut ws, &subs).await;
                    ws_stream = Some(ws);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt = attempt + 1, "connect attempt failed");
                }
            }
        }
    }
}
