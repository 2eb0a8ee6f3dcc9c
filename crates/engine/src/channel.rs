//! Sync channel
//!
//! Connects a [`SheetDocument`] to the relay room `sheet-<id>` over a
//! WebSocket and keeps it there. Every (re)connect starts with the state
//! vector exchange, so edits made while offline are delivered without any
//! replay queue of our own; the CRDT merge drops whatever arrives twice.
//!
//! Connection loss is never reported as an error. The task logs it, backs
//! off and tries again until [`SyncChannel::disconnect`] or drop.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use gridsync_protocol::{room_key, SyncMessage};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::document::{DocumentHandle, SheetDocument, UpdateOrigin};
use crate::error::{Result, SyncError};

/// Connection state as seen by the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Connecting,
    /// Socket open, state vector exchange in flight
    Connected,
    /// The relay's state has been merged at least once on this connection
    Synced,
    Disconnected,
    /// Torn down; no further reconnects
    Closed,
}

/// Exponential reconnect backoff with jitter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(10))
    }
}

impl ReconnectPolicy {
    pub const fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    /// Backoff before retry number `attempt` (zero-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Backoff with up to 20% random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let spread = (base.as_millis() / 5) as u64;
        if spread == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Live connection between one document and its relay room
pub struct SyncChannel {
    room: String,
    url: Url,
    status: watch::Receiver<ChannelStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncChannel {
    /// Validate the endpoint and start the connection task
    ///
    /// Only a malformed endpoint fails; an unreachable relay is retried in
    /// the background.
    pub fn connect(endpoint: &str, document: &SheetDocument, policy: ReconnectPolicy) -> Result<Self> {
        let room = room_key(document.sheet_id());
        let url = room_url(endpoint, &room)?;

        let (status_tx, status) = watch::channel(ChannelStatus::Connecting);
        let cancel = CancellationToken::new();
        let task = ChannelTask {
            room: room.clone(),
            url: url.clone(),
            document: document.downgrade(),
            outbound: document.subscribe_updates(),
            status: status_tx,
            cancel: cancel.clone(),
            policy,
        };
        let task = tokio::spawn(task.run());

        tracing::info!(room = %room, url = %url, "Sync channel started");
        Ok(Self {
            room,
            url,
            status,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn room(&self) -> &str {
        &self.room
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Wait until the relay state has been merged, at most `timeout`
    ///
    /// Returns `false` on timeout or if the channel closed first.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut status = self.status.clone();
        let reached = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s, ChannelStatus::Synced | ChannelStatus::Closed)),
        )
        .await;
        matches!(reached, Ok(Ok(ref s)) if **s == ChannelStatus::Synced)
    }

    /// Cancel reconnects, close the socket and wait for the task to end
    pub async fn disconnect(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(room = %self.room, error = %e, "Sync channel task failed");
            }
        }
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SyncChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncChannel")
            .field("room", &self.room)
            .field("url", &self.url.as_str())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// `<endpoint>/<room>` for a `ws://` or `wss://` endpoint
pub fn room_url(endpoint: &str, room: &str) -> Result<Url> {
    let invalid = |reason: String| SyncError::Endpoint {
        endpoint: endpoint.to_string(),
        reason,
    };
    let base = Url::parse(endpoint).map_err(|e| invalid(e.to_string()))?;
    if !matches!(base.scheme(), "ws" | "wss") {
        return Err(invalid(format!("unsupported scheme {}", base.scheme())));
    }
    if base.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Url::parse(&format!("{}/{room}", endpoint.trim_end_matches('/'))).map_err(|e| invalid(e.to_string()))
}

/// Why one connection ended
enum Ended {
    Cancelled,
    /// The session dropped or detached the document
    DocumentGone,
    Lost(String),
}

struct ChannelTask {
    room: String,
    url: Url,
    document: DocumentHandle,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    status: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
}

impl ChannelTask {
    async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            self.status.send_replace(ChannelStatus::Connecting);
            let connected = tokio::select! {
                () = self.cancel.cancelled() => break,
                connected = tokio_tungstenite::connect_async(self.url.as_str()) => connected,
            };

            match connected {
                Ok((ws, _response)) => {
                    attempt = 0;
                    self.status.send_replace(ChannelStatus::Connected);
                    tracing::info!(room = %self.room, "Connected to relay");
                    match self.session(ws).await {
                        Ended::Cancelled | Ended::DocumentGone => break,
                        Ended::Lost(reason) => {
                            tracing::warn!(room = %self.room, reason = %reason, "Relay connection lost");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(room = %self.room, attempt, error = %e, "Relay connection failed");
                }
            }

            self.status.send_replace(ChannelStatus::Disconnected);
            let delay = self.policy.delay(attempt);
            attempt = attempt.saturating_add(1);
            tracing::debug!(room = %self.room, delay_ms = delay.as_millis() as u64, "Reconnecting");
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.status.send_replace(ChannelStatus::Closed);
        tracing::info!(room = %self.room, "Sync channel closed");
    }

    async fn session<S>(&mut self, ws: tokio_tungstenite::WebSocketStream<S>) -> Ended
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = ws.split();

        // Queued deltas are covered by the state vector exchange below
        let mut stale = 0usize;
        while self.outbound.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            tracing::debug!(room = %self.room, stale, "Dropped queued updates before resync");
        }

        let Some(document) = self.document.upgrade() else {
            return Ended::DocumentGone;
        };
        let hello = SyncMessage::SyncStep1 {
            state_vector: document.state_vector(),
        };
        drop(document);
        if let Err(e) = send(&mut ws_tx, &hello).await {
            return Ended::Lost(e.to_string());
        }

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ended::Cancelled;
                }

                update = self.outbound.recv() => {
                    let Some(update) = update else {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        return Ended::DocumentGone;
                    };
                    if let Err(e) = send(&mut ws_tx, &SyncMessage::Update { update }).await {
                        return Ended::Lost(e.to_string());
                    }
                }

                frame = ws_rx.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Close(_))) | None => return Ended::Lost("closed by relay".to_string()),
                        Some(Err(e)) => return Ended::Lost(e.to_string()),
                        Some(Ok(_)) => continue,
                    };
                    let msg = match SyncMessage::from_json(&text) {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::warn!(room = %self.room, error = %e, "Ignoring malformed frame");
                            continue;
                        }
                    };

                    let Some(document) = self.document.upgrade() else {
                        return Ended::DocumentGone;
                    };
                    let completes_sync = matches!(msg, SyncMessage::SyncStep2 { .. });
                    let reply = match handle_message(&document, msg) {
                        Ok(reply) => reply,
                        Err(e) => {
                            tracing::warn!(room = %self.room, error = %e, "Failed to apply relay message");
                            continue;
                        }
                    };
                    drop(document);

                    if completes_sync && *self.status.borrow() != ChannelStatus::Synced {
                        self.status.send_replace(ChannelStatus::Synced);
                        tracing::info!(room = %self.room, "Document synced with relay");
                    }
                    if let Some(reply) = reply {
                        if let Err(e) = send(&mut ws_tx, &reply).await {
                            return Ended::Lost(e.to_string());
                        }
                    }
                }
            }
        }
    }
}

/// Apply one relay message to the document
///
/// Returns the message to send back, if any.
pub fn handle_message(document: &SheetDocument, msg: SyncMessage) -> Result<Option<SyncMessage>> {
    match msg {
        SyncMessage::SyncStep1 { state_vector } => {
            // Relay wants what it is missing
            let update = document.encode_diff(&state_vector)?;
            Ok(Some(SyncMessage::SyncStep2 { update }))
        }
        SyncMessage::SyncStep2 { update } | SyncMessage::Update { update } => {
            document.apply_update(&update, UpdateOrigin::Remote)?;
            Ok(None)
        }
        SyncMessage::Awareness { .. } => Ok(None),
    }
}

async fn send<S>(ws_tx: &mut S, msg: &SyncMessage) -> Result<()>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    ws_tx.send(Message::Text(msg.to_json()?)).await?;
    Ok(())
}
