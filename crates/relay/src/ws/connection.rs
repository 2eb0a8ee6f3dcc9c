//! WebSocket connection handling
//!
//! Manages one member connection: handshake with room and origin checks,
//! the opening sync exchange, and bidirectional frame relaying with a
//! heartbeat and per-connection rate limiting.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::{SinkExt, StreamExt};
use gridsync_protocol::SyncMessage;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::room::{MemberId, RoomEvent, SharedRoomRegistry};

use super::protocol::{parse_room_from_uri, validate_origin};
use super::rate_limit::RateLimiter;

/// Minimum spacing between two full resyncs of a lagging member
const LAG_RECOVERY_DEBOUNCE: Duration = Duration::from_secs(2);

/// Connection metadata extracted during the WebSocket handshake
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub room: Option<String>,
    pub origin: Option<String>,
}

/// Handle a single WebSocket connection
pub async fn handle_connection<S>(
    stream: S,
    registry: SharedRoomRegistry,
    config: Arc<RelayConfig>,
    shutdown: CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_info = Arc::new(Mutex::new(ConnectionInfo::default()));
    let conn_info_clone = Arc::clone(&conn_info);
    let allowed_origins = config.allowed_origins.clone();

    // Reject bad rooms and origins before upgrading
    let callback = move |req: &Request, response: Response| -> std::result::Result<Response, ErrorResponse> {
        let mut info = conn_info_clone.lock().unwrap_or_else(PoisonError::into_inner);

        let origin = req
            .headers()
            .get("origin")
            .and_then(|origin| origin.to_str().ok())
            .map(str::to_string);
        // No origin header = non-browser client
        if let Some(origin) = &origin {
            if !validate_origin(origin, &allowed_origins) {
                return Err(reject(StatusCode::FORBIDDEN, "origin not allowed"));
            }
        }
        info.origin = origin;

        let Some(room) = parse_room_from_uri(&req.uri().to_string()) else {
            return Err(reject(StatusCode::NOT_FOUND, "unknown room"));
        };
        info.room = Some(room);
        Ok(response)
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(config.max_message_bytes);
    ws_config.max_frame_size = Some(config.max_message_bytes);

    let ws = match tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            let info = conn_info.lock().unwrap_or_else(PoisonError::into_inner).clone();
            tracing::warn!(origin = ?info.origin, error = %e, "Rejected connection");
            return Err(e.into());
        }
    };
    let info = conn_info.lock().unwrap_or_else(PoisonError::into_inner).clone();
    let room = info
        .room
        .ok_or_else(|| anyhow::anyhow!("handshake finished without a room"))?;

    let (ws_tx, mut ws_rx) = ws.split();
    let ws_tx = Arc::new(tokio::sync::Mutex::new(ws_tx));

    let (member, events, hello) = {
        let mut registry = registry.write().await;
        let (member, events) = registry.join(&room);
        (member, events, registry.hello(&room))
    };
    tracing::info!(room = %room, member, origin = ?info.origin, "Member connected");

    // Opening exchange: the member answers with what the relay is missing
    if let Some(hello) = hello {
        if let Err(e) = send_frame(&ws_tx, &hello).await {
            registry.write().await.leave(&room, member);
            return Err(e);
        }
    }

    // Dedicated task for room -> member frames
    let sender_handle = tokio::spawn(forward_room_events(
        events,
        Arc::clone(&ws_tx),
        registry.clone(),
        room.clone(),
        member,
    ));

    let mut rate_limiter = RateLimiter::new(config.rate_limit_burst, config.rate_limit_per_sec);
    let mut heartbeat = tokio::time::interval(config.heartbeat());
    let idle_timeout = config.idle_timeout();
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                let _ = ws_tx.lock().await.send(Message::Close(None)).await;
                break;
            }

            _ = heartbeat.tick() => {
                if last_activity.elapsed() > idle_timeout {
                    tracing::warn!(
                        room = %room,
                        member,
                        elapsed_secs = last_activity.elapsed().as_secs(),
                        "Member idle, disconnecting"
                    );
                    break;
                }
                if ws_tx.lock().await.send(Message::Ping(Vec::new())).await.is_err() {
                    tracing::debug!(room = %room, member, "Ping send failed");
                    break;
                }
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();

                        // Over the limit: stop reading from this member until the bucket refills
                        let wait = rate_limiter.reserve();
                        if !wait.is_zero() {
                            tracing::debug!(
                                room = %room,
                                member,
                                wait_ms = wait.as_millis() as u64,
                                "Rate limit exceeded, delaying frame"
                            );
                            tokio::select! {
                                () = shutdown.cancelled() => {
                                    let _ = ws_tx.lock().await.send(Message::Close(None)).await;
                                    break;
                                }
                                () = tokio::time::sleep(wait) => {}
                            }
                        }

                        let frame = match SyncMessage::from_json(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                tracing::warn!(room = %room, member, error = %e, "Ignoring malformed frame");
                                continue;
                            }
                        };
                        let kind = frame.kind();
                        let reply = registry.write().await.handle_message(&room, member, frame);
                        match reply {
                            Ok(Some(reply)) => {
                                if send_frame(&ws_tx, &reply).await.is_err() {
                                    tracing::warn!(room = %room, member, "Failed to send reply");
                                    break;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                tracing::warn!(room = %room, member, kind, error = %e, "Frame rejected");
                            }
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        tracing::debug!(room = %room, member, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(room = %room, member, error = %e, "Socket error");
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                }
            }
        }
    }

    sender_handle.abort();
    registry.write().await.leave(&room, member);
    tracing::info!(room = %room, member, "Member disconnected");
    Ok(())
}

/// Relay room events to one member, resyncing it in full when it lags
///
/// Full resyncs are spaced at least [`LAG_RECOVERY_DEBOUNCE`] apart. A lag
/// inside that window schedules the resync for the end of the window; it
/// is never skipped, since the dropped frames are gone for good.
async fn forward_room_events<W>(
    mut events: broadcast::Receiver<RoomEvent>,
    ws_tx: Arc<tokio::sync::Mutex<W>>,
    registry: SharedRoomRegistry,
    room: String,
    member: MemberId,
) where
    W: futures::Sink<Message> + Unpin,
{
    let mut last_resync: Option<tokio::time::Instant> = None;
    let mut resync_due: Option<tokio::time::Instant> = None;
    loop {
        let due = resync_due;
        tokio::select! {
            () = sleep_until_due(due), if due.is_some() => {
                resync_due = None;
                last_resync = Some(tokio::time::Instant::now());
                let full = registry.read().await.full_sync(&room);
                if let Some(full) = full {
                    if send_frame(&ws_tx, &full).await.is_err() {
                        break;
                    }
                }
            }

            event = events.recv() => match event {
                Ok(event) => {
                    if event.from == member {
                        continue;
                    }
                    let mut tx = ws_tx.lock().await;
                    if tx.send(Message::Text(event.frame.to_string())).await.is_err() {
                        tracing::warn!(room = %room, member, "Send failed, stopping sender");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(dropped)) => {
                    let now = tokio::time::Instant::now();
                    let at = last_resync.map_or(now, |at| (at + LAG_RECOVERY_DEBOUNCE).max(now));
                    let at = *resync_due.get_or_insert(at);
                    tracing::warn!(
                        room = %room,
                        member,
                        dropped,
                        delay_ms = at.saturating_duration_since(now).as_millis() as u64,
                        "Member lagged, scheduling full state"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

async fn sleep_until_due(due: Option<tokio::time::Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn send_frame<W>(ws_tx: &tokio::sync::Mutex<W>, msg: &SyncMessage) -> Result<()>
where
    W: futures::Sink<Message> + Unpin,
{
    let text = msg.to_json()?;
    ws_tx
        .lock()
        .await
        .send(Message::Text(text))
        .await
        .map_err(|_| anyhow::anyhow!("socket closed"))
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use futures::channel::mpsc;

    use super::*;
    use crate::room::create_registry;

    fn awareness(from: MemberId, n: u8) -> RoomEvent {
        let frame = SyncMessage::Awareness { data: vec![n] }.to_json().unwrap();
        RoomEvent {
            from,
            frame: frame.into(),
        }
    }

    /// Read forwarded frames until the next full-state `sync2`
    async fn next_full_sync(frames: &mut mpsc::UnboundedReceiver<Message>) -> tokio::time::Instant {
        loop {
            let Some(Message::Text(text)) = frames.next().await else {
                panic!("forwarder stopped");
            };
            if matches!(SyncMessage::from_json(&text).unwrap(), SyncMessage::SyncStep2 { .. }) {
                return tokio::time::Instant::now();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_lag_inside_debounce_window_still_resyncs() {
        let registry = create_registry();
        let (member, _room_events) = registry.write().await.join("sheet-1");
        let (events_tx, events_rx) = broadcast::channel(1);
        let (sink, mut frames) = mpsc::unbounded();

        // Overflow the one-slot channel before the forwarder reads anything
        for n in 0..3 {
            events_tx.send(awareness(member + 1, n)).unwrap();
        }
        let start = tokio::time::Instant::now();
        let forwarder = tokio::spawn(forward_room_events(
            events_rx,
            Arc::new(tokio::sync::Mutex::new(sink)),
            registry.clone(),
            "sheet-1".to_string(),
            member,
        ));

        let first = next_full_sync(&mut frames).await;
        assert!(first - start < LAG_RECOVERY_DEBOUNCE);

        // Lag again right away: the resync waits out the window instead of vanishing
        for n in 3..6 {
            events_tx.send(awareness(member + 1, n)).unwrap();
        }
        let second = next_full_sync(&mut frames).await;
        assert!(second - first >= LAG_RECOVERY_DEBOUNCE);

        drop(events_tx);
        forwarder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn own_events_are_not_echoed() {
        let registry = create_registry();
        let (member, _room_events) = registry.write().await.join("sheet-1");
        let (events_tx, events_rx) = broadcast::channel(8);
        let (sink, mut frames) = mpsc::unbounded();
        let forwarder = tokio::spawn(forward_room_events(
            events_rx,
            Arc::new(tokio::sync::Mutex::new(sink)),
            registry,
            "sheet-1".to_string(),
            member,
        ));

        events_tx.send(awareness(member, 1)).unwrap();
        events_tx.send(awareness(member + 1, 2)).unwrap();
        drop(events_tx);
        forwarder.await.unwrap();

        let Some(Message::Text(text)) = frames.next().await else {
            panic!("expected one frame");
        };
        assert_eq!(
            SyncMessage::from_json(&text).unwrap(),
            SyncMessage::Awareness { data: vec![2] }
        );
        assert!(frames.next().await.is_none());
    }
}
