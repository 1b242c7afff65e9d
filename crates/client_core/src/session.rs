//! Live session: the single real-time transport connection for one identity.
//!
//! The session exclusively owns the WebSocket. Everything else observes it
//! through [`LiveSession::subscribe`] and talks back through
//! [`LiveSession::emit`]; nothing outside this module ever holds the raw
//! stream. Subscriptions survive reconnects: the broadcast channel outlives
//! individual transport connections, so a handler registered before a drop
//! keeps receiving events after the session re-establishes itself.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use shared::domain::UserId;
use shared::protocol::{ClientSignal, ServerEvent};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

use crate::error::ClientError;
use crate::Identity;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, WsMessage>;
type WsReader = SplitStream<WsStream>;

const SESSION_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Attempts per disconnect episode before the session gives up.
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            max_retries: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub reconnect: ReconnectPolicy,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Event(ServerEvent),
}

pub struct LiveSession {
    user_id: UserId,
    writer: Arc<Mutex<Option<WsWriter>>>,
    events: broadcast::Sender<SessionEvent>,
    reader_task: JoinHandle<()>,
}

impl LiveSession {
    /// Opens the transport and announces presence. Returns `Ok(None)` when
    /// the identity has no stable user id: that is a precondition, not an
    /// error, and the messaging feature simply stays inert.
    pub async fn connect(
        identity: &Identity,
        token: &str,
        config: SessionConfig,
    ) -> Result<Option<LiveSession>, ClientError> {
        let Some(user_id) = identity.user_id.clone() else {
            warn!("no user id on identity; live session stays inert");
            return Ok(None);
        };

        let ws_url = derive_ws_url(&config.server_url, token)?;
        let stream = connect_ws(&ws_url).await?;
        let (mut writer, reader) = stream.split();
        authenticate(&mut writer, &user_id).await?;
        info!(user_id = %user_id, "live session established");

        let writer = Arc::new(Mutex::new(Some(writer)));
        let (events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);

        let reader_task = tokio::spawn(run_loop(
            reader,
            Arc::clone(&writer),
            events.clone(),
            ws_url,
            user_id.clone(),
            config.reconnect,
        ));

        Ok(Some(LiveSession {
            user_id,
            writer,
            events,
            reader_task,
        }))
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn emit(&self, signal: ClientSignal) -> Result<(), ClientError> {
        let frame = serde_json::to_string(&signal)
            .map_err(|e| ClientError::Transport(format!("failed to encode signal: {e}")))?;
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        writer
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }

    /// Tears the session down. The reader task is aborted first so no event
    /// is delivered into torn-down state.
    pub async fn disconnect(&self) {
        self.reader_task.abort();
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.send(WsMessage::Close(None)).await;
        }
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

fn derive_ws_url(server_url: &str, token: &str) -> Result<String, ClientError> {
    let base = if server_url.starts_with("https://") {
        server_url.replacen("https://", "wss://", 1)
    } else if server_url.starts_with("http://") {
        server_url.replacen("http://", "ws://", 1)
    } else {
        return Err(ClientError::Transport(
            "server url must start with http:// or https://".to_string(),
        ));
    };
    let ws_url = format!("{}/ws?token={token}", base.trim_end_matches('/'));
    Url::parse(&ws_url).map_err(|e| ClientError::Transport(format!("invalid ws url: {e}")))?;
    Ok(ws_url)
}

async fn connect_ws(ws_url: &str) -> Result<WsStream, ClientError> {
    let (stream, _) = connect_async(ws_url)
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))?;
    Ok(stream)
}

/// Presence announcement; sent as the first frame of every connection so the
/// server can route user-targeted events to this session.
async fn authenticate(writer: &mut WsWriter, user_id: &UserId) -> Result<(), ClientError> {
    let signal = ClientSignal::Authenticate {
        user_id: user_id.clone(),
    };
    let frame = serde_json::to_string(&signal)
        .map_err(|e| ClientError::Transport(format!("failed to encode signal: {e}")))?;
    writer
        .send(WsMessage::Text(frame))
        .await
        .map_err(|e| ClientError::Transport(e.to_string()))
}

async fn run_loop(
    mut reader: WsReader,
    writer_slot: Arc<Mutex<Option<WsWriter>>>,
    events: broadcast::Sender<SessionEvent>,
    ws_url: String,
    user_id: UserId,
    policy: ReconnectPolicy,
) {
    loop {
        read_until_closed(&mut reader, &events).await;

        writer_slot.lock().await.take();
        let _ = events.send(SessionEvent::Disconnected);

        match reconnect(&ws_url, &user_id, &policy).await {
            Some((writer, new_reader)) => {
                *writer_slot.lock().await = Some(writer);
                reader = new_reader;
                info!(user_id = %user_id, "live session reconnected");
                let _ = events.send(SessionEvent::Connected);
            }
            None => {
                warn!(user_id = %user_id, "live session reconnect attempts exhausted");
                return;
            }
        }
    }
}

/// Forwards frames to subscribers in transport order. Malformed frames are
/// logged and skipped; no error escapes the loop, so one bad event cannot
/// break delivery of the ones behind it.
async fn read_until_closed(reader: &mut WsReader, events: &broadcast::Sender<SessionEvent>) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                Ok(event) => {
                    let _ = events.send(SessionEvent::Event(event));
                }
                Err(err) => {
                    warn!(%err, "ignoring malformed server event");
                }
            },
            Ok(WsMessage::Close(_)) => return,
            Ok(_) => {}
            Err(err) => {
                warn!(%err, "websocket receive failed");
                return;
            }
        }
    }
}

async fn reconnect(
    ws_url: &str,
    user_id: &UserId,
    policy: &ReconnectPolicy,
) -> Option<(WsWriter, WsReader)> {
    let mut backoff = policy.initial_backoff;
    for attempt in 1..=policy.max_retries {
        tokio::time::sleep(backoff).await;
        match connect_ws(ws_url).await {
            Ok(stream) => {
                let (mut writer, reader) = stream.split();
                match authenticate(&mut writer, user_id).await {
                    Ok(()) => return Some((writer, reader)),
                    Err(err) => {
                        warn!(attempt, %err, "authentication after reconnect failed");
                    }
                }
            }
            Err(err) => {
                warn!(attempt, %err, "live session reconnect failed");
            }
        }
        backoff = (backoff * 2).min(policy.max_backoff);
    }
    None
}
