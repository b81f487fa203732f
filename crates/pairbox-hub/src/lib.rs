//! Relay hub for project channels: connections join a room named by the
//! project id in their hello frame and see every other member's
//! `project-message` and `project-code` frames.

use axum::{
    extract::{ws::Message, ws::WebSocket, ws::WebSocketUpgrade, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use pairbox_core::protocol::{
    decode_frame, encode_frame, ChannelEnvelope, ChannelEvent, ErrorPayload,
    DEFAULT_MAX_FRAME_BYTES,
};
use pairbox_core::ProjectId;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const HUB_SENDER_ID: &str = "pairbox-hub";
const CLIENT_QUEUE: usize = 256;

#[derive(Clone, Debug)]
pub struct HubConfig {
    pub addr: String,
    /// Bearer token required on upgrade when set.
    pub token: Option<String>,
    pub debug: bool,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub log_dir: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3001".to_string(),
            token: None,
            debug: false,
            ping_interval: Duration::from_secs(10),
            write_timeout: Duration::from_secs(2),
            log_dir: String::new(),
        }
    }
}

struct Client {
    conn_id: String,
    client_id: String,
    project: ProjectId,
    sender: mpsc::Sender<Message>,
}

impl Client {
    async fn send_text(&self, text: &str) -> bool {
        self.sender.send(Message::Text(text.to_string())).await.is_ok()
    }

    async fn close(&self, reason: &str) {
        let _ = self
            .sender
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: 1008,
                reason: reason.to_string().into(),
            })))
            .await;
    }
}

type Room = HashMap<String, Arc<Client>>;

pub struct HubState {
    config: HubConfig,
    conn_counter: AtomicU64,
    rooms: RwLock<HashMap<ProjectId, Room>>,
}

impl HubState {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            conn_counter: AtomicU64::new(0),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Live connections in the project's room.
    pub async fn room_size(&self, project: &ProjectId) -> usize {
        self.rooms
            .read()
            .await
            .get(project)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    fn next_conn_id(&self) -> String {
        let id = self.conn_counter.fetch_add(1, Ordering::SeqCst) + 1;
        format!("conn-{id}")
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        let Some(expected) = self.config.token.as_deref() else {
            return true;
        };
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim() == expected)
            .unwrap_or(false)
    }

    async fn join(&self, client: Arc<Client>) {
        let members = {
            let mut rooms = self.rooms.write().await;
            let room = rooms.entry(client.project.clone()).or_default();
            room.insert(client.conn_id.clone(), client.clone());
            room.len()
        };
        info!(
            event = "client_connected",
            conn_id = %client.conn_id,
            client_id = %client.client_id,
            project_id = %client.project,
            members
        );
    }

    async fn leave(&self, client: &Client, reason: &str) {
        client.close(reason).await;
        let removed = {
            let mut rooms = self.rooms.write().await;
            match rooms.get_mut(&client.project) {
                Some(room) => {
                    let removed = room.remove(&client.conn_id).is_some();
                    if room.is_empty() {
                        rooms.remove(&client.project);
                    }
                    removed
                }
                None => false,
            }
        };
        if removed {
            info!(
                event = "client_disconnected",
                conn_id = %client.conn_id,
                client_id = %client.client_id,
                project_id = %client.project,
                reason = reason
            );
        }
    }

    async fn peers_of(&self, client: &Client) -> Vec<Arc<Client>> {
        self.rooms
            .read()
            .await
            .get(&client.project)
            .map(|room| {
                room.values()
                    .filter(|peer| peer.conn_id != client.conn_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn relay(&self, from: &Client, raw: &str) {
        let peers = self.peers_of(from).await;
        let delivered = peers.len();
        for peer in peers {
            if !peer.send_text(raw).await {
                warn!(event = "send_error", conn_id = %peer.conn_id);
                self.leave(&peer, "send_error").await;
            }
        }
        debug!(event = "relayed", conn_id = %from.conn_id, project_id = %from.project, delivered);
    }

    async fn send_error(&self, client: &Client, code: &str, message: &str) {
        let envelope = ChannelEnvelope::new(
            client.project.clone(),
            HUB_SENDER_ID,
            ChannelEvent::Error(ErrorPayload {
                code: code.to_string(),
                message: message.to_string(),
            }),
        );
        if let Ok(frame) = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            let _ = client.send_text(&frame).await;
        }
    }

    fn start_ping(&self, client: Arc<Client>) -> Option<JoinHandle<()>> {
        if self.config.ping_interval.is_zero() {
            return None;
        }
        let interval = self.config.ping_interval;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if client.sender.send(Message::Ping(Vec::new())).await.is_err() {
                    debug!(event = "ping_stopped", conn_id = %client.conn_id);
                    return;
                }
            }
        }))
    }

    async fn handle_frame(&self, client: &Client, raw: &str) {
        let envelope: ChannelEnvelope = match decode_frame(raw, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "message_invalid", conn_id = %client.conn_id, error = %err);
                self.send_error(client, "invalid_frame", &err.to_string()).await;
                return;
            }
        };
        if let Err(err) = envelope.validate() {
            warn!(event = "message_invalid", conn_id = %client.conn_id, error = err);
            self.send_error(client, "invalid_envelope", err).await;
            return;
        }
        if envelope.project_id != client.project {
            warn!(
                event = "project_mismatch",
                conn_id = %client.conn_id,
                room = %client.project,
                project_id = %envelope.project_id
            );
            self.send_error(client, "project_mismatch", "frame project differs from room")
                .await;
            return;
        }
        match envelope.event {
            ChannelEvent::ProjectMessage(_) | ChannelEvent::ProjectCode(_) => {
                self.relay(client, raw).await;
            }
            ChannelEvent::Hello(_) | ChannelEvent::Error(_) => {
                self.send_error(client, "unexpected_event", envelope.kind().as_str())
                    .await;
            }
        }
    }

    async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_QUEUE);
        let write_timeout = self.config.write_timeout;
        let write_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let send = ws_sender.send(msg);
                match tokio::time::timeout(write_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) | Err(_) => return,
                }
            }
        });

        let hello = match ws_receiver.next().await {
            Some(Ok(Message::Text(text))) => text,
            _ => {
                warn!(event = "expected_hello", reason = "no_text_frame");
                return;
            }
        };
        let hello: ChannelEnvelope = match decode_frame(&hello, DEFAULT_MAX_FRAME_BYTES) {
            Ok(value) => value,
            Err(err) => {
                warn!(event = "hello_parse", error = %err);
                return;
            }
        };
        if let Err(err) = hello.validate() {
            warn!(event = "hello_envelope", error = err);
            return;
        }
        let payload = match hello.event {
            ChannelEvent::Hello(payload) => payload,
            other => {
                warn!(event = "expected_hello", kind = %other.kind());
                return;
            }
        };
        if payload.client_id != hello.sender_id {
            warn!(event = "client_id_mismatch", client_id = %payload.client_id);
            return;
        }

        let client = Arc::new(Client {
            conn_id: self.next_conn_id(),
            client_id: payload.client_id,
            project: hello.project_id,
            sender: tx.clone(),
        });
        info!(
            event = "handshake_ok",
            conn_id = %client.conn_id,
            client_id = %client.client_id,
            email = payload.email.as_deref().unwrap_or("")
        );
        self.join(client.clone()).await;
        let ping = self.start_ping(client.clone());

        while let Some(result) = ws_receiver.next().await {
            let msg = match result {
                Ok(value) => value,
                Err(err) => {
                    warn!(event = "read_error", conn_id = %client.conn_id, error = %err);
                    break;
                }
            };
            let text = match msg {
                Message::Text(text) => text,
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => text,
                    Err(_) => {
                        self.send_error(&client, "invalid_frame", "binary frame is not utf-8")
                            .await;
                        continue;
                    }
                },
                Message::Close(_) => {
                    info!(event = "client_close", conn_id = %client.conn_id);
                    break;
                }
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            if self.config.debug {
                debug!(event = "message_received", conn_id = %client.conn_id, raw = %text);
            }
            self.handle_frame(&client, &text).await;
        }

        if let Some(ping) = ping {
            ping.abort();
        }
        self.leave(&client, "disconnect").await;
        drop(client);
        drop(tx);
        let _ = write_task.await;
    }
}

/// `/ws` for the channel and `/health` for liveness checks.
pub fn router(hub: Arc<HubState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(hub)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(hub): State<Arc<HubState>>,
) -> Response {
    if !hub.authorized(&headers) {
        warn!(event = "unauthorized_upgrade");
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.on_upgrade(move |socket| async move {
        hub.handle_socket(socket).await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(conn: &str, project: &str) -> (Arc<Client>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(8);
        let client = Arc::new(Client {
            conn_id: conn.to_string(),
            client_id: format!("client-{conn}"),
            project: ProjectId::new(project),
            sender: tx,
        });
        (client, rx)
    }

    #[test]
    fn token_check_requires_matching_bearer() {
        let open = HubState::new(HubConfig::default());
        assert!(open.authorized(&HeaderMap::new()));

        let guarded = HubState::new(HubConfig {
            token: Some("s3cret".to_string()),
            ..HubConfig::default()
        });
        assert!(!guarded.authorized(&HeaderMap::new()));

        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().expect("header"));
        assert!(!guarded.authorized(&headers));
        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().expect("header"));
        assert!(guarded.authorized(&headers));
    }

    #[tokio::test]
    async fn relay_skips_sender_and_other_rooms() {
        let hub = HubState::new(HubConfig::default());
        let (a, mut a_rx) = client("1", "p1");
        let (b, mut b_rx) = client("2", "p1");
        let (c, mut c_rx) = client("3", "p2");
        for member in [&a, &b, &c] {
            hub.join(member.clone()).await;
        }
        assert_eq!(hub.room_size(&ProjectId::new("p1")).await, 2);

        hub.relay(&a, "frame").await;
        assert!(matches!(b_rx.try_recv(), Ok(Message::Text(text)) if text == "frame"));
        assert!(a_rx.try_recv().is_err());
        assert!(c_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn leaving_drops_empty_rooms() {
        let hub = HubState::new(HubConfig::default());
        let (a, _a_rx) = client("1", "p1");
        hub.join(a.clone()).await;
        assert_eq!(hub.room_count().await, 1);

        hub.leave(&a, "disconnect").await;
        assert_eq!(hub.room_count().await, 0);
        assert_eq!(hub.room_size(&ProjectId::new("p1")).await, 0);
    }

    #[tokio::test]
    async fn mismatched_project_gets_error_frame() {
        let hub = HubState::new(HubConfig::default());
        let (a, mut a_rx) = client("1", "p1");
        let (b, mut b_rx) = client("2", "p1");
        hub.join(a.clone()).await;
        hub.join(b.clone()).await;

        let stray = ChannelEnvelope::new(
            ProjectId::new("p2"),
            "client-1",
            ChannelEvent::ProjectCode(Default::default()),
        );
        let raw = encode_frame(&stray, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        hub.handle_frame(&a, &raw).await;

        let Ok(Message::Text(reply)) = a_rx.try_recv() else {
            panic!("expected error frame");
        };
        let reply: ChannelEnvelope = decode_frame(&reply, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert!(matches!(
            reply.event,
            ChannelEvent::Error(ErrorPayload { ref code, .. }) if code == "project_mismatch"
        ));
        assert!(b_rx.try_recv().is_err());
    }
}
