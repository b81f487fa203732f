use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use pairbox_core::protocol::{
    decode_frame, encode_frame, ChannelEnvelope, ChannelEvent, EventKind, HelloPayload,
    DEFAULT_MAX_FRAME_BYTES,
};
use pairbox_core::{ProjectId, SyncError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

const OUTBOUND_CAPACITY: usize = 256;
const INBOUND_CAPACITY: usize = 256;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub type Handler = Arc<dyn Fn(ChannelEnvelope) + Send + Sync>;

/// Raw text frames in both directions plus the task pumping them.
pub struct ChannelLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
    pub task: JoinHandle<()>,
}

#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Connects and sends `hello` as the first frame.
    async fn connect(&self, hello: &ChannelEnvelope) -> Result<ChannelLink, SyncError>;
}

pub struct WsConnector {
    url: Url,
    token: Option<String>,
}

impl WsConnector {
    pub fn new(url: Url, token: Option<String>) -> Self {
        Self { url, token }
    }
}

#[async_trait]
impl ChannelConnector for WsConnector {
    async fn connect(&self, hello: &ChannelEnvelope) -> Result<ChannelLink, SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| SyncError::ChannelUnavailable(err.to_string()))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| SyncError::ChannelUnavailable(err.to_string()))?;
            request.headers_mut().insert("Authorization", value);
        }

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|err| SyncError::ChannelUnavailable(err.to_string()))?;

        let hello = encode_frame(hello, DEFAULT_MAX_FRAME_BYTES)?;
        if let Err(err) = ws.send(Message::Text(hello)).await {
            let _ = ws.close(None).await;
            return Err(SyncError::ChannelUnavailable(format!("hello failed: {err}")));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<String>(INBOUND_CAPACITY);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = ws.next() => match msg {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        Some(Ok(_)) => {}
                    },
                    out = out_rx.recv() => match out {
                        Some(text) => {
                            if ws.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = ws.close(None).await;
        });

        Ok(ChannelLink {
            outbound: out_tx,
            inbound: in_rx,
            task,
        })
    }
}

struct ActiveSession {
    project: ProjectId,
    outbound: mpsc::Sender<String>,
    live: Arc<AtomicBool>,
    pump: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// The single real-time connection for the active project.
///
/// Handlers are keyed by event kind and survive rebinding; frames tagged with
/// any project other than the bound one are dropped before dispatch. A dropped
/// connection marks the session closed and is not retried here.
pub struct ChannelSession {
    connector: Arc<dyn ChannelConnector>,
    client_id: String,
    email: String,
    handlers: Arc<RwLock<HashMap<EventKind, Handler>>>,
    active: Option<ActiveSession>,
}

impl ChannelSession {
    pub fn new(
        connector: Arc<dyn ChannelConnector>,
        client_id: impl Into<String>,
        email: impl Into<String>,
    ) -> Self {
        Self {
            connector,
            client_id: client_id.into(),
            email: email.into(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            active: None,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn project(&self) -> Option<&ProjectId> {
        self.active.as_ref().map(|session| &session.project)
    }

    pub fn is_open(&self) -> bool {
        self.active
            .as_ref()
            .map(|session| session.live.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn open(&mut self, project: &ProjectId) -> Result<(), SyncError> {
        if self.is_open() && self.project() == Some(project) {
            return Ok(());
        }
        self.close().await;

        let hello = ChannelEnvelope::new(
            project.clone(),
            self.client_id.clone(),
            ChannelEvent::Hello(HelloPayload {
                client_id: self.client_id.clone(),
                email: Some(self.email.clone()),
            }),
        );
        let link = match self.connector.connect(&hello).await {
            Ok(link) => link,
            Err(err) => {
                warn!(event = "channel_connect_failed", project_id = %project, error = %err);
                return Err(err);
            }
        };

        let live = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(
            project.clone(),
            link.inbound,
            self.handlers.clone(),
            live.clone(),
        ));
        self.active = Some(ActiveSession {
            project: project.clone(),
            outbound: link.outbound,
            live,
            pump: link.task,
            reader,
        });
        info!(event = "channel_connected", project_id = %project, client_id = %self.client_id);
        Ok(())
    }

    /// Fire-and-forget. Returns whether the frame was queued.
    pub fn send(&self, event: ChannelEvent) -> bool {
        let Some(session) = self.active.as_ref().filter(|s| s.live.load(Ordering::SeqCst)) else {
            warn!(event = "channel_unavailable", kind = %event.kind());
            return false;
        };
        let kind = event.kind();
        let envelope = ChannelEnvelope::new(session.project.clone(), self.client_id.clone(), event);
        let frame = match encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "channel_encode_failed", kind = %kind, error = %err);
                return false;
            }
        };
        if let Err(err) = session.outbound.try_send(frame) {
            warn!(event = "channel_unavailable", kind = %kind, error = %err);
            return false;
        }
        debug!(event = "channel_sent", kind = %kind, project_id = %session.project);
        true
    }

    /// Replaces any handler already registered for `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(ChannelEnvelope) + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.insert(kind, Arc::new(handler));
    }

    pub fn unsubscribe(&self, kind: EventKind) {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        handlers.remove(&kind);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .map(|handlers| handlers.len())
            .unwrap_or_default()
    }

    pub async fn close(&mut self) {
        let Some(session) = self.active.take() else {
            return;
        };
        session.live.store(false, Ordering::SeqCst);
        drop(session.outbound);
        session.reader.abort();
        let _ = session.reader.await;
        let mut pump = session.pump;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut pump).await.is_err() {
            pump.abort();
        }
        info!(event = "channel_closed", project_id = %session.project);
    }
}

async fn read_loop(
    project: ProjectId,
    mut inbound: mpsc::Receiver<String>,
    handlers: Arc<RwLock<HashMap<EventKind, Handler>>>,
    live: Arc<AtomicBool>,
) {
    while let Some(raw) = inbound.recv().await {
        let envelope: ChannelEnvelope = match decode_frame(&raw, DEFAULT_MAX_FRAME_BYTES) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(event = "channel_frame_invalid", project_id = %project, error = %err);
                continue;
            }
        };
        if envelope.project_id != project {
            debug!(
                event = "cross_project_frame_dropped",
                bound = %project,
                frame_project = %envelope.project_id
            );
            continue;
        }
        if let Err(reason) = envelope.validate() {
            warn!(event = "channel_frame_invalid", project_id = %project, error = reason);
            continue;
        }
        let handler = handlers
            .read()
            .ok()
            .and_then(|handlers| handlers.get(&envelope.kind()).cloned());
        match handler {
            Some(handler) => handler(envelope),
            None => debug!(event = "channel_unhandled", kind = %envelope.kind()),
        }
    }
    if live.swap(false, Ordering::SeqCst) {
        info!(event = "channel_disconnected", project_id = %project);
    }
}
