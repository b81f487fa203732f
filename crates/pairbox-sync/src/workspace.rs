use crate::channel::{ChannelConnector, ChannelSession, WsConnector};
use crate::config::{ConfigError, SyncConfig};
use crate::editor::{EditorBuffer, OpenSetNotice};
use crate::ingest::{LogEntry, MessageLog};
use crate::local_sandbox::LocalSandboxProvider;
use crate::persistence::{HttpProjectStore, PersistOutcome, PersistenceQueue, ProjectStore};
use crate::sandbox::{
    OutputLine, Preview, ProcessExit, RunStep, SandboxController, SandboxEvent, SandboxProvider,
    SandboxState,
};
use crate::tree_store::{FileTreeStore, TreeNotice};
use pairbox_core::protocol::{ChannelEnvelope, ChannelEvent, EventKind};
use pairbox_core::{ChatMessage, FileTree, MessageBody, ProjectId, SyncError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A project document as returned by the project store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    pub id: ProjectId,
    #[serde(default, rename = "fileTree")]
    pub file_tree: FileTree,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl ProjectSnapshot {
    pub fn new(id: impl Into<ProjectId>, file_tree: FileTree) -> Self {
        Self {
            id: id.into(),
            file_tree,
            messages: Vec::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }
}

/// Everything that arrives asynchronously, in one queue.
#[derive(Debug, Clone)]
pub enum WorkspaceEvent {
    Channel(ChannelEnvelope),
    Sandbox(SandboxEvent),
    Persisted(PersistOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    Agent,
    Peer,
}

/// What changed after handling one event, for whoever renders the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Activity {
    Message {
        entry_id: Uuid,
        sender: String,
        body: MessageBody,
    },
    TreeMerged {
        source: MergeSource,
        paths: Vec<String>,
    },
    SandboxOutput {
        step: RunStep,
        line: OutputLine,
    },
    PreviewReady {
        url: String,
        port: u16,
    },
    /// Install succeeded and the server process was spawned.
    RunStarted {
        run_id: Uuid,
    },
    /// Install failed or the server could not be spawned; the sandbox is
    /// `Ready` again.
    RunFailed {
        run_id: Uuid,
        error: String,
    },
    RunExited {
        exit: ProcessExit,
    },
    MessageRolledBack {
        entry_id: Uuid,
        error: String,
    },
    TreeNotSaved {
        error: String,
    },
    ChannelError {
        code: String,
        message: String,
    },
}

/// Owns the channel, tree, message log, sandbox and editor state of the one
/// active project and keeps them keyed to the same [`ProjectId`].
pub struct Workspace {
    config: SyncConfig,
    project: Option<ProjectId>,
    channel: ChannelSession,
    tree: FileTreeStore,
    log: MessageLog,
    sandbox: SandboxController,
    editor: EditorBuffer,
    persistence: PersistenceQueue,
    events: mpsc::UnboundedReceiver<WorkspaceEvent>,
}

impl Workspace {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn ChannelConnector>,
        provider: Arc<dyn SandboxProvider>,
        store: Arc<dyn ProjectStore>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();

        let client_id = format!("client-{}", Uuid::new_v4());
        let channel = ChannelSession::new(connector, client_id, config.user_email.clone());
        for kind in [
            EventKind::ProjectMessage,
            EventKind::ProjectCode,
            EventKind::Error,
        ] {
            let tx = events_tx.clone();
            channel.subscribe(kind, move |envelope| {
                let _ = tx.send(WorkspaceEvent::Channel(envelope));
            });
        }

        let tx = events_tx.clone();
        let sandbox = SandboxController::new(
            provider,
            config.install.clone(),
            config.start.clone(),
            Arc::new(move |event| {
                let _ = tx.send(WorkspaceEvent::Sandbox(event));
            }),
        );

        let tx = events_tx;
        let persistence = PersistenceQueue::spawn(
            store,
            Arc::new(move |outcome| {
                let _ = tx.send(WorkspaceEvent::Persisted(outcome));
            }),
        );

        Self {
            log: MessageLog::new(config.agent_identity.clone()),
            config,
            project: None,
            channel,
            tree: FileTreeStore::default(),
            sandbox,
            editor: EditorBuffer::default(),
            persistence,
            events,
        }
    }

    /// Websocket channel, local process sandbox and HTTP project store.
    pub fn from_config(config: SyncConfig) -> Result<Self, ConfigError> {
        let connector = WsConnector::new(
            config.channel_url()?,
            config.bearer().map(str::to_string),
        );
        let store = HttpProjectStore::new(&config);
        Ok(Self::new(
            config,
            Arc::new(connector),
            Arc::new(LocalSandboxProvider::new()),
            Arc::new(store),
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn project_id(&self) -> Option<&ProjectId> {
        self.project.as_ref()
    }

    pub fn tree(&self) -> Arc<FileTree> {
        self.tree.get()
    }

    pub fn subscribe_tree(&self) -> broadcast::Receiver<TreeNotice> {
        self.tree.subscribe()
    }

    /// Notices whenever the open tabs or the focused file change.
    pub fn subscribe_open_set(&self) -> broadcast::Receiver<OpenSetNotice> {
        self.editor.subscribe()
    }

    pub fn messages(&self) -> &[LogEntry] {
        self.log.entries()
    }

    pub fn open_files(&self) -> &[String] {
        self.editor.open_files()
    }

    pub fn active_file(&self) -> Option<&str> {
        self.editor.active()
    }

    pub fn sandbox_state(&self) -> SandboxState {
        self.sandbox.state()
    }

    pub fn channel_open(&self) -> bool {
        self.channel.is_open()
    }

    pub fn preview(&self) -> &Preview {
        self.sandbox.preview()
    }

    /// Binds every component to `snapshot.id`. The channel is best effort; a
    /// sandbox boot failure is returned after the rest of the switch is done
    /// and can be retried with [`Workspace::boot_sandbox`].
    pub async fn open_project(&mut self, snapshot: ProjectSnapshot) -> Result<(), SyncError> {
        let ProjectSnapshot {
            id,
            file_tree,
            messages,
        } = snapshot;
        if id.is_empty() {
            return Err(SyncError::InvalidProject(id.to_string()));
        }
        info!(
            event = "project_open",
            project_id = %id,
            previous = ?self.project.as_ref().map(ProjectId::as_str),
            files = file_tree.len(),
            messages = messages.len()
        );

        self.project = Some(id.clone());
        self.editor.reset();
        self.tree.replace_all(file_tree);
        self.log.replace_history(messages);

        // Failure is logged by the session; sends no-op until reopened.
        let _ = self.channel.open(&id).await;

        self.sandbox.switch_project(id).await?;
        let tree = self.tree.get();
        let _ = self.sandbox.mount(&tree).await;
        Ok(())
    }

    pub async fn switch_project(&mut self, snapshot: ProjectSnapshot) -> Result<(), SyncError> {
        self.open_project(snapshot).await
    }

    pub async fn boot_sandbox(&mut self) -> Result<(), SyncError> {
        self.sandbox.boot().await?;
        let tree = self.tree.get();
        self.sandbox.mount(&tree).await
    }

    pub fn open_file(&mut self, path: &str) -> Result<(), SyncError> {
        self.editor.open(&self.tree, path)
    }

    pub fn close_file(&mut self, path: &str) -> bool {
        self.editor.close(path)
    }

    /// Adds an empty file, persists and broadcasts it like a commit.
    pub async fn create_file(&mut self) -> Result<String, SyncError> {
        self.require_project("create_file")?;
        let path = self.editor.create_file(&mut self.tree);
        self.persist_tree();
        if let Some(node) = self.tree.get().get(&path) {
            let mut fragment = FileTree::new();
            fragment.insert(path.clone(), node.clone());
            self.ensure_channel().await;
            self.channel.send(ChannelEvent::ProjectCode(fragment));
        }
        Ok(path)
    }

    pub fn rename_file(&mut self, from: &str, to: &str, overwrite: bool) -> Result<(), SyncError> {
        self.require_project("rename_file")?;
        self.editor.rename(&mut self.tree, from, to, overwrite)?;
        self.persist_tree();
        Ok(())
    }

    pub fn delete_file(&mut self, path: &str) -> Result<(), SyncError> {
        self.require_project("delete_file")?;
        self.editor.delete(&mut self.tree, path)?;
        self.persist_tree();
        Ok(())
    }

    /// Saves an edit: store, then persist, then broadcast the changed file.
    pub async fn commit(&mut self, path: &str, contents: impl Into<String>) -> Result<(), SyncError> {
        self.require_project("commit")?;
        let fragment = self.editor.commit(&mut self.tree, path, contents)?;
        self.persist_tree();
        self.ensure_channel().await;
        self.channel.send(ChannelEvent::ProjectCode(fragment));
        Ok(())
    }

    /// Shows the message at once as provisional; the store's answer later
    /// confirms or removes it. Blank text is ignored.
    pub async fn send_message(&mut self, text: &str) -> Option<Uuid> {
        if text.trim().is_empty() {
            return None;
        }
        let Some(project) = self.project.clone() else {
            warn!(event = "message_dropped", reason = "no_project");
            return None;
        };
        let message = ChatMessage::new(project, self.config.user_email.clone(), text);
        let entry_id = self.log.append_provisional(message.clone());
        self.ensure_channel().await;
        self.channel
            .send(ChannelEvent::ProjectMessage(message.clone()));
        self.persistence.save_message(entry_id, message);
        Some(entry_id)
    }

    /// Mounts the current tree and starts install. The server is spawned
    /// later, when the install exit is handled ([`Activity::RunStarted`]).
    pub async fn run(&mut self) -> Result<Uuid, SyncError> {
        let tree = self.tree.get();
        self.sandbox.run(&tree).await
    }

    pub fn set_display_url(&mut self, url: impl Into<String>) {
        self.sandbox.set_display_url(url);
    }

    /// Closes the channel, tears the sandbox down and flushes pending writes.
    pub async fn shutdown(mut self) {
        self.channel.close().await;
        self.sandbox.teardown().await;
        self.persistence.shutdown().await;
        info!(event = "workspace_shutdown");
    }

    pub async fn next_event(&mut self) -> Option<WorkspaceEvent> {
        self.events.recv().await
    }

    pub fn try_next_event(&mut self) -> Option<WorkspaceEvent> {
        self.events.try_recv().ok()
    }

    pub async fn handle_event(&mut self, event: WorkspaceEvent) -> Vec<Activity> {
        match event {
            WorkspaceEvent::Channel(envelope) => self.handle_channel(envelope).await,
            WorkspaceEvent::Sandbox(event) => self.handle_sandbox(event).await,
            WorkspaceEvent::Persisted(outcome) => self.handle_persisted(outcome),
        }
    }

    async fn handle_channel(&mut self, envelope: ChannelEnvelope) -> Vec<Activity> {
        if self.project.as_ref() != Some(&envelope.project_id) {
            debug!(
                event = "stale_event_dropped",
                source = "channel",
                project_id = %envelope.project_id
            );
            return Vec::new();
        }
        match envelope.event {
            ChannelEvent::ProjectMessage(message) => {
                if message.project_id != envelope.project_id {
                    debug!(event = "stale_event_dropped", source = "message", project_id = %message.project_id);
                    return Vec::new();
                }
                let sender = message.sender.email.clone();
                let outcome = self.log.ingest(message, &mut self.tree);
                let mut activity = Vec::new();
                if let Some(entry) = self.log.get(outcome.entry_id) {
                    activity.push(Activity::Message {
                        entry_id: entry.id,
                        sender,
                        body: entry.body.clone(),
                    });
                }
                if outcome.carried_tree {
                    self.persist_tree();
                    let merged = self.tree.get();
                    let _ = self.sandbox.mount(&merged).await;
                    if !outcome.changed_paths.is_empty() {
                        activity.push(Activity::TreeMerged {
                            source: MergeSource::Agent,
                            paths: outcome.changed_paths,
                        });
                    }
                }
                activity
            }
            ChannelEvent::ProjectCode(incoming) => {
                let paths = self.tree.merge(&incoming);
                if paths.is_empty() {
                    return Vec::new();
                }
                vec![Activity::TreeMerged {
                    source: MergeSource::Peer,
                    paths,
                }]
            }
            ChannelEvent::Error(payload) => {
                warn!(event = "channel_error", code = %payload.code, message = %payload.message);
                vec![Activity::ChannelError {
                    code: payload.code,
                    message: payload.message,
                }]
            }
            ChannelEvent::Hello(_) => Vec::new(),
        }
    }

    async fn handle_sandbox(&mut self, event: SandboxEvent) -> Vec<Activity> {
        match self.sandbox.apply_event(&event).await {
            Ok(true) => {}
            Ok(false) => return Vec::new(),
            Err(err) => {
                let SandboxEvent::InstallExited { run_id, .. } = event else {
                    return Vec::new();
                };
                return vec![Activity::RunFailed {
                    run_id,
                    error: err.to_string(),
                }];
            }
        }
        match event {
            SandboxEvent::ServerReady { ready, .. } => vec![Activity::PreviewReady {
                url: ready.url,
                port: ready.port,
            }],
            SandboxEvent::Output { step, line, .. } => vec![Activity::SandboxOutput { step, line }],
            SandboxEvent::InstallExited { run_id, .. } => vec![Activity::RunStarted { run_id }],
            SandboxEvent::RunExited { exit, .. } => vec![Activity::RunExited { exit }],
        }
    }

    fn handle_persisted(&mut self, outcome: PersistOutcome) -> Vec<Activity> {
        match outcome {
            PersistOutcome::Message {
                entry_id,
                project,
                result,
            } => {
                if self.project.as_ref() != Some(&project) {
                    debug!(event = "stale_event_dropped", source = "persistence", project_id = %project);
                    return Vec::new();
                }
                match result {
                    Ok(()) => {
                        self.log.confirm(entry_id);
                        Vec::new()
                    }
                    Err(err) => match self.log.rollback(entry_id) {
                        Some(_) => vec![Activity::MessageRolledBack {
                            entry_id,
                            error: err.to_string(),
                        }],
                        None => Vec::new(),
                    },
                }
            }
            PersistOutcome::FileTree { result: Err(err), .. } => vec![Activity::TreeNotSaved {
                error: err.to_string(),
            }],
            PersistOutcome::FileTree { .. } => Vec::new(),
        }
    }

    fn require_project(&self, action: &'static str) -> Result<&ProjectId, SyncError> {
        self.project.as_ref().ok_or(SyncError::InvalidTransition {
            state: "unbound",
            action,
        })
    }

    fn persist_tree(&self) {
        if let Some(project) = &self.project {
            self.persistence
                .save_file_tree(project.clone(), self.tree.get());
        }
    }

    /// Reopens a dropped channel for the bound project, once per call.
    async fn ensure_channel(&mut self) {
        if self.channel.is_open() {
            return;
        }
        if let Some(project) = self.project.clone() {
            let _ = self.channel.open(&project).await;
        }
    }
}
