//! In-memory doubles for the channel, sandbox and store seams.

use crate::channel::{ChannelConnector, ChannelLink};
use crate::config::CommandSpec;
use crate::persistence::ProjectStore;
use crate::sandbox::{
    BootedSandbox, OutputLine, OutputStream, ProcessControl, ProcessExit, SandboxInstance,
    SandboxProcess, SandboxProvider, ServerReady,
};
use async_trait::async_trait;
use pairbox_core::protocol::{decode_frame, encode_frame, ChannelEnvelope, DEFAULT_MAX_FRAME_BYTES};
use pairbox_core::{ChatMessage, FileTree, ProjectId, SyncError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct MemoryPeer {
    pub hello: ChannelEnvelope,
    pub sent: mpsc::Receiver<String>,
    inbound: mpsc::Sender<String>,
}

impl MemoryPeer {
    pub async fn inject(&self, envelope: &ChannelEnvelope) {
        let frame = encode_frame(envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode frame");
        self.inject_raw(frame).await;
    }

    pub async fn inject_raw(&self, frame: String) {
        self.inbound.send(frame).await.expect("session reading");
    }

    pub async fn next_sent(&mut self) -> Option<ChannelEnvelope> {
        let raw = self.sent.recv().await?;
        Some(decode_frame(&raw, DEFAULT_MAX_FRAME_BYTES).expect("decode sent frame"))
    }
}

#[derive(Default)]
pub struct MemoryConnector {
    peers: Mutex<VecDeque<MemoryPeer>>,
    connects: AtomicUsize,
    fail_next: AtomicBool,
}

impl MemoryConnector {
    pub fn take_peer(&self) -> Option<MemoryPeer> {
        self.peers.lock().expect("peers lock").pop_front()
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next_connect(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelConnector for MemoryConnector {
    async fn connect(&self, hello: &ChannelEnvelope) -> Result<ChannelLink, SyncError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(SyncError::ChannelUnavailable("connection refused".to_string()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        self.peers.lock().expect("peers lock").push_back(MemoryPeer {
            hello: hello.clone(),
            sent: out_rx,
            inbound: in_tx,
        });
        Ok(ChannelLink {
            outbound: out_tx,
            inbound: in_rx,
            task: tokio::spawn(async {}),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SandboxScript {
    pub boot_failures: usize,
    pub install_exit_code: i32,
    /// Install runs until killed instead of exiting at once.
    pub hold_install: bool,
}

#[derive(Default)]
struct ScriptedInner {
    boot_failures: AtomicUsize,
    install_exit_code: i32,
    hold_install: bool,
    journal: Mutex<Vec<String>>,
    signals: Mutex<Option<mpsc::UnboundedSender<ServerReady>>>,
    mounted: Mutex<Option<FileTree>>,
    live_runs: AtomicUsize,
    max_live_runs: AtomicUsize,
}

impl ScriptedInner {
    fn record(&self, entry: impl Into<String>) {
        self.journal.lock().expect("journal lock").push(entry.into());
    }
}

/// Sandbox whose install exits at once (unless held) and whose start runs
/// until killed.
#[derive(Clone, Default)]
pub struct ScriptedSandbox {
    inner: Arc<ScriptedInner>,
}

impl ScriptedSandbox {
    pub fn with_script(script: SandboxScript) -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                boot_failures: AtomicUsize::new(script.boot_failures),
                install_exit_code: script.install_exit_code,
                hold_install: script.hold_install,
                ..ScriptedInner::default()
            }),
        }
    }

    pub fn journal(&self) -> Vec<String> {
        self.inner.journal.lock().expect("journal lock").clone()
    }

    pub fn mounted(&self) -> Option<FileTree> {
        self.inner.mounted.lock().expect("mounted lock").clone()
    }

    pub fn announce(&self, port: u16, url: &str) {
        let signals = self.inner.signals.lock().expect("signals lock");
        if let Some(tx) = signals.as_ref() {
            let _ = tx.send(ServerReady {
                port,
                url: url.to_string(),
            });
        }
    }

    pub fn live_runs(&self) -> usize {
        self.inner.live_runs.load(Ordering::SeqCst)
    }

    pub fn max_live_runs(&self) -> usize {
        self.inner.max_live_runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for ScriptedSandbox {
    async fn boot(&self, project: &ProjectId) -> Result<BootedSandbox, SyncError> {
        let failures = self.inner.boot_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.inner.boot_failures.store(failures - 1, Ordering::SeqCst);
            self.inner.record(format!("boot-failed {project}"));
            return Err(SyncError::sandbox("boot", "scripted failure"));
        }
        self.inner.record(format!("boot {project}"));
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.signals.lock().expect("signals lock") = Some(tx);
        Ok(BootedSandbox {
            instance: Box::new(ScriptedInstance {
                project: project.clone(),
                inner: self.inner.clone(),
            }),
            signals: rx,
        })
    }
}

struct ScriptedInstance {
    project: ProjectId,
    inner: Arc<ScriptedInner>,
}

#[async_trait]
impl SandboxInstance for ScriptedInstance {
    async fn mount(&mut self, tree: &FileTree) -> Result<(), SyncError> {
        self.inner.record(format!("mount {}", tree.len()));
        *self.inner.mounted.lock().expect("mounted lock") = Some(tree.clone());
        Ok(())
    }

    async fn spawn(&mut self, command: &CommandSpec) -> Result<SandboxProcess, SyncError> {
        let label = command.to_string();
        self.inner.record(format!("spawn {label}"));
        let (process, control) = SandboxProcess::channel(label.clone());

        let install = command.args.iter().any(|arg| arg == "install");
        if install && !self.inner.hold_install {
            let code = self.inner.install_exit_code;
            let _ = control.output.send(OutputLine {
                stream: OutputStream::Stdout,
                line: "up to date".to_string(),
            });
            let _ = control.exit.send(Some(ProcessExit { code: Some(code) }));
            return Ok(process);
        }

        if !install {
            let live = self.inner.live_runs.fetch_add(1, Ordering::SeqCst) + 1;
            self.inner.max_live_runs.fetch_max(live, Ordering::SeqCst);
        }
        let inner = self.inner.clone();
        let ProcessControl { output, kill, exit } = control;
        tokio::spawn(async move {
            let _ = kill.await;
            inner.record(format!("kill {label}"));
            if !install {
                inner.live_runs.fetch_sub(1, Ordering::SeqCst);
            }
            drop(output);
            let _ = exit.send(Some(ProcessExit { code: None }));
        });
        Ok(process)
    }

    async fn teardown(&mut self) -> Result<(), SyncError> {
        self.inner.record(format!("teardown {}", self.project));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingInner {
    messages: Mutex<Vec<ChatMessage>>,
    trees: Mutex<Vec<(ProjectId, FileTree)>>,
    fail_messages: AtomicBool,
}

#[derive(Clone, Default)]
pub struct RecordingStore {
    inner: Arc<RecordingInner>,
}

impl RecordingStore {
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.messages.lock().expect("messages lock").clone()
    }

    pub fn trees(&self) -> Vec<(ProjectId, FileTree)> {
        self.inner.trees.lock().expect("trees lock").clone()
    }

    pub fn fail_messages(&self, fail: bool) {
        self.inner.fail_messages.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProjectStore for RecordingStore {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), SyncError> {
        if self.inner.fail_messages.load(Ordering::SeqCst) {
            return Err(SyncError::persistence("chat-message", "503 Service Unavailable"));
        }
        self.inner
            .messages
            .lock()
            .expect("messages lock")
            .push(message.clone());
        Ok(())
    }

    async fn save_file_tree(&self, project: &ProjectId, tree: &FileTree) -> Result<(), SyncError> {
        self.inner
            .trees
            .lock()
            .expect("trees lock")
            .push((project.clone(), tree.clone()));
        Ok(())
    }
}
