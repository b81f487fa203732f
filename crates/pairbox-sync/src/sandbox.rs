use crate::config::CommandSpec;
use async_trait::async_trait;
use pairbox_core::{FileTree, ProjectId, SyncError};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    Absent,
    Booting,
    Ready,
    Running,
    TearingDown,
}

impl SandboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Absent => "absent",
            SandboxState::Booting => "booting",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::TearingDown => "tearing_down",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerReady {
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("terminated"),
        }
    }
}

/// Handle to one process spawned inside a sandbox.
pub struct SandboxProcess {
    label: String,
    output: Option<mpsc::UnboundedReceiver<OutputLine>>,
    kill: Option<oneshot::Sender<()>>,
    exit: watch::Receiver<Option<ProcessExit>>,
}

/// The provider's half of a [`SandboxProcess`].
pub struct ProcessControl {
    pub output: mpsc::UnboundedSender<OutputLine>,
    pub kill: oneshot::Receiver<()>,
    pub exit: watch::Sender<Option<ProcessExit>>,
}

impl SandboxProcess {
    pub fn channel(label: impl Into<String>) -> (Self, ProcessControl) {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        (
            Self {
                label: label.into(),
                output: Some(output_rx),
                kill: Some(kill_tx),
                exit: exit_rx,
            },
            ProcessControl {
                output: output_tx,
                kill: kill_rx,
                exit: exit_tx,
            },
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn take_output(&mut self) -> Option<mpsc::UnboundedReceiver<OutputLine>> {
        self.output.take()
    }

    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit.clone()
    }

    pub fn exited(&self) -> Option<ProcessExit> {
        *self.exit.borrow()
    }

    pub async fn wait(&mut self) -> ProcessExit {
        loop {
            let current = *self.exit.borrow();
            if let Some(exit) = current {
                return exit;
            }
            if self.exit.changed().await.is_err() {
                let last = *self.exit.borrow();
                return last.unwrap_or(ProcessExit { code: None });
            }
        }
    }

    /// Requests termination and waits until the process is gone.
    pub async fn kill(&mut self) -> ProcessExit {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
        self.wait().await
    }
}

pub struct BootedSandbox {
    pub instance: Box<dyn SandboxInstance>,
    pub signals: mpsc::UnboundedReceiver<ServerReady>,
}

#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn boot(&self, project: &ProjectId) -> Result<BootedSandbox, SyncError>;
}

#[async_trait]
pub trait SandboxInstance: Send + Sync {
    async fn mount(&mut self, tree: &FileTree) -> Result<(), SyncError>;
    async fn spawn(&mut self, command: &CommandSpec) -> Result<SandboxProcess, SyncError>;
    async fn teardown(&mut self) -> Result<(), SyncError>;
}

/// Identifies the sandbox an event came from. A new generation starts at
/// every boot and every teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxTag {
    pub project: ProjectId,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStep {
    Install,
    Start,
}

impl RunStep {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStep::Install => "install",
            RunStep::Start => "start",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEvent {
    ServerReady {
        tag: SandboxTag,
        ready: ServerReady,
    },
    Output {
        tag: SandboxTag,
        run_id: Uuid,
        step: RunStep,
        line: OutputLine,
    },
    /// The install step finished; the start step is spawned when this is applied.
    InstallExited {
        tag: SandboxTag,
        run_id: Uuid,
        exit: ProcessExit,
    },
    RunExited {
        tag: SandboxTag,
        run_id: Uuid,
        exit: ProcessExit,
    },
}

impl SandboxEvent {
    pub fn tag(&self) -> &SandboxTag {
        match self {
            SandboxEvent::ServerReady { tag, .. }
            | SandboxEvent::Output { tag, .. }
            | SandboxEvent::InstallExited { tag, .. }
            | SandboxEvent::RunExited { tag, .. } => tag,
        }
    }
}

pub type SandboxSink = Arc<dyn Fn(SandboxEvent) + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preview {
    pub url: Option<String>,
    pub port: Option<u16>,
    /// Operator-entered text shown instead of `url`. Never rebinds anything.
    pub display_hint: Option<String>,
}

impl Preview {
    pub fn display_url(&self) -> Option<&str> {
        self.display_hint.as_deref().or(self.url.as_deref())
    }
}

/// The run in flight: its install step until that exits, then its server.
struct ActiveRun {
    id: Uuid,
    step: RunStep,
    process: SandboxProcess,
}

/// Explicit state machine around one sandbox per project.
///
/// All transitions take `&mut self`, so a second boot can never overlap a
/// teardown, and a new run is only spawned after the previous one has been
/// killed and reaped. A run never waits on its install step: the install's
/// exit comes back as [`SandboxEvent::InstallExited`] and applying it spawns
/// the start step.
pub struct SandboxController {
    provider: Arc<dyn SandboxProvider>,
    install: CommandSpec,
    start: CommandSpec,
    sink: SandboxSink,
    state: SandboxState,
    project: Option<ProjectId>,
    generation: u64,
    instance: Option<Box<dyn SandboxInstance>>,
    run: Option<ActiveRun>,
    preview: Preview,
    tasks: Vec<JoinHandle<()>>,
}

impl SandboxController {
    pub fn new(
        provider: Arc<dyn SandboxProvider>,
        install: CommandSpec,
        start: CommandSpec,
        sink: SandboxSink,
    ) -> Self {
        Self {
            provider,
            install,
            start,
            sink,
            state: SandboxState::Absent,
            project: None,
            generation: 0,
            instance: None,
            run: None,
            preview: Preview::default(),
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn project(&self) -> Option<&ProjectId> {
        self.project.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn active_run(&self) -> Option<Uuid> {
        self.run.as_ref().map(|run| run.id)
    }

    /// Step of the run in flight, if any.
    pub fn active_step(&self) -> Option<RunStep> {
        self.run.as_ref().map(|run| run.step)
    }

    pub fn preview(&self) -> &Preview {
        &self.preview
    }

    pub fn set_display_url(&mut self, url: impl Into<String>) {
        let url = url.into();
        self.preview.display_hint = if url.trim().is_empty() {
            None
        } else {
            Some(url)
        };
    }

    fn tag(&self) -> Option<SandboxTag> {
        self.project.clone().map(|project| SandboxTag {
            project,
            generation: self.generation,
        })
    }

    pub fn is_current(&self, tag: &SandboxTag) -> bool {
        self.instance.is_some()
            && self.generation == tag.generation
            && self.project.as_ref() == Some(&tag.project)
    }

    /// Tears down whatever is running, then boots for `project`.
    pub async fn switch_project(&mut self, project: ProjectId) -> Result<(), SyncError> {
        self.teardown().await;
        self.project = Some(project);
        self.boot().await
    }

    /// Boots for the bound project. Retrying after a failed boot is allowed.
    pub async fn boot(&mut self) -> Result<(), SyncError> {
        if self.state != SandboxState::Absent {
            return Err(SyncError::InvalidTransition {
                state: self.state.as_str(),
                action: "boot",
            });
        }
        let Some(project) = self.project.clone() else {
            return Err(SyncError::InvalidProject(String::new()));
        };

        self.generation += 1;
        self.state = SandboxState::Booting;
        info!(event = "sandbox_boot", project_id = %project, generation = self.generation);

        let booted = match self.provider.boot(&project).await {
            Ok(booted) => booted,
            Err(err) => {
                self.state = SandboxState::Absent;
                warn!(
                    event = "sandbox_operation_failed",
                    operation = "boot",
                    project_id = %project,
                    error = %err
                );
                return Err(err);
            }
        };

        let tag = SandboxTag {
            project,
            generation: self.generation,
        };
        let sink = self.sink.clone();
        let mut signals = booted.signals;
        self.tasks.push(tokio::spawn(async move {
            while let Some(ready) = signals.recv().await {
                sink(SandboxEvent::ServerReady {
                    tag: tag.clone(),
                    ready,
                });
            }
        }));
        self.instance = Some(booted.instance);
        self.state = SandboxState::Ready;
        Ok(())
    }

    /// Kills the active run, disposes the environment and waits for both.
    pub async fn teardown(&mut self) {
        let Some(mut instance) = self.instance.take() else {
            self.state = SandboxState::Absent;
            return;
        };
        self.state = SandboxState::TearingDown;
        if let Some(mut run) = self.run.take() {
            let exit = run.process.kill().await;
            debug!(event = "run_killed", run_id = %run.id, step = run.step.as_str(), exit = %exit);
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Err(err) = instance.teardown().await {
            warn!(event = "sandbox_operation_failed", operation = "teardown", error = %err);
        }
        self.preview = Preview::default();
        self.generation += 1;
        self.state = SandboxState::Absent;
        info!(
            event = "sandbox_teardown",
            project_id = %self.project.as_ref().map(ProjectId::as_str).unwrap_or_default()
        );
    }

    /// Mounts `tree` if a sandbox is up. Nothing to do otherwise.
    pub async fn mount(&mut self, tree: &FileTree) -> Result<(), SyncError> {
        let Some(instance) = self.instance.as_mut() else {
            debug!(event = "mount_skipped", state = %self.state);
            return Ok(());
        };
        if let Err(err) = instance.mount(tree).await {
            warn!(event = "sandbox_operation_failed", operation = "mount", error = %err);
            return Err(err);
        }
        debug!(event = "sandbox_mounted", files = tree.len());
        Ok(())
    }

    /// Mounts `tree` and spawns the install step as the new active run. A
    /// prior run, installing or serving, is killed and reaped first. Returns
    /// without waiting for install; see [`SandboxEvent::InstallExited`].
    pub async fn run(&mut self, tree: &FileTree) -> Result<Uuid, SyncError> {
        if !matches!(self.state, SandboxState::Ready | SandboxState::Running) {
            return Err(SyncError::InvalidTransition {
                state: self.state.as_str(),
                action: "run",
            });
        }
        let Some(tag) = self.tag() else {
            return Err(SyncError::InvalidProject(String::new()));
        };

        if let Some(mut previous) = self.run.take() {
            let exit = previous.process.kill().await;
            info!(
                event = "run_replaced",
                run_id = %previous.id,
                step = previous.step.as_str(),
                exit = %exit
            );
        }
        self.state = SandboxState::Ready;

        self.mount(tree).await?;

        let run_id = Uuid::new_v4();
        let install = self.install.clone();
        let mut process = self.spawn_step(&install).await?;
        self.supervise(&tag, run_id, RunStep::Install, &mut process);
        self.run = Some(ActiveRun {
            id: run_id,
            step: RunStep::Install,
            process,
        });
        self.state = SandboxState::Running;
        debug!(event = "install_started", run_id = %run_id, command = %install, project_id = %tag.project);
        Ok(run_id)
    }

    /// Applies an event produced by this controller's own tasks. Events from
    /// an earlier project, generation or run are ignored and yield `Ok(false)`.
    ///
    /// Applying the install exit of the active run spawns its start step, or
    /// returns the install failure with the sandbox back in `Ready`.
    pub async fn apply_event(&mut self, event: &SandboxEvent) -> Result<bool, SyncError> {
        if !self.is_current(event.tag()) {
            debug!(
                event = "stale_event_dropped",
                source = "sandbox",
                generation = event.tag().generation,
                current = self.generation
            );
            return Ok(false);
        }
        match event {
            SandboxEvent::ServerReady { ready, .. } => {
                self.preview = Preview {
                    url: Some(ready.url.clone()),
                    port: Some(ready.port),
                    display_hint: None,
                };
                info!(event = "server_ready", port = ready.port, url = %ready.url);
                Ok(true)
            }
            SandboxEvent::Output { .. } => Ok(true),
            SandboxEvent::InstallExited { tag, run_id, exit } => {
                if !self.is_active(*run_id, RunStep::Install) {
                    return Ok(false);
                }
                self.run = None;
                self.state = SandboxState::Ready;
                if !exit.success() {
                    let err = SyncError::sandbox("install", format!("{} ended with {exit}", self.install));
                    warn!(event = "sandbox_operation_failed", operation = "install", error = %err);
                    return Err(err);
                }
                self.spawn_start(tag, *run_id).await?;
                Ok(true)
            }
            SandboxEvent::RunExited { run_id, exit, .. } => {
                if !self.is_active(*run_id, RunStep::Start) {
                    return Ok(false);
                }
                self.run = None;
                self.state = SandboxState::Ready;
                info!(event = "run_exited", run_id = %run_id, exit = %exit);
                Ok(true)
            }
        }
    }

    fn is_active(&self, run_id: Uuid, step: RunStep) -> bool {
        matches!(&self.run, Some(run) if run.id == run_id && run.step == step)
    }

    async fn spawn_start(&mut self, tag: &SandboxTag, run_id: Uuid) -> Result<(), SyncError> {
        let start = self.start.clone();
        let mut process = self.spawn_step(&start).await?;
        self.supervise(tag, run_id, RunStep::Start, &mut process);
        self.run = Some(ActiveRun {
            id: run_id,
            step: RunStep::Start,
            process,
        });
        self.state = SandboxState::Running;
        info!(event = "run_started", run_id = %run_id, command = %start, project_id = %tag.project);
        Ok(())
    }

    async fn spawn_step(&mut self, command: &CommandSpec) -> Result<SandboxProcess, SyncError> {
        let Some(instance) = self.instance.as_mut() else {
            return Err(SyncError::InvalidTransition {
                state: self.state.as_str(),
                action: "spawn",
            });
        };
        instance.spawn(command).await.map_err(|err| {
            warn!(event = "sandbox_operation_failed", operation = "spawn", command = %command, error = %err);
            err
        })
    }

    /// Streams the step's output, then reports its exit, both tagged with
    /// this generation and run.
    fn supervise(
        &mut self,
        tag: &SandboxTag,
        run_id: Uuid,
        step: RunStep,
        process: &mut SandboxProcess,
    ) {
        let mut output = process.take_output();
        let mut exit = process.exit_watch();
        let sink = self.sink.clone();
        let tag = tag.clone();
        self.tasks.retain(|task| !task.is_finished());
        self.tasks.push(tokio::spawn(async move {
            let emit = |line: OutputLine| {
                info!(target: "sandbox", step = step.as_str(), line = %line.line);
                sink(SandboxEvent::Output {
                    tag: tag.clone(),
                    run_id,
                    step,
                    line,
                });
            };
            let code = loop {
                tokio::select! {
                    biased;
                    line = next_line(&mut output) => {
                        if let Some(line) = line {
                            emit(line);
                        }
                    }
                    code = exit_code(&mut exit) => break code,
                }
            };
            if let Some(rx) = output.as_mut() {
                while let Ok(line) = rx.try_recv() {
                    emit(line);
                }
            }
            sink(match step {
                RunStep::Install => SandboxEvent::InstallExited {
                    tag: tag.clone(),
                    run_id,
                    exit: code,
                },
                RunStep::Start => SandboxEvent::RunExited {
                    tag: tag.clone(),
                    run_id,
                    exit: code,
                },
            });
        }));
    }
}

/// Next output line; pends forever once the stream has closed.
async fn next_line(output: &mut Option<mpsc::UnboundedReceiver<OutputLine>>) -> Option<OutputLine> {
    let Some(rx) = output.as_mut() else {
        return std::future::pending().await;
    };
    let line = rx.recv().await;
    if line.is_none() {
        *output = None;
    }
    line
}

async fn exit_code(exit: &mut watch::Receiver<Option<ProcessExit>>) -> ProcessExit {
    loop {
        let current = *exit.borrow();
        if let Some(code) = current {
            return code;
        }
        if exit.changed().await.is_err() {
            let last = *exit.borrow();
            return last.unwrap_or(ProcessExit { code: None });
        }
    }
}
