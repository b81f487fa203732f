use crate::config::CommandSpec;
use crate::sandbox::{
    BootedSandbox, OutputLine, OutputStream, ProcessControl, ProcessExit, SandboxInstance,
    SandboxProcess, SandboxProvider, ServerReady,
};
use async_trait::async_trait;
use pairbox_core::{FileTree, ProjectId, SyncError};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs sandboxed commands as local child processes inside a private
/// temporary directory per boot.
#[derive(Debug, Clone, Default)]
pub struct LocalSandboxProvider {
    parent: Option<PathBuf>,
}

impl LocalSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates sandbox directories under `parent` instead of the system temp dir.
    pub fn in_dir(parent: impl Into<PathBuf>) -> Self {
        Self {
            parent: Some(parent.into()),
        }
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn boot(&self, project: &ProjectId) -> Result<BootedSandbox, SyncError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("pairbox-");
        let dir = match &self.parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(|err| SyncError::sandbox("boot", err))?;
        debug!(event = "local_sandbox_dir", project_id = %project, dir = %dir.path().display());

        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        Ok(BootedSandbox {
            instance: Box::new(LocalSandbox {
                dir: Some(dir),
                signals: signals_tx,
                mounted: BTreeSet::new(),
            }),
            signals: signals_rx,
        })
    }
}

pub struct LocalSandbox {
    dir: Option<TempDir>,
    signals: mpsc::UnboundedSender<ServerReady>,
    /// Files written by the last mount. Anything else under the root
    /// (`node_modules/`, lockfiles) belongs to the commands and is left alone.
    mounted: BTreeSet<PathBuf>,
}

impl LocalSandbox {
    fn root(&self, operation: &'static str) -> Result<&Path, SyncError> {
        self.dir
            .as_ref()
            .map(TempDir::path)
            .ok_or_else(|| SyncError::sandbox(operation, "sandbox already torn down"))
    }
}

#[async_trait]
impl SandboxInstance for LocalSandbox {
    async fn mount(&mut self, tree: &FileTree) -> Result<(), SyncError> {
        let root = self.root("mount")?.to_path_buf();
        let targets = tree
            .iter()
            .map(|(path, node)| Ok((resolve_path(&root, path)?, node.contents())))
            .collect::<Result<Vec<_>, SyncError>>()?;
        let mut written = BTreeSet::new();
        for (target, contents) in targets {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|err| SyncError::sandbox("mount", err))?;
            }
            tokio::fs::write(&target, contents)
                .await
                .map_err(|err| SyncError::sandbox("mount", err))?;
            written.insert(target);
        }

        let dropped: Vec<PathBuf> = self.mounted.difference(&written).cloned().collect();
        self.mounted = written;
        for path in dropped {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => prune_empty_dirs(&root, &path).await,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(SyncError::sandbox("mount", err)),
            }
            debug!(event = "sandbox_file_removed", path = %path.display());
        }
        Ok(())
    }

    async fn spawn(&mut self, command: &CommandSpec) -> Result<SandboxProcess, SyncError> {
        let root = self.root("spawn")?.to_path_buf();
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| SyncError::sandbox("spawn", format!("{command}: {err}")))?;

        let (process, control) = SandboxProcess::channel(command.to_string());
        let announced = Arc::new(AtomicBool::new(false));
        let ProcessControl {
            output,
            kill,
            exit,
        } = control;

        let stdout = child.stdout.take().map(|pipe| {
            tokio::spawn(forward_lines(
                pipe,
                OutputStream::Stdout,
                output.clone(),
                self.signals.clone(),
                announced.clone(),
            ))
        });
        let stderr = child.stderr.take().map(|pipe| {
            tokio::spawn(forward_lines(
                pipe,
                OutputStream::Stderr,
                output.clone(),
                self.signals.clone(),
                announced.clone(),
            ))
        });
        drop(output);

        let label = command.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill => {
                    if let Err(err) = child.start_kill() {
                        warn!(event = "sandbox_kill_failed", command = %label, error = %err);
                    }
                    child.wait().await
                }
            };
            let code = match status {
                Ok(status) => status.code(),
                Err(err) => {
                    warn!(event = "sandbox_wait_failed", command = %label, error = %err);
                    None
                }
            };
            for reader in [stdout, stderr].into_iter().flatten() {
                let _ = tokio::time::timeout(DRAIN_TIMEOUT, reader).await;
            }
            let _ = exit.send(Some(ProcessExit { code }));
        });

        Ok(process)
    }

    async fn teardown(&mut self) -> Result<(), SyncError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|err| SyncError::sandbox("teardown", err))?
            .map_err(|err| SyncError::sandbox("teardown", err))
    }
}

/// Removes directories left empty by a dropped file, up to `root`.
async fn prune_empty_dirs(root: &Path, file: &Path) {
    let mut dir = file.parent();
    while let Some(current) = dir {
        if current == root || !current.starts_with(root) {
            return;
        }
        // Fails on the first non-empty directory, which ends the walk.
        if tokio::fs::remove_dir(current).await.is_err() {
            return;
        }
        dir = current.parent();
    }
}

async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    output: mpsc::UnboundedSender<OutputLine>,
    signals: mpsc::UnboundedSender<ServerReady>,
    announced: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !announced.load(Ordering::SeqCst) {
            if let Some(ready) = detect_server_ready(&line) {
                // Stdout and stderr race for the one announcement per process.
                if !announced.swap(true, Ordering::SeqCst) {
                    let _ = signals.send(ready);
                }
            }
        }
        let _ = output.send(OutputLine { stream, line });
    }
}

fn ready_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(https?://(?:localhost|127\.0\.0\.1|0\.0\.0\.0):(\d{1,5}))(?:[/\s.,)'\x22]|$)").ok()
        })
        .as_ref()
}

/// Finds a local listening address such as `http://localhost:3000` in a line
/// of server output. Only the origin is kept; any request path is dropped.
pub fn detect_server_ready(line: &str) -> Option<ServerReady> {
    let captures = ready_pattern()?.captures(line)?;
    let port = captures.get(2)?.as_str().parse::<u16>().ok()?;
    let url = captures.get(1)?.as_str().to_string();
    Some(ServerReady { port, url })
}

/// Maps a tree path into `root`, rejecting anything that could escape it.
pub fn resolve_path(root: &Path, path: &str) -> Result<PathBuf, SyncError> {
    let invalid = || SyncError::InvalidPath {
        path: path.to_string(),
    };
    let relative = Path::new(path);
    if path.trim().is_empty() || relative.is_absolute() {
        return Err(invalid());
    }
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(invalid())
            }
        }
    }
    if resolved == root {
        return Err(invalid());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairbox_core::FileNode;

    fn tree(entries: &[(&str, &str)]) -> FileTree {
        entries
            .iter()
            .map(|(path, contents)| (path.to_string(), FileNode::new(*contents)))
            .collect()
    }

    #[test]
    fn detects_local_server_origins() {
        let ready = detect_server_ready("  Local:   http://localhost:5173/").expect("vite");
        assert_eq!(ready.port, 5173);
        assert_eq!(ready.url, "http://localhost:5173");

        let ready = detect_server_ready("Server listening on http://0.0.0.0:3000.").expect("express");
        assert_eq!(ready.port, 3000);
        assert_eq!(ready.url, "http://0.0.0.0:3000");

        let ready =
            detect_server_ready("GET http://localhost:3000/api/users 200 4ms").expect("request log");
        assert_eq!(ready.url, "http://localhost:3000");

        assert!(detect_server_ready("http://localhost:123456").is_none());
        assert!(detect_server_ready("GET https://example.com:443/").is_none());
        assert!(detect_server_ready("compiled successfully").is_none());
    }

    #[test]
    fn resolve_path_rejects_escapes() {
        let root = Path::new("/sandbox");
        assert_eq!(
            resolve_path(root, "src/index.js").expect("nested"),
            PathBuf::from("/sandbox/src/index.js")
        );
        for bad in ["../etc/passwd", "/etc/passwd", "a/../../b", "", "."] {
            assert!(
                matches!(resolve_path(root, bad), Err(SyncError::InvalidPath { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn mount_writes_nested_files_and_rejects_bad_trees_whole() {
        let parent = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::in_dir(parent.path());
        let mut booted = provider.boot(&ProjectId::new("p1")).await.expect("boot");

        booted
            .instance
            .mount(&tree(&[("package.json", "{}"), ("src/app.js", "1")]))
            .await
            .expect("mount");

        let dirs: Vec<_> = std::fs::read_dir(parent.path())
            .expect("read parent")
            .flatten()
            .collect();
        assert_eq!(dirs.len(), 1);
        let root = dirs[0].path();
        assert_eq!(
            std::fs::read_to_string(root.join("src/app.js")).expect("read"),
            "1"
        );

        let err = booted
            .instance
            .mount(&tree(&[("zz.js", "new"), ("../escape.js", "x")]))
            .await
            .expect_err("escape");
        assert!(matches!(err, SyncError::InvalidPath { .. }));
        assert!(!root.join("zz.js").exists());

        booted.instance.teardown().await.expect("teardown");
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn remount_removes_files_that_left_the_tree() {
        let parent = tempfile::tempdir().expect("tempdir");
        let provider = LocalSandboxProvider::in_dir(parent.path());
        let mut booted = provider.boot(&ProjectId::new("p1")).await.expect("boot");
        booted
            .instance
            .mount(&tree(&[("a.js", "A"), ("lib/util.js", "U"), ("keep.js", "K")]))
            .await
            .expect("first mount");

        let root = std::fs::read_dir(parent.path())
            .expect("read parent")
            .flatten()
            .next()
            .expect("sandbox dir")
            .path();
        std::fs::create_dir_all(root.join("node_modules/dep")).expect("install artifact dir");
        std::fs::write(root.join("node_modules/dep/index.js"), "dep").expect("install artifact");

        booted
            .instance
            .mount(&tree(&[("b.js", "A"), ("keep.js", "K2")]))
            .await
            .expect("second mount");

        assert!(!root.join("a.js").exists());
        assert!(!root.join("lib").exists());
        assert_eq!(std::fs::read_to_string(root.join("b.js")).expect("b"), "A");
        assert_eq!(std::fs::read_to_string(root.join("keep.js")).expect("keep"), "K2");
        assert!(root.join("node_modules/dep/index.js").exists());
        booted.instance.teardown().await.expect("teardown");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn spawn_streams_output_and_announces_readiness_once() {
        let provider = LocalSandboxProvider::new();
        let mut booted = provider.boot(&ProjectId::new("p1")).await.expect("boot");
        let command = CommandSpec::new(
            "sh",
            [
                "-c",
                "echo booting; echo 'ready on http://localhost:4321/' >&2; echo 'GET http://localhost:4321/api 200'",
            ],
        );

        let mut process = booted.instance.spawn(&command).await.expect("spawn");
        let mut output = process.take_output().expect("output");
        let exit = process.wait().await;
        assert!(exit.success());

        let mut lines = Vec::new();
        while let Some(line) = output.recv().await {
            lines.push(line);
        }
        assert!(lines
            .iter()
            .any(|l| l.stream == OutputStream::Stdout && l.line == "booting"));
        assert!(lines.iter().any(|l| l.stream == OutputStream::Stderr));
        assert!(lines.iter().any(|l| l.line.starts_with("GET ")));

        let ready = booted.signals.recv().await.expect("ready signal");
        assert_eq!(ready.port, 4321);
        assert_eq!(ready.url, "http://localhost:4321");
        assert!(booted.signals.try_recv().is_err());
        booted.instance.teardown().await.expect("teardown");
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn kill_terminates_a_long_running_process() {
        let provider = LocalSandboxProvider::new();
        let mut booted = provider.boot(&ProjectId::new("p1")).await.expect("boot");
        let mut process = booted
            .instance
            .spawn(&CommandSpec::new("sleep", ["30"]))
            .await
            .expect("spawn");

        let exit = tokio::time::timeout(Duration::from_secs(5), process.kill())
            .await
            .expect("killed in time");
        assert!(!exit.success());
        booted.instance.teardown().await.expect("teardown");
    }
}
