use crate::config::SyncConfig;
use async_trait::async_trait;
use pairbox_core::{ChatMessage, FileTree, ProjectId, SyncError};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const CHAT_MESSAGE_PATH: &str = "/project/chat-message";
pub const FILE_TREE_PATH: &str = "/project/file-tree";

/// The external project store. Writes only; reads happen before a project is
/// opened.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), SyncError>;
    async fn save_file_tree(&self, project: &ProjectId, tree: &FileTree) -> Result<(), SyncError>;
}

#[derive(Serialize)]
struct FileTreeBody<'a> {
    project_id: &'a ProjectId,
    #[serde(rename = "fileTree")]
    file_tree: &'a FileTree,
}

pub struct HttpProjectStore {
    client: reqwest::Client,
    message_url: Url,
    tree_url: Url,
    token: Option<String>,
}

impl HttpProjectStore {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            message_url: config.endpoint(CHAT_MESSAGE_PATH),
            tree_url: config.endpoint(FILE_TREE_PATH),
            token: config.bearer().map(str::to_string),
        }
    }

    async fn put<T: Serialize + ?Sized>(
        &self,
        target: &'static str,
        url: &Url,
        body: &T,
    ) -> Result<(), SyncError> {
        let mut request = self.client.put(url.clone()).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|err| SyncError::persistence(target, err))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SyncError::persistence(
                target,
                format!("{status}: {}", detail.trim()),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ProjectStore for HttpProjectStore {
    async fn save_message(&self, message: &ChatMessage) -> Result<(), SyncError> {
        self.put("chat-message", &self.message_url, message).await
    }

    async fn save_file_tree(&self, project: &ProjectId, tree: &FileTree) -> Result<(), SyncError> {
        let body = FileTreeBody {
            project_id: project,
            file_tree: tree,
        };
        self.put("file-tree", &self.tree_url, &body).await
    }
}

#[derive(Debug, Clone)]
pub enum PersistJob {
    Message {
        entry_id: Uuid,
        message: ChatMessage,
    },
    FileTree {
        project: ProjectId,
        tree: Arc<FileTree>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistOutcome {
    Message {
        entry_id: Uuid,
        project: ProjectId,
        result: Result<(), SyncError>,
    },
    FileTree {
        project: ProjectId,
        result: Result<(), SyncError>,
    },
}

pub type OutcomeSink = Arc<dyn Fn(PersistOutcome) + Send + Sync>;

/// Single background writer. Jobs run strictly in submission order and the
/// submitter never waits on them.
pub struct PersistenceQueue {
    jobs: mpsc::UnboundedSender<PersistJob>,
    worker: JoinHandle<()>,
}

impl PersistenceQueue {
    pub fn spawn(store: Arc<dyn ProjectStore>, outcomes: OutcomeSink) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<PersistJob>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = run_job(store.as_ref(), job).await;
                outcomes(outcome);
            }
        });
        Self { jobs, worker }
    }

    pub fn save_message(&self, entry_id: Uuid, message: ChatMessage) {
        self.submit(PersistJob::Message { entry_id, message });
    }

    pub fn save_file_tree(&self, project: ProjectId, tree: Arc<FileTree>) {
        self.submit(PersistJob::FileTree { project, tree });
    }

    fn submit(&self, job: PersistJob) {
        if self.jobs.send(job).is_err() {
            warn!(event = "persistence_write_failed", error = "queue closed");
        }
    }

    /// Stops accepting jobs and waits for the queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.jobs);
        let _ = self.worker.await;
    }
}

async fn run_job(store: &dyn ProjectStore, job: PersistJob) -> PersistOutcome {
    match job {
        PersistJob::Message { entry_id, message } => {
            let result = store.save_message(&message).await;
            log_result("chat-message", &message.project_id, &result);
            PersistOutcome::Message {
                entry_id,
                project: message.project_id,
                result,
            }
        }
        PersistJob::FileTree { project, tree } => {
            let result = store.save_file_tree(&project, &tree).await;
            log_result("file-tree", &project, &result);
            PersistOutcome::FileTree { project, result }
        }
    }
}

fn log_result(target: &str, project: &ProjectId, result: &Result<(), SyncError>) {
    match result {
        Ok(()) => debug!(event = "persisted", endpoint = target, project_id = %project),
        Err(err) => warn!(
            event = "persistence_write_failed",
            endpoint = target,
            project_id = %project,
            error = %err
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve_with, ConfigOverrides};
    use crate::test_support::RecordingStore;
    use axum::{extract::State, http::HeaderMap, http::StatusCode, routing::put, Json, Router};
    use pairbox_core::FileNode;
    use serde_json::Value;
    use std::sync::Mutex;

    fn tree(contents: &str) -> Arc<FileTree> {
        Arc::new(
            [("index.js".to_string(), FileNode::new(contents))]
                .into_iter()
                .collect(),
        )
    }

    #[tokio::test]
    async fn queue_preserves_submission_order_and_reports_outcomes() {
        let store = RecordingStore::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = PersistenceQueue::spawn(
            Arc::new(store.clone()),
            Arc::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );

        let project = ProjectId::new("p1");
        for n in 0..5 {
            queue.save_file_tree(project.clone(), tree(&n.to_string()));
        }
        let entry_id = Uuid::new_v4();
        queue.save_message(entry_id, ChatMessage::new(project.clone(), "me@x.y", "hi"));
        queue.shutdown().await;

        let saved: Vec<_> = store
            .trees()
            .into_iter()
            .map(|(_, tree)| tree.contents("index.js").unwrap_or_default().to_string())
            .collect();
        assert_eq!(saved, vec!["0", "1", "2", "3", "4"]);

        let mut last = None;
        while let Ok(outcome) = rx.try_recv() {
            last = Some(outcome);
        }
        assert_eq!(
            last,
            Some(PersistOutcome::Message {
                entry_id,
                project,
                result: Ok(())
            })
        );
    }

    #[tokio::test]
    async fn failed_writes_come_back_as_outcomes() {
        let store = RecordingStore::default();
        store.fail_messages(true);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = PersistenceQueue::spawn(
            Arc::new(store.clone()),
            Arc::new(move |outcome| {
                let _ = tx.send(outcome);
            }),
        );

        queue.save_message(
            Uuid::new_v4(),
            ChatMessage::new(ProjectId::new("p1"), "me@x.y", "hi"),
        );
        match rx.recv().await.expect("outcome") {
            PersistOutcome::Message { result, .. } => assert!(matches!(
                result,
                Err(SyncError::PersistenceWriteFailed { .. })
            )),
            other => panic!("unexpected outcome: {other:?}"),
        }
        queue.shutdown().await;
    }

    type Captured = Arc<Mutex<Vec<(String, Option<String>, Value)>>>;

    async fn capture(
        State(captured): State<Captured>,
        uri: axum::http::Uri,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        captured
            .lock()
            .expect("lock")
            .push((uri.path().to_string(), auth, body));
        if uri.path().ends_with("chat-message") {
            StatusCode::INTERNAL_SERVER_ERROR
        } else {
            StatusCode::OK
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn http_store_puts_json_with_bearer_token() {
        let captured: Captured = Arc::new(Mutex::new(Vec::new()));
        let app = Router::new()
            .route("/project/file-tree", put(capture))
            .route("/project/chat-message", put(capture))
            .with_state(captured.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let overrides = ConfigOverrides {
            api_url: format!("http://{addr}"),
            token: "t0ken".to_string(),
            ..ConfigOverrides::default()
        };
        let config = resolve_with(&overrides, |_| None).expect("config");
        let store = HttpProjectStore::new(&config);

        store
            .save_file_tree(&ProjectId::new("p1"), &tree("x"))
            .await
            .expect("tree saved");
        let err = store
            .save_message(&ChatMessage::new(ProjectId::new("p1"), "me@x.y", "hi"))
            .await
            .expect_err("server error");
        assert!(matches!(
            err,
            SyncError::PersistenceWriteFailed {
                target: "chat-message",
                ..
            }
        ));

        let captured = captured.lock().expect("lock").clone();
        assert_eq!(captured.len(), 2);
        let (path, auth, body) = &captured[0];
        assert_eq!(path, "/project/file-tree");
        assert_eq!(auth.as_deref(), Some("Bearer t0ken"));
        assert_eq!(body["project_id"], "p1");
        assert_eq!(body["fileTree"]["index.js"]["file"]["contents"], "x");
        assert_eq!(captured[1].2["sender"]["email"], "me@x.y");
    }
}
