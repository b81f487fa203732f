use crate::tree_store::FileTreeStore;
use pairbox_core::{ChatMessage, MessageBody, SyncError};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Confirmed,
    /// Authored locally and shown before the store acknowledged it.
    Provisional,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub id: Uuid,
    pub message: ChatMessage,
    pub body: MessageBody,
    pub state: EntryState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub entry_id: Uuid,
    /// Whether the message carried a file tree that was merged.
    pub carried_tree: bool,
    pub changed_paths: Vec<String>,
}

/// Chat history of the active project in arrival order.
pub struct MessageLog {
    agent_identity: String,
    entries: Vec<LogEntry>,
}

impl MessageLog {
    pub fn new(agent_identity: impl Into<String>) -> Self {
        Self {
            agent_identity: agent_identity.into(),
            entries: Vec::new(),
        }
    }

    pub fn agent_identity(&self) -> &str {
        &self.agent_identity
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: Uuid) -> Option<&LogEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Appends one arriving message and applies its side effects. Earlier
    /// entries are never looked at again.
    pub fn ingest(&mut self, message: ChatMessage, store: &mut FileTreeStore) -> IngestOutcome {
        let body = self.classify(&message);
        let mut outcome = IngestOutcome {
            entry_id: Uuid::new_v4(),
            carried_tree: false,
            changed_paths: Vec::new(),
        };
        if let Some(tree) = body.file_tree() {
            outcome.carried_tree = true;
            outcome.changed_paths = store.merge(tree);
        }
        debug!(
            event = "message_ingested",
            sender = %message.sender.email,
            agent = body.is_agent(),
            merged = outcome.changed_paths.len()
        );
        self.entries.push(LogEntry {
            id: outcome.entry_id,
            message,
            body,
            state: EntryState::Confirmed,
        });
        outcome
    }

    pub fn append_provisional(&mut self, message: ChatMessage) -> Uuid {
        let id = Uuid::new_v4();
        let body = MessageBody::PlainText(message.message.clone());
        self.entries.push(LogEntry {
            id,
            message,
            body,
            state: EntryState::Provisional,
        });
        id
    }

    pub fn confirm(&mut self, id: Uuid) -> bool {
        match self.entries.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => {
                entry.state = EntryState::Confirmed;
                true
            }
            None => false,
        }
    }

    /// Removes a provisional entry. Confirmed entries stay.
    pub fn rollback(&mut self, id: Uuid) -> Option<LogEntry> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.id == id && entry.state == EntryState::Provisional)?;
        Some(self.entries.remove(index))
    }

    /// Loads stored history. Agent payloads in it are classified for display
    /// but their trees are not merged again.
    pub fn replace_history(&mut self, messages: Vec<ChatMessage>) {
        self.entries = messages
            .into_iter()
            .map(|message| LogEntry {
                id: Uuid::new_v4(),
                body: self.classify(&message),
                message,
                state: EntryState::Confirmed,
            })
            .collect();
    }

    fn classify(&self, message: &ChatMessage) -> MessageBody {
        match message.classify(&self.agent_identity) {
            Ok(body) => body,
            Err(SyncError::MalformedAgentPayload(reason)) => {
                warn!(
                    event = "malformed_agent_payload",
                    project_id = %message.project_id,
                    error = %reason
                );
                MessageBody::PlainText(message.message.clone())
            }
            Err(err) => {
                warn!(event = "message_classify_failed", error = %err);
                MessageBody::PlainText(message.message.clone())
            }
        }
    }
}
