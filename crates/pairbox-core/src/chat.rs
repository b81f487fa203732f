use crate::{FileTree, ProjectId, SyncError};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Sender address reserved for the automated collaborator.
pub const DEFAULT_AGENT_IDENTITY: &str = "gemini@ai.com";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub project_id: ProjectId,
    pub sender: Sender,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ChatMessage {
    pub fn new(project_id: ProjectId, email: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            project_id,
            sender: Sender {
                email: email.into(),
            },
            message: message.into(),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn is_from(&self, email: &str) -> bool {
        self.sender.email.eq_ignore_ascii_case(email)
    }

    /// Decides once, at arrival, whether the message is plain chat or a
    /// structured agent payload. Only messages from `agent_identity` are parsed.
    pub fn classify(&self, agent_identity: &str) -> Result<MessageBody, SyncError> {
        if !self.is_from(agent_identity) {
            return Ok(MessageBody::PlainText(self.message.clone()));
        }
        serde_json::from_str::<AgentPayload>(&self.message)
            .map(MessageBody::Agent)
            .map_err(|err| SyncError::MalformedAgentPayload(err.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "fileTree", skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<FileTree>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    PlainText(String),
    Agent(AgentPayload),
}

impl MessageBody {
    pub fn text(&self) -> &str {
        match self {
            MessageBody::PlainText(text) => text,
            MessageBody::Agent(payload) => &payload.text,
        }
    }

    pub fn file_tree(&self) -> Option<&FileTree> {
        match self {
            MessageBody::PlainText(_) => None,
            MessageBody::Agent(payload) => payload.file_tree.as_ref(),
        }
    }

    pub fn is_agent(&self) -> bool {
        matches!(self, MessageBody::Agent(_))
    }
}
