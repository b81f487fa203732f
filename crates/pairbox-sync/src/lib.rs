//! Client-side engine keeping one project's chat, file tree, editor tabs and
//! preview sandbox in sync with collaborators over a realtime channel.

pub mod channel;
pub mod config;
pub mod editor;
pub mod ingest;
pub mod local_sandbox;
pub mod persistence;
pub mod sandbox;
pub mod tree_store;
pub mod workspace;

#[cfg(test)]
mod test_support;

pub use channel::{ChannelConnector, ChannelSession, WsConnector};
pub use config::{resolve, CommandSpec, ConfigError, ConfigOverrides, SyncConfig};
pub use editor::{EditorBuffer, OpenSetNotice};
pub use ingest::{EntryState, LogEntry, MessageLog};
pub use local_sandbox::LocalSandboxProvider;
pub use persistence::{HttpProjectStore, ProjectStore};
pub use sandbox::{Preview, SandboxController, SandboxState};
pub use tree_store::{FileTreeStore, TreeChange, TreeNotice};
pub use workspace::{Activity, MergeSource, ProjectSnapshot, Workspace, WorkspaceEvent};
