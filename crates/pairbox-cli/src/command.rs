use pairbox_sync::sandbox::{OutputStream, RunStep};
use pairbox_sync::{Activity, MergeSource};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Open(String),
    Close(String),
    New,
    Rename { from: String, to: String },
    Remove(String),
    Write { path: String, contents: String },
    Cat(String),
    Say(String),
    Run,
    Preview,
    Url(String),
    Switch { project: String, tree: Option<String> },
    Help,
    Quit,
}

pub const HELP: &str = "commands: ls | open <path> | close <path> | new | rename <from> <to> | rm <path> | write <path> <contents...> | cat <path> | say <text...> | run | preview | url <display-url> | switch <project> [tree.json] | quit";

/// Parses one REPL line. `Ok(None)` for blank input.
pub fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };
    let mut args = rest.split_whitespace();
    let one = |name: &str| -> Result<String, String> {
        let mut parts = rest.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(value), None) => Ok(value.to_string()),
            _ => Err(format!("usage: {name} <path>")),
        }
    };

    let command = match verb {
        "ls" => Command::List,
        "open" => Command::Open(one("open")?),
        "close" => Command::Close(one("close")?),
        "new" => Command::New,
        "rename" | "mv" => match (args.next(), args.next(), args.next()) {
            (Some(from), Some(to), None) => Command::Rename {
                from: from.to_string(),
                to: to.to_string(),
            },
            _ => return Err("usage: rename <from> <to>".to_string()),
        },
        "rm" => Command::Remove(one("rm")?),
        "write" => {
            let (path, contents) = match rest.split_once(char::is_whitespace) {
                Some((path, contents)) => (path, contents),
                None if !rest.is_empty() => (rest, ""),
                None => return Err("usage: write <path> <contents...>".to_string()),
            };
            Command::Write {
                path: path.to_string(),
                contents: contents.replace("\\n", "\n"),
            }
        }
        "cat" => Command::Cat(one("cat")?),
        "say" if !rest.is_empty() => Command::Say(rest.to_string()),
        "say" => return Err("usage: say <text...>".to_string()),
        "run" => Command::Run,
        "preview" => Command::Preview,
        "url" if !rest.is_empty() => Command::Url(rest.to_string()),
        "url" => return Err("usage: url <display-url>".to_string()),
        "switch" => match (args.next(), args.next(), args.next()) {
            (Some(project), tree, None) => Command::Switch {
                project: project.to_string(),
                tree: tree.map(str::to_string),
            },
            _ => return Err("usage: switch <project> [tree.json]".to_string()),
        },
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command: {other} (try help)")),
    };
    Ok(Some(command))
}

pub fn render_activity(activity: &Activity) -> String {
    match activity {
        Activity::Message { sender, body, .. } => match body.file_tree() {
            Some(tree) => format!("[chat] {sender}: {} (+{} files)", body.text(), tree.len()),
            None => format!("[chat] {sender}: {}", body.text()),
        },
        Activity::TreeMerged { source, paths } => {
            let from = match source {
                MergeSource::Agent => "agent",
                MergeSource::Peer => "peer",
            };
            format!("[tree] merged from {from}: {}", paths.join(", "))
        }
        Activity::SandboxOutput { step, line } => {
            let marker = match line.stream {
                OutputStream::Stdout => "",
                OutputStream::Stderr => "!",
            };
            let step = match step {
                RunStep::Install => "install",
                RunStep::Start => "start",
            };
            format!("[{step}{marker}] {}", line.line)
        }
        Activity::PreviewReady { url, port } => format!("[preview] {url} (port {port})"),
        Activity::RunStarted { run_id } => format!("[run] started {run_id}"),
        Activity::RunFailed { error, .. } => format!("[run] failed: {error}"),
        Activity::RunExited { exit } => format!("[run] {exit}"),
        Activity::MessageRolledBack { error, .. } => {
            format!("[chat] message not saved and removed: {error}")
        }
        Activity::TreeNotSaved { error } => format!("[tree] save failed: {error}"),
        Activity::ChannelError { code, message } => format!("[channel] {code}: {message}"),
    }
}
