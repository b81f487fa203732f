mod command;

use anyhow::{Context, Result};
use clap::Parser;
use command::{parse_command, render_activity, Command, HELP};
use pairbox_core::logging::{self, file_safe, Console, LogSettings};
use pairbox_core::{FileTree, ProjectId};
use pairbox_sync::config::{resolve, ConfigOverrides};
use pairbox_sync::{ProjectSnapshot, SandboxState, Workspace};
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "pairbox")]
#[command(about = "Collaborative workspace client", long_about = None)]
struct Cli {
    /// Project to open.
    #[arg(long)]
    project: String,
    #[arg(long, default_value = "")]
    api_url: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value = "")]
    email: String,
    #[arg(long, default_value = "")]
    agent_identity: String,
    /// JSON file tree to load as the project's initial contents.
    #[arg(long)]
    tree: Option<String>,
    #[arg(long, default_value = "")]
    install: String,
    #[arg(long, default_value = "")]
    start: String,
    #[arg(long, default_value = "")]
    log_dir: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_dir = if cli.log_dir.trim().is_empty() {
        std::env::var("PAIRBOX_LOG_DIR").unwrap_or_else(|_| ".pairbox/logs".to_string())
    } else {
        cli.log_dir.clone()
    };
    let _log_guard = logging::init(&LogSettings {
        debug: cli.debug,
        default_level: "warn",
        console: Console::Stderr,
        log_dir,
        file_name: format!("pairbox-cli-{}.log", file_safe(&cli.project)),
        ansi: false,
    });

    let config = resolve(&ConfigOverrides {
        api_url: cli.api_url.clone(),
        token: cli.token.clone(),
        email: cli.email.clone(),
        agent_identity: cli.agent_identity.clone(),
        install: cli.install.clone(),
        start: cli.start.clone(),
    })
    .context("invalid configuration")?;
    info!(event = "cli_start", project_id = %cli.project, api_url = %config.api_url);

    let mut workspace = Workspace::from_config(config).context("invalid api url")?;
    let snapshot = load_snapshot(&cli.project, cli.tree.as_deref())?;
    if let Err(err) = workspace.open_project(snapshot).await {
        println!("[sandbox] {err} (run will retry boot)");
    }
    println!("opened {} ({} files). {HELP}", cli.project, workspace.tree().len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line.context("reading stdin")? {
                    Some(line) => line,
                    None => break,
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(err) = execute(&mut workspace, command).await {
                            println!("error: {err:#}");
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => println!("{usage}"),
                }
            }
            event = workspace.next_event() => {
                let Some(event) = event else { break };
                for activity in workspace.handle_event(event).await {
                    println!("{}", render_activity(&activity));
                }
            }
        }
    }

    workspace.shutdown().await;
    Ok(())
}

fn load_snapshot(project: &str, tree: Option<&str>) -> Result<ProjectSnapshot> {
    let file_tree = match tree {
        Some(path) => load_tree(Path::new(path))?,
        None => FileTree::new(),
    };
    Ok(ProjectSnapshot::new(ProjectId::new(project), file_tree))
}

fn load_tree(path: &Path) -> Result<FileTree> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
}

async fn execute(workspace: &mut Workspace, command: Command) -> Result<()> {
    match command {
        Command::List => {
            let tree = workspace.tree();
            let active = workspace.active_file().map(str::to_string);
            for path in tree.paths() {
                let marker = if active.as_deref() == Some(path) {
                    "*"
                } else if workspace.open_files().iter().any(|open| open == path) {
                    "+"
                } else {
                    " "
                };
                println!("{marker} {path}");
            }
        }
        Command::Open(path) => workspace.open_file(&path)?,
        Command::Close(path) => {
            if !workspace.close_file(&path) {
                println!("{path} is not open");
            }
        }
        Command::New => {
            let path = workspace.create_file().await?;
            println!("created {path}");
        }
        Command::Rename { from, to } => workspace.rename_file(&from, &to, false)?,
        Command::Remove(path) => workspace.delete_file(&path)?,
        Command::Write { path, contents } => workspace.commit(&path, contents).await?,
        Command::Cat(path) => match workspace.tree().contents(&path) {
            Some(contents) => println!("{contents}"),
            None => println!("no such file: {path}"),
        },
        Command::Say(text) => {
            workspace.send_message(&text).await;
        }
        Command::Run => {
            if workspace.sandbox_state() == SandboxState::Absent {
                workspace.boot_sandbox().await?;
            }
            let run_id = workspace.run().await?;
            println!("[run] installing ({run_id})");
        }
        Command::Preview => {
            let preview = workspace.preview();
            match preview.display_url() {
                Some(url) => println!("[preview] {url}"),
                None => println!("[preview] no server yet ({})", workspace.sandbox_state().as_str()),
            }
        }
        Command::Url(url) => workspace.set_display_url(url),
        Command::Switch { project, tree } => {
            let snapshot = load_snapshot(&project, tree.as_deref())?;
            workspace.switch_project(snapshot).await?;
            println!("switched to {project} ({} files)", workspace.tree().len());
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
    Ok(())
}
