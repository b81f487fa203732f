//! Subscriber setup shared by the `pairbox` binaries: an [`EnvFilter`] and a
//! writer that copies every line to a console stream and, when a log
//! directory is configured, to an append-only file.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::{fmt::writer::BoxMakeWriter, EnvFilter};

pub const LOG_LEVEL_ENV: &str = "PAIRBOX_LOG_LEVEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    Stdout,
    /// Keeps stdout free for interactive output.
    Stderr,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
    pub debug: bool,
    pub default_level: &'static str,
    pub console: Console,
    /// Blank disables the file copy.
    pub log_dir: String,
    pub file_name: String,
    pub ansi: bool,
}

/// Holds the log file open for as long as the subscriber may write to it.
pub struct LogGuard {
    _file: Option<Arc<Mutex<File>>>,
}

struct TeeWriter {
    console: Console,
    file: Option<Arc<Mutex<File>>>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // Write errors are dropped.
        let _ = match self.console {
            Console::Stdout => io::stdout().write_all(buf),
            Console::Stderr => io::stderr().write_all(buf),
        };
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = match self.console {
            Console::Stdout => io::stdout().flush(),
            Console::Stderr => io::stderr().flush(),
        };
        if let Some(Ok(mut file)) = self.file.as_ref().map(|file| file.lock()) {
            let _ = file.flush();
        }
        Ok(())
    }
}

/// Picks the filter directive: `--debug`, then `PAIRBOX_LOG_LEVEL`, then
/// `RUST_LOG`, then `default_level`.
pub fn resolve_filter<F>(debug: bool, default_level: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if debug {
        return "debug".to_string();
    }
    [LOG_LEVEL_ENV, "RUST_LOG"]
        .into_iter()
        .filter_map(&lookup)
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| default_level.to_string())
}

/// Installs the global subscriber. `None` when one was already installed.
pub fn init(settings: &LogSettings) -> Option<LogGuard> {
    let directive = resolve_filter(settings.debug, settings.default_level, |key| {
        std::env::var(key).ok()
    });
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("log_filter_invalid: {directive}: {err}");
        EnvFilter::new(settings.default_level)
    });

    let file = match open_log_file(Path::new(&settings.log_dir), &settings.file_name) {
        Ok(file) => file.map(|file| Arc::new(Mutex::new(file))),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            None
        }
    };
    let console = settings.console;
    let shared = file.clone();
    let make_writer = BoxMakeWriter::new(move || TeeWriter {
        console,
        file: shared.clone(),
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .with_ansi(settings.ansi)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok()?;
    Some(LogGuard { _file: file })
}

/// Opens `<dir>/<name>` for appending, creating the directory. A blank `dir`
/// means no file.
pub fn open_log_file(dir: &Path, name: &str) -> io::Result<Option<File>> {
    if dir.to_string_lossy().trim().is_empty() {
        return Ok(None);
    }
    std::fs::create_dir_all(dir)?;
    let path: PathBuf = dir.join(name);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Some)
}

/// True for `1`, `true`, `yes` or `on`, in any case.
pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

/// Maps an id onto characters that are safe in a file name.
pub fn file_safe(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
