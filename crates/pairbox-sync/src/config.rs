use pairbox_core::DEFAULT_AGENT_IDENTITY;
use std::fmt;
use thiserror::Error;
use url::Url;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_USER_EMAIL: &str = "anonymous@pairbox.local";
pub const CHANNEL_PATH: &str = "/ws";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid api url '{value}': {reason}")]
    InvalidUrl { value: String, reason: String },
    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),
    #[error("{0} command is empty")]
    EmptyCommand(&'static str),
}

/// A program plus its arguments, run inside the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits on whitespace. No quoting support.
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        let program = parts.next()?;
        Some(Self::new(program, parts))
    }

    pub fn npm_install() -> Self {
        Self::new("npm", ["install"])
    }

    pub fn npm_start() -> Self {
        Self::new("npm", ["start"])
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: Url,
    pub token: String,
    pub user_email: String,
    pub agent_identity: String,
    pub install: CommandSpec,
    pub start: CommandSpec,
}

impl SyncConfig {
    pub fn bearer(&self) -> Option<&str> {
        let token = self.token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token)
        }
    }

    /// `http(s)://host/base` becomes `ws(s)://host/base/ws`.
    pub fn channel_url(&self) -> Result<Url, ConfigError> {
        let scheme = match self.api_url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };
        let mut url = self.endpoint(CHANNEL_PATH);
        url.set_scheme(scheme)
            .map_err(|_| ConfigError::UnsupportedScheme(scheme.to_string()))?;
        Ok(url)
    }

    /// Appends `path` to the base path of the api url.
    pub fn endpoint(&self, path: &str) -> Url {
        let mut url = self.api_url.clone();
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/{}", path.trim_start_matches('/')));
        url.set_query(None);
        url
    }
}

/// Command-line values; empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub api_url: String,
    pub token: String,
    pub email: String,
    pub agent_identity: String,
    pub install: String,
    pub start: String,
}

pub fn resolve(overrides: &ConfigOverrides) -> Result<SyncConfig, ConfigError> {
    resolve_with(overrides, |key| std::env::var(key).ok())
}

pub fn resolve_with<F>(overrides: &ConfigOverrides, lookup: F) -> Result<SyncConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw_url = resolve_value(&overrides.api_url, "PAIRBOX_API_URL", &lookup)
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());
    let api_url = Url::parse(&raw_url).map_err(|err| ConfigError::InvalidUrl {
        value: raw_url.clone(),
        reason: err.to_string(),
    })?;
    if !matches!(api_url.scheme(), "http" | "https") {
        return Err(ConfigError::UnsupportedScheme(api_url.scheme().to_string()));
    }

    let token = resolve_value(&overrides.token, "PAIRBOX_TOKEN", &lookup).unwrap_or_default();
    let user_email = resolve_value(&overrides.email, "PAIRBOX_EMAIL", &lookup)
        .unwrap_or_else(|| DEFAULT_USER_EMAIL.to_string());
    let agent_identity =
        resolve_value(&overrides.agent_identity, "PAIRBOX_AGENT_IDENTITY", &lookup)
            .unwrap_or_else(|| DEFAULT_AGENT_IDENTITY.to_string());
    let install = resolve_command(&overrides.install, "install", CommandSpec::npm_install)?;
    let start = resolve_command(&overrides.start, "start", CommandSpec::npm_start)?;

    Ok(SyncConfig {
        api_url,
        token,
        user_email,
        agent_identity,
        install,
        start,
    })
}

fn resolve_value<F>(flag: &str, env_key: &str, lookup: &F) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    match lookup(env_key) {
        Some(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        _ => None,
    }
}

fn resolve_command(
    flag: &str,
    name: &'static str,
    fallback: fn() -> CommandSpec,
) -> Result<CommandSpec, ConfigError> {
    if flag.is_empty() {
        return Ok(fallback());
    }
    CommandSpec::parse(flag).ok_or(ConfigError::EmptyCommand(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_flags_or_env() {
        let config = resolve_with(&ConfigOverrides::default(), env(&[])).expect("resolve");
        assert_eq!(config.api_url.as_str(), "http://127.0.0.1:3000/");
        assert_eq!(config.user_email, DEFAULT_USER_EMAIL);
        assert_eq!(config.agent_identity, DEFAULT_AGENT_IDENTITY);
        assert_eq!(config.install, CommandSpec::npm_install());
        assert_eq!(config.start.to_string(), "npm start");
        assert!(config.bearer().is_none());
    }

    #[test]
    fn flags_win_over_env() {
        let overrides = ConfigOverrides {
            api_url: "https://api.example.com".to_string(),
            email: "flag@example.com".to_string(),
            ..ConfigOverrides::default()
        };
        let config = resolve_with(
            &overrides,
            env(&[
                ("PAIRBOX_API_URL", "http://env.example.com"),
                ("PAIRBOX_EMAIL", "env@example.com"),
                ("PAIRBOX_TOKEN", "secret"),
            ]),
        )
        .expect("resolve");
        assert_eq!(config.api_url.host_str(), Some("api.example.com"));
        assert_eq!(config.user_email, "flag@example.com");
        assert_eq!(config.bearer(), Some("secret"));
    }

    #[test]
    fn channel_url_swaps_scheme_and_keeps_base_path() {
        let overrides = ConfigOverrides {
            api_url: "https://api.example.com/v1/".to_string(),
            ..ConfigOverrides::default()
        };
        let config = resolve_with(&overrides, env(&[])).expect("resolve");
        assert_eq!(
            config.channel_url().expect("channel url").as_str(),
            "wss://api.example.com/v1/ws"
        );
        assert_eq!(
            config.endpoint("/project/file-tree").as_str(),
            "https://api.example.com/v1/project/file-tree"
        );
    }

    #[test]
    fn rejects_non_http_api_urls_and_blank_commands() {
        let overrides = ConfigOverrides {
            api_url: "ftp://files.example.com".to_string(),
            ..ConfigOverrides::default()
        };
        assert!(matches!(
            resolve_with(&overrides, env(&[])),
            Err(ConfigError::UnsupportedScheme(_))
        ));

        let overrides = ConfigOverrides {
            start: "   ".to_string(),
            ..ConfigOverrides::default()
        };
        assert_eq!(
            resolve_with(&overrides, env(&[])).expect_err("blank start").to_string(),
            "start command is empty"
        );
    }

    #[test]
    fn command_spec_parses_program_and_args() {
        let spec = CommandSpec::parse("node  server.js --port 8080").expect("parse");
        assert_eq!(spec.program, "node");
        assert_eq!(spec.args, vec!["server.js", "--port", "8080"]);
        assert!(CommandSpec::parse("").is_none());
    }
}
