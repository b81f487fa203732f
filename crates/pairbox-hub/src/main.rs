use clap::Parser;
use pairbox_core::logging::{self, env_flag, Console, LogGuard, LogSettings};
use pairbox_hub::{router, HubConfig, HubState};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "pairbox-hub")]
struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value = "")]
    token: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = 10)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    let _log_guard = init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            return;
        }
    };
    if !addr.ip().is_loopback() && config.token.is_none() {
        error!(event = "invalid_addr", addr = %config.addr, reason = "non-loopback bind requires --token");
        return;
    }

    let hub = Arc::new(HubState::new(config.clone()));
    let app = router(hub);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "hub_error", error = %err);
            return;
        }
    };

    info!(
        event = "hub_start",
        addr = %config.addr,
        auth = config.token.is_some()
    );

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
    {
        error!(event = "hub_error", error = %err);
    }
    info!(event = "hub_stop");
}

fn load_config() -> HubConfig {
    let args = Args::parse();
    let token = resolve_flag(&args.token, "PAIRBOX_HUB_TOKEN");
    HubConfig {
        addr: resolve_flag(&args.addr, "PAIRBOX_HUB_ADDR")
            .unwrap_or_else(|| "127.0.0.1:3001".to_string()),
        token,
        debug: args.debug || env_flag("PAIRBOX_HUB_DEBUG"),
        ping_interval: Duration::from_secs(args.ping_interval),
        write_timeout: Duration::from_secs(args.write_timeout),
        log_dir: resolve_flag(&args.log_dir, "PAIRBOX_LOG_DIR")
            .unwrap_or_else(|| ".pairbox/logs".to_string()),
    }
}

fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    logging::init(&LogSettings {
        debug: config.debug,
        default_level: "info",
        console: Console::Stdout,
        log_dir: config.log_dir.clone(),
        file_name: format!("pairbox-hub-{}.log", std::process::id()),
        ansi: true,
    })
}

/// Flag value, then the environment, ignoring blanks.
fn resolve_flag(flag: &str, env_key: &str) -> Option<String> {
    if !flag.trim().is_empty() {
        return Some(flag.trim().to_string());
    }
    std::env::var(env_key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
