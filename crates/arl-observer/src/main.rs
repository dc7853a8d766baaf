mod http;
mod listener;

use std::env;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use arl_tracker::{ActivityTracker, TrackerConfig};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;
use url::Url;

const LOG_FILE_NAME: &str = "arl-observer.log";

#[derive(Parser, Debug)]
#[command(name = "arl-observer", about = "Activity ledger observer for an agent fleet gateway")]
struct Args {
    /// Gateway WebSocket url, e.g. ws://127.0.0.1:4464
    #[arg(long)]
    gateway_url: Option<String>,

    /// Token sent in the connect handshake
    #[arg(long)]
    gateway_token: Option<String>,

    /// Directory holding the ledger and logs
    #[arg(long)]
    state_dir: Option<String>,

    /// Loopback address for the HTTP read API
    #[arg(long)]
    http_addr: Option<String>,

    /// Directory for the observer log file
    #[arg(long)]
    log_dir: Option<String>,

    /// Force debug-level logging
    #[arg(long)]
    debug: bool,
}

#[derive(Debug, Clone)]
struct Config {
    gateway_url: Option<String>,
    gateway_token: Option<String>,
    state_dir: PathBuf,
    http_addr: String,
    log_dir: PathBuf,
    debug: bool,
}

fn env_true(name: &str) -> bool {
    env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn resolve_gateway_url(flag: Option<String>) -> Option<String> {
    flag.filter(|s| !s.is_empty())
        .or_else(|| env::var("ARL_GATEWAY_URL").ok().filter(|s| !s.is_empty()))
}

fn resolve_gateway_token(flag: Option<String>) -> Option<String> {
    flag.filter(|s| !s.is_empty())
        .or_else(|| env::var("ARL_GATEWAY_TOKEN").ok().filter(|s| !s.is_empty()))
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag.filter(|s| !s.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = env::var("ARL_STATE_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".agent-run-ledger")
}

fn resolve_http_addr(flag: Option<String>) -> String {
    if let Some(addr) = flag.filter(|s| !s.is_empty()) {
        return addr;
    }
    if let Ok(addr) = env::var("ARL_HTTP_ADDR") {
        if !addr.is_empty() {
            return addr;
        }
    }
    "127.0.0.1:8790".to_string()
}

fn resolve_log_dir(flag: Option<String>, state_dir: &Path) -> PathBuf {
    if let Some(dir) = flag.filter(|s| !s.is_empty()) {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = env::var("ARL_LOG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }
    state_dir.join("logs")
}

fn load_config(args: Args) -> Config {
    let state_dir = resolve_state_dir(args.state_dir);
    let log_dir = resolve_log_dir(args.log_dir, &state_dir);
    Config {
        gateway_url: resolve_gateway_url(args.gateway_url),
        gateway_token: resolve_gateway_token(args.gateway_token),
        state_dir,
        http_addr: resolve_http_addr(args.http_addr),
        log_dir,
        debug: args.debug || env_true("ARL_DEBUG"),
    }
}

// Runs after logging init; a bad url disables the listener, not the process.
fn parse_gateway_url(raw: &str) -> Option<Url> {
    match Url::parse(raw) {
        Ok(url) => Some(url),
        Err(err) => {
            error!(event = "observer_invalid_gateway_url", url = %raw, error = %err);
            None
        }
    }
}

#[derive(Clone)]
struct MultiWriter {
    file: Option<Arc<Mutex<std::fs::File>>>,
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = io::stdout().write_all(buf);
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = io::stdout().flush();
        if let Some(file) = &self.file {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
        Ok(())
    }
}

fn init_logging(config: &Config) {
    let default_level = if config.debug {
        "debug".to_string()
    } else {
        match env::var("ARL_LOG_LEVEL") {
            Ok(level) if !level.is_empty() => level,
            _ => "info".to_string(),
        }
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file = std::fs::create_dir_all(&config.log_dir)
        .and_then(|_| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(config.log_dir.join(LOG_FILE_NAME))
        })
        .ok()
        .map(|file| Arc::new(Mutex::new(file)));
    let writer = MultiWriter { file };
    let make_writer = BoxMakeWriter::new(move || writer.clone());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = load_config(args);
    init_logging(&config);

    let addr: SocketAddr = match config.http_addr.parse() {
        Ok(addr) => addr,
        Err(err) => {
            error!(event = "observer_invalid_addr", addr = %config.http_addr, error = %err);
            return;
        }
    };
    if !addr.ip().is_loopback() {
        error!(event = "observer_nonloopback_addr", addr = %addr);
        return;
    }

    let tracker = Arc::new(ActivityTracker::new(TrackerConfig::new(&config.state_dir)));
    tracker.start();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    match &config.gateway_url {
        Some(raw) => {
            if let Some(url) = parse_gateway_url(raw) {
                let listener_config = listener::ListenerConfig {
                    url,
                    token: config.gateway_token.clone(),
                };
                tokio::spawn(listener::run(
                    listener_config,
                    Arc::clone(&tracker),
                    shutdown_rx,
                ));
            }
        }
        None => {
            warn!(event = "gateway_disabled", reason = "no gateway url configured");
        }
    }

    let app = http::router(Arc::clone(&tracker));
    let tcp = match tokio::net::TcpListener::bind(addr).await {
        Ok(tcp) => tcp,
        Err(err) => {
            error!(event = "observer_bind_failed", addr = %addr, error = %err);
            return;
        }
    };
    info!(
        event = "observer_start",
        addr = %addr,
        state_dir = %config.state_dir.display(),
        ledger = %tracker.ledger_path().display(),
    );

    let shutdown_tracker = Arc::clone(&tracker);
    let shutdown = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "observer_shutdown");
        let _ = shutdown_tx.send(true);
        shutdown_tracker.stop();
    };

    if let Err(err) = axum::serve(tcp, app).with_graceful_shutdown(shutdown).await {
        error!(event = "observer_serve_failed", error = %err);
    }
}
