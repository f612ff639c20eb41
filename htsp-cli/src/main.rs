//! HTSP diagnostic client — entry point.
//!
//! ```text
//! htsp-cli --hostname tvh.local -u dev -p dev        Connect and log
//! htsp-cli --channel 7                               Also subscribe
//! htsp-cli --config <path>                           Use config TOML
//! htsp-cli --gen-config                              Dump defaults
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use htsp_core::{
    AuthState, AuthenticationListener, ClientConfig, ConnectionListener, ConnectionState,
    HtspMessage, SimpleHtspConnection, SubscriptionListener,
};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "htsp-cli", about = "TVHeadend HTSP diagnostic client")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "htsp-cli.toml")]
    config: PathBuf,

    /// Server hostname (overrides config).
    #[arg(long)]
    hostname: Option<String>,

    /// Server HTSP port (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Username (overrides config).
    #[arg(short, long)]
    username: Option<String>,

    /// Password (overrides config).
    #[arg(short, long)]
    password: Option<String>,

    /// Channel id to subscribe to after authenticating.
    #[arg(long)]
    channel: Option<i64>,

    /// Stream profile for the subscription.
    #[arg(long)]
    profile: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Listeners ────────────────────────────────────────────────────

struct StateLogger;

impl ConnectionListener for StateLogger {
    fn on_connection_state(&self, state: ConnectionState) {
        info!("connection state: {state}");
    }
}

impl AuthenticationListener for StateLogger {
    fn on_authentication_state(&self, state: AuthState) {
        info!("authentication state: {state}");
    }
}

struct StreamLogger {
    muxpkts: AtomicU64,
}

impl SubscriptionListener for StreamLogger {
    fn on_subscription_start(&self, message: &HtspMessage) {
        let streams = message.get_list("streams").map_or(0, |s| s.len());
        info!(streams, "subscription started");
    }

    fn on_subscription_stop(&self, _message: &HtspMessage) {
        info!("subscription stopped");
    }

    fn on_muxpkt(&self, message: &HtspMessage) {
        let count = self.muxpkts.fetch_add(1, Ordering::Relaxed) + 1;
        if count % 1000 == 0 {
            let bytes = message.get_bin("payload").map_or(0, |p| p.len());
            info!(count, last_payload_bytes = bytes, "muxpkts received");
        }
    }
}

// ── Config loading ───────────────────────────────────────────────

fn load_config(path: &Path) -> ClientConfig {
    match std::fs::read_to_string(path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!("invalid config {}: {e}; using defaults", path.display());
            ClientConfig::default()
        }),
        Err(_) => {
            tracing::info!("no config at {}; using defaults", path.display());
            ClientConfig::default()
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&ClientConfig::default())?);
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = load_config(&cli.config);
    if let Some(hostname) = cli.hostname {
        config.hostname = hostname;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(username) = cli.username {
        config.username = username;
    }
    if let Some(password) = cli.password {
        config.password = password;
    }

    info!("htsp-cli v{}", env!("CARGO_PKG_VERSION"));
    info!("connecting to {}", config.server_addr());

    let connection = SimpleHtspConnection::new(config);

    let logger = Arc::new(StateLogger);
    connection.add_connection_listener(logger.clone());
    connection.add_authentication_listener(logger);

    connection.start();

    let subscriber = if let Some(channel) = cli.channel {
        wait_for_auth(&connection).await?;

        let subscriber = connection.new_subscriber(Arc::new(StreamLogger {
            muxpkts: AtomicU64::new(0),
        }));
        subscriber
            .subscribe(channel, cli.profile.as_deref(), 0)
            .await?;
        Some(subscriber)
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    if let Some(subscriber) = subscriber {
        subscriber.unsubscribe();
    }
    connection.stop();
    Ok(())
}

async fn wait_for_auth(
    connection: &Arc<SimpleHtspConnection>,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = Duration::from_secs(15);
    tokio::time::timeout(deadline, async {
        loop {
            match connection.auth_state() {
                AuthState::Authenticated => return Ok(()),
                AuthState::Failed => return Err("authentication failed".into()),
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await
    .map_err(|_| -> Box<dyn std::error::Error> {
        error!("timed out waiting for authentication");
        "timed out waiting for authentication".into()
    })?
}
