mod aggregate;
mod api;
mod domain;
mod engine;
mod error;
mod focus;
mod goals;
mod notify;
mod pomodoro;
mod rollover;
mod session;
mod settings;
mod signal;
mod store;

use chrono::Local;
use clap::Parser;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::info;

use crate::{
    aggregate::Aggregator,
    api::AppState,
    engine::{Engine, EngineConfig},
    notify::Notifier,
    pomodoro::Pomodoro,
    store::Store,
};

const DEFAULT_PORT: u16 = 17700;

#[derive(Parser, Debug)]
#[command(name = "tracker_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:17700")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/tracker-core.db")]
    db: PathBuf,

    /// Sessions shorter than this are not recorded (milliseconds).
    #[arg(long, default_value_t = session::MIN_COMMIT_MS)]
    min_commit_ms: u64,

    /// Page a blocked tab is sent to while focus mode is on.
    #[arg(
        long,
        default_value = "chrome-extension://productivity-tracker/focus-blocked.html"
    )]
    blocked_page_url: String,

    /// Don't run the built-in midnight rollover; rely on `alarm_fired` signals.
    #[arg(long)]
    no_rollover_timer: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tracker_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    let store = Store::open(&args.db)?;
    settings::load_or_init(&store).await?;

    let aggregator = Aggregator::new(store.clone());
    let notifier = Notifier::new();
    let engine = Engine::new(
        aggregator.clone(),
        notifier.clone(),
        EngineConfig {
            min_commit_ms: args.min_commit_ms,
            blocked_page_url: args.blocked_page_url.clone(),
        },
    );
    let state = AppState {
        engine: Arc::new(Mutex::new(engine)),
        aggregator: aggregator.clone(),
        pomodoro: Pomodoro::new(store, notifier.clone()),
        notifier,
    };

    if args.no_rollover_timer {
        info!("built-in rollover timer disabled");
    } else {
        tokio::spawn(rollover::run_timer(aggregator));
    }

    let app = api::router(state.clone());

    let addr = parse_listen(&args.listen)?;
    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let outcome = state.engine.lock().await.shutdown(Local::now()).await;
    for c in &outcome.commits {
        info!("committed {}ms to {} on shutdown", c.duration_ms, c.subject);
    }
    Ok(())
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" || host.parse::<IpAddr>().is_ok() {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            let ip = host
                .parse::<IpAddr>()
                .unwrap_or(IpAddr::from([127, 0, 0, 1]));
            return Ok(SocketAddr::new(ip, port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}
